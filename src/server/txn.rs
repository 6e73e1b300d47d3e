use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::mem;
use std::num::NonZeroU32;

use enum_iterator::Sequence;

use crate::att::Handle;
use crate::gatt;
use crate::le::Addr;
use crate::name_of;

use super::{CallbackId, InstanceId};

/// Locally issued transaction id returned to the client for an accepted read
/// request.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct TxnId(pub(super) NonZeroU32);

impl TxnId {
    /// Wraps a raw transaction id. Returns `None` if the id is invalid.
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Option<Self> {
        match NonZeroU32::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }
}

impl Debug for TxnId {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", name_of!(TxnId), self.0.get())
    }
}

impl From<TxnId> for u32 {
    #[inline]
    fn from(id: TxnId) -> Self {
        id.0.get()
    }
}

crate::impl_display_via_debug! { TxnId }

/// Kind of an outstanding GATT operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Sequence)]
pub(super) enum TxnKind {
    /// Battery level characteristic read.
    Level,
    /// Presentation format descriptor read.
    Identification,
    /// Client characteristic configuration descriptor write.
    Cccd { enable: bool },
}

impl TxnKind {
    /// Returns whether a transaction of this kind may be canceled by the
    /// client. CCCD writes are issued on behalf of the subscription ledger
    /// rather than a specific request and are never user-cancellable.
    #[inline]
    #[must_use]
    pub const fn cancellable(self) -> bool {
        matches!(self, Self::Level | Self::Identification)
    }

    /// Returns whether `other` is the same kind, ignoring any parameters.
    #[inline]
    #[must_use]
    pub fn same(self, other: Self) -> bool {
        mem::discriminant(&self) == mem::discriminant(&other)
    }
}

/// Outstanding GATT operation. Device, instance, and callback are referenced
/// by value only, so directory mutation never leaves a dangling transaction.
#[derive(Clone, Copy, Debug)]
pub(super) struct TransactionEntry {
    pub id: TxnId,
    pub gatt: gatt::Txn,
    pub kind: TxnKind,
    pub addr: Addr,
    pub instance: InstanceId,
    /// Originating callback. For CCCD writes this identifies the subscriber
    /// whose enable triggered the write and is used only for rollback.
    pub callback: CallbackId,
    pub hdl: Handle,
}

/// Table of outstanding GATT operations keyed by local transaction id.
#[derive(Debug, Default)]
pub(super) struct TxnTable(BTreeMap<TxnId, TransactionEntry>);

impl TxnTable {
    /// Adds an outstanding transaction.
    #[inline]
    pub fn insert(&mut self, e: TransactionEntry) {
        self.0.insert(e.id, e);
    }

    /// Returns whether a transaction matching `(addr, kind, callback)` is
    /// already outstanding.
    pub fn outstanding(&self, addr: Addr, kind: TxnKind, callback: CallbackId) -> bool {
        (self.0.values())
            .any(|e| e.addr == addr && e.kind.same(kind) && e.callback == callback)
    }

    /// Removes and returns the transaction with the specified local id if it
    /// exists and `f` accepts it.
    pub fn remove_if(
        &mut self,
        id: TxnId,
        f: impl FnOnce(&TransactionEntry) -> bool,
    ) -> Option<TransactionEntry> {
        match self.0.get(&id) {
            Some(e) if f(e) => self.0.remove(&id),
            _ => None,
        }
    }

    /// Removes and returns the transaction matching a GATT-layer completion.
    pub fn remove_gatt(&mut self, txn: gatt::Txn) -> Option<TransactionEntry> {
        let id = self.0.values().find_map(|e| (e.gatt == txn).then_some(e.id))?;
        self.0.remove(&id)
    }

    /// Removes all outstanding transactions.
    #[inline]
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

#[cfg(test)]
mod tests {
    use enum_iterator::all;

    use super::*;

    #[test]
    fn kind_rules() {
        for k in all::<TxnKind>() {
            assert_eq!(
                k.cancellable(),
                !k.same(TxnKind::Cccd { enable: true }),
                "{k:?}"
            );
            assert!(k.same(k));
        }
        assert!((TxnKind::Cccd { enable: true }).same(TxnKind::Cccd { enable: false }));
        assert!(!TxnKind::Level.same(TxnKind::Identification));
    }

    #[test]
    fn id_size() {
        assert_eq!(std::mem::size_of::<Option<TxnId>>(), 4);
    }
}

use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::ipc::AddressId;
use crate::le::Addr;
use crate::name_of;

use super::{InstanceId, Result, TxnId};

/// Client callback id issued at registration.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct CallbackId(pub(super) NonZeroU32);

impl CallbackId {
    /// Wraps a raw callback id. Returns `None` if the id is invalid.
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Option<Self> {
        match NonZeroU32::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }
}

impl Debug for CallbackId {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", name_of!(CallbackId), self.0.get())
    }
}

impl From<CallbackId> for u32 {
    #[inline]
    fn from(id: CallbackId) -> Self {
        id.0.get()
    }
}

crate::impl_display_via_debug! { CallbackId }

/// Identity of a registered client.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientId {
    /// In-process client invoked directly.
    Local,
    /// Remote IPC client addressed by its bus endpoint.
    Remote(AddressId),
}

/// Registered client with its subscription ledger.
#[derive(Debug)]
pub(super) struct CallbackEntry {
    pub client: ClientId,
    pub sink: Arc<dyn EventSink>,
    /// Instances for which this client wants battery level notifications.
    pub subs: BTreeSet<(Addr, InstanceId)>,
}

/// Receiver of manager events.
///
/// Sinks are invoked with the module lock released, but event processing is
/// serialized: no other event is dispatched to any client while a sink call
/// is outstanding. A sink must therefore return promptly and must never block
/// waiting on another event delivered through this manager.
pub trait EventSink: Debug + Send + Sync {
    /// Delivers `event` to the callback registered as `id`.
    fn event(&self, id: CallbackId, event: &Event);
}

/// Local client event callback.
#[derive(Clone)]
#[repr(transparent)]
pub struct Callback(Arc<dyn Fn(CallbackId, &Event) + Send + Sync>);

impl Callback {
    /// Returns an event callback for a method of `T`.
    #[inline(always)]
    pub fn with<T: Send + Sync + 'static>(
        this: &Arc<T>,
        f: impl Fn(&T, CallbackId, &Event) + Send + Sync + 'static,
    ) -> Self {
        let this = Arc::clone(this);
        Self(Arc::new(move |id, event| f(&this, id, event)))
    }
}

impl Debug for Callback {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_tuple(name_of!(Callback)).field(&Arc::as_ptr(&self.0))).finish()
    }
}

impl<T: Fn(CallbackId, &Event) + Send + Sync + 'static> From<T> for Callback {
    #[inline(always)]
    fn from(f: T) -> Self {
        Self(Arc::new(f))
    }
}

impl EventSink for Callback {
    #[inline]
    fn event(&self, id: CallbackId, event: &Event) {
        self.0(id, event);
    }
}

/// Battery identification value read from the presentation format descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct Identification {
    /// Namespace of the description field.
    pub ns: u8,
    /// Namespace-specific enumeration identifying the instance.
    pub description: u16,
}

/// Events delivered to registered clients.
///
/// `Connected` and `Disconnected` are broadcast to every callback. Request
/// results carrying a [`TxnId`] are delivered only to the originating
/// callback. `BatteryLevelNotification` is delivered only to callbacks
/// subscribed to the `(addr, instance)` pair.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Event {
    /// Device with at least one valid Battery Service instance connected.
    Connected { addr: Addr, instances: u32 },
    /// Device disconnected. All subscriptions for it have been purged.
    Disconnected { addr: Addr },
    /// Battery level read result.
    BatteryLevel {
        addr: Addr,
        instance: InstanceId,
        txn: TxnId,
        level: Result<u8>,
    },
    /// Unsolicited battery level notification.
    BatteryLevelNotification {
        addr: Addr,
        instance: InstanceId,
        level: u8,
    },
    /// Battery identification read result.
    BatteryIdentification {
        addr: Addr,
        instance: InstanceId,
        txn: TxnId,
        ident: Result<Identification>,
    },
}

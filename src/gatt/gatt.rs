//! Generic Attribute Profile client capability ([Vol 3] Part G).

use std::fmt::{Debug, Formatter};
use std::num::NonZeroU32;

use smallvec::SmallVec;

pub use consts::*;

use crate::att::{ErrorCode, Handle};
use crate::gap::Uuid;
use crate::le::Addr;
use crate::name_of;

mod consts;

/// Error type returned by the GATT client capability when submitting an
/// operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The attribute handle is not valid for the peer.
    #[error("invalid attribute handle")]
    InvalidHandle,
    /// There is no connection to the peer.
    #[error("peer not connected")]
    NotConnected,
    /// The peer or the local stack does not support the operation.
    #[error("operation not supported")]
    NotSupported,
    /// Any other submission failure.
    #[error("invalid operation")]
    InvalidOperation,
}

/// Common GATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// GATT-layer operation id assigned to an accepted submission.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Txn(NonZeroU32);

impl Txn {
    /// Wraps a raw operation id. Returns `None` if the id is invalid.
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Option<Self> {
        match NonZeroU32::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }
}

impl Debug for Txn {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", name_of!(Txn), self.0.get())
    }
}

impl From<Txn> for u32 {
    #[inline]
    fn from(t: Txn) -> Self {
        t.0.get()
    }
}

crate::impl_display_via_debug! { Txn }

/// GATT client capability used to execute attribute operations against a
/// remote server.
///
/// Every accepted submission must eventually produce a matching completion
/// [`Event`] carrying the returned [`Txn`], even after a connection loss or a
/// [`Gatt::cancel`] call that raced the completion.
pub trait Gatt: Debug + Send + Sync {
    /// Submits a read of the attribute value at `hdl`.
    fn read(&self, peer: Addr, hdl: Handle) -> Result<Txn>;

    /// Submits a write of the attribute value at `hdl`.
    fn write(&self, peer: Addr, hdl: Handle, value: &[u8]) -> Result<Txn>;

    /// Requests cancellation of an outstanding operation. The completion for
    /// a successfully canceled operation is never delivered.
    fn cancel(&self, txn: Txn) -> Result<()>;
}

/// Completion and notification events delivered by the GATT capability.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Event {
    /// Read completion with the attribute value or ATT error status.
    ReadRsp {
        peer: Addr,
        txn: Txn,
        value: std::result::Result<Vec<u8>, ErrorCode>,
    },
    /// Write completion.
    WriteRsp {
        peer: Addr,
        txn: Txn,
        status: std::result::Result<(), ErrorCode>,
    },
    /// Unsolicited characteristic value notification.
    Notify {
        peer: Addr,
        hdl: Handle,
        value: Vec<u8>,
    },
}

/// Parsed primary service record from the peer's service catalog.
#[derive(Clone, Debug)]
pub struct ServiceData {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicData>,
}

/// Parsed characteristic declaration within a [`ServiceData`] record.
#[derive(Clone, Debug)]
pub struct CharacteristicData {
    pub uuid: Uuid,
    /// Handle of the characteristic value attribute.
    pub value_handle: Handle,
    pub props: CharProps,
    pub descriptors: SmallVec<[DescriptorData; 2]>,
}

/// Parsed descriptor declaration within a [`CharacteristicData`] record.
#[derive(Clone, Copy, Debug)]
pub struct DescriptorData {
    pub uuid: Uuid,
    pub hdl: Handle,
}

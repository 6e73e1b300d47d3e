//! Platform message bus interface for remote clients.
//!
//! Every message begins with a common little-endian header carrying the
//! endpoint address id, a message id with a high-bit response flag, the
//! message group, the message function, and the payload length. Request and
//! response pairs share a message id with the response bit set. Payloads are
//! fixed-size per function and validated before use.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use structbuf::{Pack, Packer, Unpacker};
use tracing::warn;

pub use msg::*;

use crate::name_of;
use crate::server::{CallbackId, Event, EventSink};

mod msg;

/// Battery Service manager message group.
pub const GROUP: u32 = 0x0000_1107;

/// Size of the common message header in bytes.
pub const HEADER_SIZE: usize = 20;

/// Error type returned by the message layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The message is shorter than the common header.
    #[error("truncated message")]
    Truncated,
    /// The message belongs to another message group.
    #[error("unknown message group {group:#010X}")]
    UnknownGroup { group: u32 },
    /// The message function is not defined for this group.
    #[error("unknown message function {func:#010X}")]
    UnknownFunction { func: u32 },
    /// The payload length does not match the function's fixed layout.
    #[error("invalid payload length {len} (want {want})")]
    InvalidPayload { want: u32, len: usize },
    /// The bus could not deliver the message.
    #[error("send to {to} failed")]
    SendFailed { to: AddressId },
}

/// Common message layer result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Bus endpoint address of a connected IPC client.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct AddressId(u32);

impl AddressId {
    /// Wraps a raw endpoint address id.
    #[inline(always)]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    /// Returns the raw endpoint address id.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl Debug for AddressId {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", name_of!(AddressId), self.0)
    }
}

crate::impl_display_via_debug! { AddressId }

/// Message id with a high-bit response flag. A response carries the id of
/// its request with the flag set.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct MessageId(u32);

impl MessageId {
    const RESPONSE: u32 = 0x8000_0000;

    /// Creates a request message id, clearing the response flag.
    #[inline]
    #[must_use]
    pub const fn request(v: u32) -> Self {
        Self(v & !Self::RESPONSE)
    }

    /// Returns the raw message id including the response flag.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the matching response message id.
    #[inline]
    #[must_use]
    pub const fn response(self) -> Self {
        Self(self.0 | Self::RESPONSE)
    }

    /// Returns whether the response flag is set.
    #[inline]
    #[must_use]
    pub const fn is_response(self) -> bool {
        self.0 & Self::RESPONSE != 0
    }
}

impl Debug for MessageId {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#010X})", name_of!(MessageId), self.0)
    }
}

crate::impl_display_via_debug! { MessageId }

/// Common message header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub addr_id: AddressId,
    pub msg_id: MessageId,
    pub func: Func,
    /// Payload length in bytes, excluding the header.
    pub len: u32,
}

impl Header {
    /// Creates a message header.
    #[inline]
    #[must_use]
    pub const fn new(addr_id: AddressId, msg_id: MessageId, func: Func, len: u32) -> Self {
        Self {
            addr_id,
            msg_id,
            func,
            len,
        }
    }

    /// Packs the header.
    pub fn pack(&self, p: &mut Packer) {
        p.u32(self.addr_id.raw())
            .u32(self.msg_id.raw())
            .u32(GROUP)
            .u32(u32::from(self.func))
            .u32(self.len);
    }

    /// Unpacks and validates the header of a received message, returning the
    /// header and the payload.
    pub fn unpack(raw: &[u8]) -> Result<(Self, &[u8])> {
        let mut p = Unpacker::new(raw);
        let (addr_id, msg_id, group, func, len) = (p.u32(), p.u32(), p.u32(), p.u32(), p.u32());
        if !p.is_ok() {
            return Err(Error::Truncated);
        }
        if group != GROUP {
            return Err(Error::UnknownGroup { group });
        }
        let func = Func::try_from(func).map_err(|_| Error::UnknownFunction { func })?;
        let payload = p.take().into_inner();
        if payload.len() != len as usize {
            return Err(Error::InvalidPayload {
                want: len,
                len: payload.len(),
            });
        }
        Ok((
            Self {
                addr_id: AddressId::new(addr_id),
                msg_id: MessageId(msg_id),
                func,
                len,
            },
            payload,
        ))
    }
}

/// Outbound IPC bus capability.
///
/// The manager writes responses and asynchronous event messages through this
/// interface. Delivery failures are reported but never retried.
pub trait Bus: Debug + Send + Sync {
    /// Sends a complete message to endpoint `to`.
    fn send(&self, to: AddressId, msg: &[u8]) -> Result<()>;
}

/// Event sink that marshals events into outbound IPC messages for one remote
/// client endpoint.
#[derive(Debug)]
pub struct RemoteSink {
    bus: Arc<dyn Bus>,
    to: AddressId,
    next: AtomicU32,
}

impl RemoteSink {
    /// Creates an event sink addressing the remote endpoint `to`.
    #[inline]
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>, to: AddressId) -> Self {
        Self {
            bus,
            to,
            next: AtomicU32::new(0),
        }
    }

    /// Returns the next outbound message id.
    #[inline]
    fn next_id(&self) -> MessageId {
        MessageId::request(self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }
}

impl EventSink for RemoteSink {
    fn event(&self, id: CallbackId, event: &Event) {
        let msg = event_message(self.to, self.next_id(), id, event);
        if let Err(e) = self.bus.send(self.to, msg.as_ref()) {
            warn!("Failed to deliver {event:?} to {}: {e}", self.to);
        }
    }
}

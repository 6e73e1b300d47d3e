use structbuf::{Pack, Packer, StructBuf, Unpacker};

use crate::le::RawAddr;
use crate::server::{CallbackId, Event, Identification};

use super::{AddressId, Error, Header, MessageId, Result, HEADER_SIZE};

/// Message function codes. Functions with the `0x1xxxx` prefix are
/// asynchronous event messages that never receive a response.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u32)]
pub enum Func {
    RegisterClientEvents = 0x0000_1001,
    UnregisterClientEvents = 0x0000_1002,
    EnableNotifications = 0x0000_1103,
    DisableNotifications = 0x0000_1104,
    GetBatteryLevel = 0x0000_1105,
    GetBatteryIdentification = 0x0000_1106,
    CancelTransaction = 0x0000_1107,
    Connected = 0x0001_0001,
    Disconnected = 0x0001_0002,
    BatteryLevel = 0x0001_1003,
    BatteryLevelNotification = 0x0001_1004,
    BatteryIdentification = 0x0001_1005,
}

crate::impl_display_via_debug! { Func }

/// Connection transport of a device event. Battery Service clients are
/// LE-only.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u32)]
pub enum ConnType {
    LowEnergy = 0,
}

/// Builds a complete message from a header and a payload packer.
#[must_use]
pub fn message(hdr: &Header, payload: impl FnOnce(&mut Packer)) -> StructBuf {
    let mut b = StructBuf::new(HEADER_SIZE + hdr.len as usize);
    let p = &mut b.append();
    hdr.pack(p);
    payload(p);
    b
}

/// Extension trait providing message-specific [`Unpacker`] methods.
trait MsgUnpacker {
    /// Returns the next device address.
    fn addr(&mut self) -> RawAddr;
}

impl MsgUnpacker for Unpacker<'_> {
    #[inline(always)]
    fn addr(&mut self) -> RawAddr {
        // SAFETY: All bit patterns are valid
        unsafe { self.read() }
    }
}

/// Returns an unpacker for a payload of exactly `want` bytes.
fn unpacker(payload: &[u8], want: u32) -> Result<Unpacker> {
    if payload.len() == want as usize {
        Ok(Unpacker::new(payload))
    } else {
        Err(Error::InvalidPayload {
            want,
            len: payload.len(),
        })
    }
}

/// Request payload shared by the enable/disable notifications and battery
/// level/identification read functions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Request {
    pub callback: u32,
    pub addr: RawAddr,
    pub instance: u32,
}

impl Request {
    pub const SIZE: u32 = 14;

    /// Packs the request payload.
    pub fn pack(&self, p: &mut Packer) {
        p.u32(self.callback).put(self.addr.as_le_bytes()).u32(self.instance);
    }

    /// Unpacks the request payload.
    pub fn unpack(payload: &[u8]) -> Result<Self> {
        let p = &mut unpacker(payload, Self::SIZE)?;
        Ok(Self {
            callback: p.u32(),
            addr: p.addr(),
            instance: p.u32(),
        })
    }
}

/// Un-register client events request payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnregisterRequest {
    pub callback: u32,
}

impl UnregisterRequest {
    pub const SIZE: u32 = 4;

    /// Packs the request payload.
    pub fn pack(&self, p: &mut Packer) {
        p.u32(self.callback);
    }

    /// Unpacks the request payload.
    pub fn unpack(payload: &[u8]) -> Result<Self> {
        let p = &mut unpacker(payload, Self::SIZE)?;
        Ok(Self { callback: p.u32() })
    }
}

/// Cancel transaction request payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CancelRequest {
    pub txn: u32,
}

impl CancelRequest {
    pub const SIZE: u32 = 4;

    /// Packs the request payload.
    pub fn pack(&self, p: &mut Packer) {
        p.u32(self.txn);
    }

    /// Unpacks the request payload.
    pub fn unpack(payload: &[u8]) -> Result<Self> {
        let p = &mut unpacker(payload, Self::SIZE)?;
        Ok(Self { txn: p.u32() })
    }
}

/// Response payload shared by every request function. A non-negative status
/// is the request's success value (callback or transaction id, or 0), a
/// negative status is an error code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Response {
    pub status: i32,
}

impl Response {
    pub const SIZE: u32 = 4;

    /// Packs the response payload.
    pub fn pack(&self, p: &mut Packer) {
        p.i32(self.status);
    }

    /// Unpacks the response payload.
    pub fn unpack(payload: &[u8]) -> Result<Self> {
        let p = &mut unpacker(payload, Self::SIZE)?;
        Ok(Self { status: p.i32() })
    }
}

/// Connected event payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectedEvent {
    pub callback: u32,
    pub addr: RawAddr,
    pub conn_type: u32,
    pub flags: u32,
    pub instances: u32,
}

impl ConnectedEvent {
    pub const SIZE: u32 = 22;

    /// Packs the event payload.
    pub fn pack(&self, p: &mut Packer) {
        p.u32(self.callback)
            .put(self.addr.as_le_bytes())
            .u32(self.conn_type)
            .u32(self.flags)
            .u32(self.instances);
    }

    /// Unpacks the event payload.
    pub fn unpack(payload: &[u8]) -> Result<Self> {
        let p = &mut unpacker(payload, Self::SIZE)?;
        Ok(Self {
            callback: p.u32(),
            addr: p.addr(),
            conn_type: p.u32(),
            flags: p.u32(),
            instances: p.u32(),
        })
    }
}

/// Disconnected event payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DisconnectedEvent {
    pub callback: u32,
    pub addr: RawAddr,
    pub conn_type: u32,
}

impl DisconnectedEvent {
    pub const SIZE: u32 = 14;

    /// Packs the event payload.
    pub fn pack(&self, p: &mut Packer) {
        p.u32(self.callback).put(self.addr.as_le_bytes()).u32(self.conn_type);
    }

    /// Unpacks the event payload.
    pub fn unpack(payload: &[u8]) -> Result<Self> {
        let p = &mut unpacker(payload, Self::SIZE)?;
        Ok(Self {
            callback: p.u32(),
            addr: p.addr(),
            conn_type: p.u32(),
        })
    }
}

/// Battery level read result event payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LevelEvent {
    pub callback: u32,
    pub addr: RawAddr,
    pub instance: u32,
    pub txn: u32,
    pub status: i32,
    pub level: u8,
}

impl LevelEvent {
    pub const SIZE: u32 = 23;

    /// Packs the event payload.
    pub fn pack(&self, p: &mut Packer) {
        p.u32(self.callback)
            .put(self.addr.as_le_bytes())
            .u32(self.instance)
            .u32(self.txn)
            .i32(self.status)
            .u8(self.level);
    }

    /// Unpacks the event payload.
    pub fn unpack(payload: &[u8]) -> Result<Self> {
        let p = &mut unpacker(payload, Self::SIZE)?;
        Ok(Self {
            callback: p.u32(),
            addr: p.addr(),
            instance: p.u32(),
            txn: p.u32(),
            status: p.i32(),
            level: p.u8(),
        })
    }
}

/// Battery level notification event payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NotificationEvent {
    pub callback: u32,
    pub addr: RawAddr,
    pub instance: u32,
    pub level: u8,
}

impl NotificationEvent {
    pub const SIZE: u32 = 15;

    /// Packs the event payload.
    pub fn pack(&self, p: &mut Packer) {
        p.u32(self.callback)
            .put(self.addr.as_le_bytes())
            .u32(self.instance)
            .u8(self.level);
    }

    /// Unpacks the event payload.
    pub fn unpack(payload: &[u8]) -> Result<Self> {
        let p = &mut unpacker(payload, Self::SIZE)?;
        Ok(Self {
            callback: p.u32(),
            addr: p.addr(),
            instance: p.u32(),
            level: p.u8(),
        })
    }
}

/// Battery identification read result event payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IdentificationEvent {
    pub callback: u32,
    pub addr: RawAddr,
    pub instance: u32,
    pub txn: u32,
    pub status: i32,
    pub ns: u8,
    pub description: u16,
}

impl IdentificationEvent {
    pub const SIZE: u32 = 25;

    /// Packs the event payload.
    pub fn pack(&self, p: &mut Packer) {
        p.u32(self.callback)
            .put(self.addr.as_le_bytes())
            .u32(self.instance)
            .u32(self.txn)
            .i32(self.status)
            .u8(self.ns)
            .u16(self.description);
    }

    /// Unpacks the event payload.
    pub fn unpack(payload: &[u8]) -> Result<Self> {
        let p = &mut unpacker(payload, Self::SIZE)?;
        Ok(Self {
            callback: p.u32(),
            addr: p.addr(),
            instance: p.u32(),
            txn: p.u32(),
            status: p.i32(),
            ns: p.u8(),
            description: p.u16(),
        })
    }
}

/// Marshals a manager event into a complete outbound message for the remote
/// client registered as `cb` at endpoint `to`.
#[must_use]
pub(super) fn event_message(
    to: AddressId,
    msg_id: MessageId,
    cb: CallbackId,
    event: &Event,
) -> StructBuf {
    let callback = u32::from(cb);
    let hdr = |func, len| Header::new(to, msg_id, func, len);
    match *event {
        Event::Connected { addr, instances } => {
            message(&hdr(Func::Connected, ConnectedEvent::SIZE), |p| {
                ConnectedEvent {
                    callback,
                    addr: addr.raw(),
                    conn_type: ConnType::LowEnergy.into(),
                    flags: 0,
                    instances,
                }
                .pack(p);
            })
        }
        Event::Disconnected { addr } => {
            message(&hdr(Func::Disconnected, DisconnectedEvent::SIZE), |p| {
                DisconnectedEvent {
                    callback,
                    addr: addr.raw(),
                    conn_type: ConnType::LowEnergy.into(),
                }
                .pack(p);
            })
        }
        Event::BatteryLevel {
            addr,
            instance,
            txn,
            level,
        } => {
            let (status, level) = match level {
                Ok(v) => (0, v),
                Err(e) => (e.status(), 0),
            };
            message(&hdr(Func::BatteryLevel, LevelEvent::SIZE), |p| {
                LevelEvent {
                    callback,
                    addr: addr.raw(),
                    instance: instance.raw(),
                    txn: txn.into(),
                    status,
                    level,
                }
                .pack(p);
            })
        }
        Event::BatteryLevelNotification {
            addr,
            instance,
            level,
        } => message(
            &hdr(Func::BatteryLevelNotification, NotificationEvent::SIZE),
            |p| {
                NotificationEvent {
                    callback,
                    addr: addr.raw(),
                    instance: instance.raw(),
                    level,
                }
                .pack(p);
            },
        ),
        Event::BatteryIdentification {
            addr,
            instance,
            txn,
            ident,
        } => {
            let (status, id) = match ident {
                Ok(v) => (0, v),
                Err(e) => (
                    e.status(),
                    Identification {
                        ns: 0,
                        description: 0,
                    },
                ),
            };
            message(
                &hdr(Func::BatteryIdentification, IdentificationEvent::SIZE),
                |p| {
                    IdentificationEvent {
                        callback,
                        addr: addr.raw(),
                        instance: instance.raw(),
                        txn: txn.into(),
                        status,
                        ns: id.ns,
                        description: id.description,
                    }
                    .pack(p);
                },
            )
        }
    }
}

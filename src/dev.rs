//! Remote device directory capability.

use std::fmt::Debug;

use bitflags::bitflags;

use crate::gatt::ServiceData;
use crate::le::Addr;

bitflags! {
    /// Remote device state flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct DevFlags: u32 {
        /// An LE connection to the device is up.
        const CONNECTED = 1 << 0;
        /// The LE service catalog of the device is cached and current.
        const SERVICES_KNOWN = 1 << 1;
        /// The device is paired over LE.
        const PAIRED = 1 << 2;
        /// The link is currently encrypted.
        const ENCRYPTED = 1 << 3;
    }
}

bitflags! {
    /// Property fields that changed in a [`Event::Properties`] update.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct ChangedFlags: u32 {
        /// Connection state changed.
        const CONNECTION = 1 << 0;
        /// Service catalog state changed.
        const SERVICES = 1 << 1;
        /// Pairing state changed.
        const PAIRING = 1 << 2;
        /// Link encryption state changed.
        const ENCRYPTION = 1 << 3;
        /// The device address rotated.
        const ADDRESS = 1 << 4;
    }
}

/// Snapshot of a remote device's directory properties.
#[derive(Clone, Copy, Debug)]
pub struct Properties {
    pub addr: Addr,
    /// Previous address when a resolvable private address rotation occurred.
    pub prior_addr: Option<Addr>,
    pub flags: DevFlags,
}

impl Properties {
    /// Creates a properties snapshot for `addr`.
    #[inline]
    #[must_use]
    pub const fn new(addr: Addr, flags: DevFlags) -> Self {
        Self {
            addr,
            prior_addr: None,
            flags,
        }
    }
}

/// Device directory capability used to query remote device state.
pub trait Directory: Debug + Send + Sync {
    /// Returns the current properties of `addr`, or [`None`] if the
    /// directory does not know the device.
    fn properties(&self, addr: Addr) -> Option<Properties>;

    /// Returns the parsed LE service catalog of `addr`, or [`None`] if the
    /// device is unknown or its services have not been discovered.
    fn services(&self, addr: Addr) -> Option<Vec<ServiceData>>;
}

/// Device directory events.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Event {
    /// One or more device properties changed.
    Properties {
        props: Properties,
        changed: ChangedFlags,
    },
    /// The device was removed from the directory.
    Deleted { addr: Addr },
    /// The local adapter powered on or off.
    Power { on: bool },
}

use std::fmt::Debug;

use smallvec::SmallVec;
use tracing::debug;

use crate::att::Handle;
use crate::gatt::{CharProps, Characteristic, Descriptor, Service, ServiceData};
use crate::le::Addr;

/// Battery Service instance id. Ids are dense, zero-based, unique within a
/// device, and reassigned whenever an instance is invalidated and removed.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct InstanceId(u32);

impl InstanceId {
    /// Wraps a raw instance id.
    #[inline(always)]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    /// Returns the raw instance id.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

crate::impl_display_via_debug! { InstanceId }

/// Attribute handles of one Battery Service instance.
#[derive(Clone, Copy, Debug)]
pub(super) struct InstanceHandles {
    /// Battery level characteristic value handle.
    pub level: Handle,
    /// Client characteristic configuration descriptor handle. Always present
    /// when the instance supports notifications.
    pub cccd: Option<Handle>,
    /// Presentation format descriptor handle. May be absent only on a
    /// single-instance device.
    pub format: Option<Handle>,
}

/// One validated Battery Service occurrence on a remote device.
#[derive(Clone, Copy, Debug)]
pub(super) struct InstanceEntry {
    pub id: InstanceId,
    pub handles: InstanceHandles,
    pub notify_supported: bool,
    /// Number of distinct subscribers, across all callbacks, currently
    /// wanting notifications.
    pub notify_count: u32,
    /// Mirror of the live CCCD state on the remote server.
    pub notify_enabled: bool,
}

/// Connected remote device exposing at least one valid Battery Service
/// instance.
#[derive(Clone, Debug)]
pub(super) struct DeviceEntry {
    pub addr: Addr,
    instances: SmallVec<[InstanceEntry; 1]>,
}

impl DeviceEntry {
    /// Validates the parsed service catalog of `addr` and builds the device
    /// entry. Returns `None` if no valid Battery Service instance remains.
    ///
    /// A candidate instance requires a readable battery level characteristic
    /// and, when it advertises notifications, a CCCD. When more than one
    /// candidate survives, every instance must also have a presentation
    /// format descriptor to be distinguishable; those lacking it are dropped
    /// and the survivors renumbered.
    pub fn discover(addr: Addr, services: &[ServiceData]) -> Option<Self> {
        let mut instances: SmallVec<[InstanceEntry; 1]> = SmallVec::new();
        for s in services.iter().filter(|s| Service::Battery == s.uuid) {
            let Some(c) = (s.characteristics.iter())
                .find(|c| Characteristic::BatteryLevel == c.uuid)
            else {
                debug!("{addr} Battery Service without battery level characteristic");
                continue;
            };
            if !c.props.contains(CharProps::READ) {
                debug!("{addr} battery level at {} is not readable", c.value_handle);
                continue;
            }
            let find = |d: Descriptor| {
                (c.descriptors.iter()).find_map(|v| (d == v.uuid).then_some(v.hdl))
            };
            let notify = c.props.contains(CharProps::NOTIFY);
            let cccd = find(Descriptor::ClientCharacteristicConfiguration);
            if notify && cccd.is_none() {
                debug!("{addr} battery level at {} has no CCCD", c.value_handle);
                continue;
            }
            instances.push(InstanceEntry {
                id: InstanceId::default(),
                handles: InstanceHandles {
                    level: c.value_handle,
                    cccd,
                    format: find(Descriptor::CharacteristicPresentationFormat),
                },
                notify_supported: notify,
                notify_count: 0,
                notify_enabled: false,
            });
        }
        if instances.len() > 1 {
            // Multiple instances are told apart by their presentation format
            // descriptions, so the descriptor becomes mandatory.
            instances.retain(|i| i.handles.format.is_some());
        }
        for (id, i) in (0u32..).zip(&mut instances) {
            i.id = InstanceId::new(id);
        }
        (!instances.is_empty()).then_some(Self { addr, instances })
    }

    /// Returns the instance with the specified id.
    #[inline]
    pub fn instance(&self, id: InstanceId) -> Option<&InstanceEntry> {
        self.instances.get(id.raw() as usize)
    }

    /// Returns a mutable reference to the instance with the specified id.
    #[inline]
    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut InstanceEntry> {
        self.instances.get_mut(id.raw() as usize)
    }

    /// Returns the instance whose battery level characteristic is at `hdl`.
    #[inline]
    pub fn instance_by_level(&self, hdl: Handle) -> Option<&InstanceEntry> {
        self.instances.iter().find(|i| i.handles.level == hdl)
    }

    /// Returns all instances.
    #[inline]
    pub fn instances(&self) -> &[InstanceEntry] {
        &self.instances
    }

    /// Returns mutable references to all instances.
    #[inline]
    pub fn instances_mut(&mut self) -> &mut [InstanceEntry] {
        &mut self.instances
    }
}

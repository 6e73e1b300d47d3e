//! Notification state persistence.
//!
//! Per-instance CCCD enable flags and the notify-capable instance count are
//! mirrored to the settings store so that enabled notifications survive a
//! disconnect. Keys follow the platform configuration file layout: one flag
//! key per instance and one count key per device, both carrying the address
//! in MSB-first order. A value of 0 and an absent key are equivalent.

use tracing::debug;

use crate::le::Addr;
use crate::SettingsStore;

use super::{DeviceEntry, InstanceId};

pub(super) const SECTION: &str = "BASM-Client";

/// Returns the per-instance CCCD flag key.
fn cccd_key(instance: InstanceId, addr: Addr) -> String {
    let raw = addr.raw();
    let a = raw.as_le_bytes();
    format!(
        "BL-{:04}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        instance.raw(),
        a[5],
        a[4],
        a[3],
        a[2],
        a[1],
        a[0]
    )
}

/// Returns the per-device notify-capable instance count key.
fn count_key(addr: Addr) -> String {
    let raw = addr.raw();
    let a = raw.as_le_bytes();
    format!(
        "IC-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        a[5], a[4], a[3], a[2], a[1], a[0]
    )
}

/// Reconciles the in-memory notification state of a paired and encrypted
/// device with the store. A stored enable flag is loaded into memory, so a
/// later subscribe does not re-write the remote CCCD, and in-memory enables
/// missing from the store are written back.
pub(super) fn reconcile(store: &dyn SettingsStore, dev: &mut DeviceEntry) {
    let addr = dev.addr;
    let mut count = 0;
    for inst in dev.instances_mut() {
        if !inst.notify_supported {
            continue;
        }
        count += 1;
        let key = cccd_key(inst.id, addr);
        let stored = store.read(SECTION, &key) != 0;
        if stored && !inst.notify_enabled {
            debug!("{addr} instance {} notifications restored from store", inst.id);
            inst.notify_enabled = true;
        } else if inst.notify_enabled && !stored {
            store.write(SECTION, &key, 1);
        }
    }
    store.write(SECTION, &count_key(addr), count);
}

/// Writes the current notification state of a paired and encrypted device to
/// the store.
pub(super) fn save(store: &dyn SettingsStore, dev: &DeviceEntry) {
    let mut count = 0;
    for inst in dev.instances() {
        if !inst.notify_supported {
            continue;
        }
        count += 1;
        let key = cccd_key(inst.id, dev.addr);
        store.write(SECTION, &key, u32::from(inst.notify_enabled));
    }
    store.write(SECTION, &count_key(dev.addr), count);
}

/// Purges all stored keys for `addr` after un-pairing, deletion, or address
/// rotation.
pub(super) fn purge(store: &dyn SettingsStore, addr: Addr) {
    let ck = count_key(addr);
    let n = store.read(SECTION, &ck);
    if n == 0 {
        return;
    }
    debug!("{addr} purging stored notification state ({n} instances)");
    store.write(SECTION, &ck, 0);
    for i in 0..n {
        let key = cccd_key(InstanceId::new(i), addr);
        if store.read(SECTION, &key) != 0 {
            store.write(SECTION, &key, 0);
        }
    }
}

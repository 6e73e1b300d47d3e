//! Battery Service manager server engine.
//!
//! The server tracks every connected device exposing one or more valid
//! Battery Service instances, arbitrates notification subscriptions from
//! multiple local and remote clients behind a CCCD reference count, executes
//! battery level and identification reads against the remote GATT server,
//! and persists per-device notification state across reconnects and pairing
//! changes.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use {device::*, event::*, txn::*};

use crate::att::{ErrorCode, Handle};
use crate::dev::{self, ChangedFlags, DevFlags};
use crate::gatt::{self, Cccd, Gatt, PresentationFormat};
use crate::ipc::{
    self, AddressId, Bus, CancelRequest, Func, Header, RemoteSink, Request, Response,
    UnregisterRequest,
};
use crate::le::{Addr, RawAddr};
use crate::{SettingsStore, SyncMutex, SyncMutexGuard};

mod device;
mod event;
mod persist;
mod txn;

#[cfg(test)]
mod tests;

/// Error type returned by the Battery Service manager. Discriminants are the
/// stable negative status codes carried by response and result messages.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    thiserror::Error,
)]
#[non_exhaustive]
#[repr(i32)]
pub enum Error {
    /// The event loop has been shut down.
    #[error("manager not initialized")]
    NotInitialized = -1,
    /// A request parameter is invalid, or a canceled transaction no longer
    /// exists.
    #[error("invalid parameter")]
    InvalidParameter = -2,
    /// The module lock could not be acquired.
    #[error("unable to lock context")]
    UnableToLockContext = -3,
    /// A directory entry could not be allocated.
    #[error("unable to add entry")]
    UnableToAddEntry = -4,
    /// The callback id is not registered or not owned by the caller.
    #[error("invalid callback id")]
    InvalidCallback = -5,
    /// No instance matches the device address and instance id.
    #[error("invalid instance")]
    InvalidInstance = -6,
    /// An identical request from the same callback is already outstanding.
    #[error("same request outstanding")]
    SameRequestOutstanding = -7,
    /// The instance does not support notifications.
    #[error("notifications not supported")]
    NotifyUnsupported = -8,
    /// The device exposes a single instance, so identification is
    /// meaningless.
    #[error("identification not supported")]
    IdentificationUnsupported = -9,
    /// The caller has no matching subscription to remove.
    #[error("notifications not enabled")]
    NotificationsDisabled = -10,
    /// A message or attribute value has an invalid layout.
    #[error("invalid response message")]
    ResponseMessageInvalid = -11,
    /// The attribute handle is not valid for the peer.
    #[error("invalid attribute handle")]
    InvalidHandle = -12,
    /// There is no connection to the peer.
    #[error("device not connected")]
    NotConnected = -13,
    /// The peer or the local stack does not support the operation.
    #[error("operation not supported")]
    NotSupported = -14,
    /// Any other GATT-layer failure.
    #[error("invalid operation")]
    InvalidOperation = -15,
}

impl Error {
    /// Returns the wire status code.
    #[inline]
    #[must_use]
    pub const fn status(self) -> i32 {
        self as i32
    }
}

impl From<gatt::Error> for Error {
    /// Maps a GATT submission failure into the manager taxonomy.
    fn from(e: gatt::Error) -> Self {
        match e {
            gatt::Error::InvalidHandle => Self::InvalidHandle,
            gatt::Error::NotConnected => Self::NotConnected,
            gatt::Error::NotSupported => Self::NotSupported,
            gatt::Error::InvalidOperation => Self::InvalidOperation,
        }
    }
}

impl From<ErrorCode> for Error {
    /// Maps an ATT completion status into the manager taxonomy.
    fn from(e: ErrorCode) -> Self {
        match e {
            ErrorCode::InvalidHandle => Self::InvalidHandle,
            ErrorCode::RequestNotSupported => Self::NotSupported,
            _ => Self::InvalidOperation,
        }
    }
}

/// Common manager result type.
pub type Result<T> = std::result::Result<T, Error>;

/// External event queued for serialized processing.
#[derive(Debug)]
#[non_exhaustive]
pub enum Update {
    /// Device directory event.
    Device(dev::Event),
    /// GATT completion or notification.
    Gatt(gatt::Event),
    /// Raw inbound message from a remote client.
    Message(Vec<u8>),
    /// A remote client endpoint detached from the bus.
    ClientDetached(AddressId),
}

/// Battery Service manager server.
///
/// Externally triggered events are queued through [`Self::update`] and
/// drained one at a time by the [`EventLoop`], so handlers never race each
/// other. Client-facing operations execute on the caller's thread under the
/// module lock and either return synchronously or complete with an [`Event`]
/// delivered to the originating callback.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct Server(Arc<Ctx>);

#[derive(Debug)]
struct Ctx {
    gatt: Arc<dyn Gatt>,
    dir: Arc<dyn dev::Directory>,
    store: Arc<dyn SettingsStore>,
    bus: Arc<dyn Bus>,
    tx: mpsc::UnboundedSender<Update>,
    state: SyncMutex<State>,
}

/// Shared mutable manager state.
#[derive(Debug)]
struct State {
    running: bool,
    rx: Option<mpsc::UnboundedReceiver<Update>>,
    next_callback: u32,
    next_txn: u32,
    callbacks: BTreeMap<CallbackId, CallbackEntry>,
    devices: BTreeMap<Addr, DeviceEntry>,
    txns: TxnTable,
}

impl Server {
    /// Creates a manager using the specified GATT, device directory,
    /// settings store, and IPC bus capabilities.
    #[must_use]
    pub fn new(
        gatt: Arc<dyn Gatt>,
        dir: Arc<dyn dev::Directory>,
        store: Arc<dyn SettingsStore>,
        bus: Arc<dyn Bus>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self(Arc::new(Ctx {
            gatt,
            dir,
            store,
            bus,
            tx,
            state: SyncMutex::new(State {
                running: true,
                rx: Some(rx),
                next_callback: 0,
                next_txn: 0,
                callbacks: BTreeMap::new(),
                devices: BTreeMap::new(),
                txns: TxnTable::default(),
            }),
        }))
    }

    /// Queues an external event for processing by the event loop.
    pub fn update(&self, u: Update) {
        if self.0.tx.send(u).is_err() {
            debug!("Update dropped after shutdown");
        }
    }

    /// Spawns a task that processes queued updates until stopped. The task
    /// is canceled when the returned future is dropped.
    ///
    /// # Panics
    ///
    /// Panics if the event loop was already started.
    #[must_use]
    pub fn event_loop(&self) -> EventLoop {
        let rx = (self.0.state.lock().rx.take()).expect("event loop already started");
        let c = CancellationToken::new();
        EventLoop {
            h: tokio::spawn(EventLoop::run(self.clone(), rx, c.clone())),
            c: c.clone(),
            _g: c.drop_guard(),
        }
    }

    /// Registers a local client event callback, returning its callback id.
    pub fn register_events(&self, cb: impl Into<Callback>) -> Result<CallbackId> {
        self.register(ClientId::Local, Arc::new(cb.into()))
    }

    /// Un-registers a client callback, dropping its subscriptions as if each
    /// had been disabled.
    pub fn unregister_events(&self, id: CallbackId) -> Result<()> {
        let mut guard = self.lock()?;
        let st = &mut *guard;
        let e = st.callbacks.remove(&id).ok_or(Error::InvalidCallback)?;
        debug!("Unregistered {id}");
        self.drop_subscriptions(st, id, e.subs);
        Ok(())
    }

    /// Enables battery level notifications for `(addr, instance)` on behalf
    /// of callback `id`. The remote CCCD is written only when the first
    /// subscriber arrives and the remote state is not already enabled from a
    /// persisted prior session. A duplicate enable from the same callback is
    /// a no-op success.
    pub fn enable_notifications(
        &self,
        id: CallbackId,
        addr: Addr,
        instance: InstanceId,
    ) -> Result<()> {
        let mut guard = self.lock()?;
        let st = &mut *guard;
        let cbe = st.callbacks.get_mut(&id).ok_or(Error::InvalidCallback)?;
        let inst = (st.devices.get_mut(&addr))
            .and_then(|d| d.instance_mut(instance))
            .ok_or(Error::InvalidInstance)?;
        if !inst.notify_supported {
            return Err(Error::NotifyUnsupported);
        }
        if !cbe.subs.insert((addr, instance)) {
            return Ok(());
        }
        if inst.notify_count == 0 && !inst.notify_enabled {
            // Discovery guarantees a CCCD handle when notify is supported
            let Some(hdl) = inst.handles.cccd else {
                return Err(Error::NotifyUnsupported);
            };
            if let Err(e) =
                self.submit_cccd(&mut st.next_txn, &mut st.txns, addr, instance, hdl, true, id)
            {
                cbe.subs.remove(&(addr, instance));
                return Err(e);
            }
        }
        inst.notify_count += 1;
        Ok(())
    }

    /// Disables battery level notifications for `(addr, instance)` on
    /// behalf of callback `id`. The remote CCCD is cleared when the last
    /// subscriber leaves. The ledger keeps the caller's intent even when
    /// the remote write fails.
    pub fn disable_notifications(
        &self,
        id: CallbackId,
        addr: Addr,
        instance: InstanceId,
    ) -> Result<()> {
        let mut guard = self.lock()?;
        let st = &mut *guard;
        let cbe = st.callbacks.get_mut(&id).ok_or(Error::InvalidCallback)?;
        let inst = (st.devices.get_mut(&addr))
            .and_then(|d| d.instance_mut(instance))
            .ok_or(Error::InvalidInstance)?;
        if !cbe.subs.remove(&(addr, instance)) {
            return Err(Error::NotificationsDisabled);
        }
        if inst.notify_count > 0 {
            inst.notify_count -= 1;
            if inst.notify_count == 0 && inst.notify_enabled {
                if let Some(hdl) = inst.handles.cccd {
                    self.submit_cccd(
                        &mut st.next_txn,
                        &mut st.txns,
                        addr,
                        instance,
                        hdl,
                        false,
                        id,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Submits a battery level read, returning the transaction id. The
    /// result is delivered as [`Event::BatteryLevel`] to callback `id` only.
    pub fn battery_level(&self, id: CallbackId, addr: Addr, instance: InstanceId) -> Result<TxnId> {
        self.submit_read(id, addr, instance, TxnKind::Level)
    }

    /// Submits a battery identification read, returning the transaction id.
    /// The result is delivered as [`Event::BatteryIdentification`] to
    /// callback `id` only. Identification requires the device to expose more
    /// than one instance.
    pub fn battery_identification(
        &self,
        id: CallbackId,
        addr: Addr,
        instance: InstanceId,
    ) -> Result<TxnId> {
        self.submit_read(id, addr, instance, TxnKind::Identification)
    }

    /// Cancels an outstanding read transaction owned by callback `id` and
    /// forwards a best-effort cancel to the GATT layer. A completion racing
    /// the cancellation finds no entry and is silently dropped. CCCD write
    /// transactions are never cancellable.
    pub fn cancel(&self, id: CallbackId, txn: TxnId) -> Result<()> {
        let e = {
            let mut st = self.lock()?;
            (st.txns)
                .remove_if(txn, |e| e.callback == id && e.kind.cancellable())
                .ok_or(Error::InvalidParameter)?
        };
        if let Err(err) = self.0.gatt.cancel(e.gatt) {
            debug!("{txn} GATT cancel failed: {err}");
        }
        Ok(())
    }

    /// Acquires the module lock, failing if the event loop has shut down.
    fn lock(&self) -> Result<SyncMutexGuard<State>> {
        let st = self.0.state.lock();
        if st.running {
            Ok(st)
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// Adds a callback registry entry for `client`.
    fn register(&self, client: ClientId, sink: Arc<dyn EventSink>) -> Result<CallbackId> {
        let mut st = self.lock()?;
        let id = CallbackId(next_id(&mut st.next_callback));
        debug!("Registered {id} for {client:?}");
        st.callbacks.insert(
            id,
            CallbackEntry {
                client,
                sink,
                subs: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    /// Validates a read request and submits it to the GATT layer.
    fn submit_read(
        &self,
        id: CallbackId,
        addr: Addr,
        instance: InstanceId,
        kind: TxnKind,
    ) -> Result<TxnId> {
        let mut guard = self.lock()?;
        let st = &mut *guard;
        if !st.callbacks.contains_key(&id) {
            return Err(Error::InvalidCallback);
        }
        let dev = st.devices.get(&addr).ok_or(Error::InvalidInstance)?;
        let inst = dev.instance(instance).ok_or(Error::InvalidInstance)?;
        let hdl = match kind {
            TxnKind::Level => inst.handles.level,
            TxnKind::Identification => {
                if dev.instances().len() < 2 {
                    return Err(Error::IdentificationUnsupported);
                }
                inst.handles.format.ok_or(Error::IdentificationUnsupported)?
            }
            TxnKind::Cccd { .. } => return Err(Error::InvalidParameter),
        };
        if st.txns.outstanding(addr, kind, id) {
            return Err(Error::SameRequestOutstanding);
        }
        let gatt = self.0.gatt.read(addr, hdl).map_err(|e| {
            warn!("{addr} read submission failed: {e}");
            Error::from(e)
        })?;
        let txn = TxnId(next_id(&mut st.next_txn));
        debug!("{addr} instance {instance} {kind:?} read {txn}");
        st.txns.insert(TransactionEntry {
            id: txn,
            gatt,
            kind,
            addr,
            instance,
            callback: id,
            hdl,
        });
        Ok(txn)
    }

    /// Issues a CCCD write and records its transaction. The entry carries
    /// the subscriber that triggered the write for rollback, but the
    /// transaction itself is never user-cancellable.
    #[allow(clippy::too_many_arguments)]
    fn submit_cccd(
        &self,
        next_txn: &mut u32,
        txns: &mut TxnTable,
        addr: Addr,
        instance: InstanceId,
        hdl: Handle,
        enable: bool,
        origin: CallbackId,
    ) -> Result<()> {
        let value = if enable { Cccd::NOTIFY } else { Cccd::empty() };
        let gatt = (self.0.gatt)
            .write(addr, hdl, &value.bits().to_le_bytes())
            .map_err(|e| {
                warn!("{addr} CCCD write submission failed: {e}");
                Error::from(e)
            })?;
        let id = TxnId(next_id(next_txn));
        debug!(
            "{addr} instance {instance} CCCD {} write {id}",
            if enable { "enable" } else { "disable" }
        );
        txns.insert(TransactionEntry {
            id,
            gatt,
            kind: TxnKind::Cccd { enable },
            addr,
            instance,
            callback: origin,
            hdl,
        });
        Ok(())
    }

    /// Removes a purged callback's subscriptions, issuing a best-effort
    /// CCCD disable write for each instance losing its last subscriber.
    fn drop_subscriptions(
        &self,
        st: &mut State,
        origin: CallbackId,
        subs: BTreeSet<(Addr, InstanceId)>,
    ) {
        for (addr, instance) in subs {
            let Some(inst) =
                (st.devices.get_mut(&addr)).and_then(|d| d.instance_mut(instance))
            else {
                continue;
            };
            if inst.notify_count == 0 {
                continue;
            }
            inst.notify_count -= 1;
            if inst.notify_count > 0 || !inst.notify_enabled {
                continue;
            }
            let Some(hdl) = inst.handles.cccd else { continue };
            let _ = self.submit_cccd(
                &mut st.next_txn,
                &mut st.txns,
                addr,
                instance,
                hdl,
                false,
                origin,
            );
        }
    }

    /// Processes one queued update.
    fn handle(&self, u: Update) {
        match u {
            Update::Device(e) => self.on_dev(&e),
            Update::Gatt(e) => self.on_gatt(e),
            Update::Message(m) => self.on_message(&m),
            Update::ClientDetached(a) => self.on_client_detached(a),
        }
    }

    /// Processes a device directory event.
    fn on_dev(&self, e: &dev::Event) {
        match *e {
            dev::Event::Properties { props, changed } => {
                let addr = props.addr;
                if changed.contains(ChangedFlags::ADDRESS) {
                    if let Some(prior) = props.prior_addr {
                        self.on_address_change(prior, &props);
                    }
                }
                let flags = props.flags;
                if changed.contains(ChangedFlags::CONNECTION) && !flags.contains(DevFlags::CONNECTED)
                {
                    self.on_disconnect(addr);
                    return;
                }
                if changed.intersects(ChangedFlags::CONNECTION | ChangedFlags::SERVICES)
                    && flags.contains(DevFlags::CONNECTED | DevFlags::SERVICES_KNOWN)
                {
                    self.try_discover(addr, flags);
                }
                if changed.intersects(ChangedFlags::PAIRING | ChangedFlags::ENCRYPTION) {
                    if flags.contains(DevFlags::PAIRED | DevFlags::ENCRYPTED) {
                        self.on_secured(addr, flags);
                    } else if changed.contains(ChangedFlags::PAIRING)
                        && !flags.contains(DevFlags::PAIRED)
                    {
                        persist::purge(self.0.store.as_ref(), addr);
                    }
                }
            }
            dev::Event::Deleted { addr } => {
                persist::purge(self.0.store.as_ref(), addr);
                self.on_disconnect(addr);
            }
            dev::Event::Power { on } => self.on_power(on),
        }
    }

    /// Runs Battery Service discovery for a newly usable device and
    /// broadcasts `Connected` if at least one valid instance was found.
    #[allow(clippy::cast_possible_truncation)]
    fn try_discover(&self, addr: Addr, flags: DevFlags) {
        {
            let Ok(st) = self.lock() else { return };
            if st.devices.contains_key(&addr) {
                return;
            }
        }
        let Some(services) = self.0.dir.services(addr) else {
            warn!("{addr} service catalog unavailable");
            return;
        };
        let Some(mut dev) = DeviceEntry::discover(addr, &services) else {
            debug!("{addr} exposes no valid Battery Service instance");
            return;
        };
        if flags.contains(DevFlags::PAIRED | DevFlags::ENCRYPTED) {
            persist::reconcile(self.0.store.as_ref(), &mut dev);
        }
        let instances = dev.instances().len() as u32;
        let targets = {
            let Ok(mut st) = self.lock() else { return };
            st.devices.insert(addr, dev);
            broadcast_targets(&st)
        };
        debug!("{addr} connected with {instances} instance(s)");
        dispatch(&targets, &Event::Connected { addr, instances });
    }

    /// Handles the device becoming paired and encrypted.
    fn on_secured(&self, addr: Addr, flags: DevFlags) {
        {
            let Ok(mut st) = self.lock() else { return };
            if let Some(dev) = st.devices.get_mut(&addr) {
                persist::reconcile(self.0.store.as_ref(), dev);
                return;
            }
        }
        if flags.contains(DevFlags::CONNECTED | DevFlags::SERVICES_KNOWN) {
            self.try_discover(addr, flags);
        }
    }

    /// Purges a disconnected device: its directory entry and every
    /// subscription referencing it. Stored notification state is left
    /// untouched so it survives a reconnect.
    fn on_disconnect(&self, addr: Addr) {
        let targets = {
            let Ok(mut st) = self.lock() else { return };
            if st.devices.remove(&addr).is_none() {
                return;
            }
            for e in st.callbacks.values_mut() {
                e.subs.retain(|&(a, _)| a != addr);
            }
            broadcast_targets(&st)
        };
        debug!("{addr} disconnected");
        dispatch(&targets, &Event::Disconnected { addr });
    }

    /// Handles a resolvable private address rotation: stored and in-memory
    /// state move from the prior address to the new one.
    fn on_address_change(&self, prior: Addr, props: &dev::Properties) {
        let addr = props.addr;
        debug!("{prior} rotated to {addr}");
        persist::purge(self.0.store.as_ref(), prior);
        let Ok(mut guard) = self.lock() else { return };
        let st = &mut *guard;
        let Some(mut dev) = st.devices.remove(&prior) else { return };
        dev.addr = addr;
        if props.flags.contains(DevFlags::PAIRED | DevFlags::ENCRYPTED) {
            persist::reconcile(self.0.store.as_ref(), &mut dev);
        }
        st.devices.insert(addr, dev);
        for e in st.callbacks.values_mut() {
            e.subs = (e.subs.iter())
                .map(|&(a, i)| if a == prior { (addr, i) } else { (a, i) })
                .collect();
        }
        // Outstanding transactions keep the prior address; completions are
        // matched by GATT id and their lookups tolerate a missing device
    }

    /// Handles an adapter power transition. Power-off drops all devices and
    /// outstanding transactions without dispatching events or touching the
    /// store.
    fn on_power(&self, on: bool) {
        if on {
            debug!("Adapter powered on");
            return;
        }
        let Ok(mut st) = self.lock() else { return };
        debug!("Adapter powered off");
        st.devices.clear();
        st.txns.clear();
        for e in st.callbacks.values_mut() {
            e.subs.clear();
        }
    }

    /// Processes a GATT completion or notification.
    fn on_gatt(&self, e: gatt::Event) {
        match e {
            gatt::Event::ReadRsp { peer, txn, value } => self.on_read_rsp(peer, txn, &value),
            gatt::Event::WriteRsp { peer, txn, status } => self.on_write_rsp(peer, txn, status),
            gatt::Event::Notify { peer, hdl, value } => self.on_notify(peer, hdl, &value),
        }
    }

    /// Completes an outstanding read and delivers the result to the
    /// originating callback.
    fn on_read_rsp(
        &self,
        peer: Addr,
        txn: gatt::Txn,
        value: &std::result::Result<Vec<u8>, ErrorCode>,
    ) {
        let (entry, target) = {
            let Ok(mut st) = self.lock() else { return };
            let Some(e) = st.txns.remove_gatt(txn) else {
                debug!("{peer} dropping completion for unknown {txn}");
                return;
            };
            let target = st.callbacks.get(&e.callback).map(|c| Arc::clone(&c.sink));
            (e, target)
        };
        let event = match entry.kind {
            TxnKind::Level => Event::BatteryLevel {
                addr: entry.addr,
                instance: entry.instance,
                txn: entry.id,
                level: decode_level(value),
            },
            TxnKind::Identification => Event::BatteryIdentification {
                addr: entry.addr,
                instance: entry.instance,
                txn: entry.id,
                ident: decode_identification(value),
            },
            TxnKind::Cccd { .. } => {
                warn!("{peer} read completion for {:?}", entry.kind);
                return;
            }
        };
        if let Some(sink) = target {
            sink.event(entry.callback, &event);
        }
    }

    /// Completes an outstanding CCCD write, updating the remote-state mirror
    /// on success or rolling back the triggering subscription on an enable
    /// failure, then persists the outcome.
    fn on_write_rsp(
        &self,
        peer: Addr,
        txn: gatt::Txn,
        status: std::result::Result<(), ErrorCode>,
    ) {
        let Ok(mut guard) = self.lock() else { return };
        let st = &mut *guard;
        let Some(e) = st.txns.remove_gatt(txn) else {
            debug!("{peer} dropping completion for unknown {txn}");
            return;
        };
        let TxnKind::Cccd { enable } = e.kind else {
            warn!("{peer} write completion for {:?}", e.kind);
            return;
        };
        match status {
            Ok(()) => {
                if let Some(inst) =
                    (st.devices.get_mut(&e.addr)).and_then(|d| d.instance_mut(e.instance))
                {
                    inst.notify_enabled = enable;
                    debug!(
                        "{peer} instance {} notifications {}",
                        e.instance,
                        if enable { "enabled" } else { "disabled" }
                    );
                }
            }
            Err(code) => {
                warn!("{peer} CCCD write failed: {code}");
                if enable {
                    if let Some(inst) =
                        (st.devices.get_mut(&e.addr)).and_then(|d| d.instance_mut(e.instance))
                    {
                        inst.notify_count = inst.notify_count.saturating_sub(1);
                    }
                    if let Some(cb) = st.callbacks.get_mut(&e.callback) {
                        cb.subs.remove(&(e.addr, e.instance));
                    }
                }
            }
        }
        if let Some(dev) = st.devices.get(&e.addr) {
            let secured = (self.0.dir.properties(e.addr))
                .map_or(false, |p| p.flags.contains(DevFlags::PAIRED | DevFlags::ENCRYPTED));
            if secured {
                persist::save(self.0.store.as_ref(), dev);
            }
        }
    }

    /// Fans an incoming battery level notification out to every callback
    /// subscribed to the matching instance.
    fn on_notify(&self, peer: Addr, hdl: Handle, value: &[u8]) {
        let Some(&level) = value.first() else {
            warn!("{peer} empty battery level notification");
            return;
        };
        let (instance, targets) = {
            let Ok(st) = self.lock() else { return };
            let Some(inst) = (st.devices.get(&peer)).and_then(|d| d.instance_by_level(hdl))
            else {
                debug!("{peer} notification for unknown {hdl}");
                return;
            };
            (inst.id, subscriber_targets(&st, peer, inst.id))
        };
        dispatch(
            &targets,
            &Event::BatteryLevelNotification {
                addr: peer,
                instance,
                level,
            },
        );
    }

    /// Processes a raw inbound message from a remote client and sends the
    /// response.
    fn on_message(&self, raw: &[u8]) {
        let (hdr, payload) = match Header::unpack(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("Invalid message: {e}");
                return;
            }
        };
        if hdr.msg_id.is_response() {
            debug!("Ignoring unexpected response {hdr:?}");
            return;
        }
        let status = self.handle_request(&hdr, payload);
        self.respond(&hdr, status);
    }

    /// Executes a remote request, returning the response status.
    #[allow(clippy::cast_possible_wrap)] // issued ids stay below the sign bit
    fn handle_request(&self, hdr: &Header, payload: &[u8]) -> i32 {
        let r: Result<u32> = match hdr.func {
            Func::RegisterClientEvents => {
                let sink = Arc::new(RemoteSink::new(Arc::clone(&self.0.bus), hdr.addr_id));
                (self.register(ClientId::Remote(hdr.addr_id), sink)).map(u32::from)
            }
            Func::UnregisterClientEvents => (UnregisterRequest::unpack(payload))
                .map_err(invalid_message)
                .and_then(|m| {
                    let id = self.remote_callback(hdr.addr_id, m.callback)?;
                    self.unregister_events(id).map(|()| 0)
                }),
            Func::EnableNotifications
            | Func::DisableNotifications
            | Func::GetBatteryLevel
            | Func::GetBatteryIdentification => (Request::unpack(payload))
                .map_err(invalid_message)
                .and_then(|m| {
                    let id = self.remote_callback(hdr.addr_id, m.callback)?;
                    let addr = self.device_addr(m.addr)?;
                    let instance = InstanceId::new(m.instance);
                    match hdr.func {
                        Func::EnableNotifications => {
                            self.enable_notifications(id, addr, instance).map(|()| 0)
                        }
                        Func::DisableNotifications => {
                            self.disable_notifications(id, addr, instance).map(|()| 0)
                        }
                        Func::GetBatteryLevel => {
                            self.battery_level(id, addr, instance).map(u32::from)
                        }
                        _ => (self.battery_identification(id, addr, instance)).map(u32::from),
                    }
                }),
            Func::CancelTransaction => (CancelRequest::unpack(payload))
                .map_err(invalid_message)
                .and_then(|m| self.cancel_remote(hdr.addr_id, m.txn).map(|()| 0)),
            _ => Err(Error::InvalidParameter), // event functions are outbound-only
        };
        match r {
            Ok(v) => v as i32,
            Err(e) => e.status(),
        }
    }

    /// Resolves a callback id from the wire and verifies that it is owned
    /// by the requesting endpoint.
    fn remote_callback(&self, from: AddressId, raw: u32) -> Result<CallbackId> {
        let id = CallbackId::new(raw).ok_or(Error::InvalidCallback)?;
        let st = self.lock()?;
        match st.callbacks.get(&id) {
            Some(e) if e.client == ClientId::Remote(from) => Ok(id),
            _ => Err(Error::InvalidCallback),
        }
    }

    /// Resolves a known device address from its raw wire form.
    fn device_addr(&self, raw: RawAddr) -> Result<Addr> {
        let st = self.lock()?;
        (st.devices.keys().copied())
            .find(|a| a.raw() == raw)
            .ok_or(Error::InvalidInstance)
    }

    /// Cancels a transaction on behalf of a remote client, which identifies
    /// it by transaction id alone.
    fn cancel_remote(&self, from: AddressId, raw: u32) -> Result<()> {
        let txn = TxnId::new(raw).ok_or(Error::InvalidParameter)?;
        let e = {
            let mut guard = self.lock()?;
            let st = &mut *guard;
            let callbacks = &st.callbacks;
            (st.txns)
                .remove_if(txn, |e| {
                    e.kind.cancellable()
                        && (callbacks.get(&e.callback))
                            .map_or(false, |c| c.client == ClientId::Remote(from))
                })
                .ok_or(Error::InvalidParameter)?
        };
        if let Err(err) = self.0.gatt.cancel(e.gatt) {
            debug!("{txn} GATT cancel failed: {err}");
        }
        Ok(())
    }

    /// Sends the response for a processed request.
    fn respond(&self, hdr: &Header, status: i32) {
        let rsp = ipc::message(
            &Header::new(hdr.addr_id, hdr.msg_id.response(), hdr.func, Response::SIZE),
            |p| Response { status }.pack(p),
        );
        if let Err(e) = self.0.bus.send(hdr.addr_id, rsp.as_ref()) {
            warn!("Failed to respond to {}: {e}", hdr.addr_id);
        }
    }

    /// Purges every callback owned by a detached remote endpoint.
    fn on_client_detached(&self, from: AddressId) {
        let Ok(mut guard) = self.lock() else { return };
        let st = &mut *guard;
        let ids: Vec<_> = (st.callbacks.iter())
            .filter_map(|(&id, e)| (e.client == ClientId::Remote(from)).then_some(id))
            .collect();
        for id in ids {
            if let Some(e) = st.callbacks.remove(&id) {
                debug!("Purging {id} after {from} detached");
                self.drop_subscriptions(st, id, e.subs);
            }
        }
    }
}

/// Future that processes queued updates.
#[derive(Debug)]
pub struct EventLoop {
    h: tokio::task::JoinHandle<()>,
    c: CancellationToken,
    _g: tokio_util::sync::DropGuard,
}

impl EventLoop {
    /// Stops update processing. Subsequent operations fail with
    /// [`Error::NotInitialized`].
    pub async fn stop(self) {
        self.c.cancel();
        self.h.await.unwrap();
    }

    /// Processes updates until cancellation.
    async fn run(s: Server, mut rx: mpsc::UnboundedReceiver<Update>, c: CancellationToken) {
        debug!("Event loop started");
        loop {
            let u = tokio::select! {
                u = rx.recv() => u,
                _ = c.cancelled() => None,
            };
            let Some(u) = u else {
                debug!("Event loop terminating");
                s.0.state.lock().running = false;
                return;
            };
            s.handle(u);
        }
    }
}

impl Future for EventLoop {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(ready!(Pin::new(&mut self.h).poll(cx)).unwrap())
    }
}

/// Issues the next id from a monotonic counter, wrapping to 1 before the
/// sign bit is set so that ids remain positive on the wire.
fn next_id(n: &mut u32) -> NonZeroU32 {
    *n = n.wrapping_add(1);
    if *n & 0x8000_0000 != 0 {
        *n = 1;
    }
    // SAFETY: The counter is in 1..=0x7FFF_FFFF after the wrap check
    unsafe { NonZeroU32::new_unchecked(*n) }
}

/// Returns every registered callback as a dispatch target.
fn broadcast_targets(st: &State) -> Vec<(CallbackId, Arc<dyn EventSink>)> {
    (st.callbacks.iter())
        .map(|(&id, e)| (id, Arc::clone(&e.sink)))
        .collect()
}

/// Returns the callbacks subscribed to `(addr, instance)`.
fn subscriber_targets(
    st: &State,
    addr: Addr,
    instance: InstanceId,
) -> Vec<(CallbackId, Arc<dyn EventSink>)> {
    (st.callbacks.iter())
        .filter(|(_, e)| e.subs.contains(&(addr, instance)))
        .map(|(&id, e)| (id, Arc::clone(&e.sink)))
        .collect()
}

/// Invokes sinks with the module lock released. Processing is serialized by
/// the event loop, so no other event is dispatched while a sink call is
/// outstanding.
fn dispatch(targets: &[(CallbackId, Arc<dyn EventSink>)], event: &Event) {
    for (id, sink) in targets {
        sink.event(*id, event);
    }
}

/// Decodes a battery level read result.
fn decode_level(value: &std::result::Result<Vec<u8>, ErrorCode>) -> Result<u8> {
    match *value {
        Ok(ref v) => v.first().copied().ok_or(Error::ResponseMessageInvalid),
        Err(e) => Err(Error::from(e)),
    }
}

/// Decodes a battery identification read result from the presentation
/// format descriptor value.
fn decode_identification(value: &std::result::Result<Vec<u8>, ErrorCode>) -> Result<Identification> {
    match *value {
        Ok(ref v) => PresentationFormat::unpack(v)
            .map(|f| Identification {
                ns: f.ns,
                description: f.description,
            })
            .ok_or(Error::ResponseMessageInvalid),
        Err(e) => Err(Error::from(e)),
    }
}

/// Maps a malformed inbound payload to the wire error status.
fn invalid_message(e: ipc::Error) -> Error {
    warn!("Invalid request payload: {e}");
    Error::ResponseMessageInvalid
}

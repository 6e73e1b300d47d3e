use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use matches::assert_matches;

use crate::att::{ErrorCode, Handle};
use crate::dev::{self, ChangedFlags, DevFlags, Directory, Properties};
use crate::gatt::{
    self, CharProps, Characteristic, CharacteristicData, Descriptor, DescriptorData, Gatt, Service,
    ServiceData,
};
use crate::ipc::{self, AddressId, Bus, ConnectedEvent, Func, Header, MessageId, Request, Response};
use crate::le::{Addr, RawAddr};
use crate::{SettingsStore, SyncMutex};

use super::persist::SECTION;
use super::*;

const ADDR: Addr = Addr::Public(RawAddr::from_le_bytes([6, 5, 4, 3, 2, 1]));
const OTHER: Addr = Addr::Public(RawAddr::from_le_bytes([9, 9, 9, 9, 9, 9]));
const I0: InstanceId = InstanceId::new(0);

const LINK: DevFlags = DevFlags::CONNECTED.union(DevFlags::SERVICES_KNOWN);
const SECURE: DevFlags = LINK.union(DevFlags::PAIRED).union(DevFlags::ENCRYPTED);

const LEVEL: u16 = 0x10;
const BL0: &str = "BL-0000-010203040506";
const IC: &str = "IC-010203040506";

fn hdl(v: u16) -> Handle {
    Handle::new(v).unwrap()
}

fn bas(base: u16, props: CharProps, descs: &[(Descriptor, u16)]) -> ServiceData {
    ServiceData {
        uuid: Service::Battery.uuid(),
        characteristics: vec![CharacteristicData {
            uuid: Characteristic::BatteryLevel.uuid(),
            value_handle: hdl(base),
            props,
            descriptors: (descs.iter())
                .map(|&(d, h)| DescriptorData {
                    uuid: d.uuid(),
                    hdl: hdl(h),
                })
                .collect(),
        }],
    }
}

/// Returns a notify-capable instance with CCCD and presentation format
/// descriptors at `base + 1` and `base + 2`.
fn notify_bas(base: u16) -> ServiceData {
    bas(
        base,
        CharProps::READ | CharProps::NOTIFY,
        &[
            (Descriptor::ClientCharacteristicConfiguration, base + 1),
            (Descriptor::CharacteristicPresentationFormat, base + 2),
        ],
    )
}

/// Returns a read-only instance with a presentation format descriptor at
/// `base + 2`.
fn read_bas(base: u16) -> ServiceData {
    bas(
        base,
        CharProps::READ,
        &[(Descriptor::CharacteristicPresentationFormat, base + 2)],
    )
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum GattOp {
    Read { hdl: Handle },
    Write { hdl: Handle, value: Vec<u8> },
    Cancel,
}

#[derive(Debug, Default)]
struct FakeGatt(SyncMutex<GattState>);

#[derive(Debug, Default)]
struct GattState {
    next: u32,
    fail: Option<gatt::Error>,
    ops: Vec<(gatt::Txn, GattOp)>,
}

impl FakeGatt {
    fn submit(&self, op: GattOp) -> gatt::Result<gatt::Txn> {
        let mut g = self.0.lock();
        if let Some(e) = g.fail.take() {
            return Err(e);
        }
        g.next += 1;
        let txn = gatt::Txn::new(g.next).unwrap();
        g.ops.push((txn, op));
        Ok(txn)
    }

    fn fail_next(&self, e: gatt::Error) {
        self.0.lock().fail = Some(e);
    }

    fn take(&self) -> Vec<(gatt::Txn, GattOp)> {
        mem::take(&mut self.0.lock().ops)
    }
}

impl Gatt for FakeGatt {
    fn read(&self, _peer: Addr, hdl: Handle) -> gatt::Result<gatt::Txn> {
        self.submit(GattOp::Read { hdl })
    }

    fn write(&self, _peer: Addr, hdl: Handle, value: &[u8]) -> gatt::Result<gatt::Txn> {
        self.submit(GattOp::Write {
            hdl,
            value: value.to_vec(),
        })
    }

    fn cancel(&self, txn: gatt::Txn) -> gatt::Result<()> {
        self.0.lock().ops.push((txn, GattOp::Cancel));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeDir(SyncMutex<DirState>);

#[derive(Debug, Default)]
struct DirState {
    props: Option<Properties>,
    services: Vec<ServiceData>,
}

impl Directory for FakeDir {
    fn properties(&self, addr: Addr) -> Option<Properties> {
        self.0.lock().props.filter(|p| p.addr == addr)
    }

    fn services(&self, addr: Addr) -> Option<Vec<ServiceData>> {
        let d = self.0.lock();
        (d.props.map_or(false, |p| p.addr == addr)).then(|| d.services.clone())
    }
}

#[derive(Debug, Default)]
struct MemStore(SyncMutex<BTreeMap<(String, String), u32>>);

impl SettingsStore for MemStore {
    fn write(&self, section: &str, key: &str, v: u32) -> bool {
        let mut m = self.0.lock();
        if v == 0 {
            m.remove(&(section.to_owned(), key.to_owned()));
        } else {
            m.insert((section.to_owned(), key.to_owned()), v);
        }
        true
    }

    fn read(&self, section: &str, key: &str) -> u32 {
        (self.0.lock().get(&(section.to_owned(), key.to_owned()))).map_or(0, |&v| v)
    }
}

#[derive(Debug, Default)]
struct FakeBus(SyncMutex<Vec<(AddressId, Vec<u8>)>>);

impl FakeBus {
    fn take(&self) -> Vec<(AddressId, Vec<u8>)> {
        mem::take(&mut *self.0.lock())
    }
}

impl Bus for FakeBus {
    fn send(&self, to: AddressId, msg: &[u8]) -> ipc::Result<()> {
        self.0.lock().push((to, msg.to_vec()));
        Ok(())
    }
}

struct Fix {
    srv: Server,
    gatt: Arc<FakeGatt>,
    dir: Arc<FakeDir>,
    store: Arc<MemStore>,
    bus: Arc<FakeBus>,
    events: Arc<SyncMutex<Vec<(CallbackId, Event)>>>,
}

impl Fix {
    fn new() -> Self {
        let gatt = Arc::new(FakeGatt::default());
        let dir = Arc::new(FakeDir::default());
        let store = Arc::new(MemStore::default());
        let bus = Arc::new(FakeBus::default());
        let srv = Server::new(
            Arc::clone(&gatt) as _,
            Arc::clone(&dir) as _,
            Arc::clone(&store) as _,
            Arc::clone(&bus) as _,
        );
        Self {
            srv,
            gatt,
            dir,
            store,
            bus,
            events: Arc::default(),
        }
    }

    /// Registers a local client that records received events.
    fn client(&self) -> CallbackId {
        let events = Arc::clone(&self.events);
        (self.srv)
            .register_events(move |id: CallbackId, e: &Event| events.lock().push((id, e.clone())))
            .unwrap()
    }

    /// Connects `ADDR` exposing `services` and runs discovery.
    fn connect(&self, flags: DevFlags, services: Vec<ServiceData>) {
        let props = Properties::new(ADDR, flags);
        {
            let mut d = self.dir.0.lock();
            d.props = Some(props);
            d.services = services;
        }
        self.srv.handle(Update::Device(dev::Event::Properties {
            props,
            changed: ChangedFlags::CONNECTION | ChangedFlags::SERVICES,
        }));
    }

    fn take_events(&self) -> Vec<(CallbackId, Event)> {
        mem::take(&mut *self.events.lock())
    }

    fn read_rsp(&self, txn: gatt::Txn, value: std::result::Result<Vec<u8>, ErrorCode>) {
        (self.srv).handle(Update::Gatt(gatt::Event::ReadRsp {
            peer: ADDR,
            txn,
            value,
        }));
    }

    fn write_rsp(&self, txn: gatt::Txn, status: std::result::Result<(), ErrorCode>) {
        (self.srv).handle(Update::Gatt(gatt::Event::WriteRsp {
            peer: ADDR,
            txn,
            status,
        }));
    }
}

#[test]
fn discovery() {
    let f = Fix::new();
    let (a, b) = (f.client(), f.client());
    f.connect(LINK, vec![notify_bas(LEVEL)]);
    assert_matches!(
        f.take_events().as_slice(),
        [(x, Event::Connected { addr: ADDR, instances: 1 }),
         (y, Event::Connected { addr: ADDR, instances: 1 })] if (*x, *y) == (a, b)
    );

    // No valid instance means no device and no event
    let f = Fix::new();
    f.client();
    f.connect(LINK, vec![bas(LEVEL, CharProps::NOTIFY, &[])]);
    assert!(f.take_events().is_empty());
    assert_eq!(
        f.srv.battery_level(f.client(), ADDR, I0),
        Err(Error::InvalidInstance)
    );
}

#[test]
fn notify_refcount() {
    let f = Fix::new();
    let (a, b) = (f.client(), f.client());
    f.connect(LINK, vec![notify_bas(LEVEL)]);

    // First subscriber triggers the one and only enable write
    f.srv.enable_notifications(a, ADDR, I0).unwrap();
    let ops = f.gatt.take();
    assert_matches!(
        ops.as_slice(),
        [(_, GattOp::Write { hdl: h, ref value })] if *h == hdl(LEVEL + 1) && value == &[1, 0]
    );
    f.srv.enable_notifications(b, ADDR, I0).unwrap();
    f.srv.enable_notifications(a, ADDR, I0).unwrap(); // duplicate is a no-op
    assert!(f.gatt.take().is_empty());
    f.write_rsp(ops[0].0, Ok(()));

    // Last subscriber triggers the disable write
    f.srv.disable_notifications(a, ADDR, I0).unwrap();
    assert!(f.gatt.take().is_empty());
    f.srv.disable_notifications(b, ADDR, I0).unwrap();
    assert_matches!(
        f.gatt.take().as_slice(),
        [(_, GattOp::Write { ref value, .. })] if value == &[0, 0]
    );
}

#[test]
fn enable_errors() {
    let f = Fix::new();
    let a = f.client();
    f.connect(LINK, vec![read_bas(LEVEL)]);

    let e = f.srv.enable_notifications(a, ADDR, I0);
    assert_eq!(e, Err(Error::NotifyUnsupported));
    let e = f.srv.enable_notifications(a, OTHER, I0);
    assert_eq!(e, Err(Error::InvalidInstance));
    let e = f.srv.enable_notifications(a, ADDR, InstanceId::new(5));
    assert_eq!(e, Err(Error::InvalidInstance));
    let e = (f.srv).enable_notifications(CallbackId::new(999).unwrap(), ADDR, I0);
    assert_eq!(e, Err(Error::InvalidCallback));

    // Removing a subscription that was never added leaves nothing mutated
    let e = f.srv.disable_notifications(a, ADDR, I0);
    assert_eq!(e, Err(Error::NotificationsDisabled));
    assert!(f.gatt.take().is_empty());
}

#[test]
fn enable_rollback() {
    let f = Fix::new();
    let a = f.client();
    f.connect(LINK, vec![notify_bas(LEVEL)]);

    // Submission failure leaves no subscription behind
    f.gatt.fail_next(gatt::Error::NotConnected);
    let e = f.srv.enable_notifications(a, ADDR, I0);
    assert_eq!(e, Err(Error::NotConnected));
    assert_eq!(
        f.srv.disable_notifications(a, ADDR, I0),
        Err(Error::NotificationsDisabled)
    );

    // A failed CCCD write rolls back the triggering subscription
    f.srv.enable_notifications(a, ADDR, I0).unwrap();
    let txn = f.gatt.take()[0].0;
    f.write_rsp(txn, Err(ErrorCode::WriteNotPermitted));
    assert_eq!(
        f.srv.disable_notifications(a, ADDR, I0),
        Err(Error::NotificationsDisabled)
    );
    f.srv.enable_notifications(a, ADDR, I0).unwrap();
    assert_matches!(f.gatt.take().as_slice(), [(_, GattOp::Write { .. })]);
}

#[test]
fn battery_level_read() {
    let f = Fix::new();
    let (a, b) = (f.client(), f.client());
    f.connect(LINK, vec![notify_bas(LEVEL)]);
    f.take_events();

    let t = f.srv.battery_level(a, ADDR, I0).unwrap();
    assert_eq!(
        f.srv.battery_level(a, ADDR, I0),
        Err(Error::SameRequestOutstanding)
    );
    f.srv.battery_level(b, ADDR, I0).unwrap(); // distinct callback is fine
    let ops = f.gatt.take();
    assert_matches!(
        ops.as_slice(),
        [(_, GattOp::Read { hdl: x }), (_, GattOp::Read { hdl: y })]
            if (*x, *y) == (hdl(LEVEL), hdl(LEVEL))
    );

    // Result goes to the originator only and consumes the transaction
    f.read_rsp(ops[0].0, Ok(vec![0x5A]));
    assert_matches!(
        f.take_events().as_slice(),
        [(id, Event::BatteryLevel { addr: ADDR, instance: I0, txn, level: Ok(90) })]
            if (*id, *txn) == (a, t)
    );
    assert_eq!(f.srv.cancel(a, t), Err(Error::InvalidParameter));

    // ATT errors and malformed values map to the local taxonomy
    f.read_rsp(ops[1].0, Err(ErrorCode::UnlikelyError));
    assert_matches!(
        f.take_events().as_slice(),
        [(id, Event::BatteryLevel { level: Err(Error::InvalidOperation), .. })] if *id == b
    );
    let t = f.srv.battery_level(a, ADDR, I0).unwrap();
    f.read_rsp(f.gatt.take()[0].0, Ok(vec![]));
    assert_matches!(
        f.take_events().as_slice(),
        [(_, Event::BatteryLevel { txn, level: Err(Error::ResponseMessageInvalid), .. })]
            if *txn == t
    );
}

#[test]
fn battery_identification() {
    let f = Fix::new();
    let a = f.client();
    f.connect(LINK, vec![read_bas(0x10), read_bas(0x20)]);
    assert_matches!(
        f.take_events().as_slice(),
        [(_, Event::Connected { instances: 2, .. })]
    );

    let t = (f.srv).battery_identification(a, ADDR, InstanceId::new(1)).unwrap();
    let ops = f.gatt.take();
    assert_matches!(
        ops.as_slice(),
        [(_, GattOp::Read { hdl: h })] if *h == hdl(0x22)
    );
    // uint8, percentage, Bluetooth SIG namespace, second instance
    f.read_rsp(ops[0].0, Ok(vec![0x04, 0x00, 0xAD, 0x27, 0x01, 0x02, 0x00]));
    assert_matches!(
        f.take_events().as_slice(),
        [(id, Event::BatteryIdentification {
            txn,
            ident: Ok(Identification { ns: 1, description: 2 }),
            ..
        })] if (*id, *txn) == (a, t)
    );

    // Short descriptor value
    f.srv.battery_identification(a, ADDR, I0).unwrap();
    f.read_rsp(f.gatt.take()[0].0, Ok(vec![0x04]));
    assert_matches!(
        f.take_events().as_slice(),
        [(_, Event::BatteryIdentification { ident: Err(Error::ResponseMessageInvalid), .. })]
    );

    // Meaningless on a single-instance device
    let f = Fix::new();
    let a = f.client();
    f.connect(LINK, vec![notify_bas(LEVEL)]);
    assert_eq!(
        f.srv.battery_identification(a, ADDR, I0),
        Err(Error::IdentificationUnsupported)
    );
}

#[test]
fn cancel_outstanding_read() {
    let f = Fix::new();
    let (a, b) = (f.client(), f.client());
    f.connect(LINK, vec![notify_bas(LEVEL)]);
    f.take_events();

    let t = f.srv.battery_level(a, ADDR, I0).unwrap();
    let txn = f.gatt.take()[0].0;
    assert_eq!(f.srv.cancel(b, t), Err(Error::InvalidParameter)); // not the owner
    f.srv.cancel(a, t).unwrap();
    assert_matches!(f.gatt.take().as_slice(), [(_, GattOp::Cancel)]);

    // A completion that raced the cancellation is dropped
    f.read_rsp(txn, Ok(vec![1]));
    assert!(f.take_events().is_empty());
}

#[test]
fn notification_fan_out() {
    let f = Fix::new();
    let (a, _b) = (f.client(), f.client());
    f.connect(LINK, vec![notify_bas(LEVEL)]);
    f.srv.enable_notifications(a, ADDR, I0).unwrap();
    f.write_rsp(f.gatt.take()[0].0, Ok(()));
    f.take_events();

    f.srv.handle(Update::Gatt(gatt::Event::Notify {
        peer: ADDR,
        hdl: hdl(LEVEL),
        value: vec![55],
    }));
    assert_matches!(
        f.take_events().as_slice(),
        [(id, Event::BatteryLevelNotification { addr: ADDR, instance: I0, level: 55 })]
            if *id == a
    );

    // Unknown handles are dropped
    f.srv.handle(Update::Gatt(gatt::Event::Notify {
        peer: ADDR,
        hdl: hdl(0x99),
        value: vec![55],
    }));
    assert!(f.take_events().is_empty());
}

#[test]
fn unregister_drops_subscriptions() {
    let f = Fix::new();
    let a = f.client();
    f.connect(LINK, vec![notify_bas(LEVEL)]);
    f.srv.enable_notifications(a, ADDR, I0).unwrap();
    f.write_rsp(f.gatt.take()[0].0, Ok(()));

    f.srv.unregister_events(a).unwrap();
    assert_matches!(
        f.gatt.take().as_slice(),
        [(_, GattOp::Write { ref value, .. })] if value == &[0, 0]
    );
    assert_eq!(f.srv.unregister_events(a), Err(Error::InvalidCallback));
}

#[test]
fn persisted_state_restored() {
    let f = Fix::new();
    let a = f.client();
    f.store.write(SECTION, BL0, 1);
    f.connect(SECURE, vec![notify_bas(LEVEL)]);

    // The remote CCCD is known to be enabled, so subscribing does not write
    f.srv.enable_notifications(a, ADDR, I0).unwrap();
    assert!(f.gatt.take().is_empty());
    f.srv.handle(Update::Gatt(gatt::Event::Notify {
        peer: ADDR,
        hdl: hdl(LEVEL),
        value: vec![80],
    }));
    assert_matches!(
        f.take_events().as_slice(),
        [_, (id, Event::BatteryLevelNotification { level: 80, .. })] if *id == a
    );
    assert_eq!(f.store.read(SECTION, IC), 1);
}

#[test]
fn persisted_state_written_and_purged() {
    const BL1: &str = "BL-0001-010203040506";
    let f = Fix::new();
    let a = f.client();
    f.connect(SECURE, vec![notify_bas(0x10), notify_bas(0x20)]);
    f.srv.enable_notifications(a, ADDR, I0).unwrap();
    f.srv.enable_notifications(a, ADDR, InstanceId::new(1)).unwrap();
    for (txn, _) in f.gatt.take() {
        f.write_rsp(txn, Ok(()));
    }
    assert_eq!(f.store.read(SECTION, BL0), 1);
    assert_eq!(f.store.read(SECTION, BL1), 1);
    assert_eq!(f.store.read(SECTION, IC), 2);

    // Disconnect leaves stored state for the next session
    let props = Properties::new(ADDR, DevFlags::PAIRED);
    f.dir.0.lock().props = Some(props);
    f.srv.handle(Update::Device(dev::Event::Properties {
        props,
        changed: ChangedFlags::CONNECTION | ChangedFlags::ENCRYPTION,
    }));
    assert_matches!(
        f.take_events().as_slice(),
        [_, (_, Event::Disconnected { addr: ADDR })]
    );
    assert_eq!(f.store.read(SECTION, BL0), 1);

    // Un-pairing purges it
    let props = Properties::new(ADDR, DevFlags::default());
    f.dir.0.lock().props = Some(props);
    f.srv.handle(Update::Device(dev::Event::Properties {
        props,
        changed: ChangedFlags::PAIRING,
    }));
    assert_eq!(f.store.read(SECTION, BL0), 0);
    assert_eq!(f.store.read(SECTION, BL1), 0);
    assert_eq!(f.store.read(SECTION, IC), 0);
}

#[test]
fn device_deleted() {
    let f = Fix::new();
    let a = f.client();
    f.connect(SECURE, vec![notify_bas(LEVEL)]);
    f.srv.enable_notifications(a, ADDR, I0).unwrap();
    f.write_rsp(f.gatt.take()[0].0, Ok(()));
    f.take_events();

    f.srv.handle(Update::Device(dev::Event::Deleted { addr: ADDR }));
    assert_matches!(
        f.take_events().as_slice(),
        [(_, Event::Disconnected { addr: ADDR })]
    );
    assert_eq!(f.store.read(SECTION, BL0), 0);
    assert_eq!(f.srv.battery_level(a, ADDR, I0), Err(Error::InvalidInstance));
}

#[test]
fn address_rotation() {
    let f = Fix::new();
    let a = f.client();
    f.connect(SECURE, vec![notify_bas(LEVEL)]);
    f.srv.enable_notifications(a, ADDR, I0).unwrap();
    f.write_rsp(f.gatt.take()[0].0, Ok(()));
    f.take_events();

    let new = Addr::Public(RawAddr::from_le_bytes([0x66, 5, 4, 3, 2, 1]));
    let props = Properties {
        addr: new,
        prior_addr: Some(ADDR),
        flags: SECURE,
    };
    f.dir.0.lock().props = Some(props);
    f.srv.handle(Update::Device(dev::Event::Properties {
        props,
        changed: ChangedFlags::ADDRESS,
    }));

    // Stored state and the subscription follow the device
    assert_eq!(f.store.read(SECTION, BL0), 0);
    assert_eq!(f.store.read(SECTION, "BL-0000-010203040566"), 1);
    f.srv.handle(Update::Gatt(gatt::Event::Notify {
        peer: new,
        hdl: hdl(LEVEL),
        value: vec![42],
    }));
    assert_matches!(
        f.take_events().as_slice(),
        [(id, Event::BatteryLevelNotification { addr, level: 42, .. })]
            if (*id, *addr) == (a, new)
    );
}

#[test]
fn power_off() {
    let f = Fix::new();
    let a = f.client();
    f.connect(LINK, vec![notify_bas(LEVEL)]);
    f.srv.battery_level(a, ADDR, I0).unwrap();
    let txn = f.gatt.take()[0].0;
    f.take_events();

    f.srv.handle(Update::Device(dev::Event::Power { on: false }));
    assert!(f.take_events().is_empty()); // no synthetic disconnects
    assert_eq!(f.srv.battery_level(a, ADDR, I0), Err(Error::InvalidInstance));
    f.read_rsp(txn, Ok(vec![1]));
    assert!(f.take_events().is_empty());
}

#[test]
fn remote_client() {
    fn response(bus: &FakeBus) -> (AddressId, i32) {
        let sent = bus.take();
        let (h, p) = Header::unpack(&sent[0].1).unwrap();
        assert!(h.msg_id.is_response());
        (sent[0].0, Response::unpack(p).unwrap().status)
    }

    let f = Fix::new();
    let ep = AddressId::new(9);

    let m = ipc::message(
        &Header::new(ep, MessageId::request(1), Func::RegisterClientEvents, 0),
        |_| {},
    );
    f.srv.handle(Update::Message(m.as_ref().to_vec()));
    let (to, status) = response(&f.bus);
    assert_eq!(to, ep);
    let cb = u32::try_from(status).unwrap();
    assert_ne!(cb, 0);

    // Connected events are marshaled onto the bus
    f.connect(LINK, vec![notify_bas(LEVEL)]);
    let sent = f.bus.take();
    let (h, p) = Header::unpack(&sent[0].1).unwrap();
    assert_eq!((h.addr_id, h.func), (ep, Func::Connected));
    assert!(!h.msg_id.is_response());
    let e = ConnectedEvent::unpack(p).unwrap();
    assert_eq!((e.callback, e.addr, e.instances), (cb, ADDR.raw(), 1));

    // Callback ownership is checked against the requesting endpoint
    let req = Request {
        callback: cb,
        addr: ADDR.raw(),
        instance: 0,
    };
    let m = ipc::message(
        &Header::new(
            AddressId::new(10),
            MessageId::request(2),
            Func::EnableNotifications,
            Request::SIZE,
        ),
        |p| req.pack(p),
    );
    f.srv.handle(Update::Message(m.as_ref().to_vec()));
    let (to, status) = response(&f.bus);
    assert_eq!((to, status), (AddressId::new(10), Error::InvalidCallback.status()));
    assert!(f.gatt.take().is_empty());

    let m = ipc::message(
        &Header::new(ep, MessageId::request(3), Func::EnableNotifications, Request::SIZE),
        |p| req.pack(p),
    );
    f.srv.handle(Update::Message(m.as_ref().to_vec()));
    assert_eq!(response(&f.bus).1, 0);
    let ops = f.gatt.take();
    assert_matches!(ops.as_slice(), [(_, GattOp::Write { .. })]);
    f.write_rsp(ops[0].0, Ok(()));

    // Endpoint detach un-registers its callbacks and subscriptions
    f.srv.handle(Update::ClientDetached(ep));
    assert_matches!(
        f.gatt.take().as_slice(),
        [(_, GattOp::Write { ref value, .. })] if value == &[0, 0]
    );
    let m = ipc::message(
        &Header::new(ep, MessageId::request(4), Func::GetBatteryLevel, Request::SIZE),
        |p| req.pack(p),
    );
    f.srv.handle(Update::Message(m.as_ref().to_vec()));
    assert_eq!(response(&f.bus).1, Error::InvalidCallback.status());
}

#[test]
fn invalid_messages() {
    let f = Fix::new();
    f.srv.handle(Update::Message(vec![0; 4])); // truncated
    f.srv.handle(Update::Message(
        (ipc::message(
            &Header::new(AddressId::new(1), MessageId::request(1), Func::Connected, 0),
            |_| {},
        ))
        .as_ref()
        .to_vec(),
    ));
    assert_eq!(f.bus.take().len(), 1); // only the event function got a response
}

#[tokio::test]
async fn event_loop() {
    let f = Fix::new();
    let el = f.srv.event_loop();
    let a = f.client();

    let props = Properties::new(ADDR, LINK);
    {
        let mut d = f.dir.0.lock();
        d.props = Some(props);
        d.services = vec![notify_bas(LEVEL)];
    }
    f.srv.update(Update::Device(dev::Event::Properties {
        props,
        changed: ChangedFlags::CONNECTION | ChangedFlags::SERVICES,
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_matches!(
        f.take_events().as_slice(),
        [(id, Event::Connected { addr: ADDR, instances: 1 })] if *id == a
    );

    el.stop().await;
    assert_eq!(f.srv.unregister_events(a), Err(Error::NotInitialized));
}

//! Shared fixtures for the stillcan end-to-end tests

use std::cell::RefCell;
use std::rc::Rc;

use stillcan_common::{CanFrame, DataType, NodeId, Value};
use stillcan_node::net::SendFn;
use stillcan_node::object_dict::{AccessType, Device, Object, ObjectCode, SubObject};
use stillcan_node::Node;

/// Frames captured from a node's send callback
pub type FrameLog = Rc<RefCell<Vec<CanFrame>>>;

/// Build a send callback that appends every frame to a shared log
pub fn frame_sink() -> (SendFn, FrameLog) {
    let log: FrameLog = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    (
        Box::new(move |frame: &CanFrame| {
            sink.borrow_mut().push(*frame);
            Ok(())
        }),
        log,
    )
}

/// Exchange queued frames between two nodes until both go quiet
pub fn pump(a: &mut Node, a_log: &FrameLog, b: &mut Node, b_log: &FrameLog, now: u64) {
    for _ in 0..1000 {
        let from_a: Vec<CanFrame> = a_log.borrow_mut().drain(..).collect();
        let from_b: Vec<CanFrame> = b_log.borrow_mut().drain(..).collect();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for frame in from_a {
            b.on_frame(&frame, now);
        }
        for frame in from_b {
            a.on_frame(&frame, now);
        }
    }
    panic!("nodes did not go quiet");
}

fn var(index: u16, ty: DataType, access: AccessType, default: Value) -> Object {
    let mut obj = Object::new(index, ObjectCode::Var);
    obj.insert_sub(SubObject::new(0, ty, access).with_default(default))
        .unwrap();
    obj
}

/// Build a device carrying the standard communication objects plus a few
/// application objects, mirroring a typical small CANopen slave
pub fn server_device(node_id: u8) -> Device {
    let mut dev =
        Device::new(NodeId::new(node_id).unwrap()).with_identity(0x0000_1234, 0x0101, 1);

    dev.insert_object(var(
        0x1000,
        DataType::UInt32,
        AccessType::Ro,
        Value::UInt32(0x0000_0000),
    ))
    .unwrap();
    dev.insert_object(var(0x1001, DataType::UInt8, AccessType::Ro, Value::UInt8(0)))
        .unwrap();

    let mut obj = Object::new(0x1003, ObjectCode::Array).with_name("Pre-defined error field");
    obj.insert_sub(SubObject::new(0, DataType::UInt8, AccessType::Rw)).unwrap();
    for i in 1..=4 {
        obj.insert_sub(SubObject::new(i, DataType::UInt32, AccessType::Ro)).unwrap();
    }
    dev.insert_object(obj).unwrap();

    dev.insert_object(var(
        0x1005,
        DataType::UInt32,
        AccessType::Rw,
        Value::UInt32(0x80),
    ))
    .unwrap();
    dev.insert_object(var(0x1006, DataType::UInt32, AccessType::Rw, Value::UInt32(0)))
        .unwrap();
    dev.insert_object(var(0x1007, DataType::UInt32, AccessType::Rw, Value::UInt32(0)))
        .unwrap();
    dev.insert_object(var(
        0x1012,
        DataType::UInt32,
        AccessType::Rw,
        Value::UInt32(0x100),
    ))
    .unwrap();
    dev.insert_object(var(0x1013, DataType::UInt32, AccessType::Rw, Value::UInt32(0)))
        .unwrap();
    dev.insert_object(var(
        0x1014,
        DataType::UInt32,
        AccessType::Rw,
        Value::UInt32(0x80 + node_id as u32),
    ))
    .unwrap();
    dev.insert_object(var(0x1015, DataType::UInt16, AccessType::Rw, Value::UInt16(0)))
        .unwrap();

    let mut obj = Object::new(0x1018, ObjectCode::Record).with_name("Identity");
    obj.insert_sub(
        SubObject::new(0, DataType::UInt8, AccessType::Const).with_default(Value::UInt8(4)),
    )
    .unwrap();
    obj.insert_sub(
        SubObject::new(1, DataType::UInt32, AccessType::Ro)
            .with_default(Value::UInt32(0x0000_1234)),
    )
    .unwrap();
    obj.insert_sub(SubObject::new(2, DataType::UInt32, AccessType::Ro)).unwrap();
    obj.insert_sub(SubObject::new(3, DataType::UInt32, AccessType::Ro)).unwrap();
    obj.insert_sub(SubObject::new(4, DataType::UInt32, AccessType::Ro)).unwrap();
    dev.insert_object(obj).unwrap();

    dev.insert_object(var(0x1019, DataType::UInt8, AccessType::Rw, Value::UInt8(0)))
        .unwrap();

    // One RPDO and one TPDO, both disabled until a test configures them
    let mut obj = Object::new(0x1400, ObjectCode::Record);
    obj.insert_sub(
        SubObject::new(0, DataType::UInt8, AccessType::Const).with_default(Value::UInt8(2)),
    )
    .unwrap();
    obj.insert_sub(
        SubObject::new(1, DataType::UInt32, AccessType::Rw)
            .with_default(Value::UInt32(0x8000_0000 | (0x200 + node_id as u32))),
    )
    .unwrap();
    obj.insert_sub(
        SubObject::new(2, DataType::UInt8, AccessType::Rw).with_default(Value::UInt8(255)),
    )
    .unwrap();
    dev.insert_object(obj).unwrap();

    let mut obj = Object::new(0x1600, ObjectCode::Record);
    obj.insert_sub(SubObject::new(0, DataType::UInt8, AccessType::Rw)).unwrap();
    for i in 1..=8 {
        obj.insert_sub(SubObject::new(i, DataType::UInt32, AccessType::Rw)).unwrap();
    }
    dev.insert_object(obj).unwrap();

    let mut obj = Object::new(0x1800, ObjectCode::Record);
    obj.insert_sub(
        SubObject::new(0, DataType::UInt8, AccessType::Const).with_default(Value::UInt8(6)),
    )
    .unwrap();
    obj.insert_sub(
        SubObject::new(1, DataType::UInt32, AccessType::Rw)
            .with_default(Value::UInt32(0x8000_0000 | (0x180 + node_id as u32))),
    )
    .unwrap();
    obj.insert_sub(
        SubObject::new(2, DataType::UInt8, AccessType::Rw).with_default(Value::UInt8(255)),
    )
    .unwrap();
    obj.insert_sub(SubObject::new(3, DataType::UInt16, AccessType::Rw)).unwrap();
    obj.insert_sub(SubObject::new(5, DataType::UInt16, AccessType::Rw)).unwrap();
    obj.insert_sub(SubObject::new(6, DataType::UInt8, AccessType::Rw)).unwrap();
    dev.insert_object(obj).unwrap();

    let mut obj = Object::new(0x1A00, ObjectCode::Record);
    obj.insert_sub(SubObject::new(0, DataType::UInt8, AccessType::Rw)).unwrap();
    for i in 1..=8 {
        obj.insert_sub(SubObject::new(i, DataType::UInt32, AccessType::Rw)).unwrap();
    }
    dev.insert_object(obj).unwrap();

    // Application objects
    let mut obj = Object::new(0x2000, ObjectCode::Var).with_name("Actuator setpoint");
    obj.insert_sub(
        SubObject::new(0, DataType::UInt32, AccessType::Rww)
            .with_limits(Some(Value::UInt32(0)), Some(Value::UInt32(0xFFFF_FFFF)))
            .pdo_mappable(),
    )
    .unwrap();
    dev.insert_object(obj).unwrap();

    let mut obj = Object::new(0x2001, ObjectCode::Var).with_name("Sensor reading");
    obj.insert_sub(
        SubObject::new(0, DataType::UInt32, AccessType::Rwr).pdo_mappable(),
    )
    .unwrap();
    dev.insert_object(obj).unwrap();

    dev.insert_object(var(
        0x2002,
        DataType::OctetString,
        AccessType::Rw,
        Value::OctetString(b"abcdefghij".to_vec()),
    ))
    .unwrap();
    dev.insert_object(var(
        0x2003,
        DataType::Domain,
        AccessType::Rw,
        Value::Domain(Vec::new()),
    ))
    .unwrap();

    let mut obj = Object::new(0x2004, ObjectCode::Var);
    obj.insert_sub(SubObject::new(0, DataType::UInt8, AccessType::Rww).pdo_mappable())
        .unwrap();
    dev.insert_object(obj).unwrap();

    let mut obj = Object::new(0x2005, ObjectCode::Var);
    obj.insert_sub(SubObject::new(0, DataType::Int16, AccessType::Rwr).pdo_mappable())
        .unwrap();
    dev.insert_object(obj).unwrap();

    dev
}

/// A server node with its SDO server started, plus its frame log
pub fn server_node(node_id: u8) -> (Node, FrameLog) {
    let (send, log) = frame_sink();
    let mut node = Node::new(server_device(node_id), send).unwrap();
    node.start_sdo_server(0).unwrap();
    (node, log)
}

/// A bare client node connected to `server_node_id`, plus its frame log
pub fn client_node(node_id: u8, server_node_id: u8) -> (Node, FrameLog) {
    let (send, log) = frame_sink();
    let dev = Device::new(NodeId::new(node_id).unwrap());
    let mut node = Node::new(dev, send).unwrap();
    node.sdo_client_connect(server_node_id, 0).unwrap();
    (node, log)
}

use integration_tests::{frame_sink, server_device, server_node};
use stillcan_common::{CanFrame, CanId, TimeOfDay, Value};
use stillcan_node::Node;

const NODE_ID: u8 = 5;

#[test]
fn test_sync_producer_period() {
    let (mut node, log) = server_node(NODE_ID);

    // Producer bit + 10 ms period + counter up to 4
    node.write(0x1019, 0, &Value::UInt8(4), 0).unwrap();
    node.write(0x1006, 0, &Value::UInt32(10_000), 0).unwrap();
    node.write(0x1005, 0, &Value::UInt32(0x4000_0080), 0).unwrap();
    node.start_sync(0).unwrap();
    log.borrow_mut().clear();

    assert_eq!(node.next_deadline(), Some(10_000));
    node.tick(10_000);
    node.tick(20_000);
    node.tick(30_000);

    let sent = log.borrow();
    let syncs: Vec<&CanFrame> = sent.iter().filter(|f| f.id() == CanId::Std(0x80)).collect();
    assert_eq!(syncs.len(), 3);
    assert_eq!(syncs[0].data(), &[1]);
    assert_eq!(syncs[1].data(), &[2]);
    assert_eq!(syncs[2].data(), &[3]);
}

#[test]
fn test_sync_producer_requires_node_id() {
    use stillcan_common::NodeId;

    let (send, _log) = frame_sink();
    let mut dev = server_device(NODE_ID);
    dev.set_node_id(NodeId::UNCONFIGURED);
    // Producer bit set before the services attach
    dev.write(0x1005, 0, Value::UInt32(0x4000_0080)).unwrap();
    let mut node = Node::new(dev, send).unwrap();

    assert!(node.start_sync(0).is_err());
}

#[test]
fn test_sync_producer_drives_own_pdos() {
    let (mut node, log) = server_node(NODE_ID);

    // Synchronous TPDO on every SYNC
    node.write(0x1A00, 1, &Value::UInt32(0x2001_0020), 0).unwrap();
    node.write(0x1A00, 0, &Value::UInt8(1), 0).unwrap();
    node.write(0x1800, 2, &Value::UInt8(1), 0).unwrap();
    node.write(0x1800, 1, &Value::UInt32(0x185), 0).unwrap();
    node.write(0x2001, 0, &Value::UInt32(0x99), 0).unwrap();

    node.write(0x1006, 0, &Value::UInt32(5_000), 0).unwrap();
    node.write(0x1005, 0, &Value::UInt32(0x4000_0080), 0).unwrap();
    node.start_sync(0).unwrap();
    log.borrow_mut().clear();

    node.tick(5_000);
    let sent = log.borrow();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].id(), CanId::Std(0x80));
    assert_eq!(sent[1].id(), CanId::Std(0x185));
    assert_eq!(sent[1].data(), &0x99u32.to_le_bytes());
}

#[test]
fn test_time_producer_emits_wall_clock() {
    let (mut node, log) = server_node(NODE_ID);

    node.write(0x1012, 0, &Value::UInt32(0x4000_0100), 0).unwrap();
    node.time()
        .unwrap()
        .set_clock(0, TimeOfDay::from_ymd_hms_ms(2024, 5, 1, 12, 0, 0, 0).unwrap());
    node.start_time_producer(1_000_000, 0).unwrap();
    log.borrow_mut().clear();

    assert_eq!(node.next_deadline(), Some(1_000_000));
    node.tick(1_000_000);

    let sent = log.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id(), CanId::Std(0x100));
    let data = sent[0].data();
    assert_eq!(data.len(), 6);
    // 2024-05-01 is day 14731 of the CANopen epoch; noon plus the second
    // that elapsed before production
    assert_eq!(
        u32::from_le_bytes(data[0..4].try_into().unwrap()),
        43_201_000
    );
    assert_eq!(u16::from_le_bytes(data[4..6].try_into().unwrap()), 14731);
    drop(sent);

    // The high resolution time stamp tracked the elapsed time
    assert_eq!(node.read(0x1013, 0).unwrap(), Value::UInt32(1_000_000));
}

#[test]
fn test_time_consumer_indication() {
    use std::cell::Cell;
    use std::rc::Rc;

    let (mut node, _log) = server_node(NODE_ID);
    node.write(0x1012, 0, &Value::UInt32(0x8000_0100), 0).unwrap();

    let seen = Rc::new(Cell::new(None));
    let sink = seen.clone();
    node.time()
        .unwrap()
        .set_indication(Some(Box::new(move |t| sink.set(Some(t)))));

    let mut payload = [0u8; 6];
    payload[0..4].copy_from_slice(&43_200_000u32.to_le_bytes());
    payload[4..6].copy_from_slice(&14731u16.to_le_bytes());
    node.on_frame(&CanFrame::new(CanId::Std(0x100), &payload), 0);

    assert_eq!(seen.get(), Some(TimeOfDay::new(14731, 43_200_000)));
}

#[test]
fn test_time_renumber_needs_disable() {
    let (mut node, _log) = server_node(NODE_ID);
    node.write(0x1012, 0, &Value::UInt32(0x8000_0100), 0).unwrap();

    // Active consumer: moving the CAN-ID is refused
    assert!(node.write(0x1012, 0, &Value::UInt32(0x8000_0101), 0).is_err());
    assert!(node.write(0x1012, 0, &Value::UInt32(0x101), 0).is_err());

    node.write(0x1012, 0, &Value::UInt32(0x100), 0).unwrap();
    node.write(0x1012, 0, &Value::UInt32(0x101), 0).unwrap();
    node.write(0x1012, 0, &Value::UInt32(0x8000_0101), 0).unwrap();
}

#[test]
fn test_emcy_push_and_history() {
    let (mut node, log) = server_node(NODE_ID);
    log.borrow_mut().clear();

    node.emcy_push(0x2310, 0x02, [0xAA, 0, 0, 0, 0], 0).unwrap();

    let sent = log.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id(), CanId::Std(0x85));
    assert_eq!(sent[0].data(), &[0x10, 0x23, 0x03, 0xAA, 0, 0, 0, 0]);
    drop(sent);

    assert_eq!(node.read(0x1001, 0).unwrap(), Value::UInt8(0x03));
    assert_eq!(node.read(0x1003, 0).unwrap(), Value::UInt8(1));
    assert_eq!(node.read(0x1003, 1).unwrap(), Value::UInt32(0x2310));

    node.emcy_push(0x8100, 0x10, [0; 5], 0).unwrap();
    assert_eq!(node.read(0x1003, 0).unwrap(), Value::UInt8(2));
    assert_eq!(node.read(0x1003, 1).unwrap(), Value::UInt32(0x8100));
    assert_eq!(node.read(0x1003, 2).unwrap(), Value::UInt32(0x2310));

    node.emcy_clear(0).unwrap();
    assert_eq!(node.read(0x1001, 0).unwrap(), Value::UInt8(0));
    assert_eq!(node.read(0x1003, 0).unwrap(), Value::UInt8(0));
}

#[test]
fn test_emcy_consumer_between_nodes() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let (mut producer, producer_log) = server_node(NODE_ID);

    // The consumer node watches node 5's EMCY COB-ID via object 0x1028
    let (send, _log) = frame_sink();
    let mut dev = server_device(6);
    let mut obj = stillcan_node::object_dict::Object::new(
        0x1028,
        stillcan_node::object_dict::ObjectCode::Array,
    );
    obj.insert_sub(
        stillcan_node::object_dict::SubObject::new(
            0,
            stillcan_common::DataType::UInt8,
            stillcan_node::object_dict::AccessType::Const,
        )
        .with_default(Value::UInt8(1)),
    )
    .unwrap();
    obj.insert_sub(
        stillcan_node::object_dict::SubObject::new(
            1,
            stillcan_common::DataType::UInt32,
            stillcan_node::object_dict::AccessType::Rw,
        )
        .with_default(Value::UInt32(0x85)),
    )
    .unwrap();
    dev.insert_object(obj).unwrap();
    let mut consumer = Node::new(dev, send).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    consumer
        .emcy()
        .unwrap()
        .set_indication(Some(Box::new(move |id, msg| {
            sink.borrow_mut().push((id, msg.eec));
        })));

    producer.emcy_push(0x4201, 0x08, [0; 5], 0).unwrap();
    for frame in producer_log.borrow_mut().drain(..) {
        consumer.on_frame(&frame, 0);
    }

    assert_eq!(seen.borrow().as_slice(), &[(CanId::Std(0x85), 0x4201)]);
}

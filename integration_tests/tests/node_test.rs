use integration_tests::{frame_sink, server_device, server_node};
use stillcan_common::{CanFrame, CanId, DataType, Value};
use stillcan_node::persist;
use stillcan_node::Node;

const NODE_ID: u8 = 5;

#[test]
fn test_unrelated_frames_ignored() {
    let (mut node, log) = server_node(NODE_ID);

    // An NMT-style frame and somebody else's SDO channel
    node.on_frame(&CanFrame::new(CanId::Std(0x000), &[1, 5]), 0);
    node.on_frame(&CanFrame::new(CanId::Std(0x606), &[0x40, 0, 0x10, 0, 0, 0, 0, 0]), 0);
    assert!(log.borrow().is_empty());
}

#[test]
fn test_sdo_server_requires_node_id() {
    use stillcan_common::NodeId;

    let (send, _log) = frame_sink();
    let mut dev = server_device(NODE_ID);
    dev.set_node_id(NodeId::UNCONFIGURED);
    let mut node = Node::new(dev, send).unwrap();
    assert!(node.start_sdo_server(0).is_err());
}

#[test]
fn test_frames_emitted_in_order() {
    let (mut node, log) = server_node(NODE_ID);

    // A SYNC producer driving a synchronous TPDO: one tick produces both
    // frames, and they must appear in production order
    node.write(0x1A00, 1, &Value::UInt32(0x2001_0020), 0).unwrap();
    node.write(0x1A00, 0, &Value::UInt8(1), 0).unwrap();
    node.write(0x1800, 2, &Value::UInt8(1), 0).unwrap();
    node.write(0x1800, 1, &Value::UInt32(0x185), 0).unwrap();

    node.write(0x1006, 0, &Value::UInt32(1_000), 0).unwrap();
    node.write(0x1005, 0, &Value::UInt32(0x4000_0080), 0).unwrap();
    node.start_sync(0).unwrap();
    log.borrow_mut().clear();

    node.tick(1_000);
    let sent = log.borrow();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].id(), CanId::Std(0x80));
    assert_eq!(sent[1].id(), CanId::Std(0x185));
}

#[test]
fn test_deadline_tracks_earliest_timer() {
    let (mut node, _log) = server_node(NODE_ID);

    node.write(0x1006, 0, &Value::UInt32(50_000), 0).unwrap();
    node.write(0x1005, 0, &Value::UInt32(0x4000_0080), 0).unwrap();
    node.start_sync(0).unwrap();
    assert_eq!(node.next_deadline(), Some(50_000));

    // An SDO transfer in flight arms the shorter timeout
    node.on_frame(
        &CanFrame::new(
            CanId::Std(0x605),
            &[0x21, 0x02, 0x20, 0x00, 0x0E, 0x00, 0x00, 0x00],
        ),
        0,
    );
    assert_eq!(
        node.next_deadline(),
        Some(stillcan_node::DEFAULT_SDO_TIMEOUT_US.min(50_000))
    );
}

#[test]
fn test_snapshot_roundtrip_through_node() {
    let (mut node, _log) = server_node(NODE_ID);
    node.write(0x2000, 0, &Value::UInt32(0x600D_CAFE), 0).unwrap();
    node.write(0x2002, 0, &Value::OctetString(b"persisted".to_vec()), 0)
        .unwrap();

    let blob = persist::save(node.device());

    let (send, _log2) = frame_sink();
    let mut dev = server_device(NODE_ID);
    persist::load(&mut dev, &blob).unwrap();
    let node2 = Node::new(dev, send).unwrap();
    assert_eq!(node2.read(0x2000, 0).unwrap(), Value::UInt32(0x600D_CAFE));
    assert_eq!(
        node2.read(0x2002, 0).unwrap(),
        Value::OctetString(b"persisted".to_vec())
    );
}

#[test]
fn test_packed_storage_invariant() {
    // Every sub-object's slot is aligned for its type and slots are
    // disjoint, in sub-index order
    let dev = server_device(NODE_ID);
    for obj in dev.objects() {
        let mut prev_end = 0usize;
        for sub in obj.subs() {
            let align = sub.data_type().align_of();
            assert_eq!(sub.offset() % align, 0, "0x{:04X}:{}", obj.index(), sub.sub_index());
            assert!(sub.offset() >= prev_end);
            prev_end = sub.offset() + sub.slot_len();
        }
    }
}

#[test]
fn test_value_codec_roundtrip_all_types() {
    use stillcan_common::{TimeDifference, TimeOfDay};

    let values = [
        Value::Boolean(true),
        Value::Int8(-1),
        Value::Int16(-2),
        Value::Int24(-3),
        Value::Int32(-4),
        Value::Int40(-5),
        Value::Int48(-6),
        Value::Int56(-7),
        Value::Int64(-8),
        Value::UInt8(1),
        Value::UInt16(2),
        Value::UInt24(3),
        Value::UInt32(4),
        Value::UInt40(5),
        Value::UInt48(6),
        Value::UInt56(7),
        Value::UInt64(8),
        Value::Real32(1.25),
        Value::Real64(-0.5),
        Value::VisibleString("roundtrip".into()),
        Value::OctetString(vec![0, 1, 2]),
        Value::UnicodeString(vec![0x68, 0x69]),
        Value::TimeOfDay(TimeOfDay::new(14731, 43_200_000)),
        Value::TimeDifference(TimeDifference::new(2, 100)),
        Value::Domain(vec![9; 40]),
    ];
    for v in values {
        let bytes = v.to_bytes();
        assert_eq!(Value::decode(v.data_type(), &bytes).unwrap(), v, "{:?}", v);
    }
    assert_eq!(DataType::try_from(0x1B).unwrap(), DataType::UInt64);
}

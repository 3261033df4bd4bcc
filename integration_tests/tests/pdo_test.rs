use integration_tests::server_node;
use stillcan_common::{CanFrame, CanId, Value};
use stillcan_node::Node;

const NODE_ID: u8 = 5;

fn sync_frame() -> CanFrame {
    CanFrame::new(CanId::Std(0x80), &[])
}

/// Map 0x2000:00 (u32) into the RPDO and enable it on 0x205
fn setup_rpdo(node: &mut Node, ttype: u8) {
    node.write(0x1600, 1, &Value::UInt32(0x2000_0020), 0).unwrap();
    node.write(0x1600, 0, &Value::UInt8(1), 0).unwrap();
    node.write(0x1400, 2, &Value::UInt8(ttype), 0).unwrap();
    node.write(0x1400, 1, &Value::UInt32(0x205), 0).unwrap();
}

/// Map 0x2001:00 (u32) into the TPDO and enable it on 0x185
fn setup_tpdo(node: &mut Node, ttype: u8) {
    node.write(0x1A00, 1, &Value::UInt32(0x2001_0020), 0).unwrap();
    node.write(0x1A00, 0, &Value::UInt8(1), 0).unwrap();
    node.write(0x1800, 2, &Value::UInt8(ttype), 0).unwrap();
    node.write(0x1800, 1, &Value::UInt32(0x185), 0).unwrap();
}

#[test]
fn test_rpdo_event_driven_commit() {
    let (mut node, _log) = server_node(NODE_ID);
    setup_rpdo(&mut node, 255);

    node.on_frame(
        &CanFrame::new(CanId::Std(0x205), &0xDEAD_BEEFu32.to_le_bytes()),
        0,
    );
    assert_eq!(node.read(0x2000, 0).unwrap(), Value::UInt32(0xDEAD_BEEF));
}

#[test]
fn test_rpdo_synchronous_commits_latest_on_sync() {
    let (mut node, _log) = server_node(NODE_ID);
    setup_rpdo(&mut node, 1);
    node.start_sync(0).unwrap();

    // Two frames between SYNCs: only the second survives
    node.on_frame(&CanFrame::new(CanId::Std(0x205), &111u32.to_le_bytes()), 0);
    node.on_frame(&CanFrame::new(CanId::Std(0x205), &222u32.to_le_bytes()), 0);
    assert_eq!(node.read(0x2000, 0).unwrap(), Value::UInt32(0));

    node.on_frame(&sync_frame(), 0);
    assert_eq!(node.read(0x2000, 0).unwrap(), Value::UInt32(222));

    // No staged frame, the next SYNC changes nothing
    node.write(0x2000, 0, &Value::UInt32(7), 0).unwrap();
    node.on_frame(&sync_frame(), 0);
    assert_eq!(node.read(0x2000, 0).unwrap(), Value::UInt32(7));
}

#[test]
fn test_rpdo_short_frame_dropped() {
    let (mut node, _log) = server_node(NODE_ID);
    setup_rpdo(&mut node, 255);

    node.on_frame(&CanFrame::new(CanId::Std(0x205), &[1, 2]), 0);
    assert_eq!(node.read(0x2000, 0).unwrap(), Value::UInt32(0));
}

#[test]
fn test_tpdo_event_driven_on_mapped_write() {
    let (mut node, log) = server_node(NODE_ID);
    setup_tpdo(&mut node, 255);
    log.borrow_mut().clear();

    node.write(0x2001, 0, &Value::UInt32(0xAABB_CCDD), 0).unwrap();

    let sent = log.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id(), CanId::Std(0x185));
    assert_eq!(sent[0].data(), &0xAABB_CCDDu32.to_le_bytes());
}

#[test]
fn test_tpdo_inhibit_defers_transmission() {
    let (mut node, log) = server_node(NODE_ID);
    node.write(0x1A00, 1, &Value::UInt32(0x2001_0020), 0).unwrap();
    node.write(0x1A00, 0, &Value::UInt8(1), 0).unwrap();
    node.write(0x1800, 2, &Value::UInt8(255), 0).unwrap();
    // 10 * 100 µs = 1 ms minimum gap, set while the PDO is disabled
    node.write(0x1800, 3, &Value::UInt16(10), 0).unwrap();
    node.write(0x1800, 1, &Value::UInt32(0x185), 0).unwrap();
    log.borrow_mut().clear();

    node.write(0x2001, 0, &Value::UInt32(1), 0).unwrap();
    assert_eq!(log.borrow().len(), 1);

    // A second event 100 µs later is inhibited
    node.write(0x2001, 0, &Value::UInt32(2), 100).unwrap();
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(node.next_deadline(), Some(1000));

    node.tick(1000);
    let sent = log.borrow();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].data(), &2u32.to_le_bytes());
}

#[test]
fn test_tpdo_event_timer_resends() {
    let (mut node, log) = server_node(NODE_ID);
    node.write(0x1A00, 1, &Value::UInt32(0x2001_0020), 0).unwrap();
    node.write(0x1A00, 0, &Value::UInt8(1), 0).unwrap();
    node.write(0x1800, 2, &Value::UInt8(254), 0).unwrap();
    // 50 ms maximum gap
    node.write(0x1800, 5, &Value::UInt16(50), 0).unwrap();
    node.write(0x1800, 1, &Value::UInt32(0x185), 0).unwrap();
    log.borrow_mut().clear();

    node.write(0x2001, 0, &Value::UInt32(9), 0).unwrap();
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(node.next_deadline(), Some(50_000));

    node.tick(50_000);
    assert_eq!(log.borrow().len(), 2);
    // The timer re-arms after the periodic send
    assert_eq!(node.next_deadline(), Some(100_000));
}

#[test]
fn test_tpdo_synchronous_every_nth() {
    let (mut node, log) = server_node(NODE_ID);
    setup_tpdo(&mut node, 3);
    node.start_sync(0).unwrap();
    node.write(0x2001, 0, &Value::UInt32(0x55), 0).unwrap();
    log.borrow_mut().clear();

    for _ in 0..5 {
        node.on_frame(&sync_frame(), 0);
    }
    assert_eq!(log.borrow().len(), 1);
    node.on_frame(&sync_frame(), 0);
    assert_eq!(log.borrow().len(), 2);
}

#[test]
fn test_tpdo_rtr() {
    let (mut node, log) = server_node(NODE_ID);
    setup_tpdo(&mut node, 253);
    node.write(0x2001, 0, &Value::UInt32(0x77), 0).unwrap();
    log.borrow_mut().clear();

    node.on_frame(&CanFrame::new_rtr(CanId::Std(0x185), 4), 0);
    let sent = log.borrow();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].rtr);
    assert_eq!(sent[0].data(), &0x77u32.to_le_bytes());
}

#[test]
fn test_mapping_rules_enforced() {
    use stillcan_common::sdo::AbortCode;

    let (mut node, _log) = server_node(NODE_ID);

    // 0x2002 is not PDO-mappable
    assert!(node
        .write(0x1600, 1, &Value::UInt32(0x2002_0020), 0)
        .is_err());

    // Mapping a u8 as 16 bits widens the type
    assert!(node
        .write(0x1600, 1, &Value::UInt32(0x2004_0010), 0)
        .is_err());

    // A valid set totalling more than 64 bits is refused at activation
    node.write(0x1600, 1, &Value::UInt32(0x2000_0020), 0).unwrap();
    node.write(0x1600, 2, &Value::UInt32(0x2001_0020), 0).unwrap();
    node.write(0x1600, 3, &Value::UInt32(0x2005_0010), 0).unwrap();
    assert!(node.write(0x1600, 0, &Value::UInt8(3), 0).is_err());
    node.write(0x1600, 0, &Value::UInt8(2), 0).unwrap();

    // With the mapping active, entries are locked
    let err = node.write(0x1600, 3, &Value::UInt32(0), 0);
    assert!(err.is_err());

    // Enable, then try to move the CAN-ID while enabled
    node.write(0x1400, 1, &Value::UInt32(0x205), 0).unwrap();
    assert!(node.write(0x1400, 1, &Value::UInt32(0x206), 0).is_err());

    // The abort code for an over-long mapping is PdoTooLong on the wire
    assert_eq!(AbortCode::PdoTooLong as u32, 0x0604_0042);
}

#[test]
fn test_mixed_mapping_with_sign_extension() {
    let (mut node, _log) = server_node(NODE_ID);

    // Map a u8 and an i16 back to back
    node.write(0x1600, 1, &Value::UInt32(0x2004_0008), 0).unwrap();
    node.write(0x1600, 2, &Value::UInt32(0x2005_0010), 0).unwrap();
    node.write(0x1600, 0, &Value::UInt8(2), 0).unwrap();
    node.write(0x1400, 2, &Value::UInt8(255), 0).unwrap();
    node.write(0x1400, 1, &Value::UInt32(0x205), 0).unwrap();

    let mut payload = [0u8; 3];
    payload[0] = 0x42;
    payload[1..3].copy_from_slice(&(-123i16).to_le_bytes());
    node.on_frame(&CanFrame::new(CanId::Std(0x205), &payload), 0);

    assert_eq!(node.read(0x2004, 0).unwrap(), Value::UInt8(0x42));
    assert_eq!(node.read(0x2005, 0).unwrap(), Value::Int16(-123));
}

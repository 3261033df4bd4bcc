use integration_tests::{client_node, pump, server_node};
use stillcan_common::sdo::AbortCode;
use stillcan_common::{CanFrame, CanId, Value};
use stillcan_node::sdo_client::{SdoClientError, SdoTransferOutcome};

const SERVER_ID: u8 = 5;

#[test]
fn test_expedited_download_wire_format() {
    let (mut server, log) = server_node(SERVER_ID);

    // Literal frame writing 0x12345678 to 0x2000:00
    server.on_frame(
        &CanFrame::new(
            CanId::Std(0x605),
            &[0x23, 0x00, 0x20, 0x00, 0x78, 0x56, 0x34, 0x12],
        ),
        0,
    );

    let sent = log.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id(), CanId::Std(0x585));
    assert_eq!(sent[0].data(), &[0x60, 0x00, 0x20, 0x00, 0, 0, 0, 0]);
    drop(sent);

    assert_eq!(
        server.read(0x2000, 0).unwrap(),
        Value::UInt32(0x1234_5678)
    );
}

#[test]
fn test_write_to_read_only_aborts() {
    let (mut server, log) = server_node(SERVER_ID);

    // Expedited write to the read-only identity sub-object 0x1018:01
    server.on_frame(
        &CanFrame::new(
            CanId::Std(0x605),
            &[0x2F, 0x18, 0x10, 0x01, 0x01, 0x00, 0x00, 0x00],
        ),
        0,
    );

    let sent = log.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].data(),
        &[0x80, 0x18, 0x10, 0x01, 0x02, 0x00, 0x01, 0x06]
    );
}

#[test]
fn test_client_server_expedited() {
    let (mut server, server_log) = server_node(SERVER_ID);
    let (mut client, client_log) = client_node(2, SERVER_ID);

    client
        .sdo_download(0x2000, 0, 0xCAFE_F00Du32.to_le_bytes().to_vec(), 0)
        .unwrap();
    pump(&mut client, &client_log, &mut server, &server_log, 0);
    assert_eq!(
        client.sdo_take_result(),
        Some(Ok(SdoTransferOutcome::Downloaded))
    );
    assert_eq!(server.read(0x2000, 0).unwrap(), Value::UInt32(0xCAFE_F00D));

    client.sdo_upload(0x2000, 0, 0).unwrap();
    pump(&mut client, &client_log, &mut server, &server_log, 0);
    assert_eq!(
        client.sdo_take_result(),
        Some(Ok(SdoTransferOutcome::Uploaded(
            0xCAFE_F00Du32.to_le_bytes().to_vec()
        )))
    );
}

#[test]
fn test_client_server_segmented() {
    let (mut server, server_log) = server_node(SERVER_ID);
    let (mut client, client_log) = client_node(2, SERVER_ID);

    // The declared size of a segmented upload and the reassembled bytes
    // must agree with the stored value
    client.sdo_upload(0x2002, 0, 0).unwrap();
    pump(&mut client, &client_log, &mut server, &server_log, 0);
    assert_eq!(
        client.sdo_take_result(),
        Some(Ok(SdoTransferOutcome::Uploaded(b"abcdefghij".to_vec())))
    );

    let data: Vec<u8> = (0..23u8).collect();
    client.sdo_download(0x2002, 0, data.clone(), 0).unwrap();
    pump(&mut client, &client_log, &mut server, &server_log, 0);
    assert_eq!(
        client.sdo_take_result(),
        Some(Ok(SdoTransferOutcome::Downloaded))
    );
    assert_eq!(server.read(0x2002, 0).unwrap(), Value::OctetString(data));
}

#[test]
fn test_client_server_block_download() {
    let (mut server, server_log) = server_node(SERVER_ID);
    let (mut client, client_log) = client_node(2, SERVER_ID);

    let data: Vec<u8> = (0..1200usize).map(|x| (x % 251) as u8).collect();
    client
        .sdo_block_download(0x2003, 0, data.clone(), 0)
        .unwrap();
    pump(&mut client, &client_log, &mut server, &server_log, 0);
    assert_eq!(
        client.sdo_take_result(),
        Some(Ok(SdoTransferOutcome::Downloaded))
    );
    assert_eq!(server.read(0x2003, 0).unwrap(), Value::Domain(data));
}

#[test]
fn test_client_server_block_upload() {
    let (mut server, server_log) = server_node(SERVER_ID);
    let (mut client, client_log) = client_node(2, SERVER_ID);

    let data: Vec<u8> = (0..500usize).map(|x| (x % 199) as u8).collect();
    server
        .write(0x2003, 0, &Value::Domain(data.clone()), 0)
        .unwrap();

    client.sdo_block_upload(0x2003, 0, 0).unwrap();
    pump(&mut client, &client_log, &mut server, &server_log, 0);
    assert_eq!(
        client.sdo_take_result(),
        Some(Ok(SdoTransferOutcome::Uploaded(data)))
    );
}

#[test]
fn test_missing_object_abort_reaches_client() {
    let (mut server, server_log) = server_node(SERVER_ID);
    let (mut client, client_log) = client_node(2, SERVER_ID);

    client.sdo_upload(0x7777, 0, 0).unwrap();
    pump(&mut client, &client_log, &mut server, &server_log, 0);
    assert_eq!(
        client.sdo_take_result(),
        Some(Err(SdoClientError::ServerAbort {
            abort_code: AbortCode::NoSuchObject as u32
        }))
    );
}

#[test]
fn test_server_timeout_recovers_channel() {
    let (mut server, log) = server_node(SERVER_ID);

    // Start a segmented download to 0x2002 and then go silent
    server.on_frame(
        &CanFrame::new(
            CanId::Std(0x605),
            &[0x21, 0x02, 0x20, 0x00, 0x0E, 0x00, 0x00, 0x00],
        ),
        0,
    );
    log.borrow_mut().clear();

    let deadline = server.next_deadline().unwrap();
    assert_eq!(deadline, stillcan_node::DEFAULT_SDO_TIMEOUT_US);
    server.tick(deadline);

    let sent = log.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data()[0], 0x80);
    assert_eq!(
        u32::from_le_bytes(sent[0].data()[4..8].try_into().unwrap()),
        AbortCode::Timeout as u32
    );
    drop(sent);

    // The channel is idle again: a fresh expedited write succeeds
    server.on_frame(
        &CanFrame::new(
            CanId::Std(0x605),
            &[0x23, 0x00, 0x20, 0x00, 0x01, 0x00, 0x00, 0x00],
        ),
        deadline + 1,
    );
    assert_eq!(server.read(0x2000, 0).unwrap(), Value::UInt32(1));
}

#[test]
fn test_config_write_rejected_by_hook() {
    let (mut server, server_log) = server_node(SERVER_ID);
    let (mut client, client_log) = client_node(2, SERVER_ID);

    // 0x1019 rejects 1 (reserved by the SYNC counter rules)
    client.sdo_download(0x1019, 0, vec![1], 0).unwrap();
    pump(&mut client, &client_log, &mut server, &server_log, 0);
    assert_eq!(
        client.sdo_take_result(),
        Some(Err(SdoClientError::ServerAbort {
            abort_code: AbortCode::InvalidValue as u32
        }))
    );
}

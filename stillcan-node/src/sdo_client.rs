//! The SDO client state machine
//!
//! A passive counterpart to [`SdoServer`](crate::SdoServer): the host starts
//! a transfer, pumps the server's response frames in through
//! [`SdoClient::on_frame`], and collects the outcome with
//! [`SdoClient::take_result`] once the machine goes idle. One client drives
//! one server channel; a transfer must finish (or be aborted) before the
//! next may start.

use log::warn;
use snafu::Snafu;

use stillcan_common::sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse};

use crate::object_dict::DeviceError;
use crate::sdo_server::{emit_block_segments, MAX_BLKSIZE};
use crate::DEFAULT_SDO_TIMEOUT_US;

fn block_crc(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Errors terminating a client transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum SdoClientError {
    /// The server did not respond within the transfer timeout
    Timeout,
    /// The server aborted the transfer
    #[snafu(display("Server aborted with code {abort_code:#010X}"))]
    ServerAbort {
        /// The abort code from the wire
        abort_code: u32,
    },
    /// The server sent a response that does not fit the running transfer
    UnexpectedResponse,
    /// The server repeated a toggle value
    ToggleNotAlternated,
    /// The server advertised an unusable block size
    InvalidBlockSize,
    /// The block CRC did not match the transferred data
    CrcMismatch,
    /// The transferred byte count does not match the advertised size
    SizeMismatch,
    /// The host cancelled the transfer
    Cancelled,
}

/// A finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoTransferOutcome {
    /// A download completed; the server committed the data
    Downloaded,
    /// An upload completed with the transferred bytes
    Uploaded(Vec<u8>),
}

enum State {
    Idle,
    InitDownload {
        index: u16,
        sub: u8,
        data: Vec<u8>,
    },
    DownloadSeg {
        index: u16,
        sub: u8,
        data: Vec<u8>,
        sent_end: usize,
        toggle: bool,
    },
    InitUpload {
        index: u16,
        sub: u8,
    },
    UploadSeg {
        index: u16,
        sub: u8,
        buf: Vec<u8>,
        toggle: bool,
        declared: Option<usize>,
    },
    BlockDlInit {
        index: u16,
        sub: u8,
        data: Vec<u8>,
    },
    BlockDlSeg {
        index: u16,
        sub: u8,
        data: Vec<u8>,
        base: usize,
        sent: u8,
        crc_enabled: bool,
    },
    BlockDlEnd {
        index: u16,
        sub: u8,
    },
    BlockUlInit {
        index: u16,
        sub: u8,
        blksize: u8,
    },
    BlockUlSeg {
        index: u16,
        sub: u8,
        buf: Vec<u8>,
        block: Vec<u8>,
        seq: u8,
        blksize: u8,
        crc_enabled: bool,
        declared: Option<usize>,
    },
    BlockUlEnd {
        index: u16,
        sub: u8,
        buf: Vec<u8>,
        crc_enabled: bool,
    },
}

impl State {
    fn address(&self) -> (u16, u8) {
        match self {
            State::Idle => (0, 0),
            State::InitDownload { index, sub, .. }
            | State::DownloadSeg { index, sub, .. }
            | State::InitUpload { index, sub }
            | State::UploadSeg { index, sub, .. }
            | State::BlockDlInit { index, sub, .. }
            | State::BlockDlSeg { index, sub, .. }
            | State::BlockDlEnd { index, sub }
            | State::BlockUlInit { index, sub, .. }
            | State::BlockUlSeg { index, sub, .. }
            | State::BlockUlEnd { index, sub, .. } => (*index, *sub),
        }
    }
}

/// An SDO client
pub struct SdoClient {
    state: State,
    timeout_us: u64,
    deadline: Option<u64>,
    result: Option<Result<SdoTransferOutcome, SdoClientError>>,
}

impl core::fmt::Debug for SdoClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdoClient")
            .field("idle", &matches!(self.state, State::Idle))
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Default for SdoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoClient {
    /// Create a client in the idle state
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            timeout_us: DEFAULT_SDO_TIMEOUT_US,
            deadline: None,
            result: None,
        }
    }

    /// Change the per-exchange timeout
    pub fn set_timeout_us(&mut self, us: u64) {
        self.timeout_us = us;
    }

    /// True when no transfer is in progress
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// The deadline of the running exchange's timeout, when one is armed
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Collect the outcome of the last finished transfer
    pub fn take_result(&mut self) -> Option<Result<SdoTransferOutcome, SdoClientError>> {
        self.result.take()
    }

    /// Start a download (write), choosing expedited or segmented transfer
    pub fn download(
        &mut self,
        index: u16,
        sub: u8,
        data: Vec<u8>,
        now: u64,
    ) -> Result<Vec<[u8; 8]>, DeviceError> {
        self.check_idle()?;
        let req = if data.len() <= 4 {
            let req = SdoRequest::expedited_download(index, sub, &data);
            self.state = State::InitDownload { index, sub, data };
            req
        } else {
            let req = SdoRequest::initiate_download(index, sub, Some(data.len() as u32));
            self.state = State::InitDownload { index, sub, data };
            req
        };
        self.arm(now);
        Ok(vec![req.to_bytes()])
    }

    /// Start an upload (read) using the expedited/segmented protocol
    pub fn upload(&mut self, index: u16, sub: u8, now: u64) -> Result<Vec<[u8; 8]>, DeviceError> {
        self.check_idle()?;
        self.state = State::InitUpload { index, sub };
        self.arm(now);
        Ok(vec![SdoRequest::initiate_upload(index, sub).to_bytes()])
    }

    /// Start a block download (write)
    pub fn block_download(
        &mut self,
        index: u16,
        sub: u8,
        data: Vec<u8>,
        now: u64,
    ) -> Result<Vec<[u8; 8]>, DeviceError> {
        self.check_idle()?;
        let req = SdoRequest::initiate_block_download(index, sub, true, data.len() as u32);
        self.state = State::BlockDlInit { index, sub, data };
        self.arm(now);
        Ok(vec![req.to_bytes()])
    }

    /// Start a block upload (read)
    pub fn block_upload(
        &mut self,
        index: u16,
        sub: u8,
        now: u64,
    ) -> Result<Vec<[u8; 8]>, DeviceError> {
        self.check_idle()?;
        let req = SdoRequest::initiate_block_upload(index, sub, true, MAX_BLKSIZE, 0);
        self.state = State::BlockUlInit {
            index,
            sub,
            blksize: MAX_BLKSIZE,
        };
        self.arm(now);
        Ok(vec![req.to_bytes()])
    }

    /// Cancel the running transfer, notifying the server with `code`
    pub fn abort(&mut self, code: AbortCode) -> Vec<[u8; 8]> {
        if self.is_idle() {
            return Vec::new();
        }
        let (index, sub) = self.state.address();
        self.finish(Err(SdoClientError::Cancelled));
        vec![SdoRequest::abort(index, sub, code).to_bytes()]
    }

    /// Handle the expiry of the exchange timeout
    pub fn on_timeout(&mut self, _now: u64) -> Vec<[u8; 8]> {
        if self.is_idle() {
            return Vec::new();
        }
        let (index, sub) = self.state.address();
        self.finish(Err(SdoClientError::Timeout));
        vec![SdoRequest::abort(index, sub, AbortCode::Timeout).to_bytes()]
    }

    /// Handle a frame received on the client's response COB-ID
    pub fn on_frame(&mut self, data: &[u8], now: u64) -> Vec<[u8; 8]> {
        if data.len() != 8 {
            warn!("Ignoring SDO response with bad length {}", data.len());
            return Vec::new();
        }
        if matches!(self.state, State::Idle) {
            return Vec::new();
        }

        let state = core::mem::replace(&mut self.state, State::Idle);
        let out = self.step(state, data);
        if self.is_idle() {
            self.deadline = None;
        } else {
            self.arm(now);
        }
        out
    }

    fn check_idle(&self) -> Result<(), DeviceError> {
        if self.is_idle() {
            Ok(())
        } else {
            Err(DeviceError::Busy)
        }
    }

    fn arm(&mut self, now: u64) {
        self.deadline = Some(now + self.timeout_us);
    }

    fn finish(&mut self, result: Result<SdoTransferOutcome, SdoClientError>) {
        self.state = State::Idle;
        self.deadline = None;
        self.result = Some(result);
    }

    /// Fail the transfer, telling the server why
    fn fail(&mut self, index: u16, sub: u8, code: AbortCode, err: SdoClientError) -> Vec<[u8; 8]> {
        self.finish(Err(err));
        vec![SdoRequest::abort(index, sub, code).to_bytes()]
    }

    fn step(&mut self, state: State, data: &[u8]) -> Vec<[u8; 8]> {
        // During a block upload the wire carries raw segments; an abort is
        // recognizable by its first byte
        if let State::BlockUlSeg { .. } = state {
            if data[0] >> 5 != 4 {
                return self.block_ul_segment(state, data);
            }
        }

        let resp = match SdoResponse::try_from(data) {
            Ok(resp) => resp,
            Err(_) => {
                let (index, sub) = state.address();
                warn!("Failed to parse an SDO response");
                return self.fail(
                    index,
                    sub,
                    AbortCode::InvalidCommandSpecifier,
                    SdoClientError::UnexpectedResponse,
                );
            }
        };

        if let SdoResponse::Abort { abort_code, .. } = resp {
            self.finish(Err(SdoClientError::ServerAbort { abort_code }));
            return Vec::new();
        }

        match state {
            State::Idle => unreachable!(),
            State::InitDownload { .. } => self.init_download(state, resp),
            State::DownloadSeg { .. } => self.download_seg(state, resp),
            State::InitUpload { .. } | State::BlockUlInit { .. } => self.init_upload(state, resp),
            State::UploadSeg { .. } => self.upload_seg(state, resp),
            State::BlockDlInit { .. } => self.block_dl_init(state, resp),
            State::BlockDlSeg { .. } => self.block_dl_seg(state, resp),
            State::BlockDlEnd { .. } => self.block_dl_end(state, resp),
            State::BlockUlSeg { .. } | State::BlockUlEnd { .. } => self.block_ul_end(state, resp),
        }
    }

    fn init_download(&mut self, state: State, resp: SdoResponse) -> Vec<[u8; 8]> {
        let State::InitDownload { index, sub, data } = state else {
            unreachable!()
        };
        match resp {
            SdoResponse::ConfirmDownload { .. } => {
                if data.len() <= 4 {
                    // The expedited frame already carried the value
                    self.finish(Ok(SdoTransferOutcome::Downloaded));
                    return Vec::new();
                }
                let end = data.len().min(7);
                let req = SdoRequest::download_segment(false, end == data.len(), &data[0..end]);
                self.state = State::DownloadSeg {
                    index,
                    sub,
                    data,
                    sent_end: end,
                    toggle: false,
                };
                vec![req.to_bytes()]
            }
            _ => self.fail(
                index,
                sub,
                AbortCode::InvalidCommandSpecifier,
                SdoClientError::UnexpectedResponse,
            ),
        }
    }

    fn download_seg(&mut self, state: State, resp: SdoResponse) -> Vec<[u8; 8]> {
        let State::DownloadSeg {
            index,
            sub,
            data,
            sent_end,
            toggle,
        } = state
        else {
            unreachable!()
        };
        match resp {
            SdoResponse::ConfirmDownloadSegment { t } => {
                if t != toggle {
                    return self.fail(
                        index,
                        sub,
                        AbortCode::ToggleNotAlternated,
                        SdoClientError::ToggleNotAlternated,
                    );
                }
                if sent_end >= data.len() {
                    self.finish(Ok(SdoTransferOutcome::Downloaded));
                    return Vec::new();
                }
                let toggle = !toggle;
                let end = (sent_end + 7).min(data.len());
                let req =
                    SdoRequest::download_segment(toggle, end == data.len(), &data[sent_end..end]);
                self.state = State::DownloadSeg {
                    index,
                    sub,
                    data,
                    sent_end: end,
                    toggle,
                };
                vec![req.to_bytes()]
            }
            _ => self.fail(
                index,
                sub,
                AbortCode::InvalidCommandSpecifier,
                SdoClientError::UnexpectedResponse,
            ),
        }
    }

    fn init_upload(&mut self, state: State, resp: SdoResponse) -> Vec<[u8; 8]> {
        let (index, sub) = state.address();
        match resp {
            SdoResponse::ConfirmUpload { n, e, s, data, .. } => {
                if e {
                    let len = if s { 4 - n as usize } else { 4 };
                    self.finish(Ok(SdoTransferOutcome::Uploaded(data[0..len].to_vec())));
                    Vec::new()
                } else {
                    let declared =
                        s.then(|| u32::from_le_bytes(data) as usize);
                    self.state = State::UploadSeg {
                        index,
                        sub,
                        buf: Vec::new(),
                        toggle: false,
                        declared,
                    };
                    vec![SdoRequest::upload_segment_request(false).to_bytes()]
                }
            }
            SdoResponse::ConfirmBlockUpload { sc, s, size, .. }
                if matches!(state, State::BlockUlInit { .. }) =>
            {
                let State::BlockUlInit { blksize, .. } = state else {
                    unreachable!()
                };
                self.state = State::BlockUlSeg {
                    index,
                    sub,
                    buf: Vec::new(),
                    block: Vec::new(),
                    seq: 0,
                    blksize,
                    crc_enabled: sc,
                    declared: s.then_some(size as usize),
                };
                vec![SdoRequest::StartBlockUpload {}.to_bytes()]
            }
            _ => self.fail(
                index,
                sub,
                AbortCode::InvalidCommandSpecifier,
                SdoClientError::UnexpectedResponse,
            ),
        }
    }

    fn upload_seg(&mut self, state: State, resp: SdoResponse) -> Vec<[u8; 8]> {
        let State::UploadSeg {
            index,
            sub,
            mut buf,
            toggle,
            declared,
        } = state
        else {
            unreachable!()
        };
        match resp {
            SdoResponse::UploadSegment { t, n, c, data } => {
                if t != toggle {
                    return self.fail(
                        index,
                        sub,
                        AbortCode::ToggleNotAlternated,
                        SdoClientError::ToggleNotAlternated,
                    );
                }
                buf.extend_from_slice(&data[0..7 - n as usize]);
                if c {
                    if let Some(declared) = declared {
                        if buf.len() != declared {
                            self.finish(Err(SdoClientError::SizeMismatch));
                            return Vec::new();
                        }
                    }
                    self.finish(Ok(SdoTransferOutcome::Uploaded(buf)));
                    Vec::new()
                } else {
                    let toggle = !toggle;
                    self.state = State::UploadSeg {
                        index,
                        sub,
                        buf,
                        toggle,
                        declared,
                    };
                    vec![SdoRequest::upload_segment_request(toggle).to_bytes()]
                }
            }
            _ => self.fail(
                index,
                sub,
                AbortCode::InvalidCommandSpecifier,
                SdoClientError::UnexpectedResponse,
            ),
        }
    }

    fn block_dl_init(&mut self, state: State, resp: SdoResponse) -> Vec<[u8; 8]> {
        let State::BlockDlInit { index, sub, data } = state else {
            unreachable!()
        };
        match resp {
            SdoResponse::ConfirmBlockDownload { sc, blksize, .. } => {
                if blksize == 0 || blksize > MAX_BLKSIZE {
                    return self.fail(
                        index,
                        sub,
                        AbortCode::InvalidBlockSize,
                        SdoClientError::InvalidBlockSize,
                    );
                }
                let mut out = Vec::new();
                let sent = emit_block_segments(&data, 0, blksize, &mut out);
                self.state = State::BlockDlSeg {
                    index,
                    sub,
                    data,
                    base: 0,
                    sent,
                    crc_enabled: sc,
                };
                out
            }
            _ => self.fail(
                index,
                sub,
                AbortCode::InvalidCommandSpecifier,
                SdoClientError::UnexpectedResponse,
            ),
        }
    }

    fn block_dl_seg(&mut self, state: State, resp: SdoResponse) -> Vec<[u8; 8]> {
        let State::BlockDlSeg {
            index,
            sub,
            data,
            base,
            sent,
            crc_enabled,
        } = state
        else {
            unreachable!()
        };
        match resp {
            SdoResponse::ConfirmBlock { ackseq, blksize } => {
                if blksize == 0 || blksize > MAX_BLKSIZE {
                    return self.fail(
                        index,
                        sub,
                        AbortCode::InvalidBlockSize,
                        SdoClientError::InvalidBlockSize,
                    );
                }
                let base = (base + ackseq.min(sent) as usize * 7).min(data.len());
                if base >= data.len() {
                    let n = ((7 - data.len() % 7) % 7) as u8;
                    let crc = if crc_enabled { block_crc(&data) } else { 0 };
                    self.state = State::BlockDlEnd { index, sub };
                    vec![SdoRequest::end_block_download(n, crc).to_bytes()]
                } else {
                    let mut out = Vec::new();
                    let sent = emit_block_segments(&data, base, blksize, &mut out);
                    self.state = State::BlockDlSeg {
                        index,
                        sub,
                        data,
                        base,
                        sent,
                        crc_enabled,
                    };
                    out
                }
            }
            _ => self.fail(
                index,
                sub,
                AbortCode::InvalidCommandSpecifier,
                SdoClientError::UnexpectedResponse,
            ),
        }
    }

    fn block_dl_end(&mut self, state: State, resp: SdoResponse) -> Vec<[u8; 8]> {
        let State::BlockDlEnd { index, sub } = state else {
            unreachable!()
        };
        match resp {
            SdoResponse::ConfirmBlockDownloadEnd => {
                self.finish(Ok(SdoTransferOutcome::Downloaded));
                Vec::new()
            }
            _ => self.fail(
                index,
                sub,
                AbortCode::InvalidCommandSpecifier,
                SdoClientError::UnexpectedResponse,
            ),
        }
    }

    fn block_ul_segment(&mut self, state: State, data: &[u8]) -> Vec<[u8; 8]> {
        let State::BlockUlSeg {
            index,
            sub,
            mut buf,
            mut block,
            mut seq,
            blksize,
            crc_enabled,
            declared,
        } = state
        else {
            unreachable!()
        };

        // Unwrap: length was checked at entry
        let segment = BlockSegment::try_from(data).unwrap();
        if segment.seqnum == seq + 1 {
            block.extend_from_slice(&segment.data);
            seq = segment.seqnum;
        }

        if segment.c || segment.seqnum == blksize {
            let complete = segment.c && segment.seqnum == seq;
            let ack = SdoRequest::BlockUploadAck {
                ackseq: seq,
                blksize,
            };
            if complete {
                buf.extend_from_slice(&block);
                self.state = State::BlockUlEnd {
                    index,
                    sub,
                    buf,
                    crc_enabled,
                };
            } else {
                if seq == blksize {
                    buf.extend_from_slice(&block);
                    block = Vec::new();
                    seq = 0;
                }
                self.state = State::BlockUlSeg {
                    index,
                    sub,
                    buf,
                    block,
                    seq,
                    blksize,
                    crc_enabled,
                    declared,
                };
            }
            vec![ack.to_bytes()]
        } else {
            self.state = State::BlockUlSeg {
                index,
                sub,
                buf,
                block,
                seq,
                blksize,
                crc_enabled,
                declared,
            };
            Vec::new()
        }
    }

    fn block_ul_end(&mut self, state: State, resp: SdoResponse) -> Vec<[u8; 8]> {
        let (index, sub) = state.address();
        let State::BlockUlEnd {
            mut buf,
            crc_enabled,
            ..
        } = state
        else {
            // A request-style response during segment receive is out of
            // protocol
            return self.fail(
                index,
                sub,
                AbortCode::InvalidCommandSpecifier,
                SdoClientError::UnexpectedResponse,
            );
        };
        match resp {
            SdoResponse::EndBlockUpload { n, crc } => {
                buf.truncate(buf.len() - n as usize);
                if crc_enabled && block_crc(&buf) != crc {
                    return self.fail(
                        index,
                        sub,
                        AbortCode::CrcError,
                        SdoClientError::CrcMismatch,
                    );
                }
                self.finish(Ok(SdoTransferOutcome::Uploaded(buf)));
                vec![SdoRequest::EndBlockUploadAck {}.to_bytes()]
            }
            _ => self.fail(
                index,
                sub,
                AbortCode::InvalidCommandSpecifier,
                SdoClientError::UnexpectedResponse,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_req(frame: &[u8; 8]) -> SdoRequest {
        SdoRequest::try_from(frame.as_slice()).unwrap()
    }

    #[test]
    fn test_expedited_download() {
        let mut client = SdoClient::new();
        let frames = client
            .download(0x2000, 1, vec![0x78, 0x56, 0x34, 0x12], 0)
            .unwrap();
        assert_eq!(frames, vec![[0x23, 0x00, 0x20, 0x01, 0x78, 0x56, 0x34, 0x12]]);

        let out = client.on_frame(
            &SdoResponse::download_acknowledge(0x2000, 1).to_bytes(),
            0,
        );
        assert!(out.is_empty());
        assert_eq!(
            client.take_result(),
            Some(Ok(SdoTransferOutcome::Downloaded))
        );
        assert!(client.is_idle());
    }

    #[test]
    fn test_busy_rejected() {
        let mut client = SdoClient::new();
        client.download(0x2000, 1, vec![1], 0).unwrap();
        assert_eq!(
            client.upload(0x2000, 1, 0),
            Err(DeviceError::Busy)
        );
    }

    #[test]
    fn test_segmented_download() {
        let mut client = SdoClient::new();
        let data: Vec<u8> = (0..10).collect();
        let frames = client.download(0x2001, 0, data.clone(), 0).unwrap();
        assert_eq!(
            parse_req(&frames[0]),
            SdoRequest::initiate_download(0x2001, 0, Some(10))
        );

        let out = client.on_frame(
            &SdoResponse::download_acknowledge(0x2001, 0).to_bytes(),
            0,
        );
        assert_eq!(
            parse_req(&out[0]),
            SdoRequest::download_segment(false, false, &data[0..7])
        );

        let out = client.on_frame(
            &SdoResponse::download_segment_acknowledge(false).to_bytes(),
            0,
        );
        assert_eq!(
            parse_req(&out[0]),
            SdoRequest::download_segment(true, true, &data[7..10])
        );

        let out = client.on_frame(
            &SdoResponse::download_segment_acknowledge(true).to_bytes(),
            0,
        );
        assert!(out.is_empty());
        assert_eq!(
            client.take_result(),
            Some(Ok(SdoTransferOutcome::Downloaded))
        );
    }

    #[test]
    fn test_segmented_upload() {
        let mut client = SdoClient::new();
        client.upload(0x2001, 0, 0).unwrap();

        let out = client.on_frame(
            &SdoResponse::upload_acknowledge(0x2001, 0, 10).to_bytes(),
            0,
        );
        assert_eq!(parse_req(&out[0]), SdoRequest::upload_segment_request(false));

        let out = client.on_frame(
            &SdoResponse::upload_segment(false, false, b"abcdefg").to_bytes(),
            0,
        );
        assert_eq!(parse_req(&out[0]), SdoRequest::upload_segment_request(true));

        let out = client.on_frame(
            &SdoResponse::upload_segment(true, true, b"hij").to_bytes(),
            0,
        );
        assert!(out.is_empty());
        assert_eq!(
            client.take_result(),
            Some(Ok(SdoTransferOutcome::Uploaded(b"abcdefghij".to_vec())))
        );
    }

    #[test]
    fn test_server_abort_surfaces() {
        let mut client = SdoClient::new();
        client.upload(0x1018, 1, 0).unwrap();
        let out = client.on_frame(
            &SdoResponse::abort(0x1018, 1, AbortCode::NoSuchObject).to_bytes(),
            0,
        );
        assert!(out.is_empty());
        assert_eq!(
            client.take_result(),
            Some(Err(SdoClientError::ServerAbort {
                abort_code: AbortCode::NoSuchObject as u32
            }))
        );
    }

    #[test]
    fn test_timeout_sends_abort() {
        let mut client = SdoClient::new();
        client.upload(0x2000, 1, 1000).unwrap();
        assert_eq!(client.deadline(), Some(1000 + DEFAULT_SDO_TIMEOUT_US));

        let out = client.on_timeout(1000 + DEFAULT_SDO_TIMEOUT_US);
        assert_eq!(
            parse_req(&out[0]),
            SdoRequest::abort(0x2000, 1, AbortCode::Timeout)
        );
        assert_eq!(client.take_result(), Some(Err(SdoClientError::Timeout)));
        assert!(client.is_idle());
    }

    #[test]
    fn test_block_download_exchange() {
        let mut client = SdoClient::new();
        let data: Vec<u8> = (0..300).map(|x| (x % 256) as u8).collect();
        client.block_download(0x3006, 0, data.clone(), 0).unwrap();

        // Server grants a small block size; client must renegotiate down
        let out = client.on_frame(
            &SdoResponse::block_download_acknowledge(true, 0x3006, 0, 20).to_bytes(),
            0,
        );
        assert_eq!(out.len(), 20);

        // Ack the first block in full
        let out = client.on_frame(
            &SdoResponse::ConfirmBlock {
                ackseq: 20,
                blksize: 20,
            }
            .to_bytes(),
            0,
        );
        assert_eq!(out.len(), 20);

        // Second block acked in full; 300 = 20*7 + 20*7 + 20 remaining
        let out = client.on_frame(
            &SdoResponse::ConfirmBlock {
                ackseq: 20,
                blksize: 20,
            }
            .to_bytes(),
            0,
        );
        assert_eq!(out.len(), 3);
        let last = BlockSegment::try_from(out[2].as_slice()).unwrap();
        assert!(last.c);

        let out = client.on_frame(
            &SdoResponse::ConfirmBlock {
                ackseq: 3,
                blksize: 20,
            }
            .to_bytes(),
            0,
        );
        let SdoRequest::EndBlockDownload { n, crc } = parse_req(&out[0]) else {
            panic!("expected end block download");
        };
        assert_eq!(n, ((7 - 300 % 7) % 7) as u8);
        assert_eq!(crc, block_crc(&data));

        let out = client.on_frame(&SdoResponse::ConfirmBlockDownloadEnd.to_bytes(), 0);
        assert!(out.is_empty());
        assert_eq!(
            client.take_result(),
            Some(Ok(SdoTransferOutcome::Downloaded))
        );
    }

    #[test]
    fn test_block_upload_exchange() {
        let mut client = SdoClient::new();
        let data: Vec<u8> = (0..20).collect();
        client.block_upload(0x3006, 0, 0).unwrap();

        let out = client.on_frame(
            &SdoResponse::block_upload_acknowledge(true, 0x3006, 0, 20).to_bytes(),
            0,
        );
        assert_eq!(parse_req(&out[0]), SdoRequest::StartBlockUpload {});

        // Server sends three segments
        for (i, chunk) in data.chunks(7).enumerate() {
            let mut seg = [0u8; 7];
            seg[0..chunk.len()].copy_from_slice(chunk);
            let c = i == 2;
            let out = client.on_frame(
                &BlockSegment {
                    c,
                    seqnum: (i + 1) as u8,
                    data: seg,
                }
                .to_bytes(),
                0,
            );
            if c {
                assert_eq!(
                    parse_req(&out[0]),
                    SdoRequest::BlockUploadAck {
                        ackseq: 3,
                        blksize: 127
                    }
                );
            } else {
                assert!(out.is_empty());
            }
        }

        let n = ((7 - 20 % 7) % 7) as u8;
        let out = client.on_frame(
            &SdoResponse::EndBlockUpload {
                n,
                crc: block_crc(&data),
            }
            .to_bytes(),
            0,
        );
        assert_eq!(parse_req(&out[0]), SdoRequest::EndBlockUploadAck {});
        assert_eq!(
            client.take_result(),
            Some(Ok(SdoTransferOutcome::Uploaded(data)))
        );
        assert!(client.is_idle());
    }

    #[test]
    fn test_block_upload_crc_mismatch() {
        let mut client = SdoClient::new();
        client.block_upload(0x3006, 0, 0).unwrap();
        client.on_frame(
            &SdoResponse::block_upload_acknowledge(true, 0x3006, 0, 7).to_bytes(),
            0,
        );
        client.on_frame(
            &BlockSegment {
                c: true,
                seqnum: 1,
                data: [1, 2, 3, 4, 5, 6, 7],
            }
            .to_bytes(),
            0,
        );
        let out = client.on_frame(
            &SdoResponse::EndBlockUpload { n: 0, crc: 0xBAD0 }.to_bytes(),
            0,
        );
        let SdoRequest::Abort { abort_code, .. } = parse_req(&out[0]) else {
            panic!("expected abort");
        };
        assert_eq!(abort_code, AbortCode::CrcError as u32);
        assert_eq!(client.take_result(), Some(Err(SdoClientError::CrcMismatch)));
    }

    #[test]
    fn test_cancel() {
        let mut client = SdoClient::new();
        client.upload(0x2000, 1, 0).unwrap();
        let out = client.abort(AbortCode::GeneralError);
        assert_eq!(
            parse_req(&out[0]),
            SdoRequest::abort(0x2000, 1, AbortCode::GeneralError)
        );
        assert_eq!(client.take_result(), Some(Err(SdoClientError::Cancelled)));
    }
}

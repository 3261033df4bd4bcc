//! The SDO server state machine
//!
//! One [`SdoServer`] serves one client channel: expedited, segmented and
//! block transfers in both directions, with per-transfer timeout, toggle-bit
//! tracking and block CRC. The machine is passive; the node feeds it
//! received request frames and timer expirations, and it hands back the raw
//! response frames to put on the wire.

use log::warn;

use stillcan_common::sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse};

use crate::object_dict::{Device, SubInfo};
use crate::DEFAULT_SDO_TIMEOUT_US;

/// Largest number of segments per block the server will advertise
pub const MAX_BLKSIZE: u8 = 127;

fn validate_download_size(dl_size: usize, info: &SubInfo) -> Result<(), AbortCode> {
    match info.size {
        // Variable-size values (strings, DOMAIN) absorb whatever arrives
        None => Ok(()),
        Some(size) => {
            if dl_size < size {
                Err(AbortCode::DataTypeMismatchLengthLow)
            } else if dl_size > size {
                Err(AbortCode::DataTypeMismatchLengthHigh)
            } else {
                Ok(())
            }
        }
    }
}

fn length_abort(expected: usize, actual: usize) -> AbortCode {
    if actual > expected {
        AbortCode::DataTypeMismatchLengthHigh
    } else {
        AbortCode::DataTypeMismatchLengthLow
    }
}

fn block_crc(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

enum State {
    Idle,
    DownloadSeg {
        index: u16,
        sub: u8,
        toggle: bool,
        buf: Vec<u8>,
        declared: Option<usize>,
    },
    UploadSeg {
        index: u16,
        sub: u8,
        toggle: bool,
        buf: Vec<u8>,
        pos: usize,
    },
    BlockDl {
        index: u16,
        sub: u8,
        crc_enabled: bool,
        buf: Vec<u8>,
        block: Vec<u8>,
        seq: u8,
        blksize: u8,
        declared: Option<usize>,
    },
    BlockDlEnd {
        index: u16,
        sub: u8,
        crc_enabled: bool,
        buf: Vec<u8>,
        declared: Option<usize>,
    },
    BlockUlStart {
        index: u16,
        sub: u8,
        crc_enabled: bool,
        buf: Vec<u8>,
        blksize: u8,
    },
    BlockUl {
        index: u16,
        sub: u8,
        crc_enabled: bool,
        buf: Vec<u8>,
        base: usize,
        sent: u8,
        blksize: u8,
    },
    BlockUlEnd {
        index: u16,
        sub: u8,
    },
}

impl State {
    fn address(&self) -> (u16, u8) {
        match self {
            State::Idle => (0, 0),
            State::DownloadSeg { index, sub, .. }
            | State::UploadSeg { index, sub, .. }
            | State::BlockDl { index, sub, .. }
            | State::BlockDlEnd { index, sub, .. }
            | State::BlockUlStart { index, sub, .. }
            | State::BlockUl { index, sub, .. }
            | State::BlockUlEnd { index, sub } => (*index, *sub),
        }
    }
}

/// The frames produced by one server step, plus the sub-object a completed
/// download just updated
#[derive(Default)]
pub struct ServerOutput {
    /// Raw 8-byte response frames, in transmission order
    pub frames: Vec<[u8; 8]>,
    /// Set when a download committed a new value to the dictionary
    pub updated: Option<(u16, u8)>,
}

impl ServerOutput {
    fn none() -> Self {
        Self::default()
    }

    fn respond(resp: SdoResponse) -> Self {
        Self {
            frames: vec![resp.to_bytes()],
            updated: None,
        }
    }

    fn respond_updated(resp: SdoResponse, index: u16, sub: u8) -> Self {
        Self {
            frames: vec![resp.to_bytes()],
            updated: Some((index, sub)),
        }
    }
}

/// An SDO server
///
/// A single SDO server is controlled by a single SDO client at a time. A
/// node exposing multiple server channels instantiates one `SdoServer` per
/// channel.
pub struct SdoServer {
    state: State,
    timeout_us: u64,
    deadline: Option<u64>,
}

impl core::fmt::Debug for SdoServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdoServer")
            .field("idle", &matches!(self.state, State::Idle))
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Default for SdoServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoServer {
    /// Create a server in the idle state
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            timeout_us: DEFAULT_SDO_TIMEOUT_US,
            deadline: None,
        }
    }

    /// Change the per-transfer timeout
    pub fn set_timeout_us(&mut self, us: u64) {
        self.timeout_us = us;
    }

    /// True when no transfer is in progress
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// The deadline of the running transfer's timeout, when one is armed
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Cancel the running transfer, notifying the peer with `code`
    pub fn abort_transfer(&mut self, code: AbortCode) -> ServerOutput {
        if self.is_idle() {
            return ServerOutput::none();
        }
        let (index, sub) = self.state.address();
        self.state = State::Idle;
        self.deadline = None;
        ServerOutput::respond(SdoResponse::abort(index, sub, code))
    }

    /// Handle the expiry of the transfer timeout
    pub fn on_timeout(&mut self, _now: u64) -> ServerOutput {
        self.abort_transfer(AbortCode::Timeout)
    }

    /// Handle a frame received on the server's request COB-ID
    pub fn on_frame(&mut self, data: &[u8], dev: &mut Device, now: u64) -> ServerOutput {
        if data.len() != 8 {
            warn!("Ignoring SDO request with bad length {}", data.len());
            return ServerOutput::none();
        }

        let state = core::mem::replace(&mut self.state, State::Idle);
        let out = self.step(state, data, dev);
        self.deadline = if self.is_idle() {
            None
        } else {
            Some(now + self.timeout_us)
        };
        out
    }

    fn step(&mut self, state: State, data: &[u8], dev: &mut Device) -> ServerOutput {
        // During a block download the wire carries raw segments which do not
        // parse as requests; everything else is a request frame. An abort is
        // recognizable in either mode by its first byte.
        if let State::BlockDl { .. } = state {
            if data[0] != 0x80 {
                return self.block_segment(state, data);
            }
            // Fall through to request parsing for the abort
        }

        let req = match SdoRequest::try_from(data) {
            Ok(req) => req,
            Err(code) => {
                let (index, sub) = state.address();
                warn!("Failed to parse an SDO request");
                return self.abort_with(index, sub, code);
            }
        };

        if let SdoRequest::Abort { .. } = req {
            // A peer abort terminates the transfer with no reply
            self.state = State::Idle;
            return ServerOutput::none();
        }

        // A fresh initiate always addresses the channel: when a transfer is
        // already running, the channel is busy
        if !matches!(state, State::Idle) && Self::is_initiate(&req) {
            let (index, sub) = state.address();
            return self.abort_with(index, sub, AbortCode::GeneralError);
        }

        match state {
            State::Idle => self.idle(req, dev),
            State::DownloadSeg { .. } => self.download_seg(state, req, dev),
            State::UploadSeg { .. } => self.upload_seg(state, req),
            State::BlockDl { .. } => {
                // Only reachable for a non-abort request frame during block
                // receive, which the protocol does not allow
                let (index, sub) = state.address();
                self.abort_with(index, sub, AbortCode::InvalidCommandSpecifier)
            }
            State::BlockDlEnd { .. } => self.block_dl_end(state, req, dev),
            State::BlockUlStart { .. } => self.block_ul_start(state, req),
            State::BlockUl { .. } => self.block_ul_ack(state, req),
            State::BlockUlEnd { .. } => self.block_ul_end(state, req),
        }
    }

    fn is_initiate(req: &SdoRequest) -> bool {
        matches!(
            req,
            SdoRequest::InitiateDownload { .. }
                | SdoRequest::InitiateUpload { .. }
                | SdoRequest::InitiateBlockDownload { .. }
                | SdoRequest::InitiateBlockUpload { .. }
        )
    }

    fn abort_with(&mut self, index: u16, sub: u8, code: AbortCode) -> ServerOutput {
        self.state = State::Idle;
        ServerOutput::respond(SdoResponse::abort(index, sub, code))
    }

    fn idle(&mut self, req: SdoRequest, dev: &mut Device) -> ServerOutput {
        match req {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let info = match dev.sub_info(index, sub) {
                    Ok(info) => info,
                    Err(code) => return self.abort_with(index, sub, code),
                };
                if !info.access.is_writable() {
                    return self.abort_with(index, sub, AbortCode::ReadOnly);
                }

                if e {
                    // Expedited: the value is in this frame
                    let dl_size = if s {
                        4 - n as usize
                    } else {
                        info.size.unwrap_or(4).min(4)
                    };
                    if let Err(code) = validate_download_size(dl_size, &info) {
                        return self.abort_with(index, sub, code);
                    }
                    if let Err(code) = dev.download(index, sub, &data[0..dl_size]) {
                        return self.abort_with(index, sub, code);
                    }
                    ServerOutput::respond_updated(
                        SdoResponse::download_acknowledge(index, sub),
                        index,
                        sub,
                    )
                } else {
                    let declared = if s {
                        let size = u32::from_le_bytes(data) as usize;
                        if let Err(code) = validate_download_size(size, &info) {
                            return self.abort_with(index, sub, code);
                        }
                        Some(size)
                    } else {
                        None
                    };
                    self.state = State::DownloadSeg {
                        index,
                        sub,
                        toggle: false,
                        buf: Vec::new(),
                        declared,
                    };
                    ServerOutput::respond(SdoResponse::download_acknowledge(index, sub))
                }
            }
            SdoRequest::InitiateUpload { index, sub } => {
                let buf = match dev.upload(index, sub) {
                    Ok(buf) => buf,
                    Err(code) => return self.abort_with(index, sub, code),
                };
                if buf.len() <= 4 {
                    ServerOutput::respond(SdoResponse::expedited_upload(index, sub, &buf))
                } else {
                    let size = buf.len() as u32;
                    self.state = State::UploadSeg {
                        index,
                        sub,
                        toggle: false,
                        buf,
                        pos: 0,
                    };
                    ServerOutput::respond(SdoResponse::upload_acknowledge(index, sub, size))
                }
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                let info = match dev.sub_info(index, sub) {
                    Ok(info) => info,
                    Err(code) => return self.abort_with(index, sub, code),
                };
                if !info.access.is_writable() {
                    return self.abort_with(index, sub, AbortCode::ReadOnly);
                }
                let declared = if s {
                    if let Err(code) = validate_download_size(size as usize, &info) {
                        return self.abort_with(index, sub, code);
                    }
                    Some(size as usize)
                } else {
                    None
                };
                self.state = State::BlockDl {
                    index,
                    sub,
                    crc_enabled: cc,
                    buf: Vec::new(),
                    block: Vec::new(),
                    seq: 0,
                    blksize: MAX_BLKSIZE,
                    declared,
                };
                ServerOutput::respond(SdoResponse::block_download_acknowledge(
                    true,
                    index,
                    sub,
                    MAX_BLKSIZE,
                ))
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                if blksize == 0 || blksize > MAX_BLKSIZE {
                    return self.abort_with(index, sub, AbortCode::InvalidBlockSize);
                }
                let buf = match dev.upload(index, sub) {
                    Ok(buf) => buf,
                    Err(code) => return self.abort_with(index, sub, code),
                };
                if pst != 0 && buf.len() <= pst as usize {
                    // Protocol switch: fall back to the segmented protocol
                    if buf.len() <= 4 {
                        return ServerOutput::respond(SdoResponse::expedited_upload(
                            index, sub, &buf,
                        ));
                    }
                    let size = buf.len() as u32;
                    self.state = State::UploadSeg {
                        index,
                        sub,
                        toggle: false,
                        buf,
                        pos: 0,
                    };
                    return ServerOutput::respond(SdoResponse::upload_acknowledge(
                        index, sub, size,
                    ));
                }
                let size = buf.len() as u32;
                self.state = State::BlockUlStart {
                    index,
                    sub,
                    crc_enabled: cc,
                    buf,
                    blksize,
                };
                ServerOutput::respond(SdoResponse::block_upload_acknowledge(
                    true, index, sub, size,
                ))
            }
            _ => self.abort_with(0, 0, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn download_seg(&mut self, state: State, req: SdoRequest, dev: &mut Device) -> ServerOutput {
        let State::DownloadSeg {
            index,
            sub,
            toggle,
            mut buf,
            declared,
        } = state
        else {
            unreachable!()
        };

        match req {
            SdoRequest::DownloadSegment { t, n, c, data } => {
                if t != toggle {
                    return self.abort_with(index, sub, AbortCode::ToggleNotAlternated);
                }
                let segment_size = 7 - n as usize;
                buf.extend_from_slice(&data[0..segment_size]);

                if c {
                    if let Some(declared) = declared {
                        if buf.len() != declared {
                            return self.abort_with(index, sub, length_abort(declared, buf.len()));
                        }
                    }
                    if let Err(code) = dev.download(index, sub, &buf) {
                        return self.abort_with(index, sub, code);
                    }
                    ServerOutput::respond_updated(
                        SdoResponse::download_segment_acknowledge(toggle),
                        index,
                        sub,
                    )
                } else {
                    self.state = State::DownloadSeg {
                        index,
                        sub,
                        toggle: !toggle,
                        buf,
                        declared,
                    };
                    ServerOutput::respond(SdoResponse::download_segment_acknowledge(toggle))
                }
            }
            _ => self.abort_with(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn upload_seg(&mut self, state: State, req: SdoRequest) -> ServerOutput {
        let State::UploadSeg {
            index,
            sub,
            toggle,
            buf,
            pos,
        } = state
        else {
            unreachable!()
        };

        match req {
            SdoRequest::ReqUploadSegment { t } => {
                if t != toggle {
                    return self.abort_with(index, sub, AbortCode::ToggleNotAlternated);
                }
                let segment_size = (buf.len() - pos).min(7);
                let c = pos + segment_size >= buf.len();
                let resp =
                    SdoResponse::upload_segment(toggle, c, &buf[pos..pos + segment_size]);
                if c {
                    ServerOutput::respond_updated(resp, index, sub)
                } else {
                    self.state = State::UploadSeg {
                        index,
                        sub,
                        toggle: !toggle,
                        buf,
                        pos: pos + segment_size,
                    };
                    ServerOutput::respond(resp)
                }
            }
            _ => self.abort_with(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn block_segment(&mut self, state: State, data: &[u8]) -> ServerOutput {
        let State::BlockDl {
            index,
            sub,
            crc_enabled,
            mut buf,
            mut block,
            mut seq,
            blksize,
            declared,
        } = state
        else {
            unreachable!()
        };

        // Unwrap: length was checked at entry
        let segment = BlockSegment::try_from(data).unwrap();
        if segment.seqnum == 0 || segment.seqnum > blksize {
            return self.abort_with(index, sub, AbortCode::InvalidSequenceNumber);
        }

        if segment.seqnum == seq + 1 {
            block.extend_from_slice(&segment.data);
            seq = segment.seqnum;
        }
        // Anything else in the window is dropped here and nacked below once
        // the block round ends, prompting a retransmission from seq + 1.

        if segment.c || segment.seqnum == blksize {
            let complete = segment.c && segment.seqnum == seq;
            let resp = SdoResponse::ConfirmBlock {
                ackseq: seq,
                blksize,
            };
            if complete {
                buf.extend_from_slice(&block);
                self.state = State::BlockDlEnd {
                    index,
                    sub,
                    crc_enabled,
                    buf,
                    declared,
                };
            } else {
                if seq == blksize {
                    // Block fully received, start the next one
                    buf.extend_from_slice(&block);
                    block = Vec::new();
                    seq = 0;
                }
                self.state = State::BlockDl {
                    index,
                    sub,
                    crc_enabled,
                    buf,
                    block,
                    seq,
                    blksize,
                    declared,
                };
            }
            ServerOutput::respond(resp)
        } else {
            self.state = State::BlockDl {
                index,
                sub,
                crc_enabled,
                buf,
                block,
                seq,
                blksize,
                declared,
            };
            ServerOutput::none()
        }
    }

    fn block_dl_end(&mut self, state: State, req: SdoRequest, dev: &mut Device) -> ServerOutput {
        let State::BlockDlEnd {
            index,
            sub,
            crc_enabled,
            mut buf,
            declared,
        } = state
        else {
            unreachable!()
        };

        match req {
            SdoRequest::EndBlockDownload { n, crc } => {
                // The final segment was padded to 7 bytes; drop the padding
                buf.truncate(buf.len() - n as usize);
                if crc_enabled && block_crc(&buf) != crc {
                    return self.abort_with(index, sub, AbortCode::CrcError);
                }
                if let Some(declared) = declared {
                    if buf.len() != declared {
                        return self.abort_with(index, sub, length_abort(declared, buf.len()));
                    }
                }
                if let Err(code) = dev.download(index, sub, &buf) {
                    return self.abort_with(index, sub, code);
                }
                ServerOutput::respond_updated(SdoResponse::ConfirmBlockDownloadEnd, index, sub)
            }
            _ => self.abort_with(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn block_ul_start(&mut self, state: State, req: SdoRequest) -> ServerOutput {
        let State::BlockUlStart {
            index,
            sub,
            crc_enabled,
            buf,
            blksize,
        } = state
        else {
            unreachable!()
        };

        match req {
            SdoRequest::StartBlockUpload {} => {
                let mut out = ServerOutput::none();
                let sent = emit_block_segments(&buf, 0, blksize, &mut out.frames);
                self.state = State::BlockUl {
                    index,
                    sub,
                    crc_enabled,
                    buf,
                    base: 0,
                    sent,
                    blksize,
                };
                out
            }
            _ => self.abort_with(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn block_ul_ack(&mut self, state: State, req: SdoRequest) -> ServerOutput {
        let State::BlockUl {
            index,
            sub,
            crc_enabled,
            buf,
            base,
            sent,
            blksize: _,
        } = state
        else {
            unreachable!()
        };

        match req {
            SdoRequest::BlockUploadAck {
                ackseq,
                blksize: new_blksize,
            } => {
                if new_blksize == 0 || new_blksize > MAX_BLKSIZE {
                    return self.abort_with(index, sub, AbortCode::InvalidBlockSize);
                }
                if ackseq > sent {
                    return self.abort_with(index, sub, AbortCode::InvalidSequenceNumber);
                }
                let base = (base + ackseq as usize * 7).min(buf.len());
                let mut out = ServerOutput::none();
                if base >= buf.len() {
                    let n = ((7 - buf.len() % 7) % 7) as u8;
                    let crc = if crc_enabled { block_crc(&buf) } else { 0 };
                    out.frames.push(SdoResponse::EndBlockUpload { n, crc }.to_bytes());
                    self.state = State::BlockUlEnd { index, sub };
                } else {
                    // Either the client missed segments (ackseq < sent) or it
                    // acked the whole block; resume from the new base
                    let sent = emit_block_segments(&buf, base, new_blksize, &mut out.frames);
                    self.state = State::BlockUl {
                        index,
                        sub,
                        crc_enabled,
                        buf,
                        base,
                        sent,
                        blksize: new_blksize,
                    };
                }
                out
            }
            _ => self.abort_with(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn block_ul_end(&mut self, state: State, req: SdoRequest) -> ServerOutput {
        let State::BlockUlEnd { index, sub } = state else {
            unreachable!()
        };

        match req {
            SdoRequest::EndBlockUploadAck {} => {
                self.state = State::Idle;
                ServerOutput {
                    frames: Vec::new(),
                    updated: Some((index, sub)),
                }
            }
            _ => self.abort_with(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }
}

/// Queue up to `blksize` segments starting at `base`, returning the count
pub(crate) fn emit_block_segments(
    buf: &[u8],
    base: usize,
    blksize: u8,
    out: &mut Vec<[u8; 8]>,
) -> u8 {
    let remaining = buf.len() - base;
    let nseg = remaining.div_ceil(7).clamp(1, blksize as usize);
    for i in 0..nseg {
        let start = base + i * 7;
        let len = (buf.len() - start).min(7);
        let mut data = [0u8; 7];
        data[0..len].copy_from_slice(&buf[start..start + len]);
        let c = start + len >= buf.len();
        out.push(
            BlockSegment {
                c,
                seqnum: (i + 1) as u8,
                data,
            }
            .to_bytes(),
        );
    }
    nseg as u8
}

//! SDO protocol definitions
//!
//! Defines the frame codecs and abort codes shared by the SDO client and
//! server state machines. All SDO frames are 8 bytes: byte 0 carries the
//! command specifier, bytes 1-2 the object index (little endian), byte 3 the
//! sub-index, and bytes 4-7 payload or size, except for segment frames which
//! use bytes 1-7 as payload.

use int_enum::IntEnum;

use crate::messages::{CanFrame, CanId};

/// Server command specifier (SCS) values in SDO response frames
#[derive(Copy, Clone, Debug, PartialEq)]
enum ServerCommand {
    SegmentUpload = 0,
    SegmentDownload = 1,
    Upload = 2,
    Download = 3,
    Abort = 4,
    BlockDownload = 5,
    BlockUpload = 6,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            5 => Ok(BlockDownload),
            6 => Ok(BlockUpload),
            _ => Err(()),
        }
    }
}

/// Client command specifier (CCS) values in SDO request frames
#[derive(Copy, Clone, Debug, PartialEq)]
enum ClientCommand {
    DownloadSegment = 0,
    InitiateDownload = 1,
    InitiateUpload = 2,
    ReqUploadSegment = 3,
    Abort = 4,
    BlockUpload = 5,
    BlockDownload = 6,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            5 => Ok(BlockUpload),
            6 => Ok(BlockDownload),
            _ => Err(()),
        }
    }
}

/// SDO abort code
///
/// The reasons a transfer can be terminated, emitted verbatim on the wire as
/// 32-bit values in the payload of an abort frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    Timeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC error (block mode only)
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnmappablePdo = 0x0604_0041,
    /// The number and length of mapped objects would exceed the PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to a hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter written too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter written too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Maximum value is less than minimum value
    RangeError = 0x0609_0036,
    /// Resource not available: SDO connection
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored because of the device state
    CantStoreDeviceState = 0x0800_0022,
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

impl AbortCode {
    /// Interpret a raw wire value, falling back to [`AbortCode::GeneralError`]
    /// for codes outside the table
    pub fn from_raw(raw: u32) -> AbortCode {
        AbortCode::try_from(raw).unwrap_or(AbortCode::GeneralError)
    }
}

/// One segment of a block transfer
///
/// Block segments have no command specifier; byte 0 carries the 7-bit
/// sequence number and the `c` (last segment) flag, the remaining 7 bytes are
/// payload. Both directions use this layout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockSegment {
    /// Set on the final segment of the transfer
    pub c: bool,
    /// Sequence number within the current block, 1..=127
    pub seqnum: u8,
    /// Segment payload
    pub data: [u8; 7],
}

impl BlockSegment {
    /// Serialize to the 8 raw frame bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[0] = ((self.c as u8) << 7) | (self.seqnum & 0x7F);
        bytes[1..8].copy_from_slice(&self.data);
        bytes
    }

    /// Convert to a CAN frame using the provided COB ID
    pub fn to_frame(&self, id: CanId) -> CanFrame {
        CanFrame::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for BlockSegment {
    type Error = ();

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 8 {
            return Err(());
        }
        Ok(BlockSegment {
            c: (value[0] & 0x80) != 0,
            seqnum: value[0] & 0x7F,
            data: value[1..8].try_into().unwrap(),
        })
    }
}

/// An SDO request, sent from client to server
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SdoRequest {
    /// Begin a download, writing data to an object on the server
    InitiateDownload {
        /// Number of unused bytes in data (valid when e=1 and s=1)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size valid flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value (expedited) or size (when e=0 and s=1)
        data: [u8; 4],
    },
    /// Send a segment of data to the server
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, there are no more segments to be sent
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Begin an upload of data from an object on the server
    InitiateUpload {
        /// The requested object index
        index: u16,
        /// The requested sub-index
        sub: u8,
    },
    /// Request the next segment of an upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Begin a block download
    InitiateBlockDownload {
        /// Client CRC support flag
        cc: bool,
        /// Size valid flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// When s=1, the number of bytes to be downloaded
        size: u32,
    },
    /// Finish a block download
    EndBlockDownload {
        /// Number of unused bytes in the last segment of the last block
        n: u8,
        /// CRC over the full transfer
        crc: u16,
    },
    /// Begin a block upload
    InitiateBlockUpload {
        /// Client CRC support flag
        cc: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of segments per block the client can accept, 1..=127
        blksize: u8,
        /// Protocol switch threshold: if the data is not larger than this,
        /// the server may fall back to the segmented protocol. 0 disables.
        pst: u8,
    },
    /// Tell the server to start sending block upload segments
    StartBlockUpload {},
    /// Acknowledge a block of upload segments
    BlockUploadAck {
        /// The last in-sequence segment received
        ackseq: u8,
        /// Number of segments per block for the next block
        blksize: u8,
    },
    /// Acknowledge the end of a block upload
    EndBlockUploadAck {},
    /// Sent by the client to abort an ongoing transfer
    Abort {
        /// The object index of the active transfer
        index: u16,
        /// The sub-index of the active transfer
        sub: u8,
        /// The abort reason
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an abort request
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Create an initiate download request for a segmented transfer
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create an expedited download request carrying up to 4 bytes
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);
        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create a download segment request
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let mut data = [0; 7];
        data[0..segment_data.len()].copy_from_slice(segment_data);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: 7 - segment_data.len() as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an initiate upload request
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Create an initiate block download request
    pub fn initiate_block_download(index: u16, sub: u8, cc: bool, size: u32) -> Self {
        SdoRequest::InitiateBlockDownload {
            cc,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an end block download request
    pub fn end_block_download(n: u8, crc: u16) -> Self {
        SdoRequest::EndBlockDownload { n, crc }
    }

    /// Create an initiate block upload request
    pub fn initiate_block_upload(index: u16, sub: u8, cc: bool, blksize: u8, pst: u8) -> Self {
        SdoRequest::InitiateBlockUpload {
            cc,
            index,
            sub,
            blksize,
            pst,
        }
    }

    /// Serialize to the 8 raw frame bytes
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ClientCommand::InitiateDownload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = ((ClientCommand::DownloadSegment as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 7) << 1)
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = ((ClientCommand::ReqUploadSegment as u8) << 5) | ((t as u8) << 4);
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = ((ClientCommand::BlockDownload as u8) << 5)
                    | ((cc as u8) << 2)
                    | ((s as u8) << 1);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                payload[0] = ((ClientCommand::BlockDownload as u8) << 5) | ((n & 7) << 2) | 1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5) | ((cc as u8) << 2);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
                payload[5] = pst;
            }
            SdoRequest::StartBlockUpload {} => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5) | 3;
            }
            SdoRequest::BlockUploadAck { ackseq, blksize } => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5) | 2;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoRequest::EndBlockUploadAck {} => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5) | 1;
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }

    /// Convert to a CAN frame using the provided COB ID
    pub fn to_frame(self, id: CanId) -> CanFrame {
        CanFrame::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let ccs: ClientCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;

        match ccs {
            ClientCommand::DownloadSegment => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 0x7;
                let c = (value[0] & 1) != 0;
                let data = value[1..8].try_into().unwrap();
                Ok(SdoRequest::DownloadSegment { t, n, c, data })
            }
            ClientCommand::InitiateDownload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & 1) != 0;
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                let data = value[4..8].try_into().unwrap();
                Ok(SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ClientCommand::InitiateUpload => {
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                Ok(SdoRequest::InitiateUpload { index, sub })
            }
            ClientCommand::ReqUploadSegment => {
                let t = ((value[0] >> 4) & 1) != 0;
                Ok(SdoRequest::ReqUploadSegment { t })
            }
            ClientCommand::Abort => {
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                let abort_code = u32::from_le_bytes(value[4..8].try_into().unwrap());
                Ok(SdoRequest::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ClientCommand::BlockDownload => {
                // Sub-command in bit 0: 0 = initiate, 1 = end
                if value[0] & 1 == 0 {
                    let cc = (value[0] & (1 << 2)) != 0;
                    let s = (value[0] & (1 << 1)) != 0;
                    let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    let sub = value[3];
                    let size = u32::from_le_bytes(value[4..8].try_into().unwrap());
                    Ok(SdoRequest::InitiateBlockDownload {
                        cc,
                        s,
                        index,
                        sub,
                        size,
                    })
                } else {
                    let n = (value[0] >> 2) & 0x7;
                    let crc = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    Ok(SdoRequest::EndBlockDownload { n, crc })
                }
            }
            ClientCommand::BlockUpload => match value[0] & 0x3 {
                0 => {
                    let cc = (value[0] & (1 << 2)) != 0;
                    let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    let sub = value[3];
                    Ok(SdoRequest::InitiateBlockUpload {
                        cc,
                        index,
                        sub,
                        blksize: value[4],
                        pst: value[5],
                    })
                }
                1 => Ok(SdoRequest::EndBlockUploadAck {}),
                2 => Ok(SdoRequest::BlockUploadAck {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                3 => Ok(SdoRequest::StartBlockUpload {}),
                _ => unreachable!(),
            },
        }
    }
}

/// An SDO response, sent from server to client
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SdoResponse {
    /// Response to an [`SdoRequest::InitiateUpload`]
    ConfirmUpload {
        /// Number of unused bytes in data (valid when e=1 and s=1)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size valid flag
        s: bool,
        /// The index of the object being uploaded
        index: u16,
        /// The sub-index being uploaded
        sub: u8,
        /// Value (expedited) or size (when e=0 and s=1)
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Set on the final segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Response to an [`SdoRequest::InitiateDownload`]
    ConfirmDownload {
        /// The index of the object being written
        index: u16,
        /// The sub-index being written
        sub: u8,
    },
    /// Response to an [`SdoRequest::DownloadSegment`]
    ConfirmDownloadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Response to an [`SdoRequest::InitiateBlockDownload`]
    ConfirmBlockDownload {
        /// Server CRC support flag
        sc: bool,
        /// The index of the object being written
        index: u16,
        /// The sub-index being written
        sub: u8,
        /// Number of segments per block the server will accept, 1..=127
        blksize: u8,
    },
    /// Acknowledges a block of download segments
    ConfirmBlock {
        /// The last in-sequence segment received
        ackseq: u8,
        /// Number of segments per block for the next block
        blksize: u8,
    },
    /// Response to an [`SdoRequest::EndBlockDownload`]
    ConfirmBlockDownloadEnd,
    /// Response to an [`SdoRequest::InitiateBlockUpload`]
    ConfirmBlockUpload {
        /// Server CRC support flag
        sc: bool,
        /// Size valid flag
        s: bool,
        /// The index of the object being uploaded
        index: u16,
        /// The sub-index being uploaded
        sub: u8,
        /// When s=1, the number of bytes to be uploaded
        size: u32,
    },
    /// Finishes a block upload
    EndBlockUpload {
        /// Number of unused bytes in the last segment of the last block
        n: u8,
        /// CRC over the full transfer
        crc: u16,
    },
    /// Sent by the server to abort an ongoing transfer
    Abort {
        /// Object index of the active transfer
        index: u16,
        /// Sub-index of the active transfer
        sub: u8,
        /// Abort reason
        abort_code: u32,
    },
}

impl SdoResponse {
    /// Create a `ConfirmUpload` response for an expedited upload
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        if data.len() > 4 {
            panic!("Cannot create expedited upload with more than 4 bytes");
        }
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        // For zero-length values the size flag is cleared: n cannot express
        // "no valid bytes"
        let (s, n) = if data.is_empty() {
            (false, 0)
        } else {
            (true, 4 - data.len() as u8)
        };
        SdoResponse::ConfirmUpload {
            index,
            sub,
            e: true,
            s,
            n,
            data: msg_data,
        }
    }

    /// Create a `ConfirmUpload` response announcing a segmented upload
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an `UploadSegment` response
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let n = (7 - data.len()) as u8;
        let mut buf = [0; 7];
        buf[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadSegment { t, n, c, data: buf }
    }

    /// Create a `ConfirmDownload` response
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a `ConfirmDownloadSegment` response
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create a `ConfirmBlockDownload` response
    pub fn block_download_acknowledge(sc: bool, index: u16, sub: u8, blksize: u8) -> SdoResponse {
        SdoResponse::ConfirmBlockDownload {
            sc,
            index,
            sub,
            blksize,
        }
    }

    /// Create a `ConfirmBlockUpload` response
    pub fn block_upload_acknowledge(sc: bool, index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmBlockUpload {
            sc,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Serialize to the 8 raw frame bytes
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ServerCommand::Upload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = ((ServerCommand::SegmentUpload as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 7) << 1)
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = ((ServerCommand::SegmentDownload as u8) << 5) | ((t as u8) << 4);
            }
            SdoResponse::ConfirmBlockDownload {
                sc,
                index,
                sub,
                blksize,
            } => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5) | ((sc as u8) << 2);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
            }
            SdoResponse::ConfirmBlock { ackseq, blksize } => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5) | 2;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoResponse::ConfirmBlockDownloadEnd => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5) | 1;
            }
            SdoResponse::ConfirmBlockUpload {
                sc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = ((ServerCommand::BlockUpload as u8) << 5)
                    | ((sc as u8) << 2)
                    | ((s as u8) << 1);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoResponse::EndBlockUpload { n, crc } => {
                payload[0] = ((ServerCommand::BlockUpload as u8) << 5) | ((n & 7) << 2) | 1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }

    /// Convert to a CAN frame using the provided COB ID
    pub fn to_frame(self, id: CanId) -> CanFrame {
        CanFrame::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let scs: ServerCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;

        match scs {
            ServerCommand::SegmentUpload => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 7;
                let c = (value[0] & 1) != 0;
                let data: [u8; 7] = value[1..8].try_into().unwrap();
                Ok(SdoResponse::UploadSegment { t, n, c, data })
            }
            ServerCommand::SegmentDownload => {
                let t = (value[0] & (1 << 4)) != 0;
                Ok(SdoResponse::ConfirmDownloadSegment { t })
            }
            ServerCommand::Upload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & 1) != 0;
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                let data: [u8; 4] = value[4..8].try_into().unwrap();
                Ok(SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ServerCommand::Download => {
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                Ok(SdoResponse::ConfirmDownload { index, sub })
            }
            ServerCommand::Abort => {
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                let abort_code = u32::from_le_bytes(value[4..8].try_into().unwrap());
                Ok(SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ServerCommand::BlockDownload => match value[0] & 0x3 {
                0 => {
                    let sc = (value[0] & (1 << 2)) != 0;
                    let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    let sub = value[3];
                    Ok(SdoResponse::ConfirmBlockDownload {
                        sc,
                        index,
                        sub,
                        blksize: value[4],
                    })
                }
                1 => Ok(SdoResponse::ConfirmBlockDownloadEnd),
                2 => Ok(SdoResponse::ConfirmBlock {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                _ => Err(AbortCode::InvalidCommandSpecifier),
            },
            ServerCommand::BlockUpload => {
                if value[0] & 1 == 0 {
                    let sc = (value[0] & (1 << 2)) != 0;
                    let s = (value[0] & (1 << 1)) != 0;
                    let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    let sub = value[3];
                    let size = u32::from_le_bytes(value[4..8].try_into().unwrap());
                    Ok(SdoResponse::ConfirmBlockUpload {
                        sc,
                        s,
                        index,
                        sub,
                        size,
                    })
                } else {
                    let n = (value[0] >> 2) & 0x7;
                    let crc = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    Ok(SdoResponse::EndBlockUpload { n, crc })
                }
            }
        }
    }
}

/// Returns true if `can_id` addresses the SDO server of `node_id`
pub fn is_sdo_request(can_id: CanId, node_id: u8) -> bool {
    if let CanId::Std(id) = can_id {
        id & 0xFF80 == crate::constants::SDO_REQ_BASE && id & 0x7F == node_id as u16
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expedited_download_bytes() {
        let req = SdoRequest::expedited_download(0x2000, 0x01, &0x12345678u32.to_le_bytes());
        assert_eq!(
            req.to_bytes(),
            [0x23, 0x00, 0x20, 0x01, 0x78, 0x56, 0x34, 0x12]
        );
        let parsed = SdoRequest::try_from(req.to_bytes().as_slice()).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_download_acknowledge_bytes() {
        let resp = SdoResponse::download_acknowledge(0x2000, 0x01);
        assert_eq!(
            resp.to_bytes(),
            [0x60, 0x00, 0x20, 0x01, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_abort_roundtrip() {
        let resp = SdoResponse::abort(0x1018, 0x01, AbortCode::ReadOnly);
        let bytes = resp.to_bytes();
        assert_eq!(bytes[0], 0x80);
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            0x0601_0002
        );
        assert_eq!(SdoResponse::try_from(bytes.as_slice()).unwrap(), resp);
    }

    #[test]
    fn test_request_roundtrip() {
        let cases = [
            SdoRequest::initiate_download(0x2001, 2, Some(100)),
            SdoRequest::download_segment(true, false, &[1, 2, 3, 4, 5, 6, 7]),
            SdoRequest::initiate_upload(0x1000, 0),
            SdoRequest::upload_segment_request(true),
            SdoRequest::initiate_block_download(0x3006, 0, true, 1200),
            SdoRequest::end_block_download(3, 0xBEEF),
            SdoRequest::initiate_block_upload(0x3006, 0, true, 127, 0),
            SdoRequest::StartBlockUpload {},
            SdoRequest::BlockUploadAck {
                ackseq: 12,
                blksize: 127,
            },
            SdoRequest::EndBlockUploadAck {},
            SdoRequest::abort(0x2000, 1, AbortCode::Timeout),
        ];
        for req in cases {
            assert_eq!(SdoRequest::try_from(req.to_bytes().as_slice()).unwrap(), req);
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let cases = [
            SdoResponse::expedited_upload(0x2000, 1, &[1, 2]),
            SdoResponse::upload_acknowledge(0x2001, 0, 10),
            SdoResponse::upload_segment(false, true, &[1, 2, 3]),
            SdoResponse::download_acknowledge(0x2000, 1),
            SdoResponse::download_segment_acknowledge(true),
            SdoResponse::block_download_acknowledge(true, 0x3006, 0, 127),
            SdoResponse::ConfirmBlock {
                ackseq: 127,
                blksize: 127,
            },
            SdoResponse::ConfirmBlockDownloadEnd,
            SdoResponse::block_upload_acknowledge(true, 0x3006, 0, 1200),
            SdoResponse::EndBlockUpload { n: 3, crc: 0x1234 },
            SdoResponse::abort(0x2000, 1, AbortCode::NoSuchObject),
        ];
        for resp in cases {
            assert_eq!(
                SdoResponse::try_from(resp.to_bytes().as_slice()).unwrap(),
                resp
            );
        }
    }

    #[test]
    fn test_block_segment_roundtrip() {
        let seg = BlockSegment {
            c: true,
            seqnum: 127,
            data: [9, 8, 7, 6, 5, 4, 3],
        };
        let bytes = seg.to_bytes();
        assert_eq!(bytes[0], 0xFF);
        assert_eq!(BlockSegment::try_from(bytes.as_slice()).unwrap(), seg);
    }

    #[test]
    fn test_unknown_cs_rejected() {
        let bytes = [0xE0u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            SdoRequest::try_from(bytes.as_slice()),
            Err(AbortCode::InvalidCommandSpecifier)
        );
    }

    #[test]
    fn test_abort_code_values() {
        assert_eq!(AbortCode::ToggleNotAlternated as u32, 0x0503_0000);
        assert_eq!(AbortCode::RangeError as u32, 0x0609_0036);
        assert_eq!(AbortCode::from_raw(0x0504_0003), AbortCode::InvalidSequenceNumber);
        assert_eq!(AbortCode::from_raw(0xDEAD_BEEF), AbortCode::GeneralError);
    }
}

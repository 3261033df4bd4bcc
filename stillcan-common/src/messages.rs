//! CAN frame types and the fixed-format broadcast messages

use snafu::Snafu;

use crate::constants::{EMCY_BASE, SYNC_ID};
use crate::time_types::TimeOfDay;

/// A classic or extended CAN identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanId {
    /// A 29-bit extended identifier
    Extended(u32),
    /// An 11-bit standard identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the identifier bits regardless of kind
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true for an extended (29-bit) identifier
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

/// Maximum payload carried by one frame
#[cfg(feature = "canfd")]
pub const MAX_DATA_LENGTH: usize = 64;
/// Maximum payload carried by one frame
#[cfg(not(feature = "canfd"))]
pub const MAX_DATA_LENGTH: usize = 8;

/// A CAN frame value
///
/// The engine only produces and consumes frame values; putting them on a bus
/// is the host's business.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CanFrame {
    /// Frame payload, valid up to `dlc`
    pub data: [u8; MAX_DATA_LENGTH],
    /// Number of valid payload bytes
    pub dlc: u8,
    /// Frame identifier
    pub id: CanId,
    /// Remote transmission request flag. RTR frames carry no payload.
    pub rtr: bool,
}

impl Default for CanFrame {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
        }
    }
}

impl CanFrame {
    /// Create a new data frame
    pub fn new(id: CanId, data: &[u8]) -> Self {
        if data.len() > MAX_DATA_LENGTH {
            panic!("Data length exceeds maximum size of {} bytes", MAX_DATA_LENGTH);
        }
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..data.len()].copy_from_slice(data);

        Self {
            id,
            dlc: data.len() as u8,
            data: buf,
            rtr: false,
        }
    }

    /// Create a remote transmission request frame
    pub fn new_rtr(id: CanId, dlc: u8) -> Self {
        Self {
            id,
            dlc,
            ..Default::default()
        }
        .with_rtr()
    }

    fn with_rtr(mut self) -> Self {
        self.rtr = true;
        self
    }

    /// Get the frame ID
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }
}

/// A SYNC message
///
/// A single node can serve as the SYNC producer, broadcasting a periodic sync
/// to all other nodes. When the producer is configured with a counter
/// overflow, a one byte counter starting at 1 is carried; otherwise the frame
/// is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMessage {
    /// Counter value, present when the producer carries one
    pub counter: Option<u8>,
}

impl SyncMessage {
    /// Convert to a CAN frame using the provided COB ID
    pub fn to_frame(self, id: CanId) -> CanFrame {
        match self.counter {
            Some(cnt) => CanFrame::new(id, &[cnt]),
            None => CanFrame::new(id, &[]),
        }
    }
}

impl TryFrom<&CanFrame> for SyncMessage {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        let counter = match frame.data() {
            [] => None,
            [cnt, ..] => Some(*cnt),
        };
        Ok(SyncMessage { counter })
    }
}

/// A TIME stamp message carrying a [`TimeOfDay`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeMessage {
    /// The broadcast time
    pub time: TimeOfDay,
}

impl TimeMessage {
    /// Convert to a CAN frame using the provided COB ID
    pub fn to_frame(self, id: CanId) -> CanFrame {
        CanFrame::new(id, &self.time.to_le_bytes())
    }
}

impl TryFrom<&CanFrame> for TimeMessage {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        let data = frame.data();
        if data.len() < 6 {
            return Err(MessageError::MessageTooShort);
        }
        let time = TimeOfDay::from_le_bytes(data[0..6].try_into().unwrap());
        Ok(TimeMessage { time })
    }
}

/// An emergency message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyMessage {
    /// Emergency error code
    pub eec: u16,
    /// Error register value at the time of the event
    pub register: u8,
    /// Manufacturer specific error bytes
    pub msef: [u8; 5],
}

impl EmcyMessage {
    /// Convert to a CAN frame using the provided COB ID
    pub fn to_frame(self, id: CanId) -> CanFrame {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&self.eec.to_le_bytes());
        data[2] = self.register;
        data[3..8].copy_from_slice(&self.msef);
        CanFrame::new(id, &data)
    }
}

impl TryFrom<&CanFrame> for EmcyMessage {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        let data = frame.data();
        if data.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        Ok(EmcyMessage {
            eec: u16::from_le_bytes(data[0..2].try_into().unwrap()),
            register: data[2],
            msef: data[3..8].try_into().unwrap(),
        })
    }
}

/// Returns the default SYNC COB ID
pub fn default_sync_id() -> CanId {
    CanId::Std(SYNC_ID)
}

/// Returns the default EMCY COB ID for a node
pub fn default_emcy_id(node_id: u8) -> CanId {
    CanId::Std(EMCY_BASE + node_id as u16)
}

/// Errors raised when converting frames to typed messages
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// The frame payload is shorter than the message requires
    MessageTooShort,
    /// A field in the message holds an invalid value
    InvalidField,
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}"))]
    UnexpectedId {
        /// The offending COB-ID
        cob_id: CanId,
    },
}

//! The node ID newtype

use snafu::Snafu;

/// A CANopen node ID
///
/// Valid node IDs lie in 1..=127. The special value 255 marks a device which
/// has not yet been assigned an ID; services which put node-specific frames
/// on the bus refuse to start for an unconfigured device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(u8);

/// The raw value carried by [`NodeId::UNCONFIGURED`]
pub const UNCONFIGURED_RAW: u8 = 255;

impl NodeId {
    /// The placeholder ID of a device awaiting configuration
    pub const UNCONFIGURED: NodeId = NodeId(UNCONFIGURED_RAW);

    /// Create a node ID, failing for values outside 1..=127 and 255
    pub fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        match value {
            1..=127 | UNCONFIGURED_RAW => Ok(NodeId(value)),
            _ => InvalidNodeIdSnafu { value }.fail(),
        }
    }

    /// Get the raw node ID as a u8
    pub fn raw(&self) -> u8 {
        self.0
    }

    /// Returns true unless this is [`NodeId::UNCONFIGURED`]
    pub fn is_configured(&self) -> bool {
        self.0 != UNCONFIGURED_RAW
    }

    /// Get the configured ID value, or `None` for an unconfigured device
    pub fn configured(&self) -> Option<u8> {
        self.is_configured().then_some(self.0)
    }
}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeIdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for u8 {
    fn from(value: NodeId) -> Self {
        value.raw()
    }
}

/// Error for converting a u8 to a [`NodeId`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("Invalid node ID {value}"))]
pub struct InvalidNodeIdError {
    /// The rejected value
    pub value: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_bounds() {
        assert!(NodeId::new(0).is_err());
        assert!(NodeId::new(128).is_err());
        assert!(NodeId::new(254).is_err());
        assert_eq!(NodeId::new(1).unwrap().raw(), 1);
        assert_eq!(NodeId::new(127).unwrap().configured(), Some(127));
        assert!(!NodeId::new(255).unwrap().is_configured());
        assert_eq!(NodeId::UNCONFIGURED.configured(), None);
    }
}

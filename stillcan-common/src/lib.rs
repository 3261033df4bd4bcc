//! Common functionality shared among the stillcan crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is
//! re-exported by `stillcan-node`.
#![warn(missing_docs, missing_copy_implementations)]

pub mod constants;
pub mod messages;
pub mod node_id;
pub mod sdo;
pub mod time_types;
pub mod values;

pub use messages::{CanFrame, CanId, MessageError};
pub use node_id::NodeId;
pub use time_types::{TimeDifference, TimeOfDay};
pub use values::{DataType, Value};

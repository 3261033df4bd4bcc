//! Object Dictionary
//!
//! # Overview
//!
//! The object dictionary is the main mechanism of configuration and
//! communication for a node. SDO access is performed on sub-objects, which
//! are identified by the 16-bit index of their parent object and an 8-bit
//! sub-index. Objects come in a few varieties:
//!
//! - VAR: a single variable of any type, accessed at sub-index 0
//! - ARRAY: sub-objects of one type; sub-index 0 is a u8 holding the count
//! - RECORD: sub-objects of heterogeneous types; sub-index 0 holds the
//!   highest implemented sub-index
//!
//! Unlike a generated, statically allocated dictionary, this one is built at
//! run time: the host constructs [`Object`] and [`SubObject`] values and
//! inserts them into a [`Device`]. The set of storable data types is defined
//! by [`DataType`](crate::common::DataType).
//!
//! # Value storage
//!
//! Each object owns a single contiguous buffer holding the current values of
//! all its sub-objects, each at an offset aligned for its type. Inserting or
//! removing a sub-object, or resizing a string value, rebuilds the buffer
//! and re-resolves every slot. Because slots are identified by offset rather
//! than pointer, a rebuild can never leave a sub-object referring to freed
//! storage.
//!
//! # Indication hooks
//!
//! Every sub-object can carry a download and an upload hook. The download
//! hook observes an assembled SDO write before it is committed and may
//! accept it (after applying whatever side effects it likes), rewrite the
//! outcome, or reject it with an abort code. The upload hook produces the
//! outbound bytes for a read. When no hook is registered the default pair is
//! used: decode, range-check and commit for writes, encode the current slot
//! for reads. The services in this crate use the same mechanism to guard
//! their configuration objects.

mod device;
mod object;
mod sub_object;

pub use device::*;
pub use object::*;
pub use sub_object::*;

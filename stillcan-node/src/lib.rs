//! A passive CANopen protocol engine
//!
//! stillcan-node implements the CANopen communication objects (the object
//! dictionary, SDO client and server, PDOs, SYNC, TIME and EMCY) as pure
//! state machines. The engine owns no socket, no clock and no thread: the
//! host pushes received CAN frames and the current monotonic time in, and
//! takes outbound frames through a send callback. That makes the engine
//! equally at home behind socketcan, a bare-metal driver, or a test harness
//! that pumps frames directly.
//!
//! # Getting started
//!
//! ## Build a dictionary
//!
//! The object dictionary is constructed at run time from [`Object`] and
//! [`SubObject`] values:
//!
//! ```
//! use stillcan_node::object_dict::{AccessType, Device, Object, ObjectCode, SubObject};
//! use stillcan_node::common::{DataType, NodeId, Value};
//!
//! let mut dev = Device::new(NodeId::new(5).unwrap());
//! let mut obj = Object::new(0x2000, ObjectCode::Var);
//! obj.insert_sub(
//!     SubObject::new(0, DataType::UInt32, AccessType::Rw)
//!         .with_default(Value::UInt32(42)),
//! )
//! .unwrap();
//! dev.insert_object(obj).unwrap();
//! assert_eq!(dev.read(0x2000, 0).unwrap(), Value::UInt32(42));
//! ```
//!
//! ## Run a node
//!
//! [`Node`] wires the dictionary to the services and the frame dispatcher.
//! The host hands every received frame to [`Node::on_frame`], calls
//! [`Node::tick`] when the deadline returned by [`Node::next_deadline`]
//! passes, and ships whatever the send callback is given:
//!
//! ```ignore
//! let mut node = Node::new(dev, Box::new(|frame| bus.send(frame)))?;
//! node.start_sdo_server()?;
//! loop {
//!     match rx.recv_deadline(node.next_deadline()) {
//!         Ok(frame) => node.on_frame(&frame, clock.now_us()),
//!         Err(Timeout) => node.tick(clock.now_us()),
//!     }
//! }
//! ```
//!
//! All entry points must be serialized by the host; the engine performs no
//! locking of its own.
#![warn(missing_docs)]
#![allow(clippy::comparison_chain)]

pub mod emcy;
pub mod net;
pub mod node;
pub mod object_dict;
pub mod pdo;
pub mod persist;
pub mod sdo_client;
pub mod sdo_server;
pub mod sync;
pub mod time;

pub use stillcan_common as common;

pub use net::CanNet;
pub use node::Node;
pub use object_dict::{AccessType, Device, DeviceError, Object, ObjectCode, SubObject};
pub use sdo_client::SdoClient;
pub use sdo_server::SdoServer;

/// The default SDO transfer timeout in microseconds
pub const DEFAULT_SDO_TIMEOUT_US: u64 = 100_000;

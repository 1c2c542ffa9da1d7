//! Wire-level types shared by every node of the mesh and by the tools that
//! talk to it over MQTT.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod command;
pub mod mesh;

pub use command::OtaCommand;
pub use mesh::{CustomSubtype, MeshAddress, MessageKind, MAX_PAYLOAD_LEN, RESTART_PAYLOAD};

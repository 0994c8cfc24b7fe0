//! Common transport building blocks for the weft work manager.
//!
//! This crate provides endpoint addressing, stream sockets over TCP and
//! Unix-domain transports, and the length-prefixed framing shared by the
//! master and worker nodes.

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod net;

pub use codec::{FrameReader, FrameWriter};
pub use endpoint::{Endpoint, EndpointKind, EndpointRegistry};
pub use error::{CommonError, Diagnose, Result};
pub use net::{Connection, Listener};

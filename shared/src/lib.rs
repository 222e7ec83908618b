//! Portal shared library.
//!
//! Wire protocol types and the frame codec used by the control-channel
//! server, shared with anything that speaks the tunnel protocol.

pub mod codec;
pub mod error;
pub mod protocol;

pub use error::{Error, ErrorKind, Result};

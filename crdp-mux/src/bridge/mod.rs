//! Wire-level pieces shared by the multiplexor and the transports.
//!
//! - **protocol**: CRDP envelope model and the channel id codec
//! - **codec**: NUL-delimited framing for pipe transports

pub mod codec;
pub mod protocol;

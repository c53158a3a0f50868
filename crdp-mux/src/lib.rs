//! crdp-mux: share one Chrome DevTools Protocol connection between several debugger
//! sessions.
//!
//! Each [`Channel`] behaves like a private connection. Request ids are rewritten on the
//! way out so responses can be routed back, and notifications are filtered by the
//! domains each channel has enabled.

pub mod bridge;
pub mod channel;
pub mod discovery;
pub mod error;
pub mod listener;
pub mod multiplexor;
pub mod transport;

pub use bridge::protocol::{ChannelId, MAX_CHANNELS};
pub use channel::{Channel, ChannelSnapshot};
pub use discovery::{DiscoveryConfig, DiscoveryError, discover};
pub use error::{ErrorKind, MuxError};
pub use listener::{Listener, ListenerId};
pub use multiplexor::{Multiplexor, MuxConfig};
pub use transport::{Connection, ConnectionEvent, EventKind, EventStream, QueuedConnection, TransportError};

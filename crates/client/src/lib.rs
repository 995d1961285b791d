//! Client side of the relay: a serialized command channel, the relay
//! bootstrapper and typed peer operations on top of them.

pub mod channel;
pub mod launcher;
pub mod peer;
pub mod transport;

pub use channel::CommandChannel;
pub use launcher::RelayLauncher;
pub use peer::{PeerClient, ResponseSnapshot, SendPolicy};
pub use transport::Transport;

//! Local WebSocket relay that multiplexes client commands onto the single
//! browser extension link.

pub mod correlation;
pub mod server;

pub use correlation::CorrelationTable;
pub use server::{RelayServer, RelayState};

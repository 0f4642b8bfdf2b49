pub mod bootstrap;
pub mod cancel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod optical;
pub mod progress;
pub mod session;
pub mod snapshot;
pub mod telemetry;
pub mod transfer;
pub mod transport;

pub use error::{HandoffError, Result};

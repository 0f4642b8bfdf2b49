//! Framing of one snapshot over an open ordered channel: a `metadata` text
//! frame, the blob as binary chunks, then a `complete` text frame.

pub mod frame;
pub mod receiver;
pub mod sender;

pub use frame::{ControlFrame, TransferFrame};
pub use receiver::{ReceiveReport, Reassembler, receive_snapshot};
pub use sender::{SendReport, send_snapshot};

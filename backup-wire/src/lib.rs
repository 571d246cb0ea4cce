//! Wire layer shared by the coordinator, its workers, sidecars and clients.
//!
//! Every message travels as a frame: an 8-digit decimal length header
//! followed by that many payload bytes.

pub mod client;
mod error;
pub mod frame;
pub mod message;
pub mod net;

pub use client::{request, send_request};
pub use error::WireError;
pub use frame::{FrameTransport, HEADER_LEN, MAX_FRAME_LEN};
pub use message::{BackupReply, BackupRequest, ControlRequest, ControlResponse};
pub use net::bind_listener;

//! SIP message and SDP codec.

pub mod message;
pub mod sdp;

pub use message::{SipMessage, StartLine, ViaHeader};
pub use sdp::SessionDescription;

//! IMS-style SIP B2BUA with RTPProxy-backed media relay control
//!
//! A signalling and media coordination core: SIP transaction and dialog
//! state machines, a back-to-back user agent that bridges two call legs, a
//! NAT-aware Contact/SDP rewriter, and an RTPProxy control-protocol client.

pub mod codec;
pub mod config;
pub mod core;
pub mod dialog;
pub mod error;
pub mod nat;
pub mod registrar;
pub mod services;
pub mod transaction;
pub mod transport;
pub mod utils;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

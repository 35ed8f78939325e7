//! Stateful services that sit above the transaction/dialog layers.

pub mod b2bua;
pub mod events;
pub mod media_session;
pub mod rtpproxy;

pub use b2bua::{B2buaCall, B2buaCallState, B2buaDeps, B2buaService};
pub use events::{CallDisposition, CallRecordSnapshot, EventBus, GatewayEvent};
pub use media_session::{MediaSession, MediaSessionManager};
pub use rtpproxy::{RelayEndpoint, RtpProxyClient};

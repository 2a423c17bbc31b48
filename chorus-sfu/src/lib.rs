//! Chorus SFU (Selective Forwarding Unit)
//!
//! Runs fixed-size, time-boxed sessions in which every participant publishes
//! one audio and one video track and receives everybody else's.
//!
//! ## Architecture
//!
//! - **`SessionRegistry`**: Maps `origin#name` to live sessions, indexes SSRCs
//! - **`Session`**: Admission, readiness counting, countdown and teardown
//! - **`Mixer`**: Keeps every participant's outbound senders in line with the
//!   live slices and renegotiates with retry
//! - **`MixerSlice`**: Processing of one inbound track, fanned out to all the
//!   other participants with loss-driven bitrate adaptation
//! - **`PeerHandle`**: A participant's transport, signaling and keyframe throttle
//!
//! Media processing itself sits behind [`PipelineFactory`]; the bundled
//! [`PassthroughFactory`] relays packets unchanged.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chorus_sfu::{PassthroughFactory, SessionRegistry, SfuConfig};
//!
//! let registry = SessionRegistry::new(SfuConfig::default(), Arc::new(PassthroughFactory));
//! let (session, status) = registry.join(&payload)?;
//! session.connect_peer(peer.clone());
//! tokio::spawn(session.run_slice(peer, track));
//! ```

mod config;
mod error;
mod interpolator;
mod log;
mod mixer;
mod peer;
mod pipeline;
mod registry;
mod rtc;
mod sender_controller;
mod session;
mod signal;
mod slice;
mod transport;
mod types;

#[cfg(test)]
mod testing;

pub use config::{BitrateConfig, SfuConfig};
pub use error::{Error, Result};
pub use interpolator::{InterpolatorHandle, LinearInterpolator};
pub use log::{Elapsed, LogContext};
pub use mixer::Mixer;
pub use peer::PeerHandle;
pub use pipeline::{
    PacketSink, PassthroughFactory, PassthroughPipeline, Pipeline, PipelineFactory, PipelineSpec,
};
pub use registry::{RegistryStats, SessionRegistry, SsrcEntry};
pub use rtc::{build_api, new_peer_connection, RemoteTrack, WebrtcPeer, WebrtcSender};
pub use sender_controller::{RtcpAction, SenderController};
pub use session::Session;
pub use signal::Signal;
pub use slice::{MixerSlice, SliceBitrates};
pub use transport::{InboundTrack, PeerTransport, RtcpPackets, RtpSender, Signaling};
pub use types::{
    sanitize, ControlPayload, JoinPayload, JoinStatus, SessionId, SessionState, TrackId,
    TrackKind, UserId, UserStream, MAX_PARSED_LENGTH,
};

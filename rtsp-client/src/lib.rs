//! RTSP/RTP client (§4.D): session state machine, SDP parsing, per-stream
//! depacketization via `rtp-depack`, RTCP, and NEM synthesis (§4.D.9),
//! exposed as a `content-pipe` `ProtocolHandler` so a parser consumes an
//! RTSP session exactly like a local file or an HTTP stream.

pub mod config;
pub mod error;
mod handler;
pub mod nem;
pub mod sdp;
pub mod session;
pub mod stream;

pub use config::RtspConfig;
pub use error::{RtspError, RtspResult};
pub use handler::{RtspHandler, RtspHandlerFactory};
pub use session::{RtspSession, SessionState};

use std::sync::Arc;

/// Registers `rtsp://` on `registry`. `http://*.sdp` already resolves to
/// the `"rtsp"` scheme inside `content_pipe::ProtocolRegistry::resolve_scheme`,
/// so this one call covers both.
pub fn register(registry: &content_pipe::ProtocolRegistry, config: RtspConfig) {
    registry.register("rtsp", Arc::new(RtspHandlerFactory::new(config)));
}

//! Chunked, zero-copy caching content pipe over pluggable protocol
//! handlers. See `SPEC_FULL.md` §3/§4 for the data model this crate
//! implements; this is the "content pipe" consumed by parsers in §6.

mod borrow;
mod cache;
mod chunk;
mod error;
mod file_handler;
mod http_handler;
mod handler;

pub use cache::{AvailabilityStatus, CacheEvent, CacheLimits, ContentPipe, PositionEx, ReadBuffer};
pub use error::{PipeError, PipeResult};
pub use file_handler::{probe_by_extension, FileHandler, FileHandlerFactory};
pub use http_handler::{HttpHandler, HttpHandlerFactory};
pub use handler::{
    ConfigKey, ConfigValue, OpenAccess, ParserKind, ProtocolHandler, ProtocolHandlerFactory,
    ProtocolRegistry, SdesField, SeekOrigin, HANDLER_ABI_VERSION,
};

/// Builds a registry with the built-in `file://` and `http://` handlers
/// registered. Callers add protocol-specific handlers (e.g. `rtsp-client`'s
/// `rtsp://`/`rtspt://`) on top of this.
pub fn default_registry() -> ProtocolRegistry {
    let registry = ProtocolRegistry::new();
    registry.register("file", std::sync::Arc::new(FileHandlerFactory));
    registry.register("http", std::sync::Arc::new(HttpHandlerFactory));
    registry.register("https", std::sync::Arc::new(HttpHandlerFactory));
    registry
}

//! Host-side streaming engine for LiveGrapher viewers.
//!
//! Embed an [`Engine`] in a process that produces named time series and call
//! [`Engine::add_data`] as samples arrive; any number of TCP clients can
//! connect, request the dataset catalog, and subscribe to the series they
//! want streamed to them. See [`EngineOptions`] for the knobs and the
//! `protocol` module for the wire format clients must speak.

mod client;
mod engine;
mod error;
mod options;
mod protocol;
mod registry;

pub use engine::Engine;
pub use error::{ProtocolError, RegistryFull, StartupError};
pub use options::EngineOptions;
pub use protocol::{ClientFrame, DatasetId, HostFrame, ID_MASK, LEGACY_ID_MASK, MAX_DATASETS};

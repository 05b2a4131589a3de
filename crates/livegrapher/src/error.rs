use std::io;

use thiserror::Error;

/// Errors that can abort [`crate::Engine::new`].
///
/// Anything past startup is handled by dropping the offending client instead
/// of propagating an error; these variants are the exception because they
/// leave the engine unable to start at all.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind { addr: std::net::SocketAddr, #[source] source: io::Error },

    #[error("failed to configure listener socket: {0}")]
    Configure(#[source] io::Error),

    #[error("failed to create reactor: {0}")]
    Reactor(#[source] io::Error),

    #[error("failed to create cross-thread waker: {0}")]
    Waker(#[source] io::Error),
}

/// Failures decoding a client-driven control frame.
///
/// All of these are handled the same way by the reactor: the offending
/// client is dropped and the engine keeps running.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown packet type in header byte")]
    BadType,
    #[error("zero-length dataset name")]
    BadLength,
    #[error("frame truncated before completion")]
    ShortRead,
}

/// Dataset-registry overflow: more than 64 distinct names have been observed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("registry is full (64 datasets already assigned)")]
pub struct RegistryFull;

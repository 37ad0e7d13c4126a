use thiserror::Error;

/// Coordinator-side error classification (§7), scoped to per-RPC/session
/// faults. The router never aborts on one of these — each is isolated to
/// the offending session or RPC call and surfaced to the caller, never
/// propagated into a panic. `ConfigError` isn't a variant here: it's a
/// process-startup failure (`main.rs`/`config.rs`, via `anyhow`), never
/// something an in-flight RPC can raise.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("incompatible protocol version: {0}")]
    IncompatibleProtocol(String),

    #[error("address pool exhausted")]
    Exhausted,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("wire error: {0}")]
    Wire(#[from] tunnel_protocol::WireError),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

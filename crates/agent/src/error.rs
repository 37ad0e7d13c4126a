use thiserror::Error;

/// Agent-side error classification (§7). Transport and registration
/// errors are recoverable — the runtime loop catches them and returns
/// to `Dialing` — while interface/route errors during setup are fatal
/// to the current connection attempt but not to the process.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to open stream: {0}")]
    Stream(String),

    #[error("registration rejected: incompatible protocol (server requires >= {0})")]
    IncompatibleProtocol(String),

    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("wire error: {0}")]
    Wire(#[from] tunnel_protocol::WireError),

    #[error("virtual interface error: {0}")]
    Interface(String),

    #[error("route installer error: {0}")]
    Route(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

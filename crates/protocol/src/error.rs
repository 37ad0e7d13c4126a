use thiserror::Error;

/// Failures decoding or transporting a single wire frame. Distinct from
/// the coordinator/agent-level `CoordinatorError`/`AgentError` (§7),
/// which classify RPC-level outcomes rather than byte-level ones.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode decode error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),

    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("unknown stream kind byte: {0}")]
    UnknownStreamKind(u8),
}

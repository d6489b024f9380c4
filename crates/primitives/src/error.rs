use thiserror::Error;

/// Error taxonomy of the replication layer.
///
/// Peer-sourced malformed input ([`Self::ProtocolDecode`]) is always
/// handled locally by dropping the message and resetting that peer's
/// sessions; it never propagates out of the orchestrator. A cached
/// encoder found inconsistent with local data is rebuilt silently and is
/// deliberately not represented here.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Incompatible configuration at open time (for example a time domain
    /// paired with a 64-bit resolution). Fatal, surfaced immediately.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A coverage wait exhausted its retry budget.
    #[error("timed out waiting for coverage after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// The caller cancelled a wait via its abort signal. Not a failure to
    /// log or alert on.
    #[error("operation aborted by caller")]
    Aborted,

    /// Malformed range announcement or coded-symbol message from a peer.
    #[error("protocol decode failure: {0}")]
    ProtocolDecode(String),
}

impl ReplicationError {
    /// Whether this error came from a peer rather than the local caller
    /// or configuration.
    #[must_use]
    pub fn is_peer_sourced(&self) -> bool {
        matches!(self, Self::ProtocolDecode(_))
    }
}

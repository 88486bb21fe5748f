use std::net::SocketAddr;
use thiserror::Error;

/// Unified error type for btstream.
///
/// One enum covers every failure class in the engine:
/// - peer wire protocol violations (fatal to the connection)
/// - transient peer failures (connect/timeout/close, retried with back-off)
/// - metainfo and magnet parse errors (surfaced to the caller at open time)
/// - tracker, disk cache and cancellation errors
///
/// Using a single type keeps the error mapping consistent across the peer
/// tasks, the disk worker and the public open/read surface.
#[derive(Error, Debug, Clone)]
pub enum BtError {
    // === Open-time errors (surfaced to the caller) ===
    /// Magnet or torrent URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Configuration file, environment or value problem
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Info-hash string is not 40 hex characters
    #[error("Invalid info hash: {0}")]
    InvalidInfoHash(String),

    /// Metainfo dictionary is malformed
    #[error("Invalid metainfo: {0}")]
    InvalidMetainfo(String),

    /// Path does not name a file inside the torrent
    #[error("File not found in torrent: {0}")]
    FileNotFound(String),

    /// Path names a directory where a file was expected (or vice versa)
    #[error("Not a directory: {0}")]
    NotDirectory(String),

    /// Metadata exchange did not complete before the open timed out
    #[error("Timed out waiting for torrent metadata")]
    MetadataTimeout,

    // === Peer protocol errors (fatal to the connection) ===
    /// Handshake did not carry the BitTorrent protocol string
    #[error("Peer sent wrong protocol magic")]
    WrongProtocol,

    /// Handshake info-hash does not match the torrent
    #[error("Peer handshake info hash mismatch")]
    InfoHashMismatch,

    /// Message length prefix exceeds the 1 MiB sanity cap
    #[error("Peer message too large: {0} bytes")]
    OversizedMessage(u32),

    /// Wire message body malformed for its id
    #[error("Malformed peer message: {0}")]
    MalformedMessage(String),

    // === Transient peer errors (retried with back-off) ===
    /// TCP connect failed or timed out
    #[error("Peer connect failed: {addr}")]
    ConnectFailed { addr: SocketAddr },

    /// Connection dropped after the handshake
    #[error("Peer disconnected: {addr}")]
    PeerDisconnected { addr: SocketAddr },

    /// No data received within the idle window
    #[error("Peer read timed out")]
    PeerTimeout,

    // === Tracker errors ===
    /// Tracker hostname did not resolve
    #[error("Tracker DNS lookup failed: {0}")]
    TrackerDns(String),

    /// Tracker returned a failure reason
    #[error("Tracker error: {0}")]
    TrackerFailure(String),

    /// Tracker URL scheme is not udp:// or http(s)://
    #[error("Unsupported tracker scheme: {0}")]
    TrackerScheme(String),

    // === I/O errors ===
    /// Socket or file I/O failed
    #[error("I/O error: {0}")]
    Io(String),

    // === Disk cache errors ===
    /// Cache file I/O failed; the piece stays valid in RAM only
    #[error("Cache I/O error: {0}")]
    CacheIo(String),

    /// Cache file header failed validation
    #[error("Cache file invalid: {0}")]
    CacheInvalid(String),

    // === Codec errors ===
    /// Bencode document malformed
    #[error("Bencode parse error: {0}")]
    Bencode(String),

    // === Cancellation / shutdown ===
    /// The file handle's cancellation token fired
    #[error("Read cancelled")]
    Cancelled,

    /// The session is shutting down
    #[error("Session shut down")]
    Shutdown,
}

impl BtError {
    /// True for failures that park the peer for a retry rather than
    /// destroying it outright.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BtError::ConnectFailed { .. }
                | BtError::PeerDisconnected { .. }
                | BtError::PeerTimeout
        )
    }

    /// True for wire violations that disconnect the peer immediately.
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(
            self,
            BtError::WrongProtocol
                | BtError::InfoHashMismatch
                | BtError::OversizedMessage(_)
                | BtError::MalformedMessage(_)
        )
    }
}

impl From<std::io::Error> for BtError {
    fn from(err: std::io::Error) -> Self {
        BtError::Io(err.to_string())
    }
}

/// Result type alias used throughout the engine.
pub type BtResult<T> = Result<T, BtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        assert!(BtError::ConnectFailed { addr }.is_transient());
        assert!(BtError::PeerDisconnected { addr }.is_transient());
        assert!(BtError::PeerTimeout.is_transient());

        assert!(!BtError::WrongProtocol.is_transient());
        assert!(!BtError::TrackerFailure("down".into()).is_transient());
        assert!(!BtError::Cancelled.is_transient());
    }

    #[test]
    fn test_protocol_fatal_classification() {
        assert!(BtError::WrongProtocol.is_protocol_fatal());
        assert!(BtError::InfoHashMismatch.is_protocol_fatal());
        assert!(BtError::OversizedMessage(0x200000).is_protocol_fatal());
        assert!(BtError::MalformedMessage("have len 3".into()).is_protocol_fatal());

        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        assert!(!BtError::ConnectFailed { addr }.is_protocol_fatal());
        assert!(!BtError::CacheIo("short write".into()).is_protocol_fatal());
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", BtError::OversizedMessage(2_000_000)),
            "Peer message too large: 2000000 bytes"
        );
        assert_eq!(
            format!("{}", BtError::FileNotFound("a/b.mkv".into())),
            "File not found in torrent: a/b.mkv"
        );
        assert_eq!(format!("{}", BtError::Cancelled), "Read cancelled");
    }
}

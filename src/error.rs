//! Error types for the DHCP server.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.
//!
//! Protocol violations (a client naming another server, a mismatched
//! requested address) and pool exhaustion are not errors: the state machine
//! answers them with a NAK or with silence.

/// Errors that can occur during DHCP server operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error outside the retried persistence path.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP packet received.
    ///
    /// Bad magic cookie, truncated option, or a fixed-length option with the
    /// wrong size. The datagram is discarded without touching lease state.
    #[error("Malformed DHCP packet: {0}")]
    MalformedPacket(String),

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges.
    #[error("Socket error: {0}")]
    Socket(String),

    /// Lease persistence failed after every retry was spent.
    #[error("Failed to {operation} leases at {target} after {attempts} attempts: {source}")]
    Persistence {
        operation: &'static str,
        target: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// The UDP endpoint failed outside of a normal stop.
    #[error("Network failure: {0}")]
    FatalNetwork(std::io::Error),
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for wgnc

use thiserror::Error;

/// Main error type for wgnc
#[derive(Error, Debug)]
pub enum WgncError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("No peers found in configuration")]
    NoPeers,

    #[error("No suitable peer found in configuration")]
    NoSuitablePeer,

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("The remote internal IP to connect to was not specified and could not be inferred from the configuration")]
    MissingConnectAddress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Peer public key is a low-order point")]
    WeakPublicKey,
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("Replay attack detected: counter {counter} already seen")]
    ReplayDetected { counter: u64 },

    #[error("Session expired")]
    SessionExpired,

    #[error("No active session")]
    NoSession,

    #[error("Invalid receiver index: {index}")]
    InvalidReceiverIndex { index: u32 },
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("DNS resolution failed for {host}")]
    DnsResolutionFailed { host: String },

    #[error("Connection to {target} failed: {reason}")]
    ConnectFailed { target: String, reason: String },

    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid device configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Device activation failed: {reason}")]
    ActivationFailed { reason: String },

    #[error("Virtual network stack is closed")]
    Closed,
}

impl WgncError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Config(ConfigError::InvalidKey { field }) => {
                format!("Invalid {} in config. Expected a base64-encoded key.", field)
            }

            Self::Config(ConfigError::MissingConnectAddress) => {
                "The remote internal IP to connect to was not specified and could not be \
                 inferred from the configuration.\n  \
                 Pass it as the first positional argument or set AllowedIPs = <ip>/32."
                    .to_string()
            }

            Self::Network(NetworkError::DnsResolutionFailed { host }) => {
                format!("Couldn't resolve {}", host)
            }

            Self::Network(NetworkError::ConnectFailed { target, .. }) => {
                format!(
                    "Connection to {} through the tunnel failed.\n  \
                    Check that the peer is reachable and the service is listening.",
                    target
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Network(_) => 3,
            Self::Protocol(_) => 4,
            Self::Crypto(_) => 5,
            Self::Tunnel(_) => 6,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for wgnc operations
pub type Result<T> = std::result::Result<T, WgncError>;

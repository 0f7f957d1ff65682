use thiserror::Error;

/// ACD engine errors
///
/// Inside the engine almost every failure is absorbed into a state transition and a
/// log line. These errors only surface from configuration, admission and the
/// collaborator contracts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcdError {
    /// Queue-related errors
    #[error("Queue error: {0}")]
    Queue(String),

    /// A queue id that is not registered
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Operator-related errors
    #[error("Operator error: {0}")]
    Operator(String),

    /// Dial attempt errors
    #[error("Dial error: {0}")]
    Dial(String),

    /// Conversation leg errors reported by the leg provider
    #[error("Leg error: {0}")]
    Leg(String),

    /// Bridge service errors
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AcdError {
    /// Create a new Queue error
    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a new Operator error
    pub fn operator<S: Into<String>>(msg: S) -> Self {
        Self::Operator(msg.into())
    }

    /// Create a new Dial error
    pub fn dial<S: Into<String>>(msg: S) -> Self {
        Self::Dial(msg.into())
    }

    /// Create a new Leg error
    pub fn leg<S: Into<String>>(msg: S) -> Self {
        Self::Leg(msg.into())
    }

    /// Create a new Bridge error
    pub fn bridge<S: Into<String>>(msg: S) -> Self {
        Self::Bridge(msg.into())
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new Timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type for ACD operations
pub type Result<T> = std::result::Result<T, AcdError>;

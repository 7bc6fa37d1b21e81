// MIT License - Copyright (c) 2026 Peter Wright
// Error types

/// All errors that can occur in the wallpad bus engine.
#[derive(Debug, thiserror::Error)]
pub enum WallpadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("No active packet at {endpoint}")]
    NoTraffic { endpoint: String },

    #[error("Bus connection lost")]
    ConnectionLost,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Invalid topic: {topic}")]
    InvalidTopic { topic: String },

    #[error("Unknown device: {device}")]
    UnknownDevice { device: String },

    #[error("Unknown command {command} for device {device}")]
    UnknownCommand { device: String, command: String },

    #[error("Unknown trigger {trigger} for virtual device {device}")]
    UnknownTrigger { device: String, trigger: String },

    #[error("Empty payload on {topic}")]
    EmptyPayload { topic: String },

    #[error("Invalid payload: {payload}")]
    InvalidPayload { payload: String },

    #[error("Command not allowed: {reason}")]
    Disallowed { reason: String },

    #[error("Device {device} is disabled in the current mode")]
    DeviceDisabled { device: String },

    #[error("Invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("Channel closed")]
    ChannelClosed,
}

impl WallpadError {
    /// Whether this error ends the bus session and the transport should be reopened.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WallpadError::Io(_)
                | WallpadError::Serial(_)
                | WallpadError::NoTraffic { .. }
                | WallpadError::ConnectionLost
        )
    }

    /// Errors caused by a malformed automation-layer message.
    pub fn is_rejected_command(&self) -> bool {
        matches!(
            self,
            WallpadError::InvalidTopic { .. }
                | WallpadError::UnknownDevice { .. }
                | WallpadError::UnknownCommand { .. }
                | WallpadError::UnknownTrigger { .. }
                | WallpadError::EmptyPayload { .. }
                | WallpadError::InvalidPayload { .. }
                | WallpadError::Disallowed { .. }
                | WallpadError::DeviceDisabled { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, WallpadError>;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::SessionError;

/// Default soft backpressure threshold
pub const DEFAULT_SOFT_LIMIT: usize = 16;

/// Default hard queue limit
pub const DEFAULT_HARD_LIMIT: usize = 64;

/// Direction of a codec session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Encoder,
    Decoder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Encoder => f.write_str("encoder"),
            Role::Decoder => f.write_str("decoder"),
        }
    }
}

/// Queue limits enforced by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Depth at which the session reports itself saturated
    pub soft: usize,
    /// Depth at which submissions are rejected
    pub hard: usize,
}

impl QueueLimits {
    pub fn new(soft: usize, hard: usize) -> Self {
        Self { soft, hard }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.soft == 0 {
            return Err(SessionError::validation("soft limit must be at least 1"));
        }
        if self.hard <= self.soft {
            return Err(SessionError::validation(format!(
                "hard limit {} must exceed soft limit {}",
                self.hard, self.soft
            )));
        }
        Ok(())
    }
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            soft: DEFAULT_SOFT_LIMIT,
            hard: DEFAULT_HARD_LIMIT,
        }
    }
}

/// Temporal scalability mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalabilityMode {
    L1T1,
    L1T2,
    L1T3,
}

impl ScalabilityMode {
    /// Temporal layer of the item at `sequence_id`
    pub fn temporal_layer(&self, sequence_id: u64) -> u8 {
        match self {
            ScalabilityMode::L1T1 => 0,
            ScalabilityMode::L1T2 => (sequence_id % 2) as u8,
            ScalabilityMode::L1T3 => match sequence_id % 4 {
                0 => 0,
                2 => 1,
                _ => 2,
            },
        }
    }

    pub fn temporal_layers(&self) -> u8 {
        match self {
            ScalabilityMode::L1T1 => 1,
            ScalabilityMode::L1T2 => 2,
            ScalabilityMode::L1T3 => 3,
        }
    }
}

impl FromStr for ScalabilityMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L1T1" => Ok(ScalabilityMode::L1T1),
            "L1T2" => Ok(ScalabilityMode::L1T2),
            "L1T3" => Ok(ScalabilityMode::L1T3),
            other => Err(SessionError::validation(format!(
                "unsupported scalability mode: {}",
                other
            ))),
        }
    }
}

/// Session configuration, already normalized by the API layer
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    /// Codec name understood by the codec factory
    pub codec: String,
    /// Coded width in pixels
    pub width: u32,
    /// Coded height in pixels
    pub height: u32,
    /// Out-of-band codec description (e.g. avcC) for decoders
    pub description: Option<Bytes>,
    pub scalability: Option<ScalabilityMode>,
    pub limits: QueueLimits,
}

impl SessionConfig {
    pub fn encoder(codec: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            role: Role::Encoder,
            codec: codec.into(),
            width,
            height,
            ..Self::default()
        }
    }

    /// Decoder configuration. Coded dimensions stay unknown (0) unless set.
    pub fn decoder(codec: impl Into<String>) -> Self {
        Self {
            role: Role::Decoder,
            codec: codec.into(),
            width: 0,
            height: 0,
            ..Self::default()
        }
    }

    pub fn with_limits(mut self, limits: QueueLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_scalability(mut self, mode: ScalabilityMode) -> Self {
        self.scalability = Some(mode);
        self
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.codec.is_empty() {
            return Err(SessionError::validation("codec must not be empty"));
        }
        if self.role == Role::Encoder && (self.width == 0 || self.height == 0) {
            return Err(SessionError::validation(format!(
                "encoder dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        self.limits.validate()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: Role::Encoder,
            codec: "h264".to_string(),
            width: 1920,
            height: 1080,
            description: None,
            scalability: None,
            limits: QueueLimits::default(),
        }
    }
}

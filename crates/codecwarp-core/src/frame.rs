use bytes::Bytes;

use crate::error::ErrorKind;

/// A raw frame (encoder input) or encoded chunk (decoder input)
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    /// Presentation timestamp in microseconds
    pub timestamp_us: i64,
    /// Duration in microseconds, if known
    pub duration_us: Option<u64>,
    pub flags: FrameFlags,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, timestamp_us: i64) -> Self {
        Self {
            data: data.into(),
            timestamp_us,
            duration_us: None,
            flags: FrameFlags::default(),
        }
    }

    pub fn with_duration(mut self, duration_us: u64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    /// Mark as a keyframe (decoder input) or request one (encoder input)
    pub fn key(mut self) -> Self {
        self.flags.key_frame = true;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-item flags carried alongside the payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    pub key_frame: bool,
}

/// Session metadata attached to boundary outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryMetadata {
    pub codec: String,
    /// Coded size as reported by the handle, else as configured (0 = unknown)
    pub coded_width: u32,
    pub coded_height: u32,
    /// Codec description (e.g. parameter sets) as reported by the handle
    pub description: Option<Bytes>,
}

/// An output delivered to the owner
#[derive(Debug, Clone)]
pub struct OutputEvent {
    pub sequence_id: u64,
    pub data: Bytes,
    /// Original timestamp of the input this output was produced from
    pub timestamp_us: i64,
    pub duration_us: Option<u64>,
    /// Restart point (e.g. keyframe)
    pub is_boundary: bool,
    /// Present on boundary outputs
    pub metadata: Option<BoundaryMetadata>,
    /// Present when the session has a scalability mode
    pub temporal_layer: Option<u8>,
}

/// An asynchronous failure delivered to the owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// The failing item, or None when the failure is not tied to one
    /// (e.g. the codec could not be initialized)
    pub sequence_id: Option<u64>,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(sequence_id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            sequence_id: Some(sequence_id),
            kind,
            message: message.into(),
        }
    }

    /// Failure of the session's codec handle as a whole
    pub fn untagged(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            sequence_id: None,
            kind,
            message: message.into(),
        }
    }
}

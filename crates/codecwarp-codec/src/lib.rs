//! codecwarp-codec - Codec library contract
//!
//! This crate defines the interface the session engine drives: a factory
//! that initializes stateful codec handles, the handle itself, and the
//! format-conversion step the worker applies before submitting input.

mod convert;
#[cfg(feature = "ffmpeg")]
mod ffmpeg;
mod mock;

use bytes::Bytes;
use codecwarp_core::{CodecError, SessionConfig};

pub use convert::{FormatConverter, Passthrough};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{FfmpegDecoder, FfmpegDecoderFactory};
pub use mock::{MockCodec, MockCodecConfig, MockCodecFactory, MockStats};

/// Input handed to a codec handle
#[derive(Debug, Clone)]
pub struct CodecInput {
    /// Presentation timestamp the codec carries through to its output
    pub pts: i64,
    pub data: Bytes,
    pub key_frame: bool,
}

/// Output produced by a codec handle
#[derive(Debug, Clone)]
pub struct CodecOutput {
    /// Presentation timestamp of the input this output belongs to, if known
    pub pts: Option<i64>,
    pub data: Bytes,
    pub key_frame: bool,
}

/// A stateful codec handle
///
/// A handle accepts one input at a time and, zero or more calls later,
/// yields zero or more outputs. After [`Codec::send_eof`] it produces its
/// remaining outputs and then accepts no further input; the owner must
/// create a new handle to continue. Dropping the handle destroys it.
pub trait Codec: Send + 'static {
    /// Submit one input
    fn submit(&mut self, input: CodecInput) -> Result<(), CodecError>;

    /// Signal end of stream so buffered outputs are released
    fn send_eof(&mut self) -> Result<(), CodecError>;

    /// Fetch the next output. `Ok(None)` means no output is ready (or the
    /// stream is exhausted after `send_eof`).
    fn poll_output(&mut self) -> Result<Option<CodecOutput>, CodecError>;

    /// Out-of-band codec description (e.g. parameter sets), once known
    fn description(&self) -> Option<Bytes> {
        None
    }

    /// Coded width and height, once known
    fn coded_size(&self) -> Option<(u32, u32)> {
        None
    }
}

/// Creates codec handles for a session configuration
pub trait CodecFactory: Send + Sync + 'static {
    type Codec: Codec;

    /// Initialize a new handle
    fn init(&self, config: &SessionConfig) -> Result<Self::Codec, CodecError>;

    /// Converter applied to every input before it is submitted
    fn converter(&self, _config: &SessionConfig) -> Box<dyn FormatConverter> {
        Box::new(Passthrough)
    }
}

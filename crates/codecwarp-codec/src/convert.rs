//! Input format conversion applied by the worker before submit

use codecwarp_core::{CodecError, Frame};

/// Converts an accepted input into the layout the codec handle expects
pub trait FormatConverter: Send + 'static {
    fn convert(&mut self, frame: Frame) -> Result<Frame, CodecError>;
}

/// Hands frames through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl FormatConverter for Passthrough {
    fn convert(&mut self, frame: Frame) -> Result<Frame, CodecError> {
        Ok(frame)
    }
}

impl<F> FormatConverter for F
where
    F: FnMut(Frame) -> Result<Frame, CodecError> + Send + 'static,
{
    fn convert(&mut self, frame: Frame) -> Result<Frame, CodecError> {
        self(frame)
    }
}

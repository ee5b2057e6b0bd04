//! Mock codec for testing
//!
//! Echoes each input back as its output, with optional look-ahead
//! buffering, pairwise reordering and per-submit latency so the engine can
//! be exercised without a real codec library. Inputs whose payload starts
//! with [`MockCodec::FAIL_MARKER`] fail individually; inputs starting with
//! [`MockCodec::CORRUPT_MARKER`] make the handle unusable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use codecwarp_core::{CodecError, ResourceKind, SessionConfig, Tracked};

use crate::{Codec, CodecFactory, CodecInput, CodecOutput};

/// Behaviour of mock codec handles
#[derive(Debug, Clone, Default)]
pub struct MockCodecConfig {
    /// Inputs held back before the first output is released
    pub lookahead: usize,
    /// Release held inputs in swapped pairs, like B-frame reordering
    pub reorder: bool,
    /// Time spent inside every submit call
    pub submit_delay: Duration,
    /// Description reported once the first output has been produced
    pub description: Option<Bytes>,
    /// Coded size reported once the first output has been produced
    pub coded_size: Option<(u32, u32)>,
    /// Force a keyframe every N outputs (0 = only when requested)
    pub keyframe_interval: u64,
    /// Fail every initialization after this many have succeeded
    pub max_inits: Option<usize>,
}

/// Counters shared by a factory and all handles it creates
#[derive(Debug, Default)]
pub struct MockStats {
    inits: AtomicUsize,
    submitted: AtomicUsize,
    produced: AtomicUsize,
    eofs: AtomicUsize,
}

impl MockStats {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn eofs(&self) -> usize {
        self.eofs.load(Ordering::SeqCst)
    }
}

/// Factory for [`MockCodec`] handles
#[derive(Debug, Clone, Default)]
pub struct MockCodecFactory {
    config: MockCodecConfig,
    stats: Arc<MockStats>,
}

impl MockCodecFactory {
    pub fn new(config: MockCodecConfig) -> Self {
        Self {
            config,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Shared counters, observable while sessions run
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

impl CodecFactory for MockCodecFactory {
    type Codec = MockCodec;

    fn init(&self, config: &SessionConfig) -> Result<MockCodec, CodecError> {
        if config.codec == MockCodec::UNKNOWN_CODEC {
            return Err(CodecError::CodecNotFound(config.codec.clone()));
        }
        if let Some(max) = self.config.max_inits {
            if self.stats.inits() >= max {
                return Err(CodecError::InitFailed(format!(
                    "mock init budget of {} exhausted",
                    max
                )));
            }
        }
        self.stats.inits.fetch_add(1, Ordering::SeqCst);
        Ok(MockCodec::new(self.config.clone(), Arc::clone(&self.stats)))
    }
}

/// Scriptable in-memory codec handle
#[derive(Debug)]
pub struct MockCodec {
    config: MockCodecConfig,
    stats: Arc<MockStats>,
    held: VecDeque<CodecInput>,
    ready: VecDeque<CodecOutput>,
    emitted: u64,
    eof: bool,
    _tracked: Tracked,
}

impl MockCodec {
    /// Payload prefix that makes a single submit fail
    pub const FAIL_MARKER: &'static [u8] = b"fail";
    /// Payload prefix that makes the handle unusable
    pub const CORRUPT_MARKER: &'static [u8] = b"corrupt";
    /// Codec name the factory refuses to initialize
    pub const UNKNOWN_CODEC: &'static str = "unknown";

    fn new(config: MockCodecConfig, stats: Arc<MockStats>) -> Self {
        Self {
            config,
            stats,
            held: VecDeque::new(),
            ready: VecDeque::new(),
            emitted: 0,
            eof: false,
            _tracked: Tracked::new(ResourceKind::CodecHandle),
        }
    }

    fn release(&mut self, input: CodecInput) {
        let forced = self.config.keyframe_interval > 0
            && self.emitted % self.config.keyframe_interval == 0;
        self.emitted += 1;
        self.stats.produced.fetch_add(1, Ordering::SeqCst);
        self.ready.push_back(CodecOutput {
            pts: Some(input.pts),
            data: input.data,
            key_frame: input.key_frame || forced,
        });
    }

    fn release_ready(&mut self) {
        while self.held.len() > self.config.lookahead {
            if self.config.reorder {
                if self.held.len() < 2 + self.config.lookahead {
                    break;
                }
                if let (Some(first), Some(second)) = (self.held.pop_front(), self.held.pop_front()) {
                    self.release(second);
                    self.release(first);
                }
            } else if let Some(input) = self.held.pop_front() {
                self.release(input);
            }
        }
    }
}

impl Codec for MockCodec {
    fn submit(&mut self, input: CodecInput) -> Result<(), CodecError> {
        if self.eof {
            return Err(CodecError::EndOfStream);
        }
        if !self.config.submit_delay.is_zero() {
            std::thread::sleep(self.config.submit_delay);
        }
        if input.data.starts_with(Self::CORRUPT_MARKER) {
            return Err(CodecError::Unusable(format!(
                "corrupt input at pts {}",
                input.pts
            )));
        }
        if input.data.starts_with(Self::FAIL_MARKER) {
            return Err(CodecError::SubmitFailed(format!(
                "rejected input at pts {}",
                input.pts
            )));
        }

        self.stats.submitted.fetch_add(1, Ordering::SeqCst);
        self.held.push_back(input);
        self.release_ready();
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), CodecError> {
        if self.eof {
            return Err(CodecError::EndOfStream);
        }
        self.eof = true;
        self.stats.eofs.fetch_add(1, Ordering::SeqCst);
        while let Some(input) = self.held.pop_front() {
            self.release(input);
        }
        Ok(())
    }

    fn poll_output(&mut self) -> Result<Option<CodecOutput>, CodecError> {
        Ok(self.ready.pop_front())
    }

    fn description(&self) -> Option<Bytes> {
        if self.emitted > 0 {
            self.config.description.clone()
        } else {
            None
        }
    }

    fn coded_size(&self) -> Option<(u32, u32)> {
        self.config.coded_size.filter(|_| self.emitted > 0)
    }
}

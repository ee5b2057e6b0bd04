//! Dedicated codec thread.
//!
//! The worker owns the codec handle and the bridge sender outright. The handle
//! is created on the worker thread as its first step, and both are dropped on
//! that thread before it exits, so once the thread has been joined neither can
//! be touched again.
//!
//! The shared `codec_valid` flag is written here and read only by the session,
//! to fail operations early. The worker never consults it; it tracks its own
//! handle through `codec` being `None`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use codecwarp_codec::{Codec, CodecFactory, CodecInput, CodecOutput, FormatConverter};
use codecwarp_core::{
    CodecError, ErrorEvent, ErrorKind, Frame, ResourceKind, SessionConfig, SessionError, Tracked,
};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::bridge::{BridgeSender, Delivery, FlushAck, PostOutcome, RawOutput};
use crate::queue::TaskQueue;

/// A submitted frame or chunk
pub(crate) struct Task {
    pub sequence_id: u64,
    pub frame: Frame,
    _tracked: Tracked,
}

impl Task {
    pub fn new(sequence_id: u64, frame: Frame) -> Self {
        Self {
            sequence_id,
            frame,
            _tracked: Tracked::new(ResourceKind::QueuedItem),
        }
    }
}

/// Flush request. Dropping it unanswered aborts the flush.
pub(crate) struct FlushSentinel {
    /// Last sequence id assigned before the flush was requested
    pub barrier: Option<u64>,
    pub ack: FlushAck,
}

pub(crate) enum WorkItem {
    Work(Task),
    Flush(FlushSentinel),
}

/// Handle to a running worker thread
pub(crate) struct WorkerThread {
    id: u64,
    queue: Arc<TaskQueue<WorkItem>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn spawn<F: CodecFactory>(
        id: u64,
        factory: Arc<F>,
        config: SessionConfig,
        bridge: BridgeSender,
        codec_valid: Arc<AtomicBool>,
    ) -> Result<Self, SessionError> {
        let queue = Arc::new(TaskQueue::new());
        let converter = factory.converter(&config);
        let mut worker = CodecWorker {
            id,
            factory,
            config,
            codec: None,
            converter,
            bridge,
            codec_valid,
            timing: HashMap::new(),
            last_timing: None,
            last_submitted: None,
            owner_gone: false,
        };

        let thread_queue = Arc::clone(&queue);
        let tracked = Tracked::new(ResourceKind::Worker);
        let handle = thread::Builder::new()
            .name(format!("codecwarp-worker-{}", id))
            .spawn(move || {
                let _tracked = tracked;
                worker.run(&thread_queue);
            })
            .map_err(|e| SessionError::CodecFailure(format!("failed to start worker thread: {}", e)))?;

        debug!("worker {} started", id);

        Ok(Self {
            id,
            queue,
            handle: Some(handle),
        })
    }

    /// Enqueue an item. Hands it back if the worker is stopping.
    pub fn push(&self, item: WorkItem) -> Result<(), WorkItem> {
        self.queue.push(item)
    }

    /// Stop the worker without blocking.
    ///
    /// Queued items are dropped. The item currently executing runs to
    /// completion. The returned receiver fires once the thread has been
    /// joined.
    pub fn stop(mut self) -> oneshot::Receiver<()> {
        self.queue.shutdown();
        let discarded = self.queue.discard();
        if discarded > 0 {
            debug!("worker {}: discarded {} queued items", self.id, discarded);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let handle = self.handle.take();
        let id = self.id;
        let reaper = thread::Builder::new()
            .name(format!("codecwarp-reaper-{}", id))
            .spawn(move || {
                if let Some(handle) = handle {
                    if handle.join().is_err() {
                        error!("worker {} panicked", id);
                    }
                }
                debug!("worker {} joined", id);
                let _ = done_tx.send(());
            });

        if let Err(e) = reaper {
            // The worker still exits on its own; it just goes unjoined
            warn!("worker {}: failed to start reaper thread: {}", id, e);
        }
        done_rx
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.queue.shutdown();
        }
    }
}

struct CodecWorker<F: CodecFactory> {
    id: u64,
    factory: Arc<F>,
    config: SessionConfig,
    /// None before initialization and once the handle is unusable
    codec: Option<F::Codec>,
    converter: Box<dyn FormatConverter>,
    bridge: BridgeSender,
    codec_valid: Arc<AtomicBool>,
    /// sequence id -> (timestamp, duration) of submitted inputs
    timing: HashMap<u64, (i64, Option<u64>)>,
    /// Timing of the most recent output, for inputs producing several outputs
    last_timing: Option<(u64, (i64, Option<u64>))>,
    last_submitted: Option<u64>,
    owner_gone: bool,
}

impl<F: CodecFactory> CodecWorker<F> {
    fn run(&mut self, queue: &TaskQueue<WorkItem>) {
        self.init();
        while let Some(mut in_flight) = queue.pop() {
            match in_flight.take() {
                Some(WorkItem::Work(task)) => self.process(task),
                Some(WorkItem::Flush(sentinel)) => self.flush(sentinel),
                None => {}
            }
        }
        self.teardown();
    }

    /// Create the handle. On failure every later item is discarded.
    fn init(&mut self) {
        match self.factory.init(&self.config) {
            Ok(codec) => {
                self.codec = Some(codec);
                debug!("worker {}: codec initialized", self.id);
            }
            Err(e) => {
                error!("worker {}: codec initialization failed: {}", self.id, e);
                self.codec_valid.store(false, Ordering::Release);
                self.post(Delivery::Error(ErrorEvent::untagged(
                    ErrorKind::CodecUnusable,
                    format!("codec initialization failed: {}", e),
                )));
            }
        }
    }

    fn process(&mut self, task: Task) {
        let sequence_id = task.sequence_id;
        if self.codec.is_none() {
            self.post(Delivery::Discarded { sequence_id });
            return;
        }

        let frame = match self.converter.convert(task.frame) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(Some(sequence_id), e);
                return;
            }
        };

        self.timing
            .insert(sequence_id, (frame.timestamp_us, frame.duration_us));
        let input = CodecInput {
            pts: sequence_id as i64,
            data: frame.data,
            key_frame: frame.flags.key_frame,
        };

        let submitted = match self.codec.as_mut() {
            Some(codec) => codec.submit(input),
            None => return,
        };

        match submitted {
            Ok(()) => {
                self.last_submitted = Some(sequence_id);
                self.poll_outputs(Some(sequence_id));
            }
            Err(e) => {
                self.timing.remove(&sequence_id);
                self.fail(Some(sequence_id), e);
            }
        }
    }

    fn flush(&mut self, sentinel: FlushSentinel) {
        let FlushSentinel { barrier, ack } = sentinel;
        let result = self.drain_and_reinit();
        self.post(Delivery::FlushComplete {
            barrier,
            ack,
            result,
        });
    }

    fn drain_and_reinit(&mut self) -> Result<(), SessionError> {
        // Nothing submitted since the last reinit leaves outputs unattributed
        let fallback = self.last_submitted;

        let eof = match self.codec.as_mut() {
            Some(codec) => codec.send_eof(),
            None => {
                return Err(SessionError::CodecUnusable(
                    "codec handle was released after a fatal error".into(),
                ))
            }
        };
        match eof {
            Ok(()) => self.poll_outputs(fallback),
            Err(e) if e.is_fatal() => {
                // Not tied to any single item
                self.fail(None, e.clone());
                return Err(e.into());
            }
            Err(e) => warn!("worker {}: end of stream failed: {}", self.id, e),
        }

        if self.codec.is_none() {
            return Err(SessionError::CodecUnusable(
                "codec handle failed while draining".into(),
            ));
        }

        // The old handle is destroyed before its replacement is created
        self.codec = None;
        self.timing.clear();
        self.last_timing = None;
        self.last_submitted = None;

        match self.factory.init(&self.config) {
            Ok(codec) => {
                self.codec = Some(codec);
                debug!("worker {}: codec drained and reinitialized", self.id);
                Ok(())
            }
            Err(e) => {
                error!("worker {}: reinitializing codec failed: {}", self.id, e);
                self.codec_valid.store(false, Ordering::Release);
                Err(SessionError::CodecUnusable(e.to_string()))
            }
        }
    }

    fn poll_outputs(&mut self, fallback: Option<u64>) {
        loop {
            let polled = match self.codec.as_mut() {
                Some(codec) => codec.poll_output(),
                None => return,
            };
            match polled {
                Ok(Some(output)) => self.deliver(output, fallback),
                Ok(None) => return,
                Err(e) => {
                    self.fail(fallback, e);
                    return;
                }
            }
        }
    }

    fn deliver(&mut self, output: CodecOutput, fallback: Option<u64>) {
        let sequence_id = match output
            .pts
            .and_then(|pts| u64::try_from(pts).ok())
            .or(fallback)
        {
            Some(id) => id,
            None => {
                warn!(
                    "worker {}: dropping output with no sequence to attribute it to",
                    self.id
                );
                return;
            }
        };

        let (timestamp_us, duration_us) = match self.timing.remove(&sequence_id) {
            Some(timing) => {
                self.last_timing = Some((sequence_id, timing));
                timing
            }
            None => match self.last_timing {
                Some((id, timing)) if id == sequence_id => timing,
                _ => {
                    debug!(
                        "worker {}: no timing recorded for sequence {}",
                        self.id, sequence_id
                    );
                    (0, None)
                }
            },
        };

        let (description, coded_size) = match self.codec.as_ref() {
            Some(codec) if output.key_frame => (codec.description(), codec.coded_size()),
            _ => (None, None),
        };

        self.post(Delivery::Output(RawOutput {
            sequence_id,
            data: output.data,
            timestamp_us,
            duration_us,
            key_frame: output.key_frame,
            description,
            coded_size,
        }));
    }

    fn fail(&mut self, sequence_id: Option<u64>, err: CodecError) {
        match sequence_id {
            Some(id) => warn!("worker {}: item {} failed: {}", self.id, id, err),
            None => warn!("worker {}: codec failed: {}", self.id, err),
        }
        if err.is_fatal() {
            // Invalidate before the error is visible to the owner
            error!("worker {}: codec handle unusable, releasing it", self.id);
            self.codec_valid.store(false, Ordering::Release);
            self.codec = None;
            self.timing.clear();
            self.last_timing = None;
        }

        let kind = ErrorKind::of(&err);
        let event = match sequence_id {
            Some(id) => ErrorEvent::new(id, kind, err.to_string()),
            None => ErrorEvent::untagged(kind, err.to_string()),
        };
        self.post(Delivery::Error(event));
    }

    fn post(&mut self, delivery: Delivery) {
        if self.bridge.post(delivery) == PostOutcome::TargetGone && !self.owner_gone {
            self.owner_gone = true;
            warn!("worker {}: owner context is gone, dropping deliveries", self.id);
        }
    }

    /// Drain the codec without emitting anything, then release it
    fn teardown(&mut self) {
        if let Some(mut codec) = self.codec.take() {
            let mut dropped = 0usize;
            if codec.send_eof().is_ok() {
                while let Ok(Some(_)) = codec.poll_output() {
                    dropped += 1;
                }
            }
            debug!(
                "worker {}: released codec, {} buffered outputs dropped",
                self.id, dropped
            );
        }
        debug!("worker {} exiting", self.id);
    }
}

//! Public codec session state machine

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use codecwarp_codec::CodecFactory;
use codecwarp_core::{Frame, ResourceKind, Role, SessionConfig, SessionError, Tracked};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backpressure::QueueAccounting;
use crate::bridge::{self, SessionHandlers};
use crate::worker::{FlushSentinel, Task, WorkItem, WorkerThread};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`CodecSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconfigured,
    Configured,
    /// Terminal
    Closed,
}

/// Worker, dispatcher and flags belonging to one configuration
struct Active {
    config: SessionConfig,
    worker: WorkerThread,
    dispatcher: JoinHandle<()>,
    codec_valid: Arc<AtomicBool>,
}

struct SessionInner {
    state: SessionState,
    active: Option<Active>,
    next_sequence: u64,
    /// Join signals of stopped workers
    teardowns: Vec<oneshot::Receiver<()>>,
    /// Dispatchers of stopped configurations
    dispatchers: Vec<JoinHandle<()>>,
}

/// A codec session driven from an async owner context.
///
/// Inputs are queued to a dedicated worker thread that drives the codec
/// handle; outputs and per-item errors come back through the handlers given
/// to [`CodecSession::configure`], invoked on the owner's tokio runtime.
/// No method blocks the calling thread.
pub struct CodecSession<F: CodecFactory> {
    id: u64,
    factory: Arc<F>,
    inner: Mutex<SessionInner>,
    accounting: Arc<QueueAccounting>,
    pending: Arc<AtomicUsize>,
    _tracked: Tracked,
}

impl<F: CodecFactory> CodecSession<F> {
    pub fn new(factory: F) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            factory: Arc::new(factory),
            inner: Mutex::new(SessionInner {
                state: SessionState::Unconfigured,
                active: None,
                next_sequence: 0,
                teardowns: Vec::new(),
                dispatchers: Vec::new(),
            }),
            accounting: Arc::new(QueueAccounting::new(Default::default())),
            pending: Arc::new(AtomicUsize::new(0)),
            _tracked: Tracked::new(ResourceKind::Session),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process-unique id used in log messages
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Start the worker, which initializes the codec as its first step.
    ///
    /// Returns without waiting for the codec. An initialization failure is
    /// reported through the error handler as an untagged
    /// [`ErrorKind::CodecUnusable`](codecwarp_core::ErrorKind) event, and
    /// later operations fail until the session is reset.
    ///
    /// Must be called from within a tokio runtime; handlers run on it.
    pub fn configure(
        &self,
        config: SessionConfig,
        handlers: SessionHandlers,
    ) -> Result<(), SessionError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Closed => return Err(SessionError::invalid_state("session is closed")),
            SessionState::Configured => {
                return Err(SessionError::invalid_state(
                    "session is already configured; reset or close it first",
                ))
            }
            SessionState::Unconfigured => {}
        }

        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| SessionError::invalid_state("configure must run inside a tokio runtime"))?;

        prune_finished(&mut inner);
        self.accounting.set_limits(config.limits);

        // Cleared by the worker if initialization fails
        let codec_valid = Arc::new(AtomicBool::new(true));
        let (sender, dispatcher) = bridge::channel(
            handlers,
            config.clone(),
            inner.next_sequence,
            Arc::clone(&self.accounting),
            Arc::clone(&self.pending),
        );
        let worker = WorkerThread::spawn(
            self.id,
            Arc::clone(&self.factory),
            config.clone(),
            sender,
            Arc::clone(&codec_valid),
        )?;
        let dispatcher = runtime.spawn(dispatcher.run());

        info!(
            "session {}: configured {} {} ({}x{}, limits {}/{})",
            self.id,
            config.codec,
            config.role,
            config.width,
            config.height,
            config.limits.soft,
            config.limits.hard
        );

        inner.active = Some(Active {
            config,
            worker,
            dispatcher,
            codec_valid,
        });
        inner.state = SessionState::Configured;
        Ok(())
    }

    /// Queue a raw frame on an encoder session. Returns its sequence id.
    pub fn encode(&self, frame: Frame) -> Result<u64, SessionError> {
        self.submit(Role::Encoder, frame)
    }

    /// Queue an encoded chunk on a decoder session. Returns its sequence id.
    pub fn decode(&self, chunk: Frame) -> Result<u64, SessionError> {
        self.submit(Role::Decoder, chunk)
    }

    fn submit(&self, role: Role, frame: Frame) -> Result<u64, SessionError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let active = usable(inner)?;

        if active.config.role != role {
            return Err(SessionError::invalid_state(format!(
                "cannot submit {} input to a {} session",
                role, active.config.role
            )));
        }
        if frame.is_empty() {
            return Err(SessionError::validation("input payload is empty"));
        }

        let sequence_id = inner.next_sequence;
        self.accounting.admit(sequence_id)?;

        if active
            .worker
            .push(WorkItem::Work(Task::new(sequence_id, frame)))
            .is_err()
        {
            self.accounting.resolve(sequence_id);
            return Err(SessionError::invalid_state("worker is shutting down"));
        }
        inner.next_sequence += 1;
        Ok(sequence_id)
    }

    /// Drain the codec and wait for every earlier output to be delivered.
    ///
    /// The flush is queued when this is called, not when the future is
    /// first polled. Resolves to [`SessionError::Aborted`] if a reset or
    /// close discards it first.
    pub fn flush(&self) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        let queued = self.queue_flush();
        async move {
            let done = queued?;
            done.await.unwrap_or(Err(SessionError::Aborted))
        }
    }

    fn queue_flush(&self) -> Result<oneshot::Receiver<Result<(), SessionError>>, SessionError> {
        let guard = self.lock();
        let barrier = guard.next_sequence.checked_sub(1);
        let active = usable(&guard)?;

        let (ack, done) = oneshot::channel();
        active
            .worker
            .push(WorkItem::Flush(FlushSentinel { barrier, ack }))
            .map_err(|_| SessionError::invalid_state("worker is shutting down"))?;
        debug!("session {}: flush queued, barrier {:?}", self.id, barrier);
        Ok(done)
    }

    /// Drop queued work, stop the worker and return to `Unconfigured`
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Closed {
            return;
        }
        self.stop_active(&mut inner);
        inner.state = SessionState::Unconfigured;
        info!("session {}: reset", self.id);
    }

    /// Shut the session down for good. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Closed {
            return;
        }
        self.stop_active(&mut inner);
        inner.state = SessionState::Closed;
        info!("session {}: closed", self.id);
    }

    fn stop_active(&self, inner: &mut SessionInner) {
        if let Some(active) = inner.active.take() {
            active.codec_valid.store(false, Ordering::Release);
            inner.teardowns.push(active.worker.stop());
            inner.dispatchers.push(active.dispatcher);
        }
        self.accounting.clear();
    }

    /// Wait until every worker and dispatcher stopped so far has finished.
    ///
    /// After [`CodecSession::close`] this covers everything the session
    /// ever started.
    pub async fn closed(&self) {
        let (teardowns, dispatchers) = {
            let mut inner = self.lock();
            (
                std::mem::take(&mut inner.teardowns),
                std::mem::take(&mut inner.dispatchers),
            )
        };

        for done in teardowns {
            let _ = done.await;
        }
        for dispatcher in dispatchers {
            if let Err(e) = dispatcher.await {
                warn!("session {}: dispatcher ended abnormally: {}", self.id, e);
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Configuration currently in effect
    pub fn config(&self) -> Option<SessionConfig> {
        self.lock().active.as_ref().map(|a| a.config.clone())
    }

    /// Submitted items not yet resolved
    pub fn queue_depth(&self) -> usize {
        self.accounting.depth()
    }

    /// True once the queue depth has reached the soft limit
    pub fn is_saturated(&self) -> bool {
        self.accounting.is_saturated()
    }

    /// Deliveries posted by the worker but not yet handled
    pub fn pending_deliveries(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl<F: CodecFactory> Drop for CodecSession<F> {
    fn drop(&mut self) {
        self.close();
    }
}

/// The active configuration, if the session accepts work
fn usable(inner: &SessionInner) -> Result<&Active, SessionError> {
    let active = match (inner.state, inner.active.as_ref()) {
        (SessionState::Configured, Some(active)) => active,
        (SessionState::Closed, _) => return Err(SessionError::invalid_state("session is closed")),
        _ => return Err(SessionError::invalid_state("session is not configured")),
    };
    if !active.codec_valid.load(Ordering::Acquire) {
        return Err(SessionError::invalid_state(
            "codec handle is unusable; reset the session",
        ));
    }
    Ok(active)
}

fn prune_finished(inner: &mut SessionInner) {
    inner
        .teardowns
        .retain_mut(|done| matches!(done.try_recv(), Err(oneshot::error::TryRecvError::Empty)));
    inner.dispatchers.retain(|d| !d.is_finished());
}

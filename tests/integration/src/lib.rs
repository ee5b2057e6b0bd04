//! Shared helpers for the cross-crate session tests

use std::time::Duration;

use codecwarp_codec::{MockCodecConfig, MockCodecFactory};
use codecwarp_core::{ErrorEvent, Frame, OutputEvent, SessionConfig};
use codecwarp_engine::{CodecSession, SessionEvent, SessionHandlers};
use tokio::sync::mpsc::UnboundedReceiver;

/// Upper bound for anything that is supposed to finish promptly
pub const DEADLINE: Duration = Duration::from_secs(5);

pub type MockSession = CodecSession<MockCodecFactory>;

/// Events received by a channel-backed handler pair
pub struct Events {
    rx: UnboundedReceiver<SessionEvent>,
}

impl Events {
    /// Everything delivered so far
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }

    pub fn outputs(&mut self) -> Vec<OutputEvent> {
        self.drain()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Output(o) => Some(o),
                SessionEvent::Error(_) => None,
            })
            .collect()
    }

    /// Wait for the next error event, skipping outputs
    pub async fn next_error(&mut self) -> Option<ErrorEvent> {
        let wait = async {
            while let Some(event) = self.rx.recv().await {
                if let SessionEvent::Error(e) = event {
                    return Some(e);
                }
            }
            None
        };
        tokio::time::timeout(DEADLINE, wait).await.ok().flatten()
    }
}

/// A configured encoder session over a mock codec
pub fn mock_session(mock: MockCodecConfig, config: SessionConfig) -> (MockSession, MockCodecFactory, Events) {
    let factory = MockCodecFactory::new(mock);
    let session = CodecSession::new(factory.clone());
    let events = configure(&session, config);
    (session, factory, events)
}

/// Configure `session` with channel-backed handlers
pub fn configure(session: &MockSession, config: SessionConfig) -> Events {
    let (handlers, rx) = SessionHandlers::channel();
    session
        .configure(config, handlers)
        .unwrap_or_else(|e| panic!("configure failed: {}", e));
    Events { rx }
}

pub fn encoder_config() -> SessionConfig {
    SessionConfig::encoder("mock", 320, 240)
}

/// Frame whose payload and timestamp identify it
pub fn frame(index: u64) -> Frame {
    Frame::new(format!("frame {}", index).into_bytes(), index as i64 * 1_000).with_duration(1_000)
}

//! Session behaviour across the codec, bridge and worker

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use codecwarp_codec::{CodecFactory, MockCodec, MockCodecConfig, MockCodecFactory};
use codecwarp_core::{
    CodecError, ErrorKind, Frame, QueueLimits, ScalabilityMode, SessionConfig, SessionError,
};
use codecwarp_engine::{CodecSession, SessionHandlers, SessionState};
use integration_tests::{configure, encoder_config, frame, mock_session, MockSession, DEADLINE};
use tokio::time::timeout;

#[tokio::test]
async fn test_flush_delivers_every_output_exactly_once() {
    let mock = MockCodecConfig {
        lookahead: 5,
        reorder: true,
        ..Default::default()
    };
    let (session, _factory, mut events) = mock_session(mock, encoder_config());

    let mut submitted = Vec::new();
    for i in 0..200 {
        if session.is_saturated() {
            timeout(DEADLINE, session.flush()).await.unwrap().unwrap();
        }
        submitted.push(session.encode(frame(i)).unwrap());
    }
    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();

    let outputs = events.outputs();
    assert_eq!(outputs.len(), submitted.len());
    let ids: HashSet<u64> = outputs.iter().map(|o| o.sequence_id).collect();
    assert_eq!(ids.len(), submitted.len());
    for output in &outputs {
        // Payload, timestamp and duration all belong to the same input
        assert_eq!(output.data, Bytes::from(format!("frame {}", output.sequence_id)));
        assert_eq!(output.timestamp_us, output.sequence_id as i64 * 1_000);
        assert_eq!(output.duration_us, Some(1_000));
    }
    assert_eq!(session.queue_depth(), 0);

    session.close();
    session.closed().await;
}

#[tokio::test]
async fn test_hard_limit_and_saturation() {
    // Nothing is released before a flush, so nothing resolves early
    let mock = MockCodecConfig {
        lookahead: 1_000,
        ..Default::default()
    };
    let (session, _factory, mut events) = mock_session(mock, encoder_config());

    for i in 0..64 {
        session.encode(frame(i)).unwrap();
        assert_eq!(session.is_saturated(), i + 1 >= 16);
    }
    assert_eq!(session.queue_depth(), 64);
    assert_eq!(
        session.encode(frame(64)),
        Err(SessionError::ResourceExhausted { depth: 64, limit: 64 })
    );
    assert_eq!(session.queue_depth(), 64);

    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();
    assert_eq!(session.queue_depth(), 0);
    assert!(!session.is_saturated());
    assert_eq!(events.outputs().len(), 64);

    // The rejected frame did not consume a sequence id
    assert_eq!(session.encode(frame(64)).unwrap(), 64);

    session.close();
    session.closed().await;
}

#[tokio::test]
async fn test_custom_limits() {
    let mock = MockCodecConfig {
        lookahead: 1_000,
        ..Default::default()
    };
    let config = encoder_config().with_limits(QueueLimits::new(2, 3));
    let (session, _factory, _events) = mock_session(mock, config);

    session.encode(frame(0)).unwrap();
    assert!(!session.is_saturated());
    session.encode(frame(1)).unwrap();
    assert!(session.is_saturated());
    session.encode(frame(2)).unwrap();
    assert!(matches!(
        session.encode(frame(3)),
        Err(SessionError::ResourceExhausted { depth: 3, limit: 3 })
    ));

    session.close();
    session.closed().await;
}

#[tokio::test]
async fn test_outputs_resolve_items_before_flush() {
    let (session, _factory, mut events) = mock_session(MockCodecConfig::default(), encoder_config());

    for i in 0..20 {
        session.encode(frame(i)).unwrap();
    }

    let drained = timeout(DEADLINE, async {
        while session.queue_depth() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(drained.is_ok());
    assert!(!session.is_saturated());
    assert_eq!(events.outputs().len(), 20);

    session.close();
    session.closed().await;
}

#[tokio::test]
async fn test_close_right_after_enqueue_never_hangs() {
    for i in 0..100 {
        let (session, _factory, _events) = mock_session(MockCodecConfig::default(), encoder_config());
        session.encode(frame(i)).unwrap();
        session.close();
        assert!(timeout(DEADLINE, session.closed()).await.is_ok());
    }
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (session, _factory, _events) = mock_session(MockCodecConfig::default(), encoder_config());
    session.close();
    session.close();
    session.reset();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.encode(frame(0)),
        Err(SessionError::InvalidState(_))
    ));
    assert!(matches!(
        session.flush().await,
        Err(SessionError::InvalidState(_))
    ));
    timeout(DEADLINE, session.closed()).await.unwrap();
}

#[tokio::test]
async fn test_reset_resumes_with_fresh_codec() {
    let mock = MockCodecConfig {
        lookahead: 1_000,
        ..Default::default()
    };
    let (session, factory, mut events) = mock_session(mock, encoder_config());

    for i in 0..10 {
        session.encode(frame(i)).unwrap();
    }
    session.reset();
    assert_eq!(session.state(), SessionState::Unconfigured);
    assert_eq!(session.queue_depth(), 0);

    let mut second = configure(&session, encoder_config());
    let id = session.encode(frame(10)).unwrap();
    assert_eq!(id, 10);
    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();
    // One per configuration plus the reinit after the flush
    assert_eq!(factory.stats().inits(), 3);

    let outputs = second.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].sequence_id, 10);

    // Held items of the first configuration were dropped with its codec
    session.close();
    session.closed().await;
    assert!(events.outputs().is_empty());
}

#[tokio::test]
async fn test_item_failure_keeps_session_usable() {
    let (session, _factory, mut events) = mock_session(MockCodecConfig::default(), encoder_config());

    session.encode(frame(0)).unwrap();
    let failing = session.encode(Frame::new(&b"fail: bad slice"[..], 5)).unwrap();
    session.encode(frame(2)).unwrap();

    let error = events.next_error().await.unwrap();
    assert_eq!(error.sequence_id, Some(failing));
    assert_eq!(error.kind, ErrorKind::CodecFailure);

    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();
    let ids: Vec<u64> = events.outputs().iter().map(|o| o.sequence_id).collect();
    assert!(ids.contains(&2));
    assert_eq!(session.queue_depth(), 0);

    session.close();
    session.closed().await;
}

#[tokio::test]
async fn test_unusable_codec_requires_reset() {
    let (session, factory, mut events) = mock_session(MockCodecConfig::default(), encoder_config());

    let bad = session.encode(Frame::new(&b"corrupt"[..], 0)).unwrap();
    let error = events.next_error().await.unwrap();
    assert_eq!(error.sequence_id, Some(bad));
    assert_eq!(error.kind, ErrorKind::CodecUnusable);

    assert!(matches!(
        session.encode(frame(1)),
        Err(SessionError::InvalidState(_))
    ));
    assert!(matches!(
        session.flush().await,
        Err(SessionError::InvalidState(_))
    ));

    session.reset();
    let mut events = configure(&session, encoder_config());
    session.encode(frame(2)).unwrap();
    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();
    assert_eq!(events.outputs().len(), 1);
    assert_eq!(factory.stats().inits(), 3);

    session.close();
    session.closed().await;
}

#[tokio::test]
async fn test_failed_reinit_after_flush() {
    let mock = MockCodecConfig {
        max_inits: Some(1),
        ..Default::default()
    };
    let (session, _factory, mut events) = mock_session(mock, encoder_config());

    session.encode(frame(0)).unwrap();
    let result = timeout(DEADLINE, session.flush()).await.unwrap();
    assert!(matches!(result, Err(SessionError::CodecUnusable(_))));
    assert_eq!(events.outputs().len(), 1);
    assert!(matches!(
        session.encode(frame(1)),
        Err(SessionError::InvalidState(_))
    ));

    session.close();
    session.closed().await;
}

#[tokio::test]
async fn test_boundary_metadata_and_temporal_layers() {
    let mock = MockCodecConfig {
        keyframe_interval: 4,
        description: Some(Bytes::from_static(b"avcC")),
        ..Default::default()
    };
    let config = encoder_config().with_scalability(ScalabilityMode::L1T3);
    let (session, _factory, mut events) = mock_session(mock, config);

    for i in 0..8 {
        session.encode(frame(i)).unwrap();
    }
    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();

    let outputs = events.outputs();
    let layers: Vec<u8> = outputs.iter().filter_map(|o| o.temporal_layer).collect();
    assert_eq!(layers, vec![0, 2, 1, 2, 0, 2, 1, 2]);

    for output in &outputs {
        assert_eq!(output.is_boundary, output.sequence_id % 4 == 0);
        match &output.metadata {
            Some(metadata) => {
                assert!(output.is_boundary);
                assert_eq!(metadata.codec, "mock");
                assert_eq!((metadata.coded_width, metadata.coded_height), (320, 240));
                assert_eq!(metadata.description, Some(Bytes::from_static(b"avcC")));
            }
            None => assert!(!output.is_boundary),
        }
    }

    session.close();
    session.closed().await;
}

#[tokio::test]
async fn test_temporal_layers_restart_after_reset() {
    let config = encoder_config().with_scalability(ScalabilityMode::L1T2);
    let (session, _factory, _events) = mock_session(MockCodecConfig::default(), config.clone());

    for i in 0..3 {
        session.encode(frame(i)).unwrap();
    }
    session.reset();

    let mut events = configure(&session, config);
    let first = session.encode(frame(3)).unwrap();
    assert_eq!(first, 3);
    session.encode(frame(4)).unwrap();
    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();

    let layers: Vec<(u64, Option<u8>)> = events
        .outputs()
        .iter()
        .map(|o| (o.sequence_id, o.temporal_layer))
        .collect();
    assert_eq!(layers, vec![(3, Some(0)), (4, Some(1))]);

    session.close();
    session.closed().await;
}

/// Mock factory whose initialization takes a while
struct SlowInit {
    inner: MockCodecFactory,
    delay: Duration,
}

impl CodecFactory for SlowInit {
    type Codec = MockCodec;

    fn init(&self, config: &SessionConfig) -> Result<MockCodec, CodecError> {
        std::thread::sleep(self.delay);
        self.inner.init(config)
    }
}

#[tokio::test]
async fn test_configure_does_not_wait_for_codec_init() {
    let mock = MockCodecFactory::default();
    let session = CodecSession::new(SlowInit {
        inner: mock.clone(),
        delay: Duration::from_millis(300),
    });
    let (handlers, mut events) = SessionHandlers::channel();

    let started = Instant::now();
    session.configure(encoder_config(), handlers).unwrap();
    session.encode(frame(0)).unwrap();
    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(session.state(), SessionState::Configured);

    // Work queued during initialization runs once the codec is ready
    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();
    let mut delivered = 0;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.sequence_id(), Some(0));
        delivered += 1;
    }
    assert_eq!(delivered, 1);
    assert_eq!(mock.stats().inits(), 2);

    session.close();
    timeout(DEADLINE, session.closed()).await.unwrap();
}

#[tokio::test]
async fn test_init_failure_is_reported_asynchronously() {
    let session = CodecSession::new(MockCodecFactory::default());
    let mut events = configure(&session, SessionConfig::encoder(MockCodec::UNKNOWN_CODEC, 320, 240));

    let error = events.next_error().await.unwrap();
    assert_eq!(error.sequence_id, None);
    assert_eq!(error.kind, ErrorKind::CodecUnusable);
    assert!(matches!(
        session.encode(frame(0)),
        Err(SessionError::InvalidState(_))
    ));

    session.close();
    session.closed().await;
}

#[tokio::test]
async fn test_decoder_metadata_reports_coded_size() {
    let mock = MockCodecConfig {
        coded_size: Some((640, 360)),
        ..Default::default()
    };
    let factory = MockCodecFactory::new(mock);
    let session = CodecSession::new(factory);
    let mut events = configure(&session, SessionConfig::decoder("mock"));
    session.decode(frame(0).key()).unwrap();
    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();

    let outputs = events.outputs();
    let metadata = outputs[0].metadata.as_ref().unwrap();
    assert_eq!((metadata.coded_width, metadata.coded_height), (640, 360));

    session.close();
    session.closed().await;
}

#[tokio::test]
async fn test_decoder_session() {
    let factory = MockCodecFactory::default();
    let session = CodecSession::new(factory);
    let config = SessionConfig::decoder("mock");
    let mut events = configure(&session, config);

    assert!(matches!(
        session.encode(frame(0)),
        Err(SessionError::InvalidState(_))
    ));
    session.decode(frame(0).key()).unwrap();
    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();

    let outputs = events.outputs();
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].is_boundary);
    // Nothing reported the coded size, and the config does not carry one
    let metadata = outputs[0].metadata.as_ref().unwrap();
    assert_eq!((metadata.coded_width, metadata.coded_height), (0, 0));

    session.close();
    session.closed().await;
}

#[tokio::test]
async fn test_close_from_output_handler() {
    let session: Arc<MockSession> = Arc::new(CodecSession::new(MockCodecFactory::default()));
    let slot: Arc<Mutex<Option<Weak<MockSession>>>> = Arc::new(Mutex::new(None));

    let handler_slot = Arc::clone(&slot);
    let handlers = SessionHandlers::new(
        move |_output| {
            let session = handler_slot.lock().unwrap().as_ref().and_then(Weak::upgrade);
            if let Some(session) = session {
                session.close();
            }
        },
        |_error| {},
    );
    *slot.lock().unwrap() = Some(Arc::downgrade(&session));
    session.configure(encoder_config(), handlers).unwrap();

    for i in 0..10 {
        session.encode(frame(i)).unwrap();
    }

    let closed = timeout(DEADLINE, async {
        while session.state() != SessionState::Closed {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        session.closed().await;
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn test_flush_without_input() {
    let (session, factory, mut events) = mock_session(MockCodecConfig::default(), encoder_config());
    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();
    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();
    assert!(events.drain().is_empty());
    assert_eq!(factory.stats().inits(), 3);

    session.close();
    session.closed().await;
}

#[test]
fn test_owner_runtime_shutdown_is_tolerated() {
    let mock = MockCodecConfig {
        submit_delay: Duration::from_millis(2),
        ..Default::default()
    };
    let factory = MockCodecFactory::new(mock);
    let session = CodecSession::new(factory.clone());

    let owner = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    {
        let _guard = owner.enter();
        let (handlers, _rx) = SessionHandlers::channel();
        session.configure(encoder_config(), handlers).unwrap();
        for i in 0..20 {
            session.encode(frame(i)).unwrap();
        }
    }
    // The dispatcher goes away with the runtime while the worker is busy
    drop(owner);

    let teardown = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    teardown.block_on(async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.close();
        assert!(timeout(DEADLINE, session.closed()).await.is_ok());
    });

    assert_eq!(session.pending_deliveries(), 0);
    assert!(factory.stats().submitted() >= 1);
}

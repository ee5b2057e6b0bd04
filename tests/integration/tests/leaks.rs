//! Live-object accounting over a full session lifecycle.
//!
//! Registry counters are process-wide, so this file holds a single test.

use bytes::Bytes;
use codecwarp_codec::MockCodecConfig;
use codecwarp_core::registry::{self, RegistrySnapshot};
use codecwarp_core::{Frame, ResourceKind, ScalabilityMode};
use integration_tests::{configure, encoder_config, frame, mock_session, DEADLINE};
use tokio::time::timeout;

fn assert_no_live_objects(snapshot: RegistrySnapshot) {
    for (kind, count) in snapshot.iter() {
        assert_eq!(count, 0, "{:?} still alive", kind);
    }
}

#[tokio::test]
async fn test_round_trip_releases_everything() {
    assert_no_live_objects(registry::snapshot());

    let mock = MockCodecConfig {
        lookahead: 2,
        reorder: true,
        keyframe_interval: 10,
        description: Some(Bytes::from_static(b"avcC")),
        ..Default::default()
    };
    let config = encoder_config().with_scalability(ScalabilityMode::L1T2);
    let (session, _factory, mut events) = mock_session(mock, config.clone());

    let live = registry::snapshot();
    assert_eq!(live.count(ResourceKind::Session), 1);
    assert_eq!(live.count(ResourceKind::Worker), 1);
    assert_eq!(live.count(ResourceKind::Dispatcher), 1);

    for i in 0..30 {
        session.encode(frame(i)).unwrap();
    }
    session.encode(Frame::new(&b"fail"[..], 0)).unwrap();
    timeout(DEADLINE, session.flush()).await.unwrap().unwrap();
    assert_eq!(events.outputs().len(), 30);
    // The drained handle was replaced, never doubled up
    assert_eq!(registry::snapshot().count(ResourceKind::CodecHandle), 1);

    // Abandon queued work with a reset, then run a second configuration
    for i in 31..40 {
        session.encode(frame(i)).unwrap();
    }
    session.reset();
    let _second = configure(&session, config);
    for i in 40..50 {
        session.encode(frame(i)).unwrap();
    }
    session.encode(Frame::new(&b"corrupt"[..], 0)).unwrap();

    session.close();
    timeout(DEADLINE, session.closed()).await.unwrap();
    assert_eq!(session.pending_deliveries(), 0);
    drop(session);

    assert_no_live_objects(registry::snapshot());
}

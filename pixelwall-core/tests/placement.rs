//! End-to-end behavior of the placement engine.
//!
//! Covers validation without side effects, cooldown windows, resync queries,
//! fanout handoff, and the two concurrency guarantees: one success per
//! identity per window, and whole-cell writes at a contended position.

use pixelwall_core::{
    Channel, ChannelSet, Clock, EngineConfig, ErrorKind, Fanout, FanoutError, FeedEvent, ManualClock,
    PlaceCellRequest, PlacementEngine, Position, Scalar, Timestamp,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const COOLDOWN: Duration = Duration::from_millis(5_000);

fn engine_with_clock(start: i64) -> (Arc<PlacementEngine>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(start)));
    let engine = PlacementEngine::new(EngineConfig::default().with_cooldown(COOLDOWN))
        .with_clock(clock.clone());
    (Arc::new(engine), clock)
}

#[derive(Default)]
struct RecordingFanout {
    events: Mutex<Vec<(ChannelSet, FeedEvent)>>,
}

impl Fanout for RecordingFanout {
    fn publish(&self, channels: &ChannelSet, event: &FeedEvent) -> Result<usize, FanoutError> {
        self.events.lock().unwrap().push((channels.clone(), event.clone()));
        Ok(1)
    }
}

struct BrokenFanout;

impl Fanout for BrokenFanout {
    fn publish(&self, _: &ChannelSet, _: &FeedEvent) -> Result<usize, FanoutError> {
        Err(FanoutError::Delivery("transport down".into()))
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_out_of_range_input_is_invalid_and_mutates_nothing() {
    let (engine, _) = engine_with_clock(0);
    let id = engine.issue_identity().await.unwrap();

    let bad = [
        (-1, 0, 0),
        (0, -1, 0),
        (1024, 0, 0),
        (0, 1024, 0),
        (i64::MAX, 0, 0),
        (0, 0, -1),
        (0, 0, 16),
        (5, 5, 255),
    ];
    for (x, y, color) in bad {
        let err = engine.place(id, x, y, color).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "({x}, {y}, {color})");
    }

    assert!(engine.get_cells(None).unwrap().is_empty());
    assert_eq!(engine.cooldown_deadline(&id.to_string()).await.unwrap(), None);
    assert_eq!(engine.latest_sequence(), 0);
}

#[tokio::test]
async fn test_non_integer_operands_are_invalid() {
    let (engine, _) = engine_with_clock(0);
    let id = engine.issue_identity().await.unwrap();

    let request: PlaceCellRequest = serde_json::from_value(serde_json::json!({
        "identity": id.to_string(),
        "x": "5",
        "y": 5,
        "color": 2,
    }))
    .unwrap();
    assert_eq!(request.x, Scalar::NotInteger("string \"5\"".into()));
    let err = engine.place_cell(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let request: PlaceCellRequest = serde_json::from_value(serde_json::json!({
        "identity": id.to_string(),
        "x": 5,
        "y": 5,
        "color": 2.5,
    }))
    .unwrap();
    assert_eq!(engine.place_cell(request).await.unwrap_err().kind(), ErrorKind::InvalidArgument);

    let missing: PlaceCellRequest =
        serde_json::from_value(serde_json::json!({ "identity": id.to_string() })).unwrap();
    assert_eq!(engine.place_cell(missing).await.unwrap_err().kind(), ErrorKind::InvalidArgument);

    assert!(engine.get_cells(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_identity_is_not_found() {
    let (engine, _) = engine_with_clock(0);
    let stranger = pixelwall_core::IdentityId::generate();

    let err = engine.place(stranger, 1, 1, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = engine.cooldown_deadline(&stranger.to_string()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ─── Cooldown ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_placement_succeeds() {
    let (engine, clock) = engine_with_clock(1_700_000_000_000);
    let id = engine.issue_identity().await.unwrap();
    let now = clock.now();

    let outcome = engine.place(id, 5, 5, 2).await.unwrap();
    assert_eq!(outcome.placed_at, Some(now));
    assert_eq!(outcome.next_allowed_at, now.saturating_add(COOLDOWN));

    let cells = engine.get_cells(None).unwrap();
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].position, Position::new(5, 5).unwrap());
    assert_eq!(cells[0].color.value(), 2);
}

#[tokio::test]
async fn test_repeat_within_cooldown_returns_same_deadline() {
    let (engine, clock) = engine_with_clock(0);
    let id = engine.issue_identity().await.unwrap();

    let first = engine.place(id, 5, 5, 2).await.unwrap();
    let before = engine.get_cells(None).unwrap();

    for (x, y) in [(5, 5), (6, 6), (1023, 0)] {
        clock.advance(Duration::from_millis(100));
        let again = engine.place(id, x, y, 9).await.unwrap();
        assert!(!again.is_placed());
        assert_eq!(again.next_allowed_at, first.next_allowed_at);
    }

    assert_eq!(engine.get_cells(None).unwrap(), before);
    assert_eq!(
        engine.cooldown_deadline(&id.to_string()).await.unwrap(),
        Some(first.next_allowed_at)
    );
}

#[tokio::test]
async fn test_after_cooldown_deadline_strictly_increases() {
    let (engine, clock) = engine_with_clock(0);
    let id = engine.issue_identity().await.unwrap();

    let first = engine.place(id, 5, 5, 2).await.unwrap();
    clock.advance(COOLDOWN);
    let second = engine.place(id, 5, 5, 3).await.unwrap();

    assert!(second.is_placed());
    assert!(second.next_allowed_at > first.next_allowed_at);
    assert_eq!(engine.get_cells(None).unwrap()[0].color.value(), 3);
}

// ─── Resynchronization ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_cells_since_window() {
    let (engine, clock) = engine_with_clock(10_000);
    let a = engine.issue_identity().await.unwrap();
    let b = engine.issue_identity().await.unwrap();
    let start = clock.now();

    engine.place(a, 1, 1, 1).await.unwrap();
    engine.place(b, 2, 2, 2).await.unwrap();
    clock.advance(COOLDOWN);
    engine.place(a, 1, 1, 4).await.unwrap();
    clock.advance(COOLDOWN);
    engine.place(a, 1, 1, 5).await.unwrap();

    let after_all = clock.now().saturating_add(Duration::from_millis(1));
    assert!(engine
        .get_cells(Some(&after_all.as_millis().to_string()))
        .unwrap()
        .is_empty());

    let all = engine.get_cells(Some(&start.to_rfc3339())).unwrap();
    assert_eq!(all.len(), 2);
    let positions: HashSet<Position> = all.iter().map(|c| c.position).collect();
    assert_eq!(positions.len(), 2);
    let overwritten = all
        .iter()
        .find(|c| c.position == Position::new(1, 1).unwrap())
        .unwrap();
    assert_eq!(overwritten.color.value(), 5);
}

#[tokio::test]
async fn test_get_cells_rejects_unparseable_since() {
    let (engine, _) = engine_with_clock(0);
    let err = engine.get_cells(Some("last tuesday")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

// ─── Fanout ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_events_published_on_global_channel_in_commit_order() {
    let fanout = Arc::new(RecordingFanout::default());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let engine = PlacementEngine::new(EngineConfig::default())
        .with_clock(clock.clone())
        .with_fanout(fanout.clone());

    let id = engine.issue_identity().await.unwrap();
    engine.place(id, 3, 4, 5).await.unwrap();
    engine.place(id, 3, 4, 6).await.unwrap(); // rate limited, no event

    let events = fanout.events.lock().unwrap();
    assert_eq!(events.len(), 2);
    for (channels, _) in events.iter() {
        assert!(channels.contains(&Channel::global()));
        assert_eq!(channels.len(), 1);
    }
    assert!(matches!(events[0].1, FeedEvent::IdentityCreated(r) if r.id == id));
    match events[1].1 {
        FeedEvent::CellPlaced(record) => {
            assert_eq!(record.sequence, 1);
            assert_eq!(record.color.value(), 5);
        }
        ref other => panic!("expected CellPlaced, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fanout_failure_does_not_roll_back() {
    let engine = PlacementEngine::new(EngineConfig::default()).with_fanout(Arc::new(BrokenFanout));
    let id = engine.issue_identity().await.unwrap();
    let outcome = engine.place(id, 0, 0, 0).await.unwrap();
    assert!(outcome.is_placed());
    assert_eq!(engine.get_cells(None).unwrap().len(), 1);
}

// ─── Concurrency ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_identity_single_success() {
    let (engine, _) = engine_with_clock(0);
    let id = engine.issue_identity().await.unwrap();

    let n = 64;
    let mut handles = Vec::with_capacity(n);
    for i in 0..n {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.place(id, (i % 1024) as i64, 0, (i % 16) as i64).await
        }));
    }

    let mut successes = 0;
    let mut deadlines = HashSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.is_placed() {
            successes += 1;
        }
        deadlines.insert(outcome.next_allowed_at);
    }

    assert_eq!(successes, 1);
    assert_eq!(deadlines.len(), 1);
    assert_eq!(engine.get_cells(None).unwrap().len(), 1);
    assert_eq!(engine.latest_sequence(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_position_single_whole_value() {
    let (engine, clock) = engine_with_clock(0);
    let m = 16;
    let mut ids = Vec::with_capacity(m);
    for _ in 0..m {
        ids.push(engine.issue_identity().await.unwrap());
    }

    let mut handles = Vec::with_capacity(m);
    for (i, id) in ids.into_iter().enumerate() {
        let engine = engine.clone();
        let clock = clock.clone();
        handles.push(tokio::spawn(async move {
            clock.advance(Duration::from_millis(1));
            engine.place(id, 100, 200, i as i64).await.unwrap()
        }));
    }

    let mut inputs = HashSet::new();
    for (i, handle) in handles.into_iter().enumerate() {
        let outcome = handle.await.unwrap();
        assert!(outcome.is_placed());
        inputs.insert((i as u8, outcome.placed_at.unwrap()));
    }

    let cells = engine.get_cells(None).unwrap();
    assert_eq!(cells.len(), 1);
    let stored = (cells[0].color.value(), cells[0].placed_at);
    assert!(inputs.contains(&stored), "stored {stored:?} is not one of the inputs");

    // The feed's last record for the position is what the grid holds.
    let changes = engine.changes_since(0).unwrap();
    assert_eq!(changes.len(), m);
    let last = changes.last().unwrap();
    assert_eq!((last.color.value(), last.placed_at), stored);
}

//! Frame ticks delivered through the registry.

use looperlab::test_utils::{init_test_logging, wait_until};
use looperlab::{FrameTick, FrameTiming, LooperConfig, LooperRegistry, Time};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn recorder() -> (Arc<Mutex<Vec<FrameTick>>>, impl Fn(FrameTick) + Send + Sync + 'static) {
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let out = Arc::clone(&ticks);
    (ticks, move |tick| out.lock().push(tick))
}

#[test]
fn running_loop_gets_frames_immediately() {
    init_test_logging();
    let config = LooperConfig::default()
        .with_frame_interval(Duration::from_millis(16))
        .with_frame_timing(FrameTiming::Timeline);
    let registry = LooperRegistry::new(config).expect("registry");
    let render = registry.spawn_looper("render").expect("spawn");
    let (ticks, callback) = recorder();
    let frames = registry.frame_clock(&render, callback);

    frames.request_frame_callback().expect("frame 1");
    frames.request_frame_callback().expect("frame 2");
    assert_eq!(registry.clock().now(), Time::from_millis(132));
    assert!(wait_until(Duration::from_secs(5), || ticks.lock().len() == 2));

    let ticks = ticks.lock();
    assert_eq!(ticks[0].frame, 1);
    assert_eq!(ticks[1].frame, 2);
    assert!(ticks[0].timestamp < ticks[1].timestamp);
    assert!(ticks.iter().all(|t| t.timeline.is_some()));
}

#[test]
fn paused_main_loop_defers_frames_until_time_passes() {
    init_test_logging();
    let registry = LooperRegistry::new(LooperConfig::default()).expect("registry");
    let main = registry.main_looper();
    let (ticks, callback) = recorder();
    let frames = registry.frame_clock(main, callback);

    for round in 1..=3_u64 {
        frames.request_frame_callback().expect("request");
        main.idle_for(frames.frame_interval()).expect("idle_for");
        assert_eq!(ticks.lock().len() as u64, round);
    }
    let counters: Vec<u64> = ticks.lock().iter().map(|t| t.frame).collect();
    assert_eq!(counters, vec![1, 2, 3]);
    assert!(ticks.lock().iter().all(|t| t.timeline.is_none()));

    registry.reset().expect("reset");
    assert_eq!(frames.frame_count(), 0);
    assert_eq!(registry.clock().now(), Time::from_millis(100));
}

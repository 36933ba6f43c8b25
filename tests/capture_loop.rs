use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use camera_streaming_client::capture::mock::{OpenStep, ReadStep, ScriptedSource};
use camera_streaming_client::pipeline::Passthrough;
use camera_streaming_client::{
    CaptureLoop, ConnectError, ConnectionState, Frame, FrameBuffer, ProcessingError, SourceConfig,
    StatusEvent,
};

fn config(max_retries: u32) -> SourceConfig {
    SourceConfig {
        read_timeout_ms: 20,
        max_retries,
        backoff_base_ms: 10,
        backoff_cap_ms: 40,
        ..SourceConfig::default()
    }
}

fn wait_for(capture: &CaptureLoop, state: ConnectionState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while capture.state() != state {
        assert!(Instant::now() < deadline, "stuck in {}", capture.state());
        thread::sleep(Duration::from_millis(2));
    }
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Every event the thread emitted; the channel closes when the thread exits
fn drain(events: &flume::Receiver<StatusEvent>) -> Vec<ConnectionState> {
    events.drain().map(|event| event.state).collect()
}

fn unreachable() -> OpenStep {
    OpenStep::Fail(ConnectError::Unreachable("connection refused".into()))
}

#[test]
fn recovers_after_one_failed_open() {
    let source = ScriptedSource::new().with_opens([unreachable()]);
    let (tx, rx) = flume::unbounded();
    let mut capture = CaptureLoop::start(
        source,
        Passthrough,
        config(2),
        Arc::new(FrameBuffer::new()),
        tx,
    )
    .unwrap();

    wait_for(&capture, ConnectionState::Streaming);
    capture.stop();

    use ConnectionState::*;
    assert_eq!(
        drain(&rx),
        vec![Connecting, Reconnecting, Connecting, Streaming, Disconnected]
    );
}

#[test]
fn two_failed_opens_add_one_more_retry_cycle() {
    let source = ScriptedSource::new().with_opens([unreachable(), unreachable()]);
    let (tx, rx) = flume::unbounded();
    let mut capture = CaptureLoop::start(
        source,
        Passthrough,
        config(2),
        Arc::new(FrameBuffer::new()),
        tx,
    )
    .unwrap();

    wait_for(&capture, ConnectionState::Streaming);
    capture.stop();

    use ConnectionState::*;
    assert_eq!(
        drain(&rx),
        vec![
            Connecting,
            Reconnecting,
            Connecting,
            Reconnecting,
            Connecting,
            Streaming,
            Disconnected
        ]
    );
}

#[test]
fn gives_up_when_open_keeps_failing() {
    let source = ScriptedSource::new().open_fallback(unreachable());
    let probe = source.probe();
    let (tx, rx) = flume::unbounded();
    let capture = CaptureLoop::start(
        source,
        Passthrough,
        config(1),
        Arc::new(FrameBuffer::new()),
        tx,
    )
    .unwrap();

    let states: Vec<_> = rx.iter().map(|event| event.state).collect();
    use ConnectionState::*;
    assert_eq!(states, vec![Connecting, Reconnecting, Connecting, Failed]);
    assert_eq!(probe.opens(), 2);

    let status = capture.status();
    assert_eq!(status.state, Failed);
    assert!(status.error.unwrap().contains("connection refused"));
    wait_until(|| !capture.is_running());
}

#[test]
fn persistent_read_failures_fail_exactly_once() {
    let source = ScriptedSource::new().read_fallback(ReadStep::Lose("unplugged".into()));
    let probe = source.probe();
    let (tx, rx) = flume::unbounded();
    let mut capture = CaptureLoop::start(
        source,
        Passthrough,
        config(2),
        Arc::new(FrameBuffer::new()),
        tx,
    )
    .unwrap();

    let events: Vec<_> = rx.iter().collect();
    let failed: Vec<_> = events
        .iter()
        .filter(|event| event.state == ConnectionState::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(events.last().map(|e| e.state), Some(ConnectionState::Failed));
    let error = failed[0].error.as_deref().unwrap();
    assert!(error.contains("unplugged"), "{error}");
    assert!(error.contains("3 attempts"), "{error}");

    // Every opened handle was released
    assert_eq!(probe.opens(), 3);
    assert_eq!(probe.live(), 0);

    capture.stop();
    assert_eq!(capture.state(), ConnectionState::Failed);
}

#[test]
fn lost_sessions_up_to_max_retries_still_recover() {
    let source = ScriptedSource::new()
        .with_reads([
            ReadStep::Lose("unplugged".into()),
            ReadStep::Lose("unplugged".into()),
        ])
        .read_fallback(ReadStep::Frame);
    let probe = source.probe();
    let buffer = Arc::new(FrameBuffer::new());
    let (tx, rx) = flume::unbounded();
    let mut capture = CaptureLoop::start(source, Passthrough, config(2), buffer.clone(), tx).unwrap();

    wait_until(|| buffer.latest_sequence().unwrap_or(0) >= 3);
    capture.stop();

    let states = drain(&rx);
    assert!(!states.contains(&ConnectionState::Failed), "{states:?}");
    let reconnects = states
        .iter()
        .filter(|state| **state == ConnectionState::Reconnecting)
        .count();
    assert_eq!(reconnects, 2);
    assert_eq!(probe.opens(), 3);
    assert_eq!(states[states.len() - 2], ConnectionState::Streaming);
    assert_eq!(capture.state(), ConnectionState::Disconnected);
}

#[test]
fn timeouts_within_budget_resume_streaming() {
    let source = ScriptedSource::new()
        .with_reads([
            ReadStep::Frame,
            ReadStep::Timeout,
            ReadStep::Timeout,
            ReadStep::Timeout,
        ])
        .read_fallback(ReadStep::Frame);
    let (tx, rx) = flume::unbounded();
    let buffer = Arc::new(FrameBuffer::new());
    let mut capture = CaptureLoop::start(
        source,
        Passthrough,
        SourceConfig {
            max_consecutive_timeouts: 1,
            ..config(3)
        },
        buffer.clone(),
        tx,
    )
    .unwrap();

    wait_until(|| buffer.latest_sequence().unwrap_or(0) >= 5);
    capture.stop();

    let states = drain(&rx);
    assert!(!states.contains(&ConnectionState::Failed));
    let reconnects = states
        .iter()
        .filter(|state| **state == ConnectionState::Reconnecting)
        .count();
    assert_eq!(reconnects, 3);
    assert_eq!(states[states.len() - 2], ConnectionState::Streaming);
}

#[test]
fn isolated_timeouts_do_not_reconnect() {
    let source = ScriptedSource::new()
        .with_reads([ReadStep::Timeout, ReadStep::Timeout, ReadStep::Frame])
        .read_fallback(ReadStep::Frame);
    let probe = source.probe();
    let buffer = Arc::new(FrameBuffer::new());
    let mut capture =
        CaptureLoop::start(source, Passthrough, config(0), buffer.clone(), ()).unwrap();

    wait_until(|| buffer.latest_sequence().is_some());
    capture.stop();
    assert_eq!(probe.opens(), 1);
}

#[test]
fn stop_interrupts_a_blocked_read() {
    let source = ScriptedSource::new().read_fallback(ReadStep::Timeout);
    let probe = source.probe();
    let mut capture = CaptureLoop::start(
        source,
        Passthrough,
        SourceConfig {
            read_timeout_ms: 10_000,
            ..config(0)
        },
        Arc::new(FrameBuffer::new()),
        (),
    )
    .unwrap();

    wait_for(&capture, ConnectionState::Streaming);
    wait_until(|| probe.reads() > 0);

    let started = Instant::now();
    capture.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(capture.state(), ConnectionState::Disconnected);
    assert_eq!(probe.live(), 0);
    assert_eq!(probe.closes(), 1);
}

#[test]
fn stop_interrupts_backoff() {
    let source = ScriptedSource::new().open_fallback(unreachable());
    let mut capture = CaptureLoop::start(
        source,
        Passthrough,
        SourceConfig {
            backoff_base_ms: 10_000,
            backoff_cap_ms: 10_000,
            ..config(5)
        },
        Arc::new(FrameBuffer::new()),
        (),
    )
    .unwrap();

    wait_for(&capture, ConnectionState::Reconnecting);
    let started = Instant::now();
    capture.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(capture.state(), ConnectionState::Disconnected);
}

#[test]
fn failing_stage_publishes_the_input_frame() {
    let stage = |_: &Frame| -> Result<Frame, ProcessingError> {
        Err(ProcessingError::transform("detector", "model missing"))
    };
    let source = ScriptedSource::new()
        .with_reads([ReadStep::Frame, ReadStep::Frame, ReadStep::Frame])
        .read_fallback(ReadStep::Timeout);
    let buffer = Arc::new(FrameBuffer::new());
    let (tx, rx) = flume::unbounded();
    let mut capture = CaptureLoop::start(source, stage, config(5), buffer.clone(), tx).unwrap();

    wait_until(|| buffer.latest_sequence() == Some(3));
    let latest = buffer.try_latest().unwrap();
    // Scripted frames fill every byte with their source sequence
    assert_eq!(&latest.data[..], &[3u8; 24][..]);
    assert_eq!((latest.width(), latest.height()), (4, 2));

    capture.stop();
    assert!(!drain(&rx).contains(&ConnectionState::Failed));
}

#[test]
fn stale_source_sequences_are_dropped() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stage = {
        let seen = seen.clone();
        move |frame: &Frame| -> Result<Frame, ProcessingError> {
            seen.lock().unwrap().push(frame.sequence());
            Ok(frame.clone())
        }
    };
    let source = ScriptedSource::new()
        .with_reads([
            ReadStep::FrameWithSequence(5),
            ReadStep::FrameWithSequence(3),
            ReadStep::FrameWithSequence(5),
            ReadStep::FrameWithSequence(9),
        ])
        .read_fallback(ReadStep::Timeout);
    let buffer = Arc::new(FrameBuffer::new());
    let mut capture = CaptureLoop::start(source, stage, config(0), buffer.clone(), ()).unwrap();

    wait_until(|| buffer.latest_sequence() == Some(2));
    capture.stop();

    assert_eq!(*seen.lock().unwrap(), vec![5, 9]);
    let stats = buffer.stats();
    assert_eq!((stats.written, stats.rejected), (2, 0));
}

#[test]
fn published_sequences_strictly_increase_across_reconnects() {
    let source = ScriptedSource::new()
        .with_reads(
            [ReadStep::Frame, ReadStep::Frame, ReadStep::Lose("glitch".into())]
                .into_iter()
                .cycle()
                .take(30),
        )
        .read_fallback(ReadStep::Timeout);
    let buffer = Arc::new(FrameBuffer::new());
    let mut capture = CaptureLoop::start(source, Passthrough, config(3), buffer.clone(), ()).unwrap();

    let mut observed = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while buffer.latest_sequence() != Some(20) {
        assert!(Instant::now() < deadline, "only reached {:?}", buffer.latest_sequence());
        if let Some(frame) = buffer.try_latest() {
            if observed.last() != Some(&frame.sequence()) {
                observed.push(frame.sequence());
            }
        }
    }
    capture.stop();

    assert!(observed.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(buffer.stats().written, 20);
    assert_eq!(buffer.stats().rejected, 0);
}

//! Capture thread: source → stage → buffer, with the reconnect state machine

use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use arc_swap::ArcSwap;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::Backoff;
use super::buffer::FrameBuffer;
use super::processing::ProcessingStage;
use super::state::{ConnectionState, StatusEvent, StatusObserver};
use crate::capture::{CancelToken, Canceller, Frame, FrameSource};
use crate::error::{ConnectError, PipelineError, ReadError};
use crate::SourceConfig;

/// Handle to a running capture thread.
///
/// All blocking I/O happens on the thread. Callers observe it through the
/// status snapshot, the observer passed to [`CaptureLoop::start`], and the
/// shared [`FrameBuffer`]. Dropping the loop stops it.
pub struct CaptureLoop {
    canceller: Canceller,
    thread: Option<JoinHandle<()>>,
    status: Arc<ArcSwap<StatusEvent>>,
    buffer: Arc<FrameBuffer>,
}

impl CaptureLoop {
    /// Validate `config` and spawn the capture thread
    pub fn start<S, P, O>(
        source: S,
        stage: P,
        config: SourceConfig,
        buffer: Arc<FrameBuffer>,
        observer: O,
    ) -> Result<Self, PipelineError>
    where
        S: FrameSource + 'static,
        P: ProcessingStage + 'static,
        O: StatusObserver,
    {
        config.validate().map_err(PipelineError::InvalidConfig)?;

        let canceller = Canceller::new();
        let status = Arc::new(ArcSwap::from_pointee(StatusEvent::new(
            ConnectionState::Disconnected,
        )));

        let worker = Worker {
            backoff: Backoff::from_config(&config),
            next_sequence: buffer.latest_sequence().unwrap_or(0),
            source,
            stage,
            config,
            buffer: buffer.clone(),
            observer,
            status: status.clone(),
            cancel: canceller.token(),
            failures: 0,
            stage_failing: false,
        };

        let thread = thread::Builder::new()
            .name("camstream-capture".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            canceller,
            thread: Some(thread),
            status,
            buffer,
        })
    }

    /// Latest status snapshot
    pub fn status(&self) -> StatusEvent {
        (**self.status.load()).clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.load().state
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    /// False once stopped or failed
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map_or(false, |thread| !thread.is_finished())
    }

    /// Cancel any in-flight wait, release the source and join the thread. Idempotent.
    pub fn stop(&mut self) {
        self.canceller.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<S, P, O> {
    source: S,
    stage: P,
    config: SourceConfig,
    buffer: Arc<FrameBuffer>,
    observer: O,
    status: Arc<ArcSwap<StatusEvent>>,
    cancel: CancelToken,
    backoff: Backoff,
    /// Failed opens and sessions since the last frame was read
    failures: u32,
    /// Pipeline-wide sequence of the last published frame
    next_sequence: u64,
    stage_failing: bool,
}

impl<S, P, O> Worker<S, P, O>
where
    S: FrameSource,
    P: ProcessingStage,
    O: StatusObserver,
{
    #[instrument(name = "capture", skip_all, fields(source = %self.source.describe()))]
    fn run(mut self) {
        match self.drive() {
            Ok(()) => {
                info!("Capture stopped");
                self.report(ConnectionState::Disconnected, None);
            }
            Err(err) => {
                error!("Capture failed: {}", err);
                self.report(ConnectionState::Failed, Some(err.to_string()));
            }
        }
    }

    /// Returns Ok when cancelled, Err when the loop must give up
    fn drive(&mut self) -> Result<(), PipelineError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            self.report(ConnectionState::Connecting, None);
            let mut handle = match self.source.open(&self.config, &self.cancel) {
                Ok(handle) => handle,
                Err(ConnectError::Cancelled) => return Ok(()),
                Err(ConnectError::InvalidConfig(reason)) => {
                    return Err(PipelineError::InvalidConfig(reason));
                }
                Err(err) => match self.retry(err.to_string())? {
                    ControlFlow::Continue(()) => continue,
                    ControlFlow::Break(()) => return Ok(()),
                },
            };

            info!("Connected to {}", self.source.describe());
            self.report(ConnectionState::Streaming, None);
            let ended = self.stream(&mut handle);
            self.source.close(handle);

            match ended {
                ControlFlow::Break(()) => return Ok(()),
                ControlFlow::Continue(err) => {
                    if let ControlFlow::Break(()) = self.retry(err.to_string())? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Count a failure and wait out the backoff. Break means cancelled while waiting.
    fn retry(&mut self, error: String) -> Result<ControlFlow<()>, PipelineError> {
        self.failures += 1;
        if self.failures > self.config.max_retries {
            return Err(PipelineError::RetriesExhausted {
                attempts: self.failures,
                last_error: error,
            });
        }

        let delay = self.backoff.delay(self.failures - 1);
        warn!(
            "Connection attempt {} failed ({}), retrying in {:?}",
            self.failures, error, delay
        );
        self.report(ConnectionState::Reconnecting, Some(error));

        if self.cancel.wait_timeout(delay) {
            return Ok(ControlFlow::Break(()));
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Read until cancelled (Break) or the session is lost (Continue with the cause)
    fn stream(&mut self, handle: &mut S::Handle) -> ControlFlow<(), ReadError> {
        let mut timeouts = 0u32;
        let mut last_source_sequence: Option<u64> = None;

        loop {
            if self.cancel.is_cancelled() {
                return ControlFlow::Break(());
            }

            match self.source.read_frame(handle, &self.cancel) {
                Ok(frame) => {
                    timeouts = 0;
                    if last_source_sequence.is_some_and(|last| frame.sequence() <= last) {
                        debug!(
                            "Dropping out-of-order frame {} (last {:?})",
                            frame.sequence(),
                            last_source_sequence
                        );
                        metrics::counter!("frames_out_of_order_total").increment(1);
                        continue;
                    }
                    last_source_sequence = Some(frame.sequence());
                    self.failures = 0;
                    self.publish(frame);
                }
                Err(ReadError::Cancelled) => return ControlFlow::Break(()),
                Err(ReadError::Timeout(waited)) => {
                    timeouts += 1;
                    if timeouts >= self.config.max_consecutive_timeouts {
                        return ControlFlow::Continue(ReadError::Timeout(waited));
                    }
                    debug!(
                        "No frame within {:?} ({}/{})",
                        waited, timeouts, self.config.max_consecutive_timeouts
                    );
                }
                Err(err) => return ControlFlow::Continue(err),
            }
        }
    }

    fn publish(&mut self, frame: Frame) {
        let started = Instant::now();
        let output = match self.stage.process(&frame) {
            Ok(processed) => {
                if self.stage_failing {
                    info!("Stage '{}' recovered", self.stage.name());
                    self.stage_failing = false;
                }
                processed
            }
            Err(err) => {
                metrics::counter!("processing_failures_total").increment(1);
                if !self.stage_failing {
                    warn!("{}; publishing unprocessed frames", err);
                    self.stage_failing = true;
                }
                frame
            }
        };
        metrics::histogram!("processing_time_us").record(started.elapsed().as_micros() as f64);

        self.next_sequence += 1;
        if self.buffer.publish(output.with_sequence(self.next_sequence)) {
            metrics::counter!("frames_published_total").increment(1);
        }
    }

    fn report(&mut self, state: ConnectionState, error: Option<String>) {
        let event = StatusEvent {
            state,
            error,
            attempt: self.failures,
        };
        debug!("State -> {}", event);
        metrics::gauge!("connection_state").set(state.as_gauge());
        self.status.store(Arc::new(event.clone()));
        self.observer.on_status(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::{OpenStep, ReadStep, ScriptedSource};
    use crate::pipeline::processing::Passthrough;
    use std::time::Duration;

    fn quick_config() -> SourceConfig {
        SourceConfig {
            read_timeout_ms: 50,
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
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

    #[test]
    fn invalid_config_is_rejected_before_spawning() {
        let config = SourceConfig {
            fps: 0,
            ..quick_config()
        };
        let result = CaptureLoop::start(
            ScriptedSource::new(),
            Passthrough,
            config,
            Arc::new(FrameBuffer::new()),
            (),
        );
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn invalid_config_at_open_fails_without_retrying() {
        let source = ScriptedSource::new()
            .open_fallback(OpenStep::Fail(ConnectError::InvalidConfig("no such format".into())));
        let probe = source.probe();
        let capture = CaptureLoop::start(
            source,
            Passthrough,
            quick_config(),
            Arc::new(FrameBuffer::new()),
            (),
        )
        .unwrap();

        wait_for(&capture, ConnectionState::Failed);
        assert_eq!(probe.opens(), 1);
        assert!(capture.status().error.unwrap().contains("no such format"));
    }

    #[test]
    fn streams_and_stops() {
        let source = ScriptedSource::new();
        let probe = source.probe();
        let buffer = Arc::new(FrameBuffer::new());
        let mut capture =
            CaptureLoop::start(source, Passthrough, quick_config(), buffer.clone(), ()).unwrap();

        wait_for(&capture, ConnectionState::Streaming);
        while buffer.latest_sequence().unwrap_or(0) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(capture.is_running());

        capture.stop();
        capture.stop();
        assert_eq!(capture.state(), ConnectionState::Disconnected);
        assert!(!capture.is_running());
        assert_eq!(probe.live(), 0);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn sequence_continues_across_restarts() {
        let buffer = Arc::new(FrameBuffer::new());
        let source = ScriptedSource::new()
            .with_reads([ReadStep::Frame, ReadStep::Frame])
            .read_fallback(ReadStep::Timeout);
        let mut first =
            CaptureLoop::start(source, Passthrough, quick_config(), buffer.clone(), ()).unwrap();
        while buffer.latest_sequence() != Some(2) {
            thread::sleep(Duration::from_millis(1));
        }
        first.stop();

        let second = CaptureLoop::start(
            ScriptedSource::new().with_reads([ReadStep::Frame]).read_fallback(ReadStep::Timeout),
            Passthrough,
            quick_config(),
            buffer.clone(),
            (),
        )
        .unwrap();
        while buffer.latest_sequence() != Some(3) {
            thread::sleep(Duration::from_millis(1));
        }
        drop(second);
        assert_eq!(buffer.stats().rejected, 0);
    }
}

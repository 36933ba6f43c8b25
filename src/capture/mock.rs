//! Synthetic sources: a moving test pattern, and a scripted source for exercising
//! the reconnect state machine without hardware

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::cancel::CancelToken;
use super::frame::{Frame, PixelFormat};
use super::source::FrameSource;
use crate::error::{ConnectError, ReadError};
use crate::SourceConfig;

/// Moving RGB gradient paced to the configured frame rate
#[derive(Debug, Default)]
pub struct TestPatternSource;

pub struct TestPatternSession {
    width: u32,
    height: u32,
    interval: Duration,
    next_due: Instant,
    sequence: u64,
}

impl TestPatternSource {
    pub fn new() -> Self {
        Self
    }
}

/// One gradient image, scrolled horizontally by `offset`
pub fn gradient(width: u32, height: u32, offset: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            let shifted = (u64::from(x) + offset) % u64::from(width.max(1));
            data.push((shifted * 255 / u64::from(width.max(1))) as u8);
            data.push((u64::from(y) * 255 / u64::from(height.max(1))) as u8);
            data.push((offset % 256) as u8);
        }
    }
    data
}

impl FrameSource for TestPatternSource {
    type Handle = TestPatternSession;

    fn describe(&self) -> String {
        "test-pattern".to_string()
    }

    fn open(
        &mut self,
        config: &SourceConfig,
        cancel: &CancelToken,
    ) -> Result<TestPatternSession, ConnectError> {
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }
        Ok(TestPatternSession {
            width: config.width,
            height: config.height,
            interval: config.frame_interval(),
            next_due: Instant::now(),
            sequence: 0,
        })
    }

    fn read_frame(
        &mut self,
        session: &mut TestPatternSession,
        cancel: &CancelToken,
    ) -> Result<Frame, ReadError> {
        if cancel.wait_until(session.next_due) {
            return Err(ReadError::Cancelled);
        }
        session.next_due += session.interval;
        session.sequence += 1;
        let data = gradient(session.width, session.height, session.sequence * 4);
        Ok(Frame::new(data, session.width, session.height, PixelFormat::Rgb24)
            .with_sequence(session.sequence))
    }
}

/// Outcome of one scripted `open`
#[derive(Debug, Clone)]
pub enum OpenStep {
    Succeed,
    Fail(ConnectError),
}

/// Outcome of one scripted `read_frame`
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// Next frame of the session
    Frame,
    /// Frame carrying an explicit source sequence number
    FrameWithSequence(u64),
    /// Block for the read timeout (or until cancelled), then time out
    Timeout,
    /// Immediate device loss
    Lose(String),
}

/// Counters shared between a [`ScriptedSource`] and the test observing it
#[derive(Debug, Default)]
pub struct SourceProbe {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub reads: AtomicUsize,
    /// Handles currently alive
    pub live: AtomicUsize,
}

impl SourceProbe {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Source that replays scripted outcomes, then falls back to a fixed behaviour
#[derive(Debug)]
pub struct ScriptedSource {
    opens: VecDeque<OpenStep>,
    reads: VecDeque<ReadStep>,
    open_fallback: OpenStep,
    read_fallback: ReadStep,
    probe: Arc<SourceProbe>,
}

pub struct ScriptedHandle {
    read_timeout: Duration,
    sequence: u64,
    probe: Arc<SourceProbe>,
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.probe.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSource {
    /// Opens succeed and every read yields a frame
    pub fn new() -> Self {
        Self {
            opens: VecDeque::new(),
            reads: VecDeque::new(),
            open_fallback: OpenStep::Succeed,
            read_fallback: ReadStep::Frame,
            probe: Arc::new(SourceProbe::default()),
        }
    }

    pub fn with_opens(mut self, steps: impl IntoIterator<Item = OpenStep>) -> Self {
        self.opens.extend(steps);
        self
    }

    pub fn with_reads(mut self, steps: impl IntoIterator<Item = ReadStep>) -> Self {
        self.reads.extend(steps);
        self
    }

    pub fn open_fallback(mut self, step: OpenStep) -> Self {
        self.open_fallback = step;
        self
    }

    pub fn read_fallback(mut self, step: ReadStep) -> Self {
        self.read_fallback = step;
        self
    }

    pub fn probe(&self) -> Arc<SourceProbe> {
        self.probe.clone()
    }

    fn frame(sequence: u64) -> Frame {
        // Pixel value encodes the source sequence, handy for identity checks
        Frame::new(vec![sequence as u8; 4 * 2 * 3], 4, 2, PixelFormat::Rgb24)
            .with_sequence(sequence)
    }
}

impl FrameSource for ScriptedSource {
    type Handle = ScriptedHandle;

    fn describe(&self) -> String {
        "scripted".to_string()
    }

    fn open(
        &mut self,
        config: &SourceConfig,
        cancel: &CancelToken,
    ) -> Result<ScriptedHandle, ConnectError> {
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }
        let step = self
            .opens
            .pop_front()
            .unwrap_or_else(|| self.open_fallback.clone());
        match step {
            OpenStep::Succeed => {
                self.probe.live.fetch_add(1, Ordering::SeqCst);
                Ok(ScriptedHandle {
                    read_timeout: config.read_timeout(),
                    sequence: 0,
                    probe: self.probe.clone(),
                })
            }
            OpenStep::Fail(err) => Err(err),
        }
    }

    fn read_frame(
        &mut self,
        handle: &mut ScriptedHandle,
        cancel: &CancelToken,
    ) -> Result<Frame, ReadError> {
        self.probe.reads.fetch_add(1, Ordering::SeqCst);
        let step = self
            .reads
            .pop_front()
            .unwrap_or_else(|| self.read_fallback.clone());
        match step {
            ReadStep::Frame => {
                handle.sequence += 1;
                Ok(Self::frame(handle.sequence))
            }
            ReadStep::FrameWithSequence(sequence) => {
                handle.sequence = sequence;
                Ok(Self::frame(sequence))
            }
            ReadStep::Timeout => {
                if cancel.wait_timeout(handle.read_timeout) {
                    Err(ReadError::Cancelled)
                } else {
                    Err(ReadError::Timeout(handle.read_timeout))
                }
            }
            ReadStep::Lose(reason) => Err(ReadError::DeviceLost(reason)),
        }
    }

    fn close(&mut self, handle: ScriptedHandle) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        drop(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_is_paced_and_sequenced() {
        let config = SourceConfig {
            width: 8,
            height: 4,
            fps: 100,
            ..SourceConfig::default()
        };
        let cancel = CancelToken::never();
        let mut source = TestPatternSource::new();
        let mut session = source.open(&config, &cancel).unwrap();

        let start = Instant::now();
        let first = source.read_frame(&mut session, &cancel).unwrap();
        let second = source.read_frame(&mut session, &cancel).unwrap();
        let third = source.read_frame(&mut session, &cancel).unwrap();

        assert_eq!(first.sequence(), 1);
        assert_eq!(third.sequence(), 3);
        assert!(second.is_well_formed());
        assert_ne!(first.data, second.data);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn scripted_source_tracks_handles() {
        let mut source = ScriptedSource::new().with_opens([OpenStep::Fail(
            ConnectError::Unreachable("down".into()),
        )]);
        let probe = source.probe();
        let cancel = CancelToken::never();
        let config = SourceConfig::default();

        assert!(source.open(&config, &cancel).is_err());
        let mut handle = source.open(&config, &cancel).unwrap();
        assert_eq!(probe.live(), 1);
        assert_eq!(source.read_frame(&mut handle, &cancel).unwrap().sequence(), 1);
        source.close(handle);
        assert_eq!((probe.opens(), probe.closes(), probe.live()), (2, 1, 0));
    }
}

//! Render side: sinks pull the newest frame on their own tick

#[cfg(feature = "sdl2-display")]
pub mod display;
pub mod headless;

#[cfg(feature = "sdl2-display")]
pub use display::Sdl2Display;
pub use headless::HeadlessSink;

use std::sync::Arc;

use crate::capture::Frame;
use crate::error::RenderError;
use crate::pipeline::FrameBuffer;

/// Consumer of displayable frames. Never called by the capture thread.
pub trait RenderSink {
    fn render(&mut self, frame: &Frame) -> Result<(), RenderError>;
}

/// What one tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Frame with this sequence was handed to the sink
    Rendered(u64),
    /// Newest frame was already rendered
    Unchanged,
    /// Nothing published yet
    Empty,
}

/// Pull side of the frame buffer.
///
/// Each tick takes the newest frame without blocking and skips the redraw if
/// it has not changed since the previous tick.
pub struct RenderTick {
    buffer: Arc<FrameBuffer>,
    last_rendered: Option<u64>,
}

impl RenderTick {
    pub fn new(buffer: Arc<FrameBuffer>) -> Self {
        Self {
            buffer,
            last_rendered: None,
        }
    }

    pub fn last_rendered(&self) -> Option<u64> {
        self.last_rendered
    }

    pub fn tick<R: RenderSink + ?Sized>(&mut self, sink: &mut R) -> Result<TickOutcome, RenderError> {
        let Some(frame) = self.buffer.try_latest() else {
            return Ok(TickOutcome::Empty);
        };
        let sequence = frame.sequence();
        if self.last_rendered == Some(sequence) {
            return Ok(TickOutcome::Unchanged);
        }

        // A frame the sink rejects is not retried on the next tick
        self.last_rendered = Some(sequence);
        sink.render(&frame)?;
        metrics::histogram!("frame_latency_ms")
            .record(frame.timestamp.elapsed().as_secs_f64() * 1_000.0);
        Ok(TickOutcome::Rendered(sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    #[derive(Default)]
    struct Recorder {
        sequences: Vec<u64>,
    }

    impl RenderSink for Recorder {
        fn render(&mut self, frame: &Frame) -> Result<(), RenderError> {
            self.sequences.push(frame.sequence());
            Ok(())
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![0; 3], 1, 1, PixelFormat::Rgb24).with_sequence(sequence)
    }

    #[test]
    fn tick_renders_each_frame_once() {
        let buffer = Arc::new(FrameBuffer::new());
        let mut tick = RenderTick::new(buffer.clone());
        let mut sink = Recorder::default();

        assert_eq!(tick.tick(&mut sink).unwrap(), TickOutcome::Empty);

        buffer.publish(frame(1));
        assert_eq!(tick.tick(&mut sink).unwrap(), TickOutcome::Rendered(1));
        assert_eq!(tick.tick(&mut sink).unwrap(), TickOutcome::Unchanged);

        buffer.publish(frame(2));
        buffer.publish(frame(3));
        assert_eq!(tick.tick(&mut sink).unwrap(), TickOutcome::Rendered(3));
        assert_eq!(sink.sequences, vec![1, 3]);
    }

    #[test]
    fn rejected_frame_is_not_retried() {
        struct Refuse;
        impl RenderSink for Refuse {
            fn render(&mut self, frame: &Frame) -> Result<(), RenderError> {
                Err(RenderError::NotDisplayable(frame.format()))
            }
        }

        let buffer = Arc::new(FrameBuffer::new());
        buffer.publish(frame(7));
        let mut tick = RenderTick::new(buffer);
        assert!(tick.tick(&mut Refuse).is_err());
        assert_eq!(tick.tick(&mut Refuse).unwrap(), TickOutcome::Unchanged);
    }
}

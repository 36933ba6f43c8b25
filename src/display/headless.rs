use std::time::{Duration, Instant};

use tracing::info;

use super::RenderSink;
use crate::capture::Frame;
use crate::error::RenderError;

/// Sink without a window: validates frames and logs throughput
pub struct HeadlessSink {
    rendered: u64,
    window_frames: u64,
    window_start: Instant,
    report_every: Duration,
}

impl HeadlessSink {
    pub fn new(report_every: Duration) -> Self {
        Self {
            rendered: 0,
            window_frames: 0,
            window_start: Instant::now(),
            report_every,
        }
    }

    pub fn rendered(&self) -> u64 {
        self.rendered
    }
}

impl Default for HeadlessSink {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl RenderSink for HeadlessSink {
    fn render(&mut self, frame: &Frame) -> Result<(), RenderError> {
        if !frame.format().is_displayable() {
            return Err(RenderError::NotDisplayable(frame.format()));
        }

        self.rendered += 1;
        self.window_frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= self.report_every {
            info!(
                "Rendered {} frames in {:.1}s ({:.1} fps), latest {}x{} #{}",
                self.window_frames,
                elapsed.as_secs_f64(),
                self.window_frames as f64 / elapsed.as_secs_f64(),
                frame.width(),
                frame.height(),
                frame.sequence()
            );
            self.window_frames = 0;
            self.window_start = Instant::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    #[test]
    fn counts_displayable_frames() {
        let mut sink = HeadlessSink::new(Duration::ZERO);
        sink.render(&Frame::new(vec![0; 12], 2, 2, PixelFormat::Rgb24)).unwrap();
        sink.render(&Frame::new(vec![0; 4], 2, 2, PixelFormat::Gray8)).unwrap();
        assert_eq!(sink.rendered(), 2);
    }

    #[test]
    fn refuses_compressed_frames() {
        let mut sink = HeadlessSink::default();
        let jpeg = Frame::new(vec![0xFF, 0xD8], 2, 2, PixelFormat::Mjpeg);
        assert!(matches!(
            sink.render(&jpeg),
            Err(RenderError::NotDisplayable(PixelFormat::Mjpeg))
        ));
        assert_eq!(sink.rendered(), 0);
    }
}

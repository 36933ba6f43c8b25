//! Pluggable per-frame transforms run on the capture thread

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

use crate::capture::convert;
use crate::capture::{Frame, PixelFormat};
use crate::error::ProcessingError;
use crate::ProcessingConfig;

/// A pure per-frame transform.
///
/// The input is borrowed, so a stage cannot keep it past the call. A failure
/// is never fatal: the capture loop publishes the unprocessed frame instead.
pub trait ProcessingStage: Send {
    fn name(&self) -> &str;

    fn process(&self, frame: &Frame) -> Result<Frame, ProcessingError>;
}

impl<F> ProcessingStage for F
where
    F: Fn(&Frame) -> Result<Frame, ProcessingError> + Send,
{
    fn name(&self) -> &str {
        "closure"
    }

    fn process(&self, frame: &Frame) -> Result<Frame, ProcessingError> {
        self(frame)
    }
}

impl ProcessingStage for Box<dyn ProcessingStage> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn process(&self, frame: &Frame) -> Result<Frame, ProcessingError> {
        (**self).process(frame)
    }
}

/// Publishes frames untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl ProcessingStage for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn process(&self, frame: &Frame) -> Result<Frame, ProcessingError> {
        Ok(frame.clone())
    }
}

/// Converts colour frames to 8-bit luma
#[derive(Debug, Default, Clone, Copy)]
pub struct Grayscale;

impl ProcessingStage for Grayscale {
    fn name(&self) -> &str {
        "grayscale"
    }

    fn process(&self, frame: &Frame) -> Result<Frame, ProcessingError> {
        convert::convert(frame, PixelFormat::Gray8)
            .map_err(|e| ProcessingError::transform(self.name(), e))
    }
}

/// Scales frames to a fixed width, keeping the aspect ratio
#[derive(Debug, Clone, Copy)]
pub struct ResizeToWidth {
    pub width: u32,
}

impl ResizeToWidth {
    pub fn new(width: u32) -> Self {
        Self { width }
    }

    fn target_height(&self, frame: &Frame) -> u32 {
        let scaled = u64::from(frame.height()) * u64::from(self.width) / u64::from(frame.width());
        scaled.max(1) as u32
    }
}

impl ProcessingStage for ResizeToWidth {
    fn name(&self) -> &str {
        "resize"
    }

    fn process(&self, frame: &Frame) -> Result<Frame, ProcessingError> {
        let fail = |reason: &str| ProcessingError::transform("resize", reason);
        if self.width == 0 || !frame.is_well_formed() {
            return Err(fail("empty target or malformed frame"));
        }
        if frame.width() == self.width {
            return Ok(frame.clone());
        }

        let (w, h) = (frame.width(), frame.height());
        let (tw, th) = (self.width, self.target_height(frame));
        let packed = frame.packed_rows().into_owned();
        let pixels = match frame.format() {
            PixelFormat::Rgb24 => {
                let img = RgbImage::from_raw(w, h, packed).ok_or_else(|| fail("short buffer"))?;
                imageops::resize(&img, tw, th, FilterType::Triangle).into_raw()
            }
            PixelFormat::Gray8 => {
                let img = GrayImage::from_raw(w, h, packed).ok_or_else(|| fail("short buffer"))?;
                imageops::resize(&img, tw, th, FilterType::Triangle).into_raw()
            }
            other => return Err(fail(&format!("cannot resize {:?}", other))),
        };

        Ok(Frame::new(pixels, tw, th, frame.format()).derived_from(frame))
    }
}

/// Runs stages in order. Any failing stage fails the whole chain.
#[derive(Default)]
pub struct StageChain {
    stages: Vec<Box<dyn ProcessingStage>>,
    name: String,
}

impl StageChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, stage: impl ProcessingStage + 'static) -> Self {
        if !self.name.is_empty() {
            self.name.push('+');
        }
        self.name.push_str(stage.name());
        self.stages.push(Box::new(stage));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl ProcessingStage for StageChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, frame: &Frame) -> Result<Frame, ProcessingError> {
        let mut current = frame.clone();
        for stage in &self.stages {
            current = stage.process(&current)?;
        }
        Ok(current)
    }
}

/// Stage for the configured per-frame options: scale first so the luma pass touches fewer pixels
pub fn build_stage(config: &ProcessingConfig) -> Box<dyn ProcessingStage> {
    let mut chain = StageChain::new();
    if let Some(width) = config.output_width {
        chain = chain.then(ResizeToWidth::new(width));
    }
    if config.grayscale {
        chain = chain.then(Grayscale);
    }
    if chain.is_empty() {
        Box::new(Passthrough)
    } else {
        Box::new(chain)
    }
}

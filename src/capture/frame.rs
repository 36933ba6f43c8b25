use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One decoded image sample. Cloning shares the pixel data.
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Gray8,
    Yuyv4,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel of the first plane, `None` for compressed formats
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Gray8 | PixelFormat::Nv12 => Some(1),
            PixelFormat::Mjpeg => None,
        }
    }

    /// Formats a render sink can draw without further conversion
    pub fn is_displayable(self) -> bool {
        matches!(self, PixelFormat::Rgb24 | PixelFormat::Gray8)
    }

    /// Narrowest row (in bytes) that holds `width` pixels of the first plane.
    /// NV12 chroma rows share the luma stride and carry a full U/V pair per two
    /// pixels, so odd widths round up.
    pub fn min_stride(self, width: u32) -> Option<u32> {
        match self {
            PixelFormat::Nv12 => Some(width.div_ceil(2) * 2),
            other => other.bytes_per_pixel().map(|bpp| width * bpp),
        }
    }

    /// Minimum buffer size for a frame of this format
    pub fn min_len(self, stride: u32, height: u32) -> Option<usize> {
        let plane = stride as usize * height as usize;
        match self {
            // Interleaved UV plane of half height follows the luma plane
            PixelFormat::Nv12 => Some(plane + stride as usize * height.div_ceil(2) as usize),
            PixelFormat::Mjpeg => None,
            _ => Some(plane),
        }
    }
}

impl Frame {
    /// Build a frame with tightly packed rows
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = format.min_stride(width).unwrap_or(0);
        Self::with_stride(data, width, height, stride, format)
    }

    pub fn with_stride(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    ) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                sequence: 0,
                width,
                height,
                stride,
                format,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    /// Same pixels and capture time under a new sequence number
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        Arc::make_mut(&mut self.meta).sequence = sequence;
        self
    }

    pub fn with_device_timestamp(mut self, ts: Duration) -> Self {
        Arc::make_mut(&mut self.meta).device_timestamp = Some(ts);
        self
    }

    /// Carry sequence and timing over from the frame this one was derived from
    pub fn derived_from(mut self, origin: &Frame) -> Self {
        let meta = Arc::make_mut(&mut self.meta);
        meta.sequence = origin.meta.sequence;
        meta.device_timestamp = origin.meta.device_timestamp;
        self.timestamp = origin.timestamp;
        self
    }

    /// Checks that the buffer covers every row the metadata describes
    pub fn is_well_formed(&self) -> bool {
        let meta = &self.meta;
        if meta.width == 0 || meta.height == 0 {
            return false;
        }
        match (meta.format.min_stride(meta.width), meta.format.min_len(meta.stride, meta.height)) {
            (Some(stride), Some(min)) => meta.stride >= stride && self.data.len() >= min,
            _ => !self.data.is_empty(),
        }
    }

    /// Rows without stride padding, borrowed when already packed
    pub fn packed_rows(&self) -> std::borrow::Cow<'_, [u8]> {
        let Some(bpp) = self.meta.format.bytes_per_pixel() else {
            return std::borrow::Cow::Borrowed(&self.data[..]);
        };
        let row = (self.meta.width * bpp) as usize;
        let stride = self.meta.stride as usize;
        let height = self.meta.height as usize;
        if stride == row {
            return std::borrow::Cow::Borrowed(&self.data[..row * height]);
        }
        let mut out = Vec::with_capacity(row * height);
        for y in 0..height {
            out.extend_from_slice(&self.data[y * stride..y * stride + row]);
        }
        std::borrow::Cow::Owned(out)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("size", &format_args!("{}x{}", self.meta.width, self.meta.height))
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_rows_strips_padding() {
        // 2x2 RGB with 2 bytes of padding per row
        let data = vec![1, 2, 3, 4, 5, 6, 0, 0, 7, 8, 9, 10, 11, 12, 0, 0];
        let frame = Frame::with_stride(data, 2, 2, 8, PixelFormat::Rgb24);
        assert!(frame.is_well_formed());
        assert_eq!(
            frame.packed_rows().as_ref(),
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
        );
    }

    #[test]
    fn short_buffer_is_not_well_formed() {
        let frame = Frame::new(vec![0u8; 5], 2, 1, PixelFormat::Rgb24);
        assert!(!frame.is_well_formed());
    }

    #[test]
    fn odd_width_nv12_needs_whole_chroma_pairs() {
        // Three pixels per row need two U/V pairs, four bytes of chroma
        let packed = Frame::with_stride(vec![128u8; 9], 3, 2, 3, PixelFormat::Nv12);
        assert!(!packed.is_well_formed());

        let padded = Frame::new(vec![128u8; 12], 3, 2, PixelFormat::Nv12);
        assert_eq!(padded.meta.stride, 4);
        assert!(padded.is_well_formed());
    }

    #[test]
    fn with_sequence_keeps_pixels_shared() {
        let frame = Frame::new(vec![9u8; 3], 1, 1, PixelFormat::Rgb24);
        let restamped = frame.clone().with_sequence(42);
        assert_eq!(restamped.sequence(), 42);
        assert_eq!(frame.sequence(), 0);
        assert_eq!(restamped.data.as_ptr(), frame.data.as_ptr());
    }
}

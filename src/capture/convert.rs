//! Pixel format conversions into displayable frames

use jpeg_decoder::Decoder;

use super::frame::{Frame, PixelFormat};
use crate::error::ConvertError;

/// Convert any supported frame into a format a render sink can draw directly.
/// Displayable frames are returned as-is (shared, no copy).
pub fn to_displayable(frame: &Frame) -> Result<Frame, ConvertError> {
    match frame.format() {
        PixelFormat::Rgb24 | PixelFormat::Gray8 => Ok(frame.clone()),
        PixelFormat::Mjpeg => decode_jpeg(&frame.data).map(|f| f.derived_from(frame)),
        _ => convert(frame, PixelFormat::Rgb24),
    }
}

/// Convert between raw formats. Only conversions that end in a displayable format are supported.
pub fn convert(frame: &Frame, to: PixelFormat) -> Result<Frame, ConvertError> {
    let from = frame.format();
    if from == to {
        return Ok(frame.clone());
    }
    check_len(frame)?;

    let (w, h) = (frame.width(), frame.height());
    let pixels = match (from, to) {
        (PixelFormat::Mjpeg, PixelFormat::Rgb24) => {
            let decoded = decode_jpeg(&frame.data)?;
            return match decoded.format() {
                PixelFormat::Gray8 => convert(&decoded, PixelFormat::Rgb24),
                _ => Ok(decoded),
            }
            .map(|f| f.derived_from(frame));
        }
        (PixelFormat::Bgr24, PixelFormat::Rgb24) | (PixelFormat::Rgb24, PixelFormat::Bgr24) => {
            swap_red_blue(&frame.packed_rows())
        }
        (PixelFormat::Gray8, PixelFormat::Rgb24) => gray_to_rgb(&frame.packed_rows()),
        (PixelFormat::Rgb24, PixelFormat::Gray8) => rgb_to_gray(&frame.packed_rows(), false),
        (PixelFormat::Bgr24, PixelFormat::Gray8) => rgb_to_gray(&frame.packed_rows(), true),
        (PixelFormat::Yuyv4, PixelFormat::Rgb24) => {
            yuyv_to_rgb(&frame.data, w, h, frame.meta.stride)
        }
        (PixelFormat::Nv12, PixelFormat::Rgb24) => nv12_to_rgb(&frame.data, w, h, frame.meta.stride),
        (PixelFormat::Yuyv4, PixelFormat::Gray8) => yuyv_luma(&frame.data, w, h, frame.meta.stride),
        (PixelFormat::Nv12, PixelFormat::Gray8) => {
            let stride = frame.meta.stride as usize;
            let mut out = Vec::with_capacity((w * h) as usize);
            for y in 0..h as usize {
                out.extend_from_slice(&frame.data[y * stride..y * stride + w as usize]);
            }
            out
        }
        _ => return Err(ConvertError::Unsupported { from, to }),
    };

    Ok(Frame::new(pixels, w, h, to).derived_from(frame))
}

/// Largest decoded image accepted from a JPEG header (an 8K RGB frame fits)
pub const MAX_DECODED_BYTES: usize = 128 * 1024 * 1024;

/// Decode a JPEG image into Rgb24, or Gray8 for single-channel images
pub fn decode_jpeg(data: &[u8]) -> Result<Frame, ConvertError> {
    let mut decoder = Decoder::new(data);
    decoder
        .read_info()
        .map_err(|e| ConvertError::Jpeg(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| ConvertError::Jpeg("missing image info".into()))?;
    let (w, h) = (u32::from(info.width), u32::from(info.height));

    // The header alone decides the allocation, so check it before decoding
    let decoded = w as usize * h as usize * info.pixel_format.pixel_bytes();
    if decoded > MAX_DECODED_BYTES {
        return Err(ConvertError::Jpeg(format!(
            "{}x{} image needs {} bytes, limit is {}",
            w, h, decoded, MAX_DECODED_BYTES
        )));
    }

    let pixels = decoder
        .decode()
        .map_err(|e| ConvertError::Jpeg(e.to_string()))?;

    match info.pixel_format {
        jpeg_decoder::PixelFormat::L8 => Ok(Frame::new(pixels, w, h, PixelFormat::Gray8)),
        jpeg_decoder::PixelFormat::L16 => {
            // Keep the most significant byte of each big-endian sample
            let gray: Vec<u8> = pixels.chunks_exact(2).map(|px| px[0]).collect();
            Ok(Frame::new(gray, w, h, PixelFormat::Gray8))
        }
        jpeg_decoder::PixelFormat::CMYK32 => {
            let rgb = pixels
                .chunks_exact(4)
                .flat_map(|px| {
                    let k = u16::from(px[3]);
                    [
                        (u16::from(px[0]) * k / 255) as u8,
                        (u16::from(px[1]) * k / 255) as u8,
                        (u16::from(px[2]) * k / 255) as u8,
                    ]
                })
                .collect::<Vec<u8>>();
            Ok(Frame::new(rgb, w, h, PixelFormat::Rgb24))
        }
        _ => Ok(Frame::new(pixels, w, h, PixelFormat::Rgb24)),
    }
}

fn check_len(frame: &Frame) -> Result<(), ConvertError> {
    let stride = frame.meta.stride;
    if let Some(min) = frame.format().min_stride(frame.width()) {
        if stride < min {
            return Err(ConvertError::Stride { stride, min });
        }
    }
    if let Some(expected) = frame.format().min_len(frame.meta.stride, frame.height()) {
        if frame.data.len() < expected {
            return Err(ConvertError::Truncated {
                expected,
                actual: frame.data.len(),
            });
        }
    }
    Ok(())
}

fn swap_red_blue(packed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packed.len());
    for chunk in packed.chunks_exact(3) {
        out.push(chunk[2]);
        out.push(chunk[1]);
        out.push(chunk[0]);
    }
    out
}

fn gray_to_rgb(packed: &[u8]) -> Vec<u8> {
    packed.iter().flat_map(|&l| [l, l, l]).collect()
}

/// BT.601 luma, integer approximation
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * u32::from(r) + 150 * u32::from(g) + 29 * u32::from(b)) >> 8) as u8
}

fn rgb_to_gray(packed: &[u8], bgr: bool) -> Vec<u8> {
    packed
        .chunks_exact(3)
        .map(|px| {
            if bgr {
                luma(px[2], px[1], px[0])
            } else {
                luma(px[0], px[1], px[2])
            }
        })
        .collect()
}

/// BT.601 limited-range YCbCr to RGB
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32, stride: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height as usize {
        let row = &data[y * stride as usize..][..(width * 2) as usize];
        for quad in row.chunks_exact(4) {
            let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
            out.extend_from_slice(&yuv_to_rgb(y0, u, v));
            out.extend_from_slice(&yuv_to_rgb(y1, u, v));
        }
        // Odd widths leave a trailing half pair
        if width % 2 == 1 {
            let tail = &row[row.len() - 2..];
            out.extend_from_slice(&yuv_to_rgb(tail[0], tail[1], 128));
        }
    }
    out
}

fn yuyv_luma(data: &[u8], width: u32, height: u32, stride: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((width * height) as usize);
    for y in 0..height as usize {
        let row = &data[y * stride as usize..][..(width * 2) as usize];
        out.extend(row.iter().step_by(2));
    }
    out
}

fn nv12_to_rgb(data: &[u8], width: u32, height: u32, stride: u32) -> Vec<u8> {
    let stride = stride as usize;
    let uv_plane = &data[stride * height as usize..];
    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height as usize {
        let luma_row = &data[y * stride..];
        let uv_row = &uv_plane[(y / 2) * stride..];
        for x in 0..width as usize {
            let uv = (x / 2) * 2;
            out.extend_from_slice(&yuv_to_rgb(luma_row[x], uv_row[uv], uv_row[uv + 1]));
        }
    }
    out
}

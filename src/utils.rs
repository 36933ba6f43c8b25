use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::capture::v4l2::{device_path, fourcc_for};

/// Highest `/dev/video*` index probed
const MAX_DEVICE_INDEX: u32 = 10;

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub index: u32,
    pub card: String,
    pub format: PixelFormat,
}

/// Best format the capture pipeline can take from a device: MJPEG, then YUYV
pub fn preferred_format(formats: impl IntoIterator<Item = FourCC>) -> Option<PixelFormat> {
    let mut best = None;
    for fourcc in formats {
        if fourcc == fourcc_for(PixelFormat::Mjpeg) {
            return Some(PixelFormat::Mjpeg);
        }
        if fourcc == fourcc_for(PixelFormat::Yuyv4) {
            best = Some(PixelFormat::Yuyv4);
        }
    }
    best
}

fn probe(index: u32) -> Option<FoundDevice> {
    let path = device_path(index);
    if !Path::new(&path).exists() {
        return None;
    }

    let dev = Device::with_path(&path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        debug!("{} ({}) cannot capture", path, caps.card);
        return None;
    }

    let formats = dev.enum_formats().ok()?;
    let format = preferred_format(formats.into_iter().map(|f| f.fourcc))?;
    Some(FoundDevice {
        index,
        card: caps.card,
        format,
    })
}

/// Auto-detect best capture device
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let found = (0..MAX_DEVICE_INDEX)
        .filter_map(probe)
        .min_by_key(|device| device.format != PixelFormat::Mjpeg)
        .ok_or_else(|| eyre!("No suitable capture device found"))?;

    info!(
        "Found {:?} device: {} - {}",
        found.format,
        device_path(found.index),
        found.card
    );
    Ok(found)
}

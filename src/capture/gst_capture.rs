//! GStreamer-backed source for any URI the installed plugins can decode (RTSP, files, HTTP)

use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, instrument, warn};

use super::cancel::CancelToken;
use super::frame::{Frame, PixelFormat};
use super::source::{FrameSource, ReadDeadline};
use crate::error::{ConnectError, ReadError};
use crate::{SourceConfig, SourceOrigin};

/// GStreamer decode pipeline ending in an RGB appsink
#[derive(Debug, Default)]
pub struct GstSource {
    description: Option<String>,
}

pub struct GstSession {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    read_timeout: Duration,
    sequence: u64,
}

impl GstSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build pipeline string for the configured origin. Only URLs reach this
    /// source: devices go through V4L2 and the test pattern is generated in-process.
    fn build_pipeline_string(config: &SourceConfig) -> Result<String, ConnectError> {
        let SourceOrigin::Url(uri) = &config.origin else {
            return Err(ConnectError::InvalidConfig(format!(
                "gstreamer source needs a stream url, got {:?}",
                config.origin
            )));
        };
        if uri.trim().is_empty() {
            return Err(ConnectError::InvalidConfig("empty stream url".into()));
        }
        let quoted = uri.replace('\\', "\\\\").replace('"', "\\\"");
        Ok(format!(
            "uridecodebin uri=\"{}\" ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            quoted
        ))
    }
}

fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => Some(err.error().to_string()),
        _ => None,
    }
}

impl FrameSource for GstSource {
    type Handle = GstSession;

    fn describe(&self) -> String {
        format!(
            "gstreamer:{}",
            self.description.as_deref().unwrap_or("<unopened>")
        )
    }

    #[instrument(skip_all, fields(origin = ?config.origin))]
    fn open(
        &mut self,
        config: &SourceConfig,
        cancel: &CancelToken,
    ) -> Result<GstSession, ConnectError> {
        gst::init().map_err(|e| ConnectError::Unreachable(format!("gstreamer init: {}", e)))?;

        let pipeline_str = Self::build_pipeline_string(config)?;
        info!("Pipeline: {}", pipeline_str);
        self.description = Some(pipeline_str.clone());

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| ConnectError::InvalidConfig(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| ConnectError::InvalidConfig("not a pipeline".into()))?;
        let appsink = pipeline
            .by_name("appsink")
            .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| ConnectError::InvalidConfig("appsink element missing".into()))?;

        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| ConnectError::Unreachable(format!("start pipeline: {:?}", e)))?;
        let session = GstSession {
            pipeline,
            appsink,
            read_timeout: config.read_timeout(),
            sequence: 0,
        };

        let (state_change, _, _) = session.pipeline.state(Some(gst::ClockTime::from_mseconds(
            config.connect_timeout_ms,
        )));
        if let Some(err) = bus_error(&session.pipeline) {
            return Err(ConnectError::Unreachable(err));
        }
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => {
                info!("Pipeline playing");
            }
            Ok(gst::StateChangeSuccess::Async) => info!("Pipeline starting asynchronously"),
            Err(e) => return Err(ConnectError::Unreachable(format!("{:?}", e))),
        }
        Ok(session)
    }

    fn read_frame(
        &mut self,
        session: &mut GstSession,
        cancel: &CancelToken,
    ) -> Result<Frame, ReadError> {
        let deadline = ReadDeadline::new(session.read_timeout);
        loop {
            deadline.check(cancel)?;
            if let Some(err) = bus_error(&session.pipeline) {
                return Err(ReadError::DeviceLost(err));
            }
            if session.appsink.is_eos() {
                return Err(ReadError::DeviceLost("end of stream".into()));
            }

            let slice = gst::ClockTime::from_nseconds(deadline.slice().as_nanos() as u64);
            let Some(sample) = session.appsink.try_pull_sample(slice) else {
                continue;
            };

            let frame = sample_to_frame(&sample)?;
            session.sequence += 1;
            return Ok(frame.with_sequence(session.sequence));
        }
    }

    fn close(&mut self, session: GstSession) {
        debug!("Stopping pipeline after {} frames", session.sequence);
        drop(session);
    }
}

fn sample_to_frame(sample: &gst::Sample) -> Result<Frame, ReadError> {
    let lost = |msg: &str| ReadError::DeviceLost(msg.to_string());
    let buffer = sample.buffer().ok_or_else(|| lost("sample contains no buffer"))?;
    let caps = sample.caps().ok_or_else(|| lost("sample has no caps"))?;
    let video_info =
        gst_video::VideoInfo::from_caps(caps).map_err(|_| lost("unparsable video caps"))?;
    let map = buffer.map_readable().map_err(|_| lost("unmappable buffer"))?;

    let frame = Frame::with_stride(
        Bytes::copy_from_slice(map.as_slice()),
        video_info.width(),
        video_info.height(),
        video_info.stride()[0] as u32,
        PixelFormat::Rgb24,
    );
    Ok(match buffer.pts() {
        Some(pts) => frame.with_device_timestamp(Duration::from_nanos(pts.nseconds())),
        None => frame,
    })
}

impl Drop for GstSession {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(origin: SourceOrigin) -> SourceConfig {
        SourceConfig {
            origin,
            ..SourceConfig::default()
        }
    }

    #[test]
    fn url_is_quoted_in_the_pipeline() {
        let pipeline = GstSource::build_pipeline_string(&config(SourceOrigin::Url(
            "rtsp://cam.local/live?name=a b".into(),
        )))
        .unwrap();
        assert!(
            pipeline.starts_with(r#"uridecodebin uri="rtsp://cam.local/live?name=a b" ! "#),
            "{pipeline}"
        );
        assert!(pipeline.ends_with("appsink name=appsink sync=false max-buffers=1 drop=true"));
    }

    #[test]
    fn quotes_inside_the_url_are_escaped() {
        let pipeline = GstSource::build_pipeline_string(&config(SourceOrigin::Url(
            r#"file:///tmp/a"b.mp4"#.into(),
        )))
        .unwrap();
        assert!(pipeline.contains(r#"uri="file:///tmp/a\"b.mp4""#), "{pipeline}");
    }

    #[test]
    fn non_url_origins_are_invalid() {
        for origin in [SourceOrigin::Device(0), SourceOrigin::TestPattern] {
            assert!(matches!(
                GstSource::build_pipeline_string(&config(origin)),
                Err(ConnectError::InvalidConfig(_))
            ));
        }
    }
}

//! HTTP MJPEG frame source
//!
//! Reads `multipart/x-mixed-replace` JPEG streams as served by most IP cameras.
//! Each part is located by its `Content-Length` header; the body starts at the
//! first `0xFF` byte after the headers. Parts without a length are delimited by
//! the JPEG SOI/EOI markers instead. Servers answering with a single
//! `image/jpeg` body are polled as snapshots at the configured frame rate.

use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use url::Url;

use super::cancel::CancelToken;
use super::convert::decode_jpeg;
use super::frame::Frame;
use super::source::{FrameSource, ReadDeadline};
use crate::error::{ConnectError, ReadError};
use crate::{SourceConfig, SourceOrigin};

/// Parts below this size are keep-alive noise, not images
pub const MIN_JPEG_BYTES: usize = 100;
pub const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const CONTENT_LENGTH: &[u8] = b"content-length:";

type BodyReader = Box<dyn Read + Send + Sync + 'static>;

/// MJPEG-over-HTTP source
#[derive(Debug, Default)]
pub struct HttpMjpegSource {
    url: Option<String>,
}

/// One HTTP connection
pub struct MjpegSession {
    url: String,
    kind: SessionKind,
    sequence: u64,
    read_timeout: Duration,
    frame_interval: Duration,
}

enum SessionKind {
    Multipart(PartReader<BodyReader>),
    Snapshot {
        agent: ureq::Agent,
        pending: Option<Vec<u8>>,
        last_fetch: Option<Instant>,
    },
}

impl HttpMjpegSource {
    pub fn new() -> Self {
        Self::default()
    }
}

fn stream_url(config: &SourceConfig) -> Result<Url, ConnectError> {
    let SourceOrigin::Url(raw) = &config.origin else {
        return Err(ConnectError::InvalidConfig(
            "mjpeg source needs a stream url".into(),
        ));
    };
    let url = Url::parse(raw)
        .map_err(|e| ConnectError::InvalidConfig(format!("invalid url '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConnectError::InvalidConfig(format!(
            "unsupported scheme '{other}'; expected http(s)"
        ))),
    }
}

fn fetch(agent: &ureq::Agent, url: &str) -> Result<ureq::Response, ConnectError> {
    agent.get(url).call().map_err(|e| match e {
        ureq::Error::Status(code, _) => ConnectError::Unreachable(format!("HTTP {code} from {url}")),
        ureq::Error::Transport(t) => ConnectError::Unreachable(t.to_string()),
    })
}

fn read_snapshot(response: ureq::Response) -> Result<Vec<u8>, ReadError> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| ReadError::DeviceLost(format!("read snapshot: {e}")))?;
    if bytes.len() > MAX_JPEG_BYTES {
        return Err(ReadError::DeviceLost("snapshot exceeds size limit".into()));
    }
    Ok(bytes)
}

impl FrameSource for HttpMjpegSource {
    type Handle = MjpegSession;

    fn describe(&self) -> String {
        format!("mjpeg:{}", self.url.as_deref().unwrap_or("<unopened>"))
    }

    #[instrument(skip_all, fields(origin = ?config.origin))]
    fn open(
        &mut self,
        config: &SourceConfig,
        cancel: &CancelToken,
    ) -> Result<MjpegSession, ConnectError> {
        let url = stream_url(config)?;
        self.url = Some(url.to_string());
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        // Socket reads are bounded by the read timeout, so a stalled stream
        // hands control back to the frame loop at least that often.
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout())
            .timeout_read(config.read_timeout())
            .build();
        let response = fetch(&agent, url.as_str())?;
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        let content_type = response
            .header("Content-Type")
            .unwrap_or_default()
            .to_ascii_lowercase();
        info!("Connected to {} ({})", url, content_type);

        let kind = if content_type.contains("multipart") {
            SessionKind::Multipart(PartReader::new(response.into_reader()))
        } else {
            let first = read_snapshot(response)
                .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
            SessionKind::Snapshot {
                agent,
                pending: Some(first),
                last_fetch: Some(Instant::now()),
            }
        };

        Ok(MjpegSession {
            url: url.to_string(),
            kind,
            sequence: 0,
            read_timeout: config.read_timeout(),
            frame_interval: config.frame_interval(),
        })
    }

    fn read_frame(
        &mut self,
        session: &mut MjpegSession,
        cancel: &CancelToken,
    ) -> Result<Frame, ReadError> {
        // Deadline spans the whole call, including skipped parts
        let deadline = ReadDeadline::new(session.read_timeout);
        loop {
            let jpeg = session.next_jpeg(&deadline, cancel)?;
            if jpeg.len() < MIN_JPEG_BYTES {
                debug!("Skipping {} byte part", jpeg.len());
                continue;
            }
            match decode_jpeg(&jpeg) {
                Ok(frame) => {
                    session.sequence += 1;
                    return Ok(frame.with_sequence(session.sequence));
                }
                Err(e) => {
                    warn!("Dropping undecodable part from {}: {}", session.url, e);
                    metrics::counter!("mjpeg_corrupt_parts_total").increment(1);
                }
            }
        }
    }

    fn close(&mut self, session: MjpegSession) {
        debug!("Closing {} after {} frames", session.url, session.sequence);
    }
}

impl MjpegSession {
    fn next_jpeg(
        &mut self,
        deadline: &ReadDeadline,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, ReadError> {
        match &mut self.kind {
            SessionKind::Multipart(parts) => parts.next_part(deadline, cancel),
            SessionKind::Snapshot {
                agent,
                pending,
                last_fetch,
            } => {
                if let Some(bytes) = pending.take() {
                    return Ok(bytes);
                }
                deadline.check(cancel)?;
                if let Some(last) = *last_fetch {
                    if cancel.wait_until(last + self.frame_interval) {
                        return Err(ReadError::Cancelled);
                    }
                }
                *last_fetch = Some(Instant::now());
                let response = fetch(agent, &self.url).map_err(|e| match e {
                    ConnectError::Cancelled => ReadError::Cancelled,
                    other => ReadError::DeviceLost(other.to_string()),
                })?;
                read_snapshot(response)
            }
        }
    }
}

/// Incremental multipart JPEG parser over a blocking reader
pub struct PartReader<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
}

impl<R: Read> PartReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; 8192].into_boxed_slice(),
            pos: 0,
            len: 0,
        }
    }

    fn fill(&mut self, deadline: &ReadDeadline, cancel: &CancelToken) -> Result<(), ReadError> {
        loop {
            deadline.check(cancel)?;
            match self.inner.read(&mut self.buf) {
                Ok(0) => return Err(ReadError::DeviceLost("stream ended".into())),
                Ok(n) => {
                    self.pos = 0;
                    self.len = n;
                    return Ok(());
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(ReadError::DeviceLost(e.to_string())),
            }
        }
    }

    fn next_byte(&mut self, deadline: &ReadDeadline, cancel: &CancelToken) -> Result<u8, ReadError> {
        if self.pos == self.len {
            self.fill(deadline, cancel)?;
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_into(
        &mut self,
        out: &mut Vec<u8>,
        mut remaining: usize,
        deadline: &ReadDeadline,
        cancel: &CancelToken,
    ) -> Result<(), ReadError> {
        while remaining > 0 {
            if self.pos == self.len {
                self.fill(deadline, cancel)?;
            }
            let take = remaining.min(self.len - self.pos);
            out.extend_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            remaining -= take;
        }
        Ok(())
    }

    /// Next JPEG body in the stream
    pub fn next_part(
        &mut self,
        deadline: &ReadDeadline,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, ReadError> {
        let mut header: Vec<u8> = Vec::with_capacity(256);
        let mut line_start = 0;
        let mut content_length: Option<usize> = None;

        loop {
            let b = self.next_byte(deadline, cancel)?;

            if b == 0xFF {
                if let Some(len) = content_length {
                    if len > MAX_JPEG_BYTES {
                        return Err(ReadError::DeviceLost(format!(
                            "part of {len} bytes exceeds limit"
                        )));
                    }
                    let mut body = Vec::with_capacity(len.max(1));
                    body.push(b);
                    self.read_into(&mut body, len.saturating_sub(1), deadline, cancel)?;
                    return Ok(body);
                }
            }

            header.push(b);

            if header.ends_with(&[0xFF, 0xD8]) {
                return self.read_until_eoi(deadline, cancel);
            }

            if b == b'\n' {
                if let Some(len) = parse_content_length(&header[line_start..]) {
                    content_length = Some(len);
                }
                line_start = header.len();
            }

            if header.len() > MAX_HEADER_BYTES {
                header.clear();
                line_start = 0;
            }
        }
    }

    fn read_until_eoi(
        &mut self,
        deadline: &ReadDeadline,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, ReadError> {
        let mut body = vec![0xFF, 0xD8];
        loop {
            let b = self.next_byte(deadline, cancel)?;
            body.push(b);
            if body.ends_with(&[0xFF, 0xD9]) {
                return Ok(body);
            }
            if body.len() > MAX_JPEG_BYTES {
                return Err(ReadError::DeviceLost("unterminated jpeg part".into()));
            }
        }
    }
}

/// Parses a `Content-Length: N` header line, case-insensitively
fn parse_content_length(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?.trim();
    if line.len() < CONTENT_LENGTH.len()
        || !line.as_bytes()[..CONTENT_LENGTH.len()].eq_ignore_ascii_case(CONTENT_LENGTH)
    {
        return None;
    }
    line[CONTENT_LENGTH.len()..].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn deadline() -> ReadDeadline {
        ReadDeadline::new(Duration::from_secs(5))
    }

    fn part(body: &[u8], with_length: bool) -> Vec<u8> {
        let mut out = b"--boundary\r\nContent-Type: image/jpeg\r\n".to_vec();
        if with_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn fake_jpeg(fill: u8) -> Vec<u8> {
        let mut body = vec![0xFF, 0xD8];
        body.extend(std::iter::repeat(fill).take(150));
        body.extend_from_slice(&[0xFF, 0xD9]);
        body
    }

    #[test]
    fn parses_length_delimited_parts() {
        let (a, b) = (fake_jpeg(1), fake_jpeg(2));
        let mut stream = part(&a, true);
        stream.extend(part(&b, true));
        let mut reader = PartReader::new(Cursor::new(stream));
        let never = CancelToken::never();

        assert_eq!(reader.next_part(&deadline(), &never).unwrap(), a);
        assert_eq!(reader.next_part(&deadline(), &never).unwrap(), b);
        assert!(matches!(
            reader.next_part(&deadline(), &never),
            Err(ReadError::DeviceLost(_))
        ));
    }

    #[test]
    fn falls_back_to_markers_without_length() {
        let body = fake_jpeg(7);
        let mut reader = PartReader::new(Cursor::new(part(&body, false)));
        assert_eq!(
            reader.next_part(&deadline(), &CancelToken::never()).unwrap(),
            body
        );
    }

    #[test]
    fn header_name_is_case_insensitive() {
        assert_eq!(parse_content_length(b"content-length: 42\r\n"), Some(42));
        assert_eq!(parse_content_length(b"Content-Length:7\n"), Some(7));
        assert_eq!(parse_content_length(b"Content-Type: image/jpeg\r\n"), None);
    }

    #[test]
    fn oversized_part_is_rejected() {
        let stream = format!(
            "--b\r\nContent-Length: {}\r\n\r\n",
            MAX_JPEG_BYTES + 1
        )
        .into_bytes()
        .into_iter()
        .chain([0xFF, 0xD8])
        .collect::<Vec<u8>>();
        let mut reader = PartReader::new(Cursor::new(stream));
        assert!(matches!(
            reader.next_part(&deadline(), &CancelToken::never()),
            Err(ReadError::DeviceLost(_))
        ));
    }

    #[test]
    fn cancelled_reader_stops() {
        let canceller = crate::capture::Canceller::new();
        canceller.cancel();
        let mut reader = PartReader::new(Cursor::new(part(&fake_jpeg(1), true)));
        assert_eq!(
            reader.next_part(&deadline(), &canceller.token()),
            Err(ReadError::Cancelled)
        );
    }

    #[test]
    fn rejects_non_http_urls() {
        let config = SourceConfig {
            origin: SourceOrigin::Url("rtsp://camera.local/stream".into()),
            ..SourceConfig::default()
        };
        let mut source = HttpMjpegSource::new();
        assert!(matches!(
            source.open(&config, &CancelToken::never()),
            Err(ConnectError::InvalidConfig(_))
        ));
    }
}

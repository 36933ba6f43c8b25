//! Frame source contract

use std::time::{Duration, Instant};

use super::cancel::CancelToken;
use super::frame::Frame;
use crate::error::{ConnectError, ReadError};
use crate::SourceConfig;

/// Longest single blocking wait inside a source. Cancellation is observed
/// at least this often while a read is in flight.
pub const POLL_SLICE: Duration = Duration::from_millis(50);

/// A single video origin: a local camera device or a network stream.
///
/// All methods run on the capture thread. `read_frame` must return within the
/// configured read timeout, and must notice `cancel` between bounded waits so a
/// stop request unblocks it with [`ReadError::Cancelled`].
pub trait FrameSource: Send {
    /// Open connection or device session, released by [`FrameSource::close`]
    type Handle: Send;

    /// Short label for logs
    fn describe(&self) -> String;

    fn open(
        &mut self,
        config: &SourceConfig,
        cancel: &CancelToken,
    ) -> Result<Self::Handle, ConnectError>;

    /// Next frame, in a displayable pixel format
    fn read_frame(
        &mut self,
        handle: &mut Self::Handle,
        cancel: &CancelToken,
    ) -> Result<Frame, ReadError>;

    fn close(&mut self, handle: Self::Handle) {
        drop(handle);
    }
}

/// Deadline bookkeeping for one `read_frame` call
#[derive(Debug, Clone, Copy)]
pub struct ReadDeadline {
    started: Instant,
    timeout: Duration,
}

impl ReadDeadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }

    /// Next bounded wait: the poll slice or whatever remains, whichever is shorter
    pub fn slice(&self) -> Duration {
        self.timeout
            .saturating_sub(self.started.elapsed())
            .min(POLL_SLICE)
    }

    /// Cancellation wins over expiry
    pub fn check(&self, cancel: &CancelToken) -> Result<(), ReadError> {
        if cancel.is_cancelled() {
            Err(ReadError::Cancelled)
        } else if self.expired() {
            Err(ReadError::Timeout(self.timeout))
        } else {
            Ok(())
        }
    }
}

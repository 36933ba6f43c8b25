use std::fmt;

use tracing::warn;

/// Connection state owned by the capture thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    /// Retry budget exhausted or configuration unusable. Terminal.
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed)
    }

    /// Gauge value exported as `connection_state`
    pub fn as_gauge(self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Streaming => 2.0,
            ConnectionState::Reconnecting => 3.0,
            ConnectionState::Failed => 4.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One state transition as seen by observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub state: ConnectionState,
    /// Last error description, if the transition was caused by one
    pub error: Option<String>,
    /// Consecutive failures so far in the current retry cycle
    pub attempt: u32,
}

impl StatusEvent {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state,
            error: None,
            attempt: 0,
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if self.attempt > 0 {
            write!(f, " (attempt {})", self.attempt)?;
        }
        if let Some(error) = &self.error {
            write!(f, ": {}", error)?;
        }
        Ok(())
    }
}

/// Receives status events on the capture thread. Must not block.
pub trait StatusObserver: Send + 'static {
    fn on_status(&self, event: &StatusEvent);
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusEvent) + Send + 'static,
{
    fn on_status(&self, event: &StatusEvent) {
        self(event)
    }
}

impl StatusObserver for flume::Sender<StatusEvent> {
    fn on_status(&self, event: &StatusEvent) {
        match self.try_send(event.clone()) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => {
                warn!("Status channel full, dropping event: {}", event);
            }
            // Nobody listening any more
            Err(flume::TrySendError::Disconnected(_)) => {}
        }
    }
}

impl StatusObserver for () {
    fn on_status(&self, _event: &StatusEvent) {}
}

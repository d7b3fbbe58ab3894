//! Aggregate client counters.

use std::fmt;
use std::time::Duration;

/// Counters kept by the client's I/O thread.
///
/// Only the I/O thread mutates them; callers get a copy once that thread
/// has stopped (see [`Client::stop`](crate::Client::stop)).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientState {
    /// Short random id used to tell clients apart in logs.
    pub client_id: String,
    pub channels_opened: u64,
    pub channels_reused: u64,
    pub channels_closed: u64,
    pub requests_registered: u64,
    pub requests_completed: u64,
    pub channels_connected: u64,
    pub connect_errors: u64,
    /// Sum of request latencies.
    pub request_duration: Duration,
    /// Sum of connect latencies.
    pub connect_duration: Duration,
}

impl ClientState {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Mean request latency, if any request completed.
    pub fn avg_request_duration(&self) -> Option<Duration> {
        average(self.request_duration, self.requests_completed)
    }

    /// Connect time spread over completed requests.
    pub fn avg_connect_duration(&self) -> Option<Duration> {
        average(self.connect_duration, self.requests_completed)
    }
}

fn average(total: Duration, count: u64) -> Option<Duration> {
    if count == 0 {
        return None;
    }
    Some(Duration::from_secs_f64(total.as_secs_f64() / count as f64))
}

/// Formats with the largest unit that keeps the value at or above one.
fn format_duration(d: Option<Duration>) -> String {
    let Some(d) = d else {
        return "n/a".to_string();
    };
    let ms = d.as_secs_f64() * 1000.0;
    if ms >= 1.0 {
        format!("{:.2} ms", ms)
    } else if ms >= 0.001 {
        format!("{:.2} µs", ms * 1000.0)
    } else {
        format!("{:.0} ns", ms * 1_000_000.0)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reqDuration={}, reqAvgDuration={}, conAvgDuration={}, reqCompleted={}, \
             chanOpened={}, chanClosed={}, chanReused={}, chanConnected={}, \
             chanConnectionErrors={}, clientId='{}', reqRegistered={}",
            format_duration(Some(self.request_duration)),
            format_duration(self.avg_request_duration()),
            format_duration(self.avg_connect_duration()),
            self.requests_completed,
            self.channels_opened,
            self.channels_closed,
            self.channels_reused,
            self.channels_connected,
            self.connect_errors,
            self.client_id,
            self.requests_registered,
        )
    }
}

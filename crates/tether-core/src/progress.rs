//! Progress reporting.
//!
//! Producers publish [`ProgressEvent`]s on a [`ProgressBus`]. Delivery is
//! best-effort: there is no backpressure, a subscriber that falls behind loses
//! the oldest events, and events published while nobody listens are dropped.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;

/// Name of the channel the GUI shell listens on for [`ProgressEvent`]s.
pub const PROGRESS_CHANNEL: &str = "progress-update";

/// Channel carrying a failed operation's [`ErrorReport`](crate::ErrorReport).
pub const ERROR_CHANNEL: &str = "install-error";

/// Minimum spacing between two throttled progress events.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Idle,
    Verify,
    Jre,
    Butler,
    Pwr,
    Patch,
    OnlineFix,
    Launch,
    Update,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub stage: Stage,
    pub progress: f64,
    pub message: String,
    pub current_file: Option<String>,
    pub speed: Option<String>,
    pub downloaded: u64,
    pub total: u64,
}

impl ProgressEvent {
    pub fn new(stage: Stage, progress: f64, message: impl Into<String>) -> Self {
        Self {
            stage,
            progress: progress.clamp(0.0, 100.0),
            message: message.into(),
            current_file: None,
            speed: None,
            downloaded: 0,
            total: 0,
        }
    }

    #[must_use]
    pub fn with_file(mut self, current_file: impl Into<String>) -> Self {
        self.current_file = Some(current_file.into());
        self
    }

    #[must_use]
    pub fn with_transfer(mut self, speed: Option<String>, downloaded: u64, total: u64) -> Self {
        self.speed = speed;
        self.downloaded = downloaded;
        self.total = total;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ProgressEvent) {
        // No receivers is not an error for a fire-and-forget stream.
        let _ = self.sender.send(event);
    }

    pub fn report(&self, stage: Stage, progress: f64, message: impl Into<String>) {
        self.emit(ProgressEvent::new(stage, progress, message));
    }
}

/// Rate limiter for high-frequency producers such as download loops.
#[derive(Debug)]
pub(crate) struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub(crate) fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    const UNIT: f64 = 1024.0;
    const PREFIXES: [char; 6] = ['K', 'M', 'G', 'T', 'P', 'E'];

    if bytes_per_sec < UNIT {
        return format!("{bytes_per_sec:.0} B/s");
    }

    let mut value = bytes_per_sec / UNIT;
    let mut exp = 0;
    while value >= UNIT && exp < PREFIXES.len() - 1 {
        value /= UNIT;
        exp += 1;
    }
    format!("{value:.1} {}B/s", PREFIXES[exp])
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{ProgressBus, ProgressEvent, Stage, Throttle, format_speed};

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = ProgressBus::new();
        bus.report(Stage::Verify, 10.0, "Checking for game updates");
    }

    #[test]
    fn late_subscriber_sees_no_replay() {
        let bus = ProgressBus::new();
        bus.report(Stage::Pwr, 10.0, "early");
        let mut rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn event_serializes_with_gui_field_names() {
        let event = ProgressEvent::new(Stage::OnlineFix, 42.0, "Extracting archive...")
            .with_file("online-fix.zip")
            .with_transfer(Some("1.0 MB/s".to_string()), 10, 20);
        let json = serde_json::to_value(&event).expect("event should serialize");

        assert_eq!(json["stage"], "online-fix");
        assert_eq!(json["currentFile"], "online-fix.zip");
        assert_eq!(json["downloaded"], 10);
    }

    #[test]
    fn progress_is_clamped_to_percent_range() {
        let event = ProgressEvent::new(Stage::Jre, 140.0, "overshoot");
        assert!((event.progress - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn throttle_spaces_events() {
        let mut throttle = Throttle::new(Duration::from_millis(200));
        let start = Instant::now();

        assert!(throttle.ready(start));
        assert!(!throttle.ready(start + Duration::from_millis(100)));
        assert!(throttle.ready(start + Duration::from_millis(250)));
    }

    #[test]
    fn format_speed_uses_binary_units() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(2048.0), "2.0 KB/s");
        assert_eq!(format_speed(3.5 * 1024.0 * 1024.0), "3.5 MB/s");
    }
}

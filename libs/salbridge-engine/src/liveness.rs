use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tokio::time::Instant;

use salbridge_api::Sample;

use crate::config::LivenessConfig;

/// Heartbeat transit skew classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SkewLevel {
    Ok,
    Warning,
    Error,
}

#[derive(Default)]
struct Beats {
    last_seen: Cell<Option<Instant>>,
    last_skew: Cell<Option<f64>>,
    count: Cell<u64>,
}

/// Tracks heartbeats of one remote.
///
/// Heartbeats are consumed through an ordinary registry subscription (see
/// [`callback`](Self::callback)); staleness is evaluated on the UI tick.
pub struct LivenessMonitor {
    stale_after: Duration,
    skew_warning: f64,
    skew_error: f64,
    beats: Rc<Beats>,
    beats_at_stale: Option<u64>,
}

impl LivenessMonitor {
    pub fn new(config: &LivenessConfig) -> Self {
        Self {
            stale_after: config.stale_after(),
            skew_warning: config.skew_warning().as_secs_f64(),
            skew_error: config.skew_error().as_secs_f64(),
            beats: Rc::new(Beats::default()),
            beats_at_stale: None,
        }
    }

    /// Subscriber callback for the heartbeat topic.
    pub fn callback(&self) -> impl FnMut(&Sample) + 'static {
        let beats = self.beats.clone();
        move |sample: &Sample| {
            beats.last_seen.set(Some(Instant::now()));
            beats.last_skew.set(Some(sample.transit_skew()));
            beats.count.set(beats.count.get() + 1);
        }
    }

    /// Restart the grace window, on entering CONNECTED.
    pub fn reset(&mut self, now: Instant) {
        self.beats.last_seen.set(Some(now));
        self.beats_at_stale = None;
    }

    /// No heartbeat for longer than the threshold.
    pub fn is_overdue(&self, now: Instant) -> bool {
        self.since_last(now).is_some_and(|elapsed| elapsed > self.stale_after)
    }

    pub fn mark_stale(&mut self) {
        self.beats_at_stale = Some(self.beats.count.get());
    }

    /// A heartbeat arrived since [`mark_stale`](Self::mark_stale).
    pub fn recovered(&self) -> bool {
        self.beats_at_stale.is_some_and(|at| self.beats.count.get() > at)
    }

    pub fn since_last(&self, now: Instant) -> Option<Duration> {
        self.beats.last_seen.get().map(|t| now.saturating_duration_since(t))
    }

    pub fn heartbeats(&self) -> u64 {
        self.beats.count.get()
    }

    /// Signed transit skew of the last heartbeat, in seconds.
    pub fn last_skew(&self) -> Option<f64> {
        self.beats.last_skew.get()
    }

    pub fn skew(&self) -> Option<SkewLevel> {
        self.last_skew().map(|skew| self.classify(skew))
    }

    pub fn classify(&self, skew: f64) -> SkewLevel {
        let skew = skew.abs();
        if skew > self.skew_error {
            SkewLevel::Error
        } else if skew > self.skew_warning {
            SkewLevel::Warning
        } else {
            SkewLevel::Ok
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use rstest::rstest;
    use salbridge_api::{Fields, RemoteId};

    use super::*;

    fn heartbeat(skew: Duration) -> Sample {
        let captured = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        Sample {
            topic: RemoteId::new("MTM1M3").topic("heartbeat"),
            seq: 1,
            captured,
            received: captured + skew,
            priority: true,
            fields: Fields::new(),
        }
    }

    #[rstest]
    #[case(Duration::from_millis(2), SkewLevel::Ok)]
    #[case(Duration::from_millis(10), SkewLevel::Ok)]
    #[case(Duration::from_millis(11), SkewLevel::Warning)]
    #[case(Duration::from_millis(501), SkewLevel::Error)]
    fn classifies_heartbeat_skew(#[case] skew: Duration, #[case] level: SkewLevel) {
        let monitor = LivenessMonitor::new(&LivenessConfig::default());
        let mut callback = monitor.callback();
        callback(&heartbeat(skew));
        assert_eq!(monitor.skew(), Some(level));
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_after_missed_heartbeats() {
        let mut monitor = LivenessMonitor::new(&LivenessConfig::default());
        let start = Instant::now();
        monitor.reset(start);
        assert!(!monitor.is_overdue(start + Duration::from_millis(3000)));
        assert!(monitor.is_overdue(start + Duration::from_millis(3001)));

        monitor.mark_stale();
        assert!(!monitor.recovered());
        let mut callback = monitor.callback();
        callback(&heartbeat(Duration::ZERO));
        assert!(monitor.recovered());
        assert_eq!(monitor.heartbeats(), 1);
    }
}

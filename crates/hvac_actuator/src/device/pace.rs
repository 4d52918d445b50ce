//! Command pacing

use std::time::Duration;

use tokio::time::Instant;

/// Drops repeats of the same command sent too soon after each other
///
/// A different command always passes and restarts the clock. The same
/// command passes again once `pace` has elapsed since it was last admitted.
#[derive(Debug)]
pub struct Pacer<C> {
    pace: Option<Duration>,
    last: Option<(C, Instant)>,
}

impl<C: PartialEq + Clone> Pacer<C> {
    pub fn new(pace: Option<Duration>) -> Self {
        Self { pace, last: None }
    }

    /// Decide whether `command` should reach the hardware, recording it if so
    pub fn admit(&mut self, command: &C, now: Instant) -> bool {
        let Some(pace) = self.pace else {
            self.record(command.clone(), now);
            return true;
        };

        if let Some((last, at)) = &self.last {
            if last == command && now.saturating_duration_since(*at) < pace {
                return false;
            }
        }

        self.record(command.clone(), now);
        true
    }

    /// Note a write that happened outside [`admit`](Self::admit)
    pub fn record(&mut self, command: C, now: Instant) {
        self.last = Some((command, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_pace_everything_passes() {
        let mut pacer = Pacer::new(None);
        let now = Instant::now();

        assert!(pacer.admit(&1, now));
        assert!(pacer.admit(&1, now));
    }

    #[test]
    fn same_command_within_pace_is_dropped() {
        let mut pacer = Pacer::new(Some(Duration::from_secs(30)));
        let start = Instant::now();

        assert!(pacer.admit(&true, start));
        assert!(!pacer.admit(&true, start + Duration::from_secs(29)));
        assert!(pacer.admit(&true, start + Duration::from_secs(30)));
        // Clock restarted by the last admission
        assert!(!pacer.admit(&true, start + Duration::from_secs(45)));
    }

    #[test]
    fn different_command_passes_and_restarts_clock() {
        let mut pacer = Pacer::new(Some(Duration::from_secs(30)));
        let start = Instant::now();

        assert!(pacer.admit(&true, start));
        assert!(pacer.admit(&false, start + Duration::from_secs(1)));
        assert!(pacer.admit(&true, start + Duration::from_secs(2)));
        assert!(!pacer.admit(&true, start + Duration::from_secs(3)));
    }
}

//! Retry backoff schedules consulted by the dispatcher on transient
//! failure, per spec.md §4.5: `backoff(envelope, attempts+1) -> Option<Duration>`,
//! where `None` means "stop retrying, treat as permanent".

use std::sync::Arc;
use std::time::Duration;

use crate::envelope::Envelope;

/// A user-supplied retry schedule. Takes the envelope (so a deployment
/// could vary the schedule per sender or size) and the attempt number
/// about to be made (1-based); returns the delay before that attempt, or
/// `None` once no further attempt should be made.
pub type Backoff = Arc<dyn Fn(&Envelope, u32) -> Option<Duration> + Send + Sync>;

/// Five-step exponential schedule (1m, 5m, 15m, 30m, 1h), then gives up.
/// Matches spec.md §8 scenario 3: the sixth call returns `None`.
pub fn exponential() -> Backoff {
    const SCHEDULE_SECS: [u64; 5] = [60, 300, 900, 1800, 3600];
    Arc::new(|_envelope: &Envelope, attempt: u32| {
        SCHEDULE_SECS
            .get((attempt.saturating_sub(1)) as usize)
            .map(|secs| Duration::from_secs(*secs))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn envelope() -> Envelope {
        let meta = crate::envelope::SessionMetadata::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            crate::envelope::Protocol::Esmtp,
        );
        Envelope::new(meta)
    }

    #[test]
    fn gives_up_after_five_attempts() {
        let backoff = exponential();
        let env = envelope();
        for attempt in 1..=5 {
            assert!(backoff(&env, attempt).is_some(), "attempt {attempt} should retry");
        }
        assert!(backoff(&env, 6).is_none());
    }

    #[test]
    fn schedule_is_increasing() {
        let backoff = exponential();
        let env = envelope();
        let mut last = Duration::ZERO;
        for attempt in 1..=5 {
            let delay = backoff(&env, attempt).unwrap();
            assert!(delay > last);
            last = delay;
        }
    }
}

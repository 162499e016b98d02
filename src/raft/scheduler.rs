use super::Options;

use crossbeam::channel::{self, Receiver};
use rand::Rng as _;
use std::time::{Duration, Instant};

/// Schedules the node's timers as channels. The actor's event loop selects
/// over the current role's timer channels, so cancelling a timer is simply
/// dropping the role that owns it.
pub struct Scheduler {
    election_timeout: std::ops::Range<Duration>,
    replication_interval: Duration,
}

impl Scheduler {
    pub fn new(opts: &Options) -> Self {
        Self {
            election_timeout: opts.election_timeout.clone(),
            replication_interval: opts.replication_interval,
        }
    }

    /// Schedules a one-shot election timeout, randomized within the
    /// configured range to avoid repeated split votes.
    pub fn election_timer(&self) -> ElectionTimer {
        let min = self.election_timeout.start.as_millis() as u64;
        let max = self.election_timeout.end.as_millis() as u64;
        let timeout = Duration::from_millis(rand::thread_rng().gen_range(min..max));
        ElectionTimer { rx: channel::after(timeout), armed: true }
    }

    /// Schedules the leader's periodic log replication tick.
    pub fn replication_ticker(&self) -> ReplicationTicker {
        ReplicationTicker { rx: channel::tick(self.replication_interval) }
    }
}

/// A cancellable one-shot election timeout. Owned by the Follower and
/// Candidate roles; dropping the role cancels it.
#[derive(Debug)]
pub struct ElectionTimer {
    rx: Receiver<Instant>,
    armed: bool,
}

impl ElectionTimer {
    /// An election timer that never fires, for standby followers.
    pub fn never() -> Self {
        Self { rx: channel::never(), armed: false }
    }

    /// Whether the timer is armed at all. A standby follower's timer is not,
    /// and must not be rearmed by leader contact.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub(crate) fn receiver(&self) -> Receiver<Instant> {
        self.rx.clone()
    }
}

/// The leader's periodic replication ticker. Dropping the Leader role
/// cancels it.
#[derive(Debug)]
pub struct ReplicationTicker {
    rx: Receiver<Instant>,
}

impl ReplicationTicker {
    pub(crate) fn receiver(&self) -> Receiver<Instant> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Mode;

    #[test]
    fn election_timer_fires_within_range() {
        let opts = Options {
            election_timeout: Duration::from_millis(10)..Duration::from_millis(20),
            mode: Mode::Active,
            ..Options::default()
        };
        let scheduler = Scheduler::new(&opts);
        let timer = scheduler.election_timer();
        assert!(timer.is_armed());
        let start = Instant::now();
        timer.receiver().recv().expect("timer did not fire");
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(9), "fired after {elapsed:?}");
        assert!(elapsed < Duration::from_millis(100), "fired after {elapsed:?}");
    }

    #[test]
    fn never_timer_does_not_fire() {
        let timer = ElectionTimer::never();
        assert!(!timer.is_armed());
        assert!(timer
            .receiver()
            .recv_timeout(Duration::from_millis(20))
            .is_err());
    }
}

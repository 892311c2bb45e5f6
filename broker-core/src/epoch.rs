//! Converts a lifetime into absolute, wall-clock-aligned epoch boundaries.
//!
//! Epoch numbers must agree across independent, restarting, clock-synced
//! nodes, so they are derived from absolute Unix time, never from
//! process-start time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::clock::DynClock;

/// The epoch number for `now` under a lifetime of `lifetime`: `floor(now /
/// lifetime)`, using Unix-epoch seconds.
///
/// Panics if `lifetime` is zero or if `now` predates the Unix epoch -- both
/// indicate a misconfiguration the caller should have rejected already.
pub fn epoch_number(now: SystemTime, lifetime: Duration) -> u64 {
    assert!(!lifetime.is_zero(), "epoch lifetime must be non-zero");
    let elapsed = now
        .duration_since(UNIX_EPOCH)
        .expect("clock is before the Unix epoch");
    elapsed.as_secs() / lifetime.as_secs().max(1)
}

/// The instant at which `epoch` begins, under `lifetime`.
pub fn epoch_start(epoch: u64, lifetime: Duration) -> SystemTime {
    UNIX_EPOCH + lifetime * epoch as u32
}

/// Waits out absolute epoch boundaries for a fixed lifetime, yielding the new
/// epoch number each time one arrives.
///
/// On a backward clock jump, the scheduler does not regress: the sleep is
/// always computed from the target boundary's absolute instant, so a clock
/// that jumps backward just means the scheduler waits longer for that same,
/// still-future boundary. It never re-emits an epoch it already emitted.
pub struct EpochScheduler {
    clock: DynClock,
    lifetime: Duration,
    last_emitted: Option<u64>,
}

impl EpochScheduler {
    pub fn new(clock: DynClock, lifetime: Duration) -> Self {
        Self {
            clock,
            lifetime,
            last_emitted: None,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// The epoch number for the current instant.
    pub fn current_epoch(&self) -> u64 {
        epoch_number(self.clock.now(), self.lifetime)
    }

    /// Waits until the next unseen epoch boundary and returns its number.
    ///
    /// The first call returns the *current* epoch immediately (this lets
    /// rotators populate their initial `current`/`previous` pair at startup
    /// without waiting a full lifetime).
    pub async fn tick(&mut self) -> u64 {
        let current = self.current_epoch();
        match self.last_emitted {
            None => {
                self.last_emitted = Some(current);
                return current;
            }
            Some(last) if current > last => {
                self.last_emitted = Some(current);
                return current;
            }
            _ => {}
        }

        loop {
            let next_epoch = self.last_emitted.expect("set above") + 1;
            let boundary = epoch_start(next_epoch, self.lifetime);
            sleep_until_instant(boundary).await;

            let current = self.current_epoch();
            if current > self.last_emitted.expect("set above") {
                self.last_emitted = Some(current);
                return current;
            }
            // Spurious wakeup or clock jumped backward again; loop and wait
            // for the boundary again.
        }
    }
}

/// Sleeps until `target`, clamping to zero if `target` is already in the
/// past (which happens on the very first boundary after a restart).
async fn sleep_until_instant(target: SystemTime) {
    let now = SystemTime::now();
    let delta = target.duration_since(now).unwrap_or(Duration::ZERO);
    tokio::time::sleep(delta).await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn epoch_number_is_floor_division() {
        let lifetime = Duration::from_secs(60);
        let t0 = UNIX_EPOCH + Duration::from_secs(119);
        let t1 = UNIX_EPOCH + Duration::from_secs(120);
        assert_eq!(epoch_number(t0, lifetime), 1);
        assert_eq!(epoch_number(t1, lifetime), 2);
    }

    #[test]
    fn epoch_start_round_trips() {
        let lifetime = Duration::from_secs(30);
        let epoch = 7;
        let start = epoch_start(epoch, lifetime);
        assert_eq!(epoch_number(start, lifetime), epoch);
    }

    #[test]
    fn two_instances_with_same_inputs_agree() {
        // Epoch stability: constant clock + lifetime -> same epoch number,
        // independent of process identity.
        let lifetime = Duration::from_secs(45);
        let now = UNIX_EPOCH + Duration::from_secs(123_456);
        assert_eq!(epoch_number(now, lifetime), epoch_number(now, lifetime));
    }
}

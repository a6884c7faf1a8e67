//! Heartbeat bookkeeping for the I/O thread.
//!
//! Two timers run per connection: `Tx` fires at the negotiated interval and
//! emits a heartbeat frame if nothing else was written since the last fire;
//! `Rx` fires at the read-deadline interval and kills the connection if
//! nothing was read since the last fire. Activity is recorded on every
//! socket read/write, so a busy connection never sends a useless heartbeat
//! and never trips the read deadline.

use log::trace;
use mio_extras::timer::{Timeout, Timer};
use std::fmt::Debug;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum HeartbeatState {
    StillRunning,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum HeartbeatKind {
    Rx,
    Tx,
}

#[derive(Debug)]
struct Heartbeat<T: Copy + Debug> {
    val: T,
    last: Instant,
    timeout: Timeout,
    interval: Duration,
}

impl<T: Copy + Debug> Heartbeat<T> {
    fn start(val: T, interval: Duration, timer: &mut Timer<T>) -> Heartbeat<T> {
        assert!(
            interval > Duration::from_millis(0),
            "timer interval cannot be 0"
        );
        let last = Instant::now();
        let timeout = timer.set_timeout(interval, val);
        Heartbeat {
            val,
            last,
            timeout,
            interval,
        }
    }

    fn record_activity(&mut self) {
        self.last = Instant::now();
    }

    fn fire(&mut self, timer: &mut Timer<T>) -> HeartbeatState {
        timer.cancel_timeout(&self.timeout);

        // See if the timer has expired (restart for the full interval) or if
        // there have been intervening record_activity() calls (restart for
        // the remaining time). A few ms of fudge handles imprecise wakeups;
        // AMQP heartbeats are scaled in seconds, so that is harmless.
        let elapsed = self.last.elapsed();
        let (when, state) = if self.interval <= elapsed + Duration::from_millis(5) {
            (self.interval, HeartbeatState::Expired)
        } else {
            (self.interval - elapsed, HeartbeatState::StillRunning)
        };

        trace!(
            "setting new heartbeat timer {:?} for {:?} (interval = {:?}, elapsed = {:?})",
            self.val,
            when,
            self.interval,
            elapsed
        );
        self.timeout = timer.set_timeout(when, self.val);
        state
    }
}

struct RxTx {
    rx: Option<Heartbeat<HeartbeatKind>>,
    tx: Option<Heartbeat<HeartbeatKind>>,
}

/// The pair of connection timers, owned by the I/O loop and registered with
/// its poll handle.
pub(crate) struct HeartbeatTimers {
    pub(crate) timer: Timer<HeartbeatKind>,
    heartbeats: Option<RxTx>,
}

impl Default for HeartbeatTimers {
    fn default() -> HeartbeatTimers {
        HeartbeatTimers {
            timer: Timer::default(),
            heartbeats: None,
        }
    }
}

impl HeartbeatTimers {
    /// Start the timers after tuning. `tx_interval` is the negotiated
    /// heartbeat (None when heartbeats are disabled); `rx_deadline` is the
    /// read deadline, already resolved to
    /// `max(2 x heartbeat, socket read timeout)` by the caller (None when
    /// both are disabled).
    pub(crate) fn start(&mut self, tx_interval: Option<Duration>, rx_deadline: Option<Duration>) {
        assert!(
            self.heartbeats.is_none(),
            "heartbeat timer started multiple times"
        );
        let rx = rx_deadline.map(|d| Heartbeat::start(HeartbeatKind::Rx, d, &mut self.timer));
        let tx = tx_interval.map(|d| Heartbeat::start(HeartbeatKind::Tx, d, &mut self.timer));
        self.heartbeats = Some(RxTx { rx, tx });
    }

    pub(crate) fn record_rx_activity(&mut self) {
        if let Some(hb) = self.heartbeats.as_mut().and_then(|h| h.rx.as_mut()) {
            trace!("recording activity for rx heartbeat");
            hb.record_activity();
        }
    }

    pub(crate) fn record_tx_activity(&mut self) {
        if let Some(hb) = self.heartbeats.as_mut().and_then(|h| h.tx.as_mut()) {
            trace!("recording activity for tx heartbeat");
            hb.record_activity();
        }
    }

    pub(crate) fn fire_rx(&mut self) -> HeartbeatState {
        match self.heartbeats.as_mut().and_then(|h| h.rx.as_mut()) {
            Some(hb) => hb.fire(&mut self.timer),
            None => HeartbeatState::StillRunning,
        }
    }

    pub(crate) fn fire_tx(&mut self) -> HeartbeatState {
        match self.heartbeats.as_mut().and_then(|h| h.tx.as_mut()) {
            Some(hb) => hb.fire(&mut self.timer),
            None => HeartbeatState::StillRunning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, PollOpt, Ready, Token};
    use mio_extras::timer::Builder;

    struct Harness {
        poll: Poll,
        events: Events,
        timer: Timer<u32>,
    }

    impl Harness {
        const TOKEN: Token = Token(0);

        fn new() -> Harness {
            let poll = Poll::new().unwrap();
            let events = Events::with_capacity(16);
            let timer = Builder::default().tick_duration(millis(10)).build();
            poll.register(&timer, Self::TOKEN, Ready::readable(), PollOpt::edge())
                .unwrap();
            Harness {
                poll,
                events,
                timer,
            }
        }

        fn poll(&mut self, timeout: Duration) {
            self.poll.poll(&mut self.events, Some(timeout)).unwrap();
        }

        fn poll_until_fire(&mut self, h: &mut Heartbeat<u32>) -> HeartbeatState {
            loop {
                self.poll.poll(&mut self.events, None).unwrap();
                for ev in &self.events {
                    assert_eq!(ev.token(), Self::TOKEN);
                    if self.timer.poll().is_some() {
                        return h.fire(&mut self.timer);
                    }
                }
            }
        }
    }

    fn millis(u: u64) -> Duration {
        Duration::from_millis(u)
    }

    fn assert_duration_is_about(one: Duration, two: Duration) {
        // NOTE: assumes two is >= 50ms, or will panic on the subtraction.
        assert!(one > two - millis(50));
        assert!(one < two + millis(50));
    }

    #[test]
    fn fire_after_expiration() {
        let mut t = Harness::new();
        let mut h = Heartbeat::start(0, millis(400), &mut t.timer);
        let start = Instant::now();

        let state = t.poll_until_fire(&mut h);

        assert_duration_is_about(start.elapsed(), millis(400));
        assert_eq!(state, HeartbeatState::Expired);
    }

    #[test]
    fn fire_after_activity() {
        let mut t = Harness::new();
        let mut h = Heartbeat::start(0, millis(400), &mut t.timer);
        let start = Instant::now();

        // timer shouldn't fire yet
        t.poll(millis(200));
        assert_duration_is_about(start.elapsed(), millis(200));
        assert!(t.events.is_empty());
        h.record_activity();

        // timer should fire, but should be set back to "still running"
        let state = t.poll_until_fire(&mut h);
        assert_duration_is_about(start.elapsed(), millis(400));
        assert_eq!(state, HeartbeatState::StillRunning);

        // timer should fire again and expire in just ~200ms
        let state = t.poll_until_fire(&mut h);
        assert_duration_is_about(start.elapsed(), millis(600));
        assert_eq!(state, HeartbeatState::Expired);
    }

    #[test]
    fn disabled_timers_never_expire() {
        let mut timers = HeartbeatTimers::default();
        timers.start(None, None);
        assert_eq!(timers.fire_rx(), HeartbeatState::StillRunning);
        assert_eq!(timers.fire_tx(), HeartbeatState::StillRunning);
    }
}

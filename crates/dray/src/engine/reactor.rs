// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cooperative reactor.
//!
//! An *action* pairs an event value with a trigger:
//!
//! - `Readable(token)`: a mio-registered socket became readable
//! - `Every(period)`: an auto-rearming periodic deadline
//! - `Ready`: always eligible, gated only by the worker-side predicate
//!
//! [`poll_once`] sleeps at most until the nearest timer deadline (or the
//! caller's pacing hint, whichever is sooner) and returns the fired events
//! in registration order. Predicates live with the worker: the reactor
//! reports what is *triggered*, the worker decides what is *eligible*.
//!
//! mio delivers edge-triggered readiness, so socket handlers must drain
//! their source until `WouldBlock` before returning.
//!
//! [`poll_once`]: Reactor::poll_once

use std::io;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Registry, Token};

/// Handle to a registered action.
pub type ActionId = usize;

/// What wakes an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A socket registered with this token became readable.
    Readable(Token),
    /// Fires every `period`, auto-rearming on expiry.
    Every(Duration),
    /// Always triggered; the predicate does all the gating.
    Ready,
}

#[derive(Debug)]
struct ActionSlot<E> {
    event: E,
    trigger: Trigger,
    next_due: Option<Instant>,
    active: bool,
}

/// Readiness poller plus the action table.
#[derive(Debug)]
pub struct Reactor<E> {
    poll: Poll,
    events: Events,
    actions: Vec<ActionSlot<E>>,
}

impl<E: Copy> Reactor<E> {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            actions: Vec::new(),
        })
    }

    /// Registry for socket registration.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Register an action; actions fire in registration order.
    pub fn register(&mut self, event: E, trigger: Trigger) -> ActionId {
        let next_due = match trigger {
            Trigger::Every(period) => Some(Instant::now() + period),
            _ => None,
        };
        self.actions.push(ActionSlot {
            event,
            trigger,
            next_due,
            active: true,
        });
        self.actions.len() - 1
    }

    pub fn deactivate(&mut self, id: ActionId) {
        if let Some(slot) = self.actions.get_mut(id) {
            slot.active = false;
        }
    }

    pub fn deactivate_all(&mut self) {
        for slot in &mut self.actions {
            slot.active = false;
        }
    }

    pub fn is_active(&self, id: ActionId) -> bool {
        self.actions.get(id).is_some_and(|slot| slot.active)
    }

    /// Events of active `Ready`-triggered actions (the worker checks their
    /// predicates to decide whether the next poll may sleep).
    pub fn ready_candidates(&self) -> impl Iterator<Item = E> + '_ {
        self.actions
            .iter()
            .filter(|slot| slot.active && slot.trigger == Trigger::Ready)
            .map(|slot| slot.event)
    }

    /// Nearest deadline among active timer actions.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.actions
            .iter()
            .filter(|slot| slot.active)
            .filter_map(|slot| slot.next_due)
            .min()
    }

    /// Poll once and collect fired events into `fired` (cleared first).
    ///
    /// `timeout_hint` is an upper bound on the sleep; `None` means "sleep
    /// until something happens". The nearest timer deadline always clamps
    /// the sleep.
    pub fn poll_once(
        &mut self,
        timeout_hint: Option<Duration>,
        fired: &mut Vec<E>,
    ) -> io::Result<()> {
        fired.clear();
        let now = Instant::now();

        let timer_timeout = self
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        let timeout = match (timeout_hint, timer_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let mut readable = [false; 8];
        for event in self.events.iter() {
            if event.is_readable() {
                let Token(index) = event.token();
                if index < readable.len() {
                    readable[index] = true;
                }
            }
        }

        let now = Instant::now();
        for slot in &mut self.actions {
            if !slot.active {
                continue;
            }
            match slot.trigger {
                Trigger::Readable(Token(index)) => {
                    if index < readable.len() && readable[index] {
                        fired.push(slot.event);
                    }
                }
                Trigger::Every(period) => {
                    let due = slot.next_due.get_or_insert(now + period);
                    if *due <= now {
                        // One firing per poll, however many periods elapsed.
                        while *due <= now {
                            *due += period;
                        }
                        fired.push(slot.event);
                    }
                }
                Trigger::Ready => fired.push(slot.event),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestEvent {
        Tick,
        Fast,
        Always,
    }

    #[test]
    fn test_ready_actions_fire_every_poll() {
        let mut reactor: Reactor<TestEvent> = Reactor::new().expect("reactor");
        reactor.register(TestEvent::Always, Trigger::Ready);

        let mut fired = Vec::new();
        reactor
            .poll_once(Some(Duration::ZERO), &mut fired)
            .expect("poll");
        assert_eq!(fired, vec![TestEvent::Always]);

        reactor
            .poll_once(Some(Duration::ZERO), &mut fired)
            .expect("poll");
        assert_eq!(fired, vec![TestEvent::Always]);
    }

    #[test]
    fn test_timer_fires_after_period() {
        let mut reactor: Reactor<TestEvent> = Reactor::new().expect("reactor");
        reactor.register(TestEvent::Tick, Trigger::Every(Duration::from_millis(20)));

        let mut fired = Vec::new();
        reactor
            .poll_once(Some(Duration::ZERO), &mut fired)
            .expect("poll");
        assert!(fired.is_empty(), "not due yet");

        std::thread::sleep(Duration::from_millis(25));
        reactor
            .poll_once(Some(Duration::ZERO), &mut fired)
            .expect("poll");
        assert_eq!(fired, vec![TestEvent::Tick]);
    }

    #[test]
    fn test_timer_rearms_and_coalesces_missed_periods() {
        let mut reactor: Reactor<TestEvent> = Reactor::new().expect("reactor");
        reactor.register(TestEvent::Fast, Trigger::Every(Duration::from_millis(5)));

        std::thread::sleep(Duration::from_millis(30));
        let mut fired = Vec::new();
        reactor
            .poll_once(Some(Duration::ZERO), &mut fired)
            .expect("poll");
        assert_eq!(fired, vec![TestEvent::Fast], "one firing per poll");

        reactor
            .poll_once(Some(Duration::ZERO), &mut fired)
            .expect("poll");
        assert!(fired.is_empty(), "deadline advanced past now");
    }

    #[test]
    fn test_deactivated_action_never_fires() {
        let mut reactor: Reactor<TestEvent> = Reactor::new().expect("reactor");
        let id = reactor.register(TestEvent::Always, Trigger::Ready);
        reactor.deactivate(id);
        assert!(!reactor.is_active(id));

        let mut fired = Vec::new();
        reactor
            .poll_once(Some(Duration::ZERO), &mut fired)
            .expect("poll");
        assert!(fired.is_empty());
    }

    #[test]
    fn test_fired_order_matches_registration_order() {
        let mut reactor: Reactor<TestEvent> = Reactor::new().expect("reactor");
        reactor.register(TestEvent::Always, Trigger::Ready);
        reactor.register(TestEvent::Tick, Trigger::Ready);

        let mut fired = Vec::new();
        reactor
            .poll_once(Some(Duration::ZERO), &mut fired)
            .expect("poll");
        assert_eq!(fired, vec![TestEvent::Always, TestEvent::Tick]);
    }

    #[test]
    fn test_poll_sleeps_until_nearest_deadline() {
        let mut reactor: Reactor<TestEvent> = Reactor::new().expect("reactor");
        reactor.register(TestEvent::Tick, Trigger::Every(Duration::from_millis(15)));

        let start = Instant::now();
        let mut fired = Vec::new();
        // No hint: the timer deadline must bound the sleep.
        reactor.poll_once(None, &mut fired).expect("poll");
        assert!(
            start.elapsed() < Duration::from_millis(200),
            "poll must wake for the timer"
        );
    }

    #[test]
    fn test_ready_candidates_lists_active_only() {
        let mut reactor: Reactor<TestEvent> = Reactor::new().expect("reactor");
        let a = reactor.register(TestEvent::Always, Trigger::Ready);
        reactor.register(TestEvent::Tick, Trigger::Every(Duration::from_secs(1)));

        assert_eq!(reactor.ready_candidates().count(), 1);
        reactor.deactivate(a);
        assert_eq!(reactor.ready_candidates().count(), 0);
    }
}

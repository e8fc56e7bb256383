// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-capability circuit breaker (C5): a 3-state machine (closed, open,
//! half-open) with an explicit, tested transition table, same spirit as a
//! run-lifecycle state machine but applied to executor health instead of
//! run status.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Circuit breaker state for one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Requests flow normally; failures accumulate toward the threshold.
    Closed,
    /// Requests are rejected outright until the cooldown elapses.
    Open,
    /// Cooldown elapsed; exactly one probe request is admitted.
    HalfOpen,
}

impl State {
    /// The states directly reachable from `self` per spec §4.5's table.
    #[must_use]
    pub fn valid_transitions(self) -> &'static [State] {
        match self {
            State::Closed => &[State::Open],
            State::Open => &[State::HalfOpen],
            State::HalfOpen => &[State::Closed, State::Open],
        }
    }

    /// Whether `self -> next` is one of the table's allowed edges.
    #[must_use]
    pub fn can_transition_to(self, next: State) -> bool {
        self.valid_transitions().contains(&next)
    }
}

struct Cell {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Cell {
    fn new() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_probe_at: None,
            probe_in_flight: false,
        }
    }
}

/// Point-in-time view of one capability's breaker cell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current state.
    pub state: State,
    /// Consecutive failures recorded in the closed state.
    pub consecutive_failures: u32,
}

/// Per-capability circuit breaker registry.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    cells: Mutex<HashMap<String, Cell>>,
}

impl CircuitBreaker {
    /// Create a breaker registry with the given failure threshold and
    /// open-state cooldown.
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a request for `capability_id` should be admitted.
    ///
    /// Returns `false` only while open. Transitions open -> half-open
    /// lazily on this call once the cooldown has elapsed. In half-open,
    /// only the first caller is admitted as the probe; concurrent callers
    /// are rejected until that probe resolves.
    pub fn allow_request(&self, capability_id: &str) -> bool {
        let mut cells = self.cells.lock().unwrap();
        let cell = cells.entry(capability_id.to_string()).or_insert_with(Cell::new);
        match cell.state {
            State::Closed => true,
            State::Open => {
                let Some(next_probe_at) = cell.next_probe_at else {
                    return false;
                };
                if Instant::now() >= next_probe_at {
                    cell.state = State::HalfOpen;
                    cell.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => {
                if cell.probe_in_flight {
                    false
                } else {
                    cell.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful invocation outcome.
    ///
    /// In closed state, resets the failure counter. In half-open, the
    /// probe succeeded: transition to closed.
    pub fn record_success(&self, capability_id: &str) {
        let mut cells = self.cells.lock().unwrap();
        let cell = cells.entry(capability_id.to_string()).or_insert_with(Cell::new);
        match cell.state {
            State::Closed => {
                cell.consecutive_failures = 0;
            }
            State::HalfOpen => {
                cell.state = State::Closed;
                cell.consecutive_failures = 0;
                cell.opened_at = None;
                cell.next_probe_at = None;
                cell.probe_in_flight = false;
            }
            State::Open => {}
        }
    }

    /// Record a failed invocation outcome.
    ///
    /// In closed state, increments the failure counter and opens the
    /// breaker once it reaches the threshold. In half-open, the probe
    /// failed: reopen and reset the cooldown.
    pub fn record_failure(&self, capability_id: &str) {
        let mut cells = self.cells.lock().unwrap();
        let cell = cells.entry(capability_id.to_string()).or_insert_with(Cell::new);
        match cell.state {
            State::Closed => {
                cell.consecutive_failures += 1;
                if cell.consecutive_failures >= self.failure_threshold {
                    cell.state = State::Open;
                    cell.opened_at = Some(Instant::now());
                    cell.next_probe_at = Some(Instant::now() + self.cooldown);
                }
            }
            State::HalfOpen => {
                cell.state = State::Open;
                cell.opened_at = Some(Instant::now());
                cell.next_probe_at = Some(Instant::now() + self.cooldown);
                cell.probe_in_flight = false;
            }
            State::Open => {}
        }
    }

    /// Snapshot one capability's current state, defaulting to closed if
    /// never observed.
    #[must_use]
    pub fn snapshot(&self, capability_id: &str) -> Snapshot {
        let cells = self.cells.lock().unwrap();
        match cells.get(capability_id) {
            Some(cell) => Snapshot {
                state: cell.state,
                consecutive_failures: cell.consecutive_failures,
            },
            None => Snapshot {
                state: State::Closed,
                consecutive_failures: 0,
            },
        }
    }

    /// Force a capability's breaker back to closed. Administrative reset.
    pub fn reset(&self, capability_id: &str) {
        let mut cells = self.cells.lock().unwrap();
        cells.insert(capability_id.to_string(), Cell::new());
    }

    /// Release a half-open probe that was admitted but never reached the
    /// executor (rejected for an unrelated reason, e.g. no eligible executor
    /// or queue saturation). Reverts `HalfOpen` to `Open` without resetting
    /// `next_probe_at`, so the next probe is attempted as soon as the
    /// original cooldown elapses rather than being wedged indefinitely.
    pub fn release_probe(&self, capability_id: &str) {
        let mut cells = self.cells.lock().unwrap();
        if let Some(cell) = cells.get_mut(capability_id) {
            if cell.state == State::HalfOpen {
                cell.state = State::Open;
                cell.probe_in_flight = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_table_matches_spec() {
        assert!(State::Closed.can_transition_to(State::Open));
        assert!(State::Open.can_transition_to(State::HalfOpen));
        assert!(State::HalfOpen.can_transition_to(State::Closed));
        assert!(State::HalfOpen.can_transition_to(State::Open));
        assert!(!State::Closed.can_transition_to(State::HalfOpen));
        assert!(!State::Open.can_transition_to(State::Closed));
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        for _ in 0..2 {
            breaker.record_failure("cap.a.v1");
            assert_eq!(breaker.snapshot("cap.a.v1").state, State::Closed);
        }
        breaker.record_failure("cap.a.v1");
        assert_eq!(breaker.snapshot("cap.a.v1").state, State::Open);
        assert!(!breaker.allow_request("cap.a.v1"));
    }

    #[test]
    fn success_resets_failure_counter() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure("cap.a.v1");
        breaker.record_failure("cap.a.v1");
        breaker.record_success("cap.a.v1");
        assert_eq!(breaker.snapshot("cap.a.v1").consecutive_failures, 0);
    }

    #[test]
    fn half_open_probe_admits_one_then_blocks() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(5));
        breaker.record_failure("cap.a.v1");
        assert_eq!(breaker.snapshot("cap.a.v1").state, State::Open);
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow_request("cap.a.v1"));
        assert_eq!(breaker.snapshot("cap.a.v1").state, State::HalfOpen);
        assert!(!breaker.allow_request("cap.a.v1"));
    }

    #[test]
    fn half_open_success_closes() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(5));
        breaker.record_failure("cap.a.v1");
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow_request("cap.a.v1"));
        breaker.record_success("cap.a.v1");
        assert_eq!(breaker.snapshot("cap.a.v1").state, State::Closed);
        assert!(breaker.allow_request("cap.a.v1"));
    }

    #[test]
    fn half_open_failure_reopens_and_resets_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        breaker.record_failure("cap.a.v1");
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.allow_request("cap.a.v1"));
        breaker.record_failure("cap.a.v1");
        assert_eq!(breaker.snapshot("cap.a.v1").state, State::Open);
        assert!(!breaker.allow_request("cap.a.v1"));
    }

    #[test]
    fn admin_reset_forces_closed() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure("cap.a.v1");
        assert_eq!(breaker.snapshot("cap.a.v1").state, State::Open);
        breaker.reset("cap.a.v1");
        assert_eq!(breaker.snapshot("cap.a.v1").state, State::Closed);
        assert!(breaker.allow_request("cap.a.v1"));
    }

    #[test]
    fn release_probe_reverts_half_open_without_resetting_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(15));
        breaker.record_failure("cap.a.v1");
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request("cap.a.v1"));
        assert_eq!(breaker.snapshot("cap.a.v1").state, State::HalfOpen);

        breaker.release_probe("cap.a.v1");
        assert_eq!(breaker.snapshot("cap.a.v1").state, State::Open);
        // Cooldown already elapsed before the probe was released, so the
        // breaker immediately admits a fresh probe rather than wedging.
        assert!(breaker.allow_request("cap.a.v1"));
    }

    #[test]
    fn unseen_capability_defaults_to_closed() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        assert_eq!(breaker.snapshot("cap.never-seen.v1").state, State::Closed);
        assert!(breaker.allow_request("cap.never-seen.v1"));
    }
}

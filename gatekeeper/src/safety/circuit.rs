//! Per-session circuit breaker.
//!
//! A session that reaches any ceiling (operations, wall-clock seconds or
//! privilege escalations) stays paused until a human explicitly continues it.
//! Continuation opens a new segment; lifetime totals are kept.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::Ceiling;
use crate::io::config::CircuitBreakerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session {session} paused: {ceiling} ceiling reached ({current}/{limit})")]
pub struct CircuitTripped {
    pub session: String,
    pub ceiling: Ceiling,
    pub current: u64,
    pub limit: u64,
}

/// Counters for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBudget {
    pub total_operations: u64,
    pub total_escalations: u64,
    pub segment_operations: u64,
    pub segment_escalations: u64,
    pub segment_started: Instant,
    pub tripped: Option<Ceiling>,
    pub continuations: u32,
}

impl SessionBudget {
    fn new(now: Instant) -> Self {
        Self {
            total_operations: 0,
            total_escalations: 0,
            segment_operations: 0,
            segment_escalations: 0,
            segment_started: now,
            tripped: None,
            continuations: 0,
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    sessions: Mutex<HashMap<String, SessionBudget>>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            config: config.clone(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn max_wall_clock(&self) -> Duration {
        Duration::from_secs(self.config.max_seconds)
    }

    /// First ceiling that one more operation would cross, if any.
    fn exceeded(
        &self,
        session: &str,
        budget: &SessionBudget,
        escalation: bool,
        now: Instant,
    ) -> Option<CircuitTripped> {
        let trip = |ceiling, current, limit| CircuitTripped {
            session: session.to_string(),
            ceiling,
            current,
            limit,
        };
        if let Some(ceiling) = budget.tripped {
            let (current, limit) = match ceiling {
                Ceiling::Operations => (
                    budget.segment_operations,
                    u64::from(self.config.max_operations),
                ),
                Ceiling::WallClock => (
                    now.saturating_duration_since(budget.segment_started)
                        .as_secs(),
                    self.config.max_seconds,
                ),
                Ceiling::Escalations => (
                    budget.segment_escalations,
                    u64::from(self.config.max_escalations),
                ),
            };
            return Some(trip(ceiling, current, limit));
        }
        let max_ops = u64::from(self.config.max_operations);
        if budget.segment_operations >= max_ops {
            return Some(trip(Ceiling::Operations, budget.segment_operations, max_ops));
        }
        let elapsed = now.saturating_duration_since(budget.segment_started);
        if elapsed >= self.max_wall_clock() {
            return Some(trip(
                Ceiling::WallClock,
                elapsed.as_secs(),
                self.config.max_seconds,
            ));
        }
        let max_esc = u64::from(self.config.max_escalations);
        if escalation && budget.segment_escalations >= max_esc {
            return Some(trip(
                Ceiling::Escalations,
                budget.segment_escalations,
                max_esc,
            ));
        }
        None
    }

    /// Peek without counting anything.
    pub fn check_at(
        &self,
        session: &str,
        escalation: bool,
        now: Instant,
    ) -> Result<(), CircuitTripped> {
        let Ok(sessions) = self.sessions.lock() else {
            return Err(poisoned(session));
        };
        let fresh;
        let budget = match sessions.get(session) {
            Some(budget) => budget,
            None => {
                fresh = SessionBudget::new(now);
                &fresh
            }
        };
        match self.exceeded(session, budget, escalation, now) {
            Some(tripped) => Err(tripped),
            None => Ok(()),
        }
    }

    /// Count one operation, or trip the breaker and refuse it.
    pub fn admit_at(
        &self,
        session: &str,
        escalation: bool,
        now: Instant,
    ) -> Result<(), CircuitTripped> {
        let Ok(mut sessions) = self.sessions.lock() else {
            return Err(poisoned(session));
        };
        let budget = sessions
            .entry(session.to_string())
            .or_insert_with(|| SessionBudget::new(now));
        if let Some(tripped) = self.exceeded(session, budget, escalation, now) {
            if budget.tripped.is_none() {
                warn!(session, ceiling = tripped.ceiling.as_str(), "circuit breaker tripped");
                budget.tripped = Some(tripped.ceiling);
            }
            return Err(tripped);
        }
        budget.segment_operations += 1;
        budget.total_operations += 1;
        if escalation {
            budget.segment_escalations += 1;
            budget.total_escalations += 1;
        }
        Ok(())
    }

    /// Give back an admission whose execution never started.
    pub fn release(&self, session: &str, escalation: bool) {
        if let Ok(mut sessions) = self.sessions.lock()
            && let Some(budget) = sessions.get_mut(session)
        {
            budget.segment_operations = budget.segment_operations.saturating_sub(1);
            budget.total_operations = budget.total_operations.saturating_sub(1);
            if escalation {
                budget.segment_escalations = budget.segment_escalations.saturating_sub(1);
                budget.total_escalations = budget.total_escalations.saturating_sub(1);
            }
        }
    }

    /// Explicit human continuation: start a new segment, keep totals.
    pub fn continue_session_at(&self, session: &str, now: Instant) -> Option<SessionBudget> {
        let mut sessions = self.sessions.lock().ok()?;
        let budget = sessions.get_mut(session)?;
        budget.segment_operations = 0;
        budget.segment_escalations = 0;
        budget.segment_started = now;
        budget.tripped = None;
        budget.continuations += 1;
        info!(session, continuations = budget.continuations, "session continued");
        Some(budget.clone())
    }

    /// Forget the session entirely.
    pub fn end_session(&self, session: &str) -> Option<SessionBudget> {
        self.sessions.lock().ok()?.remove(session)
    }

    pub fn snapshot(&self, session: &str) -> Option<SessionBudget> {
        self.sessions.lock().ok()?.get(session).cloned()
    }

    /// Wall-clock budget left in the current segment.
    pub fn remaining_time_at(&self, session: &str, now: Instant) -> Duration {
        let max = self.max_wall_clock();
        match self.snapshot(session) {
            Some(budget) => {
                max.saturating_sub(now.saturating_duration_since(budget.segment_started))
            }
            None => max,
        }
    }

    pub fn is_paused(&self, session: &str) -> bool {
        self.snapshot(session).is_some_and(|b| b.tripped.is_some())
    }
}

fn poisoned(session: &str) -> CircuitTripped {
    CircuitTripped {
        session: session.to_string(),
        ceiling: Ceiling::Operations,
        current: 0,
        limit: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(ops: u32, secs: u64, escalations: u32) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            max_operations: ops,
            max_seconds: secs,
            max_escalations: escalations,
        })
    }

    #[test]
    fn operations_ceiling_pauses_until_continued() {
        let cb = breaker(2, 300, 3);
        let now = Instant::now();
        cb.admit_at("s", false, now).expect("1");
        cb.admit_at("s", false, now).expect("2");
        let err = cb.admit_at("s", false, now).expect_err("third trips");
        assert_eq!(err.ceiling, Ceiling::Operations);
        assert_eq!((err.current, err.limit), (2, 2));
        assert!(cb.is_paused("s"));

        let budget = cb.continue_session_at("s", now).expect("known session");
        assert_eq!(budget.total_operations, 2);
        assert_eq!(budget.continuations, 1);
        cb.admit_at("s", false, now).expect("new segment");
        assert_eq!(cb.snapshot("s").map(|b| b.total_operations), Some(3));
    }

    #[test]
    fn escalation_ceiling_only_applies_to_escalations() {
        let cb = breaker(10, 300, 1);
        let now = Instant::now();
        cb.admit_at("s", true, now).expect("first sudo");
        cb.check_at("s", false, now).expect("plain op still fine");
        let err = cb.check_at("s", true, now).expect_err("second sudo");
        assert_eq!(err.ceiling, Ceiling::Escalations);
        assert!(!cb.is_paused("s"), "check never trips");
    }

    #[test]
    fn wall_clock_ceiling_trips() {
        let cb = breaker(10, 60, 3);
        let start = Instant::now();
        cb.admit_at("s", false, start).expect("first");
        assert_eq!(
            cb.remaining_time_at("s", start + Duration::from_secs(45)),
            Duration::from_secs(15)
        );
        let err = cb
            .admit_at("s", false, start + Duration::from_secs(61))
            .expect_err("too long");
        assert_eq!(err.ceiling, Ceiling::WallClock);
    }

    #[test]
    fn sessions_are_isolated_and_end_resets() {
        let cb = breaker(1, 300, 3);
        let now = Instant::now();
        cb.admit_at("a", false, now).expect("a");
        cb.admit_at("b", false, now).expect("b independent");
        assert!(cb.admit_at("a", false, now).is_err());
        cb.end_session("a");
        cb.admit_at("a", false, now).expect("fresh budget");
    }
}

//! Execution budgets: per-category rate windows and the per-session circuit breaker.
//!
//! [`SafetyGovernor`] is the one shared handle the pipeline and the gate see.
//! Its limits come from configuration only; nothing a classifier returns can
//! change them.

pub mod circuit;
pub mod rate_limit;

use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::patterns::{is_privilege_escalation, rate_categories};
use crate::core::types::{HoldReason, RateCategory};
use crate::io::config::GateConfig;

pub use circuit::{CircuitBreaker, CircuitTripped, SessionBudget};
pub use rate_limit::{RateLimitExceeded, RateLimiter};

/// A budget that refused an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exhausted {
    Rate(RateLimitExceeded),
    Circuit(CircuitTripped),
}

impl Exhausted {
    pub fn hold_reason(&self) -> HoldReason {
        match self {
            Exhausted::Rate(e) => HoldReason::RateLimited {
                category: e.category,
                retry_after: e.retry_after,
            },
            Exhausted::Circuit(e) => HoldReason::SessionPaused { ceiling: e.ceiling },
        }
    }
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exhausted::Rate(e) => e.fmt(f),
            Exhausted::Circuit(e) => e.fmt(f),
        }
    }
}

/// Budget charged for one admitted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub session: String,
    pub categories: Vec<RateCategory>,
    pub escalation: bool,
    pub at: Instant,
}

pub struct SafetyGovernor {
    rate_limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl SafetyGovernor {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            rate_limiter: RateLimiter::new(&config.rate_limits),
            breaker: CircuitBreaker::new(&config.circuit_breaker),
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Would `content` be admitted right now? Consumes nothing.
    pub fn check(&self, session: &str, content: &str, now: Instant) -> Result<(), Exhausted> {
        self.breaker
            .check_at(session, is_privilege_escalation(content), now)
            .map_err(Exhausted::Circuit)?;
        for category in rate_categories(content) {
            self.rate_limiter
                .check_at(category, now)
                .map_err(Exhausted::Rate)?;
        }
        Ok(())
    }

    /// Charge the breaker and every matching rate window, all or nothing.
    pub fn admit(
        &self,
        session: &str,
        content: &str,
        now: Instant,
    ) -> Result<Admission, Exhausted> {
        let escalation = is_privilege_escalation(content);
        self.breaker
            .check_at(session, escalation, now)
            .map_err(Exhausted::Circuit)?;

        let categories = rate_categories(content);
        let mut acquired = Vec::with_capacity(categories.len());
        for category in categories {
            if let Err(e) = self.rate_limiter.try_acquire_at(category, now) {
                for taken in acquired {
                    self.rate_limiter.release_at(taken, now);
                }
                return Err(Exhausted::Rate(e));
            }
            acquired.push(category);
        }

        if let Err(e) = self.breaker.admit_at(session, escalation, now) {
            for taken in &acquired {
                self.rate_limiter.release_at(*taken, now);
            }
            return Err(Exhausted::Circuit(e));
        }
        debug!(session, categories = ?acquired, escalation, "operation admitted");
        Ok(Admission {
            session: session.to_string(),
            categories: acquired,
            escalation,
            at: now,
        })
    }

    /// Undo an admission whose execution never started.
    pub fn release(&self, admission: &Admission) {
        for category in &admission.categories {
            self.rate_limiter.release_at(*category, admission.at);
        }
        self.breaker
            .release(&admission.session, admission.escalation);
    }

    /// Charge one explicit human approval.
    pub fn charge_approval(&self, now: Instant) -> Result<(), RateLimitExceeded> {
        self.rate_limiter
            .try_acquire_at(RateCategory::Approval, now)
    }

    pub fn remaining_time(&self, session: &str, now: Instant) -> Duration {
        self.breaker.remaining_time_at(session, now)
    }

    pub fn continue_session(&self, session: &str, now: Instant) -> Option<SessionBudget> {
        self.breaker.continue_session_at(session, now)
    }

    pub fn end_session(&self, session: &str) -> Option<SessionBudget> {
        self.breaker.end_session(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::RateLimit;

    fn governor() -> SafetyGovernor {
        let mut config = GateConfig::default();
        config.rate_limits.service = RateLimit::new(1, 60);
        config.circuit_breaker.max_operations = 2;
        SafetyGovernor::new(&config)
    }

    #[test]
    fn admit_charges_matching_categories() {
        let gov = governor();
        let now = Instant::now();
        gov.admit("s", "systemctl restart nginx", now)
            .expect("first restart");
        let err = gov
            .check("s", "systemctl restart nginx", now)
            .expect_err("service window full");
        assert!(matches!(
            err,
            Exhausted::Rate(RateLimitExceeded {
                category: RateCategory::Service,
                ..
            })
        ));
        gov.check("s", "list files in /tmp", now)
            .expect("uncategorized content only hits the breaker");
    }

    #[test]
    fn breaker_refusal_rolls_back_rate_reservations() {
        let gov = governor();
        let now = Instant::now();
        gov.admit("s", "ls", now).expect("1");
        gov.admit("s", "ls", now).expect("2");
        let err = gov
            .admit("s", "systemctl restart nginx", now)
            .expect_err("breaker trips");
        assert!(matches!(err, Exhausted::Circuit(_)));
        assert_eq!(gov.rate_limiter().usage_at(RateCategory::Service, now).0, 0);
        assert!(matches!(
            err.hold_reason(),
            HoldReason::SessionPaused { .. }
        ));
    }

    #[test]
    fn release_returns_the_budget() {
        let gov = governor();
        let now = Instant::now();
        let admission = gov
            .admit("s", "systemctl restart nginx", now)
            .expect("admit");
        gov.release(&admission);
        gov.admit("s", "systemctl restart nginx", now)
            .expect("budget returned");
    }
}

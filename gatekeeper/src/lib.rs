//! Safety gatekeeper between natural-language requests and privileged actions.
//!
//! A request is sanitized, classified onto three closed axes (destination,
//! consumer, semantics), recursively decomposed when the classification is
//! unsure or the request is compound, and every resulting leaf runs through a
//! five-layer verification pipeline before the execution gate decides what
//! happens to it. The crate is split the same way throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (patterns, sanitizing, the
//!   operation arena, confidence tiers, example selection). No I/O.
//! - **[`io`]**: Side-effecting boundaries (config, processes, oracle,
//!   executor, persistence, audit). Each sits behind a trait so tests can
//!   substitute it.
//! - **[`agents`]**, **[`verify`]** and **[`safety`]** build on those two:
//!   the oracle-backed classifier and decomposer, the verification layers, and
//!   the rate limiter and circuit breaker.
//!
//! [`gate::Gatekeeper`] ties them together; [`feedback`] closes the learning
//! loop by turning user corrections into few-shot examples.

pub mod agents;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod feedback;
pub mod gate;
pub mod io;
pub mod logging;
pub mod safety;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;

pub use error::GateError;
pub use gate::{Gatekeeper, GatekeeperBuilder, Notice, OperationResult};
pub use session::{CancelToken, SessionContext, UserPreferences};

//! Error taxonomy for the solver (see SPEC_FULL.md §7).
//!
//! Configuration and invariant errors are fatal and surfaced at the API
//! boundary. Numerical degeneracies (NaN/Inf at isolated grid points) are
//! *not* represented here: they are tolerated in-band as `f64::NAN`
//! sentinels and never become an `Err`.

use derive_more::{Display, Error};

/// Malformed options, missing required params, or an inconsistent state-space
/// configuration, detected before any solving starts.
#[derive(Debug, Display, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[display("n_periods must be >= 2, got {n_periods}")]
    TooFewPeriods { n_periods: i64 },

    #[display("required param '{name}' is missing")]
    MissingParam { name: String },

    #[display("param '{name}' is not finite: {value}")]
    NonFiniteParam { name: String, value: f64 },

    #[display("savings grid must be non-negative and strictly increasing (violated at index {index})")]
    BadSavingsGrid { index: usize },

    #[display("state {state:?} is marked invalid by the sparsity condition but has no proxy")]
    MissingProxy { state: Vec<i64> },

    #[display("proxy target for state {state:?} is itself invalid: {proxy:?}")]
    InvalidProxyTarget { state: Vec<i64>, proxy: Vec<i64> },

    #[display("state {state:?} is both proxied and declared valid")]
    ProxiedValidState { state: Vec<i64> },

    #[display("child-state vector for state-choice {sc_id} has length {got}, expected {expected}")]
    ChildVectorLengthMismatch {
        sc_id: usize,
        got: usize,
        expected: usize,
    },

    #[display("transition probability at index {index} is negative for state {state:?} that maps to infeasible child -1")]
    InfeasibleTransitionHasMass { state: Vec<i64>, index: usize },
}

/// An assertion about solver-internal invariants failed; always a
/// programming error in the driver or in one of its subsystems.
#[derive(Debug, Display, Error, PartialEq, Clone)]
pub enum InvariantError {
    #[display("batch references state-choice {sc_id} whose child state {child_id} has not been solved yet")]
    UnsolvedChildReference { sc_id: usize, child_id: usize },

    #[display("FUES output for state-choice {sc_id} is not strictly increasing in x at index {index}")]
    NonMonotoneEndogenousGrid { sc_id: usize, index: usize },

    #[display("choice probabilities for state {state:?} sum to {sum}, expected 1 within 1e-9")]
    ChoiceProbabilityMassMismatch { state: Vec<i64>, sum: f64 },

    #[display("policy at index {index} for state-choice {sc_id} is negative: {value}")]
    NegativePolicy {
        sc_id: usize,
        index: usize,
        value: f64,
    },
}

/// A user-supplied callback (§4.1) returned a non-finite value for finite,
/// in-domain arguments.
#[derive(Debug, Display, Error, PartialEq, Clone)]
#[display("callback '{callback}' returned non-finite ({value}) at state {state:?}, choice {choice}")]
pub struct CallbackError {
    pub callback: &'static str,
    pub state: Vec<i64>,
    pub choice: i64,
    pub value: f64,
}

/// Top-level error returned from the public solve entry points.
#[derive(Debug, Display, Error, PartialEq)]
pub enum SolveError {
    #[display("{_0}")]
    Config(ConfigError),
    #[display("{_0}")]
    Invariant(InvariantError),
    #[display("{_0}")]
    Callback(CallbackError),
}

impl From<ConfigError> for SolveError {
    fn from(e: ConfigError) -> Self {
        SolveError::Config(e)
    }
}

impl From<InvariantError> for SolveError {
    fn from(e: InvariantError) -> Self {
        SolveError::Invariant(e)
    }
}

impl From<CallbackError> for SolveError {
    fn from(e: CallbackError) -> Self {
        SolveError::Callback(e)
    }
}

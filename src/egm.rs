//! EGM step (E, SPEC_FULL.md §4.5 / spec.md §4.5).
//!
//! Inverts the Euler equation on the exogenous savings grid to produce raw
//! (pre-FUES) endogenous-grid, policy, and value arrays for one
//! (state, choice).

use crate::E;
use crate::aggregate::{Aggregated, integrate_over_shocks};
use crate::callback::{ModelPrimitives, StateChoice};
use crate::params::Params;
use faer::ColRef;

/// Raw EGM output for one (state, choice), before FUES refinement
/// (spec.md §4.5, §3: "Per-(state,choice) arrays").
pub struct RawEgmOutput {
    pub endogenous_grid: Vec<E>,
    pub policy: Vec<E>,
    pub value: Vec<E>,
    pub expected_value_zero: E,
}

/// Runs steps 1-5 of spec.md §4.5 over the full savings grid.
///
/// `per_draw_aggregate[a]` is the already-aggregated-over-choices value at
/// savings-grid point `a`, one [`Aggregated`] per child state (one per
/// exogenous-state realisation); `integrate_over_shocks` contracts those
/// against `transition_probs`.
pub fn solve_euler_equation(
    savings_grid: &[E],
    per_draw_aggregate: &[Vec<Aggregated>],
    transition_probs: ColRef<E>,
    expected_value_zero_children: &[Aggregated],
    sc: StateChoice,
    model: &dyn ModelPrimitives,
    params: &Params,
) -> RawEgmOutput {
    let beta = params.beta();
    let r = params.interest_rate();
    let g = savings_grid.len();

    let mut endogenous_grid = Vec::with_capacity(g);
    let mut policy = Vec::with_capacity(g);
    let mut value = Vec::with_capacity(g);

    for (a_idx, &a) in savings_grid.iter().enumerate() {
        let integrated = integrate_over_shocks(&per_draw_aggregate[a_idx], transition_probs);
        let rhs = beta * (1.0 + r) * integrated.marginal_utility;
        let c = model.inverse_marginal_utility(rhs, sc, params);
        let x = a + c;
        let v = model.utility(c, sc, params) + beta * integrated.expected_value;

        endogenous_grid.push(x);
        policy.push(c);
        value.push(v);
    }

    let expected_value_zero =
        integrate_over_shocks(expected_value_zero_children, transition_probs).expected_value;

    RawEgmOutput {
        endogenous_grid,
        policy,
        value,
        expected_value_zero,
    }
}

//! Final-period solver (F, SPEC_FULL.md §4.7 / spec.md §4.7).
//!
//! At `t = T` consumption equals all available resources; marginal utility
//! and value are evaluated pointwise on the Cartesian product of the
//! savings grid and the shock grid, seeding the continuation arrays for
//! period `T - 1`.

use crate::E;
use crate::callback::{ModelPrimitives, StateChoice};
use crate::params::Params;

/// Per-(state, choice) final-period solution, already projected onto a
/// single shock draw for use as the `t = T - 1` continuation arrays, plus
/// the full per-draw grid for anyone who needs the unprojected surface
/// (e.g. a later aggregation step over draws rather than over the
/// resolved policy).
pub struct FinalPeriodSolution {
    pub endogenous_grid: Vec<E>,
    pub policy: Vec<E>,
    pub value: Vec<E>,
    /// `marginal_utility[a][draw]`, `value_by_draw[a][draw]`.
    pub marginal_utility_by_draw: Vec<Vec<E>>,
    pub value_by_draw: Vec<Vec<E>>,
}

/// Evaluates the closed-form terminal solution on every (savings-grid
/// point, shock draw) pair (spec.md §4.7). `resources[a][draw]` is the
/// beginning-of-period wealth at each pair, already computed by the
/// caller via `ModelPrimitives::budget`.
pub fn solve_final_period(
    resources: &[Vec<E>],
    sc: StateChoice,
    model: &dyn ModelPrimitives,
    params: &Params,
) -> FinalPeriodSolution {
    let g = resources.len();
    let n_draws = resources.first().map(|r| r.len()).unwrap_or(0);

    let mut marginal_utility_by_draw = Vec::with_capacity(g);
    let mut value_by_draw = Vec::with_capacity(g);

    for row in resources {
        let mut mu_row = Vec::with_capacity(n_draws);
        let mut v_row = Vec::with_capacity(n_draws);
        for &r in row {
            let (mu, v) = model.final_period_solution(sc, r, params);
            mu_row.push(mu);
            v_row.push(v);
        }
        marginal_utility_by_draw.push(mu_row);
        value_by_draw.push(v_row);
    }

    // FIXME(spec.md §9 open question 3): the reference implementation
    // selects the continuation draw via
    // `middle_of_draws = int(value.shape[2] + 1 / 2)`, which — because `1 /
    // 2` is a float division evaluated before the `+` — reduces to
    // `shape[2]` itself, one past the last valid draw index. The evident
    // intent is `(n_draws + 1) / 2`, used here; this is a guess at the
    // fix, not a resolution of the ambiguity, so it is flagged rather than
    // silently treated as settled.
    let middle = (n_draws + 1) / 2;
    let middle = middle.min(n_draws.saturating_sub(1));

    let mut endogenous_grid = Vec::with_capacity(g);
    let mut policy = Vec::with_capacity(g);
    let mut value = Vec::with_capacity(g);
    for a in 0..g {
        let r = resources[a][middle];
        endogenous_grid.push(r);
        policy.push(r);
        value.push(value_by_draw[a][middle]);
    }

    FinalPeriodSolution {
        endogenous_grid,
        policy,
        value,
        marginal_utility_by_draw,
        value_by_draw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct EatItAll;
    impl ModelPrimitives for EatItAll {
        fn utility(&self, c: E, _sc: StateChoice, _p: &Params) -> E {
            c.ln()
        }
        fn marginal_utility(&self, c: E, _sc: StateChoice, _p: &Params) -> E {
            1.0 / c
        }
        fn inverse_marginal_utility(&self, m: E, _sc: StateChoice, _p: &Params) -> E {
            1.0 / m
        }
        fn budget(&self, _sc: StateChoice, s: E, y: E, p: &Params) -> E {
            (1.0 + p.interest_rate()) * s + y
        }
        fn transition_probs(&self, _s: &[i64], _p: &Params) -> Vec<E> {
            vec![1.0]
        }
        fn feasible_choice_set(&self, _s: &[i64], n: usize) -> Vec<i64> {
            (0..n as i64).collect()
        }
        fn final_period_solution(&self, _sc: StateChoice, resources: E, _p: &Params) -> (E, E) {
            (1.0 / resources, resources.ln())
        }
    }

    fn params() -> Params {
        Params::build(
            HashMap::from([
                ("beta".to_string(), 0.95),
                ("interest_rate".to_string(), 0.02),
                ("lambda".to_string(), 1.0),
                ("sigma".to_string(), 0.0),
            ]),
            &[],
        )
        .unwrap()
    }

    #[test]
    fn policy_equals_all_available_resources() {
        let model = EatItAll;
        let p = params();
        let sc = StateChoice { state: &[1, 0], choice: 0 };
        let resources = vec![vec![1.0, 1.0, 1.0], vec![2.0, 2.0, 2.0], vec![3.0, 3.0, 3.0]];
        let sol = solve_final_period(&resources, sc, &model, &p);
        assert_eq!(sol.policy, sol.endogenous_grid);
        assert_eq!(sol.endogenous_grid, vec![1.0, 2.0, 3.0]);
    }
}

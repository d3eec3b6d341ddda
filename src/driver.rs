//! Backward driver (D, SPEC_FULL.md §4.8 / spec.md §4.8).
//!
//! The outermost loop: seeds the terminal period with F, then for each
//! preceding period orchestrates I -> A -> E -> U per batch, respecting
//! batch boundaries and checking the supplied [`Terminator`] at every
//! period boundary.

use faer::Col;

use crate::E;
use crate::Status;
use crate::aggregate::{Aggregated, ChoiceSlice, aggregate_choices, integrate_over_shocks};
use crate::callback::{ModelPrimitives, PeriodCallback, StateChoice};
use crate::egm;
use crate::error::{CallbackError, ConfigError, InvariantError, SolveError};
use crate::final_period;
use crate::fues;
use crate::interpolate::interpolate_1d;
use crate::params::Params;
use crate::state_space::StateSpace;
use crate::terminators::Terminator;

/// Refined arrays for one (state, choice), read-only once its period is
/// complete (spec.md §3 lifecycle).
#[derive(Debug, Clone)]
pub struct SolvedArrays {
    pub endogenous_grid: Vec<E>,
    pub policy: Vec<E>,
    pub value: Vec<E>,
}

/// The complete four-dimensional result: `arrays[sc_id]` for every
/// state-choice, across every period (spec.md §4.8 item 2).
pub struct Solution {
    pub arrays: Vec<Option<SolvedArrays>>,
}

impl Solution {
    pub fn get(&self, sc_id: usize) -> Option<&SolvedArrays> {
        self.arrays[sc_id].as_ref()
    }
}

pub struct DriverConfig<'a> {
    pub state_space: &'a StateSpace,
    pub model: &'a dyn ModelPrimitives,
    pub params: &'a Params,
    /// Exogenous savings grid, shared across every (state, choice)
    /// (spec.md §3).
    pub savings_grid: Vec<E>,
    /// Quadrature nodes for the stochastic income component.
    pub shock_nodes: Vec<E>,
    /// Quadrature weights matching `shock_nodes`, summing to 1.
    pub shock_weights: Vec<E>,
    /// Jump-detection threshold for FUES (spec.md §4.6, default 2).
    pub jump_thresh: E,
}

/// Runs the backward induction loop T -> 0 (spec.md §4.8).
///
/// Returns the partial or complete solution together with the [`Status`]
/// at which the solve stopped: `Complete` if every period solved, or
/// `Interrupted`/`TimeLimit` if `terminator` fired at a period boundary.
pub fn solve(
    config: &DriverConfig,
    terminator: &mut dyn Terminator,
    callback: &mut dyn PeriodCallback,
) -> Result<(Solution, Status), SolveError> {
    check_savings_grid(&config.savings_grid)?;
    let state_space = config.state_space;
    let mut arrays: Vec<Option<SolvedArrays>> = vec![None; state_space.state_choices.len()];

    terminator.initialize();

    let last_period = state_space.n_periods - 1;
    {
        let _span = tracing::info_span!("final_period", period = last_period).entered();
        solve_final_period(config, &mut arrays, last_period)?;
    }
    callback.on_period_solved(
        last_period,
        state_space.state_choices_in_period(last_period).len(),
    );
    if let Some(status) = terminator.terminate() {
        tracing::warn!(?status, "solve interrupted after final period");
        return Ok((Solution { arrays }, status));
    }

    for t in (0..last_period).rev() {
        let _span = tracing::info_span!("period", t).entered();
        let batches = state_space.batches_by_period[t as usize].clone();
        tracing::debug!(n_batches = batches.len(), "starting period");
        let mut n_solved = 0;
        // Every state-choice in a batch depends only on already-solved
        // later-period arrays (spec.md §4.2 item 6), never on a sibling in
        // the same batch, so solving the whole period before writing any
        // of it back is safe and makes batch order unobservable (spec.md
        // §5). That same independence is what makes each batch safe to
        // solve with `solve_batch` under the `parallel` feature.
        let mut solved_this_period = Vec::new();
        for batch in &batches {
            let solved = solve_batch(config, &arrays, batch)?;
            n_solved += solved.len();
            solved_this_period.extend(solved);
        }
        for (sc_id, solved) in solved_this_period {
            arrays[sc_id] = Some(solved);
        }
        callback.on_period_solved(t, n_solved);
        if let Some(status) = terminator.terminate() {
            tracing::warn!(?status, period = t, "solve interrupted");
            return Ok((Solution { arrays }, status));
        }
    }

    Ok((Solution { arrays }, Status::Complete))
}

/// Raises [`CallbackError`] when a model callback returns a non-finite
/// result for arguments that were themselves finite and in-domain (spec.md
/// §4.1/§7). Degeneracies that arise from the algorithm's own numerics
/// (e.g. NaN padding past FUES's valid prefix) are a separate, tolerated
/// category and never go through this path.
fn require_finite(name: &'static str, sc: StateChoice, value: E) -> Result<E, SolveError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CallbackError { callback: name, state: sc.state.to_vec(), choice: sc.choice, value }.into())
    }
}

/// Config check (spec.md §7): the exogenous savings grid must be
/// non-negative and strictly increasing, since both `egm` and `fues` rely
/// on it as a valid x-axis for the post-decision arrays.
fn check_savings_grid(grid: &[E]) -> Result<(), SolveError> {
    if grid.is_empty() {
        return Err(ConfigError::BadSavingsGrid { index: 0 }.into());
    }
    if grid[0] < 0.0 {
        return Err(ConfigError::BadSavingsGrid { index: 0 }.into());
    }
    for index in 1..grid.len() {
        if grid[index - 1] >= grid[index] {
            return Err(ConfigError::BadSavingsGrid { index }.into());
        }
    }
    Ok(())
}

fn solve_final_period(
    config: &DriverConfig,
    arrays: &mut [Option<SolvedArrays>],
    last_period: i64,
) -> Result<(), SolveError> {
    for sc_id in config.state_space.state_choices_in_period(last_period) {
        let sc = &config.state_space.state_choices[sc_id];
        let state_choice = StateChoice { state: &sc.state, choice: sc.choice };
        let mut resources: Vec<Vec<E>> = Vec::with_capacity(config.savings_grid.len());
        for &a in &config.savings_grid {
            let mut row = Vec::with_capacity(config.shock_nodes.len());
            for &y in &config.shock_nodes {
                let w = config.model.budget(state_choice, a, y, config.params);
                row.push(require_finite("budget", state_choice, w)?);
            }
            resources.push(row);
        }
        let sol = final_period::solve_final_period(&resources, state_choice, config.model, config.params);
        arrays[sc_id] = Some(SolvedArrays {
            endogenous_grid: sol.endogenous_grid,
            policy: sol.policy,
            value: sol.value,
        });
    }
    Ok(())
}

/// Solves every state-choice in one batch, returning `(sc_id, arrays)`
/// pairs in no particular order. Intra-batch independence (spec.md §4.2
/// item 6) is what makes the `parallel` feature's rayon fan-out sound here.
#[cfg(feature = "parallel")]
fn solve_batch(
    config: &DriverConfig,
    arrays: &[Option<SolvedArrays>],
    batch: &[usize],
) -> Result<Vec<(usize, SolvedArrays)>, SolveError> {
    use rayon::prelude::*;
    batch
        .par_iter()
        .map(|&sc_id| Ok((sc_id, solve_one_state_choice(config, arrays, sc_id)?)))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn solve_batch(
    config: &DriverConfig,
    arrays: &[Option<SolvedArrays>],
    batch: &[usize],
) -> Result<Vec<(usize, SolvedArrays)>, SolveError> {
    batch
        .iter()
        .map(|&sc_id| Ok((sc_id, solve_one_state_choice(config, arrays, sc_id)?)))
        .collect()
}

fn solve_one_state_choice(
    config: &DriverConfig,
    arrays: &[Option<SolvedArrays>],
    sc_id: usize,
) -> Result<SolvedArrays, SolveError> {
    let state_space = config.state_space;
    let sc = &state_space.state_choices[sc_id];
    let state_choice = StateChoice { state: &sc.state, choice: sc.choice };
    let n_choices = state_space.n_choices;
    let n_exog = state_space.n_exog_states;

    let transition_probs_vec = config.model.transition_probs(&sc.state, config.params);
    let transition_probs = Col::from_fn(transition_probs_vec.len(), |i| transition_probs_vec[i]);
    let shock_weights = Col::from_fn(config.shock_weights.len(), |i| config.shock_weights[i]);

    // Resolve, once, each child state's feasible (choice, sc_id) pairs.
    let child_choice_info: Vec<Option<Vec<(i64, usize)>>> = state_space.children_of[sc_id]
        .iter()
        .map(|child_opt| {
            child_opt.map(|child_state_id| {
                let child_state = &state_space.states[child_state_id];
                config
                    .model
                    .feasible_choice_set(child_state, n_choices)
                    .into_iter()
                    .map(|c| (c, state_space.sc_index[&(child_state_id, c)]))
                    .collect()
            })
        })
        .collect();

    let mut per_draw_aggregate: Vec<Vec<Aggregated>> = Vec::with_capacity(config.savings_grid.len());
    for &a in &config.savings_grid {
        let mut per_exog = Vec::with_capacity(n_exog);
        for (exog_index, info) in child_choice_info.iter().enumerate() {
            per_exog.push(aggregate_one_exog(
                config,
                arrays,
                info,
                a,
                state_choice,
                shock_weights.as_ref(),
                sc_id,
                exog_index,
                transition_probs.as_ref(),
            )?);
        }
        per_draw_aggregate.push(per_exog);
    }

    let mut expected_value_zero_children = Vec::with_capacity(n_exog);
    for (exog_index, info) in child_choice_info.iter().enumerate() {
        expected_value_zero_children.push(aggregate_one_exog(
            config,
            arrays,
            info,
            0.0,
            state_choice,
            shock_weights.as_ref(),
            sc_id,
            exog_index,
            transition_probs.as_ref(),
        )?);
    }

    let raw = egm::solve_euler_equation(
        &config.savings_grid,
        &per_draw_aggregate,
        transition_probs.as_ref(),
        &expected_value_zero_children,
        state_choice,
        config.model,
        config.params,
    );
    let refined = fues::fues_refine(&raw, config.jump_thresh, state_choice, config.model, config.params);
    check_refined_invariants(sc_id, &refined)?;

    Ok(SolvedArrays {
        endogenous_grid: refined.endogenous_grid,
        policy: refined.policy,
        value: refined.value,
    })
}

/// Invariant 1 (spec.md §7/§8): on the valid (non-NaN) prefix, FUES's output
/// must be strictly increasing in x with a non-negative policy. A violation
/// here means the scan itself has a bug, not a numerical degeneracy, so it's
/// fatal rather than tolerated in-band.
fn check_refined_invariants(sc_id: usize, refined: &fues::FuesOutput) -> Result<(), SolveError> {
    let valid_len = refined.endogenous_grid.iter().take_while(|x| !x.is_nan()).count();
    for index in 0..valid_len {
        if refined.policy[index] < 0.0 {
            return Err(InvariantError::NegativePolicy { sc_id, index, value: refined.policy[index] }.into());
        }
        if index > 0 && refined.endogenous_grid[index - 1] >= refined.endogenous_grid[index] {
            return Err(InvariantError::NonMonotoneEndogenousGrid { sc_id, index }.into());
        }
    }
    Ok(())
}

/// One exogenous-state realisation's contribution to `per_draw_aggregate`:
/// interpolates the child state's choice-specific arrays at the wealth
/// implied by every shock draw, aggregates across choices (A), then
/// integrates across shocks.
#[allow(clippy::too_many_arguments)]
fn aggregate_one_exog(
    config: &DriverConfig,
    arrays: &[Option<SolvedArrays>],
    info: &Option<Vec<(i64, usize)>>,
    a: E,
    sc: StateChoice,
    shock_weights: faer::ColRef<E>,
    sc_id: usize,
    exog_index: usize,
    transition_probs: faer::ColRef<E>,
) -> Result<Aggregated, SolveError> {
    let Some(choices) = info else {
        // No feasible transition at this exogenous realisation: the caller's
        // transition probability here must be zero (spec.md §3).
        if transition_probs[exog_index].abs() > 1e-9 {
            return Err(ConfigError::InfeasibleTransitionHasMass {
                state: config.state_space.state_choices[sc_id].state.clone(),
                index: exog_index,
            }
            .into());
        }
        return Ok(Aggregated {
            expected_value: E::NAN,
            marginal_utility: E::NAN,
        });
    };

    let n_choices = config.state_space.n_choices;
    let mut per_draw = Vec::with_capacity(config.shock_nodes.len());
    for &y in &config.shock_nodes {
        let w = require_finite("budget", sc, config.model.budget(sc, a, y, config.params))?;

        let mut values = Col::<E>::zeros(n_choices);
        let mut marginal_utilities = Col::<E>::zeros(n_choices);
        let mut feasible = vec![false; n_choices];

        for &(choice, child_sc_id) in choices {
            let child_sc = &config.state_space.state_choices[child_sc_id];
            let child_state_choice = StateChoice { state: &child_sc.state, choice };
            let solved = arrays[child_sc_id].as_ref().ok_or(InvariantError::UnsolvedChildReference {
                sc_id,
                child_id: child_sc_id,
            })?;
            let interp = interpolate_1d(
                &solved.endogenous_grid,
                &solved.policy,
                &solved.value,
                solved.endogenous_grid.len(),
                w,
                child_state_choice,
                config.model,
                config.params,
            );
            let idx = choice as usize;
            values[idx] = interp.value;
            marginal_utilities[idx] = config.model.marginal_utility(interp.policy, child_state_choice, config.params);
            feasible[idx] = true;
        }

        let slice = ChoiceSlice {
            value: values.as_ref(),
            marginal_utility: marginal_utilities.as_ref(),
            feasible: &feasible,
        };
        check_choice_probability_mass(&slice, config.params.lambda(), &config.state_space.state_choices[sc_id].state)?;
        per_draw.push(aggregate_choices(&slice, config.params.lambda()));
    }

    Ok(integrate_over_shocks(&per_draw, shock_weights))
}

/// Invariant 4 (spec.md §7/§8): choice probabilities over the feasible set
/// must sum to 1 within 1e-9. Only way this fails is a `feasible_choice_set`
/// callback returning an empty set for a state the builder thinks has
/// children, i.e. a caller contract violation.
fn check_choice_probability_mass(slice: &ChoiceSlice, lambda: E, state: &[i64]) -> Result<(), SolveError> {
    let sum: E = crate::aggregate::choice_probabilities(slice, lambda).iter().sum();
    if (sum - 1.0).abs() > 1e-9 {
        return Err(InvariantError::ChoiceProbabilityMassMismatch { state: state.to_vec(), sum }.into());
    }
    Ok(())
}

//! Aggregation kernel (A, SPEC_FULL.md §4.4 / spec.md §4.4).
//!
//! Column-wise reductions over faer vectors, styled like the teacher's
//! `linalg::vector_ops` free functions: no state, no owned borrows held
//! past the call.

use faer::{Col, ColRef, unzip, zip};

use crate::E;

/// Per-choice values/marginal utilities at one query point, plus the
/// feasible-choice mask (spec.md §4.4: infeasible choices are masked, not
/// omitted, so every `Vec` here is indexed by the full choice set).
pub struct ChoiceSlice<'a> {
    pub value: ColRef<'a, E>,
    pub marginal_utility: ColRef<'a, E>,
    pub feasible: &'a [bool],
}

/// Result of aggregating across discrete choices at one query point
/// (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregated {
    /// Log-sum / smoothed-max expected value.
    pub expected_value: E,
    /// Choice-probability-weighted marginal utility.
    pub marginal_utility: E,
}

const LAMBDA_DEGENERATE: E = 1e-12;

/// Aggregates over discrete choices at one query point (spec.md §4.4). When
/// `lambda` is at or below [`LAMBDA_DEGENERATE`] the log-sum/softmax
/// formulas degenerate into a hard max/argmax to avoid dividing by zero.
pub fn aggregate_choices(slice: &ChoiceSlice, lambda: E) -> Aggregated {
    let n = slice.value.nrows();
    debug_assert_eq!(slice.marginal_utility.nrows(), n);
    debug_assert_eq!(slice.feasible.len(), n);

    let v_bar = (0..n)
        .filter(|&c| slice.feasible[c])
        .map(|c| slice.value[c])
        .fold(E::NEG_INFINITY, E::max);

    if lambda <= LAMBDA_DEGENERATE {
        let argmax = (0..n)
            .filter(|&c| slice.feasible[c])
            .max_by(|&a, &b| slice.value[a].partial_cmp(&slice.value[b]).unwrap())
            .expect("at least one feasible choice");
        return Aggregated {
            expected_value: v_bar,
            marginal_utility: slice.marginal_utility[argmax],
        };
    }

    let mut weights = Col::<E>::zeros(n);
    let mut sum = 0.0;
    for c in 0..n {
        if slice.feasible[c] {
            let w = ((slice.value[c] - v_bar) / lambda).exp();
            weights[c] = w;
            sum += w;
        }
    }

    let expected_value = v_bar + lambda * sum.ln();

    let mut marginal_utility = 0.0;
    zip!(weights.as_ref(), slice.marginal_utility).for_each(|unzip!(w, m)| {
        marginal_utility += (*w / sum) * *m;
    });

    Aggregated {
        expected_value,
        marginal_utility,
    }
}

/// Choice probabilities at one query point, in the same order as
/// `slice.value`. Exposed separately from [`aggregate_choices`] because the
/// driver needs the full vector (invariant 4, spec.md §8) even though only
/// its weighted sum feeds the EGM step.
pub fn choice_probabilities(slice: &ChoiceSlice, lambda: E) -> Vec<E> {
    let n = slice.value.nrows();
    if lambda <= LAMBDA_DEGENERATE {
        let argmax = (0..n)
            .filter(|&c| slice.feasible[c])
            .max_by(|&a, &b| slice.value[a].partial_cmp(&slice.value[b]).unwrap())
            .expect("at least one feasible choice");
        return (0..n).map(|c| if c == argmax { 1.0 } else { 0.0 }).collect();
    }

    let v_bar = (0..n)
        .filter(|&c| slice.feasible[c])
        .map(|c| slice.value[c])
        .fold(E::NEG_INFINITY, E::max);

    let mut weights: Vec<E> = (0..n)
        .map(|c| {
            if slice.feasible[c] {
                ((slice.value[c] - v_bar) / lambda).exp()
            } else {
                0.0
            }
        })
        .collect();
    let sum: E = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= sum);
    weights
}

/// Integrates a per-draw aggregate over quadrature weights, producing the
/// post-decision marginal utility and expected value at one savings-grid
/// point (spec.md §4.4 "subsequently contracted against the income-shock
/// weight vector").
pub fn integrate_over_shocks(per_draw: &[Aggregated], quad_weights: ColRef<E>) -> Aggregated {
    debug_assert_eq!(per_draw.len(), quad_weights.nrows());
    let mut expected_value = 0.0;
    let mut marginal_utility = 0.0;
    for (draw, &w) in per_draw.iter().zip(quad_weights.iter()) {
        expected_value += w * draw.expected_value;
        marginal_utility += w * draw.marginal_utility;
    }
    Aggregated {
        expected_value,
        marginal_utility,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::col;

    #[test]
    fn choice_probabilities_sum_to_one() {
        let value = col![1.0, 2.0, 0.5];
        let marginal_utility = col![0.1, 0.2, 0.3];
        let slice = ChoiceSlice {
            value: value.as_ref(),
            marginal_utility: marginal_utility.as_ref(),
            feasible: &[true, true, true],
        };
        let probs = choice_probabilities(&slice, 1.0);
        let sum: E = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_lambda_picks_argmax() {
        let value = col![1.0, 2.0, 0.5];
        let marginal_utility = col![0.1, 0.2, 0.3];
        let slice = ChoiceSlice {
            value: value.as_ref(),
            marginal_utility: marginal_utility.as_ref(),
            feasible: &[true, true, true],
        };
        let result = aggregate_choices(&slice, 0.0);
        assert_eq!(result.expected_value, 2.0);
        assert_eq!(result.marginal_utility, 0.2);
    }

    #[test]
    fn infeasible_choices_are_masked_out() {
        let value = col![10.0, 2.0, 0.5];
        let marginal_utility = col![0.1, 0.2, 0.3];
        let slice = ChoiceSlice {
            value: value.as_ref(),
            marginal_utility: marginal_utility.as_ref(),
            feasible: &[false, true, true],
        };
        let probs = choice_probabilities(&slice, 1.0);
        assert_eq!(probs[0], 0.0);
    }
}

//! Fast Upper-Envelope Scan (U, SPEC_FULL.md §4.6 / spec.md §4.6).
//!
//! Single forward pass over a sorted, zero-prepended raw EGM output that
//! drops dominated "secondary kink" points and inserts linear-intersection
//! points at primary kinks. Ported from the reference implementation's
//! `scan_value_function`, generalized from its three preallocated-and-NaN-
//! padded arrays to push-based `Vec`s (the caller pads into a fixed-width
//! slot when storing into the driver's output tables).

use std::collections::VecDeque;

use crate::E;
use crate::callback::{ModelPrimitives, StateChoice};
use crate::egm::RawEgmOutput;
use crate::params::Params;

const EPS: E = 1e-16;
const RING_SIZE: usize = 10;
const FORWARD_SCAN_LOOKAHEAD: usize = 10;

/// Refined (endogenous_grid, policy, value), strictly increasing in `x`
/// (spec.md §3, invariant 1 & 8).
pub struct FuesOutput {
    pub endogenous_grid: Vec<E>,
    pub policy: Vec<E>,
    pub value: Vec<E>,
}

/// Runs the full FUES pipeline on one (state, choice)'s raw EGM output:
/// credit-constrained augmentation, zero-prepend, stable sort, then the
/// forward scan (spec.md §4.6 pre-processing + scan).
pub fn fues_refine(
    raw: &RawEgmOutput,
    jump_thresh: E,
    sc: StateChoice,
    model: &dyn ModelPrimitives,
    params: &Params,
) -> FuesOutput {
    let beta = params.beta();
    let mut x = raw.endogenous_grid.clone();
    let mut c = raw.policy.clone();
    let mut v = raw.value.clone();

    let min_x = x.iter().cloned().fold(E::INFINITY, E::min);
    if x[0] > min_x {
        augment_credit_constrained_region(&mut x, &mut c, &mut v, raw.expected_value_zero, sc, model, params, beta);
    }

    x.insert(0, 0.0);
    c.insert(0, 0.0);
    v.insert(0, raw.expected_value_zero);

    let mut order: Vec<usize> = (0..x.len()).collect();
    order.sort_by(|&a, &b| x[a].partial_cmp(&x[b]).unwrap());
    let x: Vec<E> = order.iter().map(|&i| x[i]).collect();
    let c: Vec<E> = order.iter().map(|&i| c[i]).collect();
    let v: Vec<E> = order.iter().map(|&i| v[i]).collect();

    scan_value_function(&x, &c, &v, jump_thresh)
}

/// Pre-processing step: extends the grid to the left of its first point
/// with `len(x) / 10` analytically-valued, fully-constrained points
/// (spec.md §4.6 pre-processing, `_augment_grids` in the reference).
fn augment_credit_constrained_region(
    x: &mut Vec<E>,
    c: &mut Vec<E>,
    v: &mut Vec<E>,
    expected_value_zero: E,
    sc: StateChoice,
    model: &dyn ModelPrimitives,
    params: &Params,
    beta: E,
) {
    let min_x = x.iter().cloned().fold(E::INFINITY, E::min);
    let points_to_add = x.len() / 10;
    if points_to_add == 0 {
        return;
    }
    let step = (x[0] - min_x) / (points_to_add as E);
    let mut new_x = Vec::with_capacity(points_to_add);
    for i in 0..points_to_add {
        new_x.push(min_x + step * (i as E));
    }
    let new_v: Vec<E> = new_x
        .iter()
        .map(|&w| model.utility(w, sc, params) + beta * expected_value_zero)
        .collect();
    let new_c = new_x.clone();

    for i in (0..points_to_add).rev() {
        x.insert(0, new_x[i]);
        c.insert(0, new_c[i]);
        v.insert(0, new_v[i]);
    }
}

/// The single forward pass (spec.md §4.6 "Scan").
///
/// `j`/`k` track the last-committed and second-to-last-committed points on
/// the current optimal branch as `(x, c, v)` scalars, not indices into `x`/
/// `c`/`v` — the reference's `endog_grid_j`/`policy_j`/`value_j` (and `_k`)
/// do the same, because the "primary kink, upper branch continuing" case
/// below sets `j` to a freshly synthesized intersection point that has no
/// corresponding entry in the input arrays at all.
fn scan_value_function(x: &[E], c: &[E], v: &[E], jump_thresh: E) -> FuesOutput {
    let n = x.len();
    let e: Vec<E> = x.iter().zip(c.iter()).map(|(&xi, &ci)| xi - ci).collect();

    let mut out_x = vec![x[0], x[1]];
    let mut out_c = vec![c[0], c[1]];
    let mut out_v = vec![v[0], v[1]];

    let mut suboptimal: VecDeque<usize> = VecDeque::with_capacity(RING_SIZE);
    for _ in 0..RING_SIZE {
        suboptimal.push_back(0);
    }

    let (mut x_k, mut c_k, mut v_k) = (x[0], c[0], v[0]);
    let (mut x_j, mut c_j, mut v_j) = (x[1], c[1], v[1]);

    for i in 1..n.saturating_sub(2) {
        let e_j = x_j - c_j;
        let grad_before = (v_j - v_k) / (x_j - x_k).max(EPS);
        let grad_next = (v[i + 1] - v_j) / (x[i + 1] - x_j).max(EPS);
        let switch = ((e[i + 1] - e_j) / (x[i + 1] - x_j).max(EPS)).abs() > jump_thresh;

        let (grad_forward, idx_forward, _found_forward) = forward_scan(x, v, &e, jump_thresh, x_j, e_j, i + 1);
        let (grad_backward, idx_backward) = backward_scan(x, v, &e, &suboptimal, jump_thresh, x_j, v_j, i + 1);

        if v[i + 1] < v_j || e[i + 1] < e_j || (grad_next < grad_forward && switch) {
            suboptimal.pop_front();
            suboptimal.push_back(i + 1);
        } else if !switch {
            out_x.push(x[i + 1]);
            out_c.push(c[i + 1]);
            out_v.push(v[i + 1]);

            (x_k, c_k, v_k) = (x_j, c_j, v_j);
            (x_j, c_j, v_j) = (x[i + 1], c[i + 1], v[i + 1]);
        } else if grad_before > grad_next || grad_next < grad_backward {
            let (ix, iv) = linear_intersection(
                x[idx_forward], v[idx_forward], x_j, v_j, x[i + 1], v[i + 1], x[idx_backward], v[idx_backward],
            );
            let left_policy = point_on_line(x[idx_forward], c[idx_forward], x_j, c_j, ix);
            let right_policy = point_on_line(x[i + 1], c[i + 1], x[idx_backward], c[idx_backward], ix);

            out_x.push(ix);
            out_c.push(left_policy);
            out_v.push(iv);

            out_x.push(ix);
            out_c.push(right_policy);
            out_v.push(iv);

            out_x.push(x[i + 1]);
            out_c.push(c[i + 1]);
            out_v.push(v[i + 1]);

            (x_k, c_k, v_k) = (x_j, c_j, v_j);
            (x_j, c_j, v_j) = (x[i + 1], c[i + 1], v[i + 1]);
        } else if grad_next > grad_backward {
            // Primary kink, upper branch continuing: the previously
            // committed point (j, now last in `out_*`) gets overwritten with
            // the intersection, a second copy of the intersection is pushed
            // for the branch change, then the i+1 point follows. k is
            // unchanged; j becomes the intersection itself, not any input
            // index (matches the reference's `scan_value_function`).
            let (ix, iv) = linear_intersection(
                x_j, v_j, x_k, v_k, x[i + 1], v[i + 1], x[idx_backward], v[idx_backward],
            );
            let left_policy = point_on_line(x_k, c_k, x_j, c_j, ix);
            let right_policy = point_on_line(x[i + 1], c[i + 1], x[idx_backward], c[idx_backward], ix);

            let last = out_x.len() - 1;
            out_x[last] = ix;
            out_c[last] = left_policy;
            out_v[last] = iv;

            out_x.push(ix);
            out_c.push(right_policy);
            out_v.push(iv);

            out_x.push(x[i + 1]);
            out_c.push(c[i + 1]);
            out_v.push(v[i + 1]);

            (x_j, c_j, v_j) = (ix, right_policy, iv);
        }
    }

    out_x.push(x[n - 1]);
    out_c.push(c[n - 1]);
    out_v.push(v[n - 1]);

    FuesOutput {
        endogenous_grid: out_x,
        policy: out_c,
        value: out_v,
    }
}

/// Looks ahead up to [`FORWARD_SCAN_LOOKAHEAD`] points past `idx_next` for
/// the first index on the same savings branch as `(endog_grid_current,
/// exog_grid_current)`. Returns `(grad, idx, found)`; `idx` defaults to 0
/// and `grad` to 0.0 when nothing matches, mirroring the reference
/// implementation's default-to-zero masking.
fn forward_scan(
    x: &[E],
    v: &[E],
    e: &[E],
    jump_thresh: E,
    endog_grid_current: E,
    exog_grid_current: E,
    idx_next: usize,
) -> (E, usize, bool) {
    let idx_max = x.len() - 1;
    for step in 1..=FORWARD_SCAN_LOOKAHEAD {
        let idx_to_check = (idx_next + step).min(idx_max);
        if endog_grid_current < x[idx_to_check] {
            let is_on_same_value =
                ((exog_grid_current - e[idx_to_check]) / (endog_grid_current - x[idx_to_check])).abs() < jump_thresh;
            if is_on_same_value {
                let grad = (v[idx_next] - v[idx_to_check]) / (x[idx_next] - x[idx_to_check]);
                return (grad, idx_to_check, true);
            }
        }
    }
    (0.0, 0, false)
}

/// Iterates the suboptimal ring buffer from newest to oldest for the first
/// index on the same savings branch as `idx_next`. Same zero-default
/// convention as [`forward_scan`].
fn backward_scan(
    x: &[E],
    v: &[E],
    e: &[E],
    suboptimal: &VecDeque<usize>,
    jump_thresh: E,
    endog_grid_current: E,
    value_current: E,
    idx_next: usize,
) -> (E, usize) {
    for &idx_to_check in suboptimal.iter().rev() {
        if endog_grid_current > x[idx_to_check] {
            let is_on_same_value = ((e[idx_next] - e[idx_to_check]) / (x[idx_next] - x[idx_to_check])).abs() < jump_thresh;
            if is_on_same_value {
                let grad = (value_current - v[idx_to_check]) / (endog_grid_current - x[idx_to_check]);
                return (grad, idx_to_check);
            }
        }
    }
    (0.0, suboptimal[0])
}

fn point_on_line(x1: E, y1: E, x2: E, y2: E, point: E) -> E {
    (y2 - y1) / (x2 - x1) * (point - x1) + y1
}

fn linear_intersection(x1: E, y1: E, x2: E, y2: E, x3: E, y3: E, x4: E, y4: E) -> (E, E) {
    let slope1 = (y2 - y1) / (x2 - x1);
    let slope2 = (y4 - y3) / (x4 - x3);
    let x_intersection = (slope1 * x1 - slope2 * x3 + y3 - y1) / (slope1 - slope2);
    let y_intersection = slope1 * (x_intersection - x1) + y1;
    (x_intersection, y_intersection)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monotone_egm() -> RawEgmOutput {
        RawEgmOutput {
            endogenous_grid: vec![1.0, 2.0, 3.0, 4.0, 5.0],
            policy: vec![0.5, 1.0, 1.5, 2.0, 2.5],
            value: vec![0.0, 1.0, 2.0, 3.0, 4.0],
            expected_value_zero: -1.0,
        }
    }

    struct LogModel;
    impl ModelPrimitives for LogModel {
        fn utility(&self, c: E, _sc: StateChoice, _p: &Params) -> E {
            if c > 0.0 { c.ln() } else { -1e10 }
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
        fn final_period_solution(&self, _sc: StateChoice, r: E, _p: &Params) -> (E, E) {
            (1.0 / r, r.ln())
        }
    }

    fn params() -> Params {
        use std::collections::HashMap;
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
    fn no_kink_case_is_sorted_input_with_zero_prepended() {
        let raw = monotone_egm();
        let model = LogModel;
        let p = params();
        let sc = StateChoice { state: &[0, 0], choice: 0 };
        let out = fues_refine(&raw, 2.0, sc, &model, &p);

        assert_eq!(out.endogenous_grid[0], 0.0);
        for w in out.endogenous_grid.windows(2) {
            assert!(w[1] > w[0], "grid must be strictly increasing: {:?}", out.endogenous_grid);
        }
        // All original points (plus the prepended zero) survive: no kink fires.
        assert_eq!(out.endogenous_grid.len(), raw.endogenous_grid.len() + 1);
    }

    #[test]
    fn output_is_strictly_increasing_in_x() {
        // A raw grid with a secondary kink: value dips then recovers.
        let raw = RawEgmOutput {
            endogenous_grid: vec![1.0, 2.0, 1.5, 3.0, 4.0],
            policy: vec![0.5, 1.0, 0.7, 1.5, 2.0],
            value: vec![0.0, 1.0, 0.3, 1.8, 2.5],
            expected_value_zero: -1.0,
        };
        let model = LogModel;
        let p = params();
        let sc = StateChoice { state: &[0, 0], choice: 0 };
        let out = fues_refine(&raw, 2.0, sc, &model, &p);
        for w in out.endogenous_grid.windows(2) {
            assert!(w[1] >= w[0] - 1e-12, "grid must be non-decreasing: {:?}", out.endogenous_grid);
        }
    }

    #[test]
    fn credit_constrained_augmentation_is_noop_when_grid_starts_at_min() {
        // monotone_egm()'s x[0] already equals min(x), so the credit-
        // constrained augmentation in fues_refine never fires; the only
        // point added beyond the raw grid is the always-prepended zero.
        let raw = monotone_egm();
        let model = LogModel;
        let p = params();
        let sc = StateChoice { state: &[0, 0], choice: 0 };
        let out = fues_refine(&raw, 2.0, sc, &model, &p);
        assert_eq!(out.endogenous_grid.len(), raw.endogenous_grid.len() + 1);
    }

    #[test]
    fn point_on_line_matches_direct_line_substitution() {
        use approx::assert_relative_eq;
        // Line through (1, 2) and (5, 10): slope 2, y = 2*(x - 1) + 2.
        let y = point_on_line(1.0, 2.0, 5.0, 10.0, 3.0);
        assert_relative_eq!(y, 2.0 * (3.0 - 1.0) + 2.0, epsilon = 1e-12);
    }

    #[test]
    fn linear_intersection_matches_direct_substitution_into_both_lines() {
        use approx::assert_relative_eq;
        // Line 1 through (0, 0) and (2, 4): y = 2x.
        // Line 2 through (0, 6) and (2, 2): y = 6 - 2x.
        // They cross at x = 1.5, y = 3.
        let (ix, iv) = linear_intersection(0.0, 0.0, 2.0, 4.0, 0.0, 6.0, 2.0, 2.0);
        assert_relative_eq!(ix, 1.5, epsilon = 1e-12);
        assert_relative_eq!(iv, 3.0, epsilon = 1e-12);

        let on_line_1 = point_on_line(0.0, 0.0, 2.0, 4.0, ix);
        let on_line_2 = point_on_line(0.0, 6.0, 2.0, 2.0, ix);
        assert_relative_eq!(on_line_1, iv, epsilon = 1e-12);
        assert_relative_eq!(on_line_2, iv, epsilon = 1e-12);
    }

    proptest::proptest! {
        #[test]
        fn refined_grid_is_nondecreasing_for_any_monotone_raw_input(
            dx in proptest::collection::vec(0.1f64..5.0, 4..12),
            dc in proptest::collection::vec(0.05f64..2.0, 4..12),
        ) {
            let n = dx.len().min(dc.len());
            let (mut x, mut c, mut v) = (Vec::with_capacity(n), Vec::with_capacity(n), Vec::with_capacity(n));
            let (mut cum_x, mut cum_c) = (1.0, 0.5);
            for i in 0..n {
                cum_x += dx[i];
                cum_c += dc[i];
                x.push(cum_x);
                c.push(cum_c);
                v.push(cum_x.ln());
            }
            let raw = RawEgmOutput { endogenous_grid: x, policy: c, value: v, expected_value_zero: -1.0 };
            let model = LogModel;
            let p = params();
            let sc = StateChoice { state: &[0, 0], choice: 0 };
            let out = fues_refine(&raw, 2.0, sc, &model, &p);
            for w in out.endogenous_grid.windows(2) {
                proptest::prop_assert!(w[1] >= w[0] - 1e-9, "grid not non-decreasing: {:?}", out.endogenous_grid);
            }
        }
    }
}

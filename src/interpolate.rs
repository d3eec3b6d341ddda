//! Interpolation kernel (I, SPEC_FULL.md §4.3 / spec.md §4.3).
//!
//! Free functions over plain slices, styled like the teacher's
//! `linalg::vector_ops` helpers: no state, no allocation beyond the
//! returned scalars.

use crate::E;
use crate::callback::{ModelPrimitives, StateChoice};
use crate::params::Params;

/// Result of evaluating a refined (endogenous-grid -> policy/value) mapping
/// at one query wealth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interpolated {
    pub policy: E,
    pub value: E,
}

/// 1-D contract (spec.md §4.3): `x` must be strictly increasing over its
/// first `valid_len` entries. For `w <= x[0]` the credit-constrained branch
/// extrapolates analytically using `value[0]` directly — `x[0]` need not be
/// zero (the final period's own grid usually isn't), it's simply the
/// smallest wealth level this grid was solved for.
pub fn interpolate_1d(
    x: &[E],
    policy: &[E],
    value: &[E],
    valid_len: usize,
    w: E,
    sc: StateChoice,
    model: &dyn ModelPrimitives,
    params: &Params,
) -> Interpolated {
    debug_assert!(valid_len >= 1);

    if w <= x[0] {
        let policy = w;
        let value = model.utility(w, sc, params) + params.beta() * value[0];
        return Interpolated { policy, value };
    }

    let last = valid_len - 1;
    if w > x[last] {
        return linear_blend(x, policy, value, last - 1, last, w);
    }

    // Binary search for i such that x[i-1] <= w < x[i].
    let mut lo = 0usize;
    let mut hi = last;
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        if x[mid] <= w {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    linear_blend(x, policy, value, lo, hi, w)
}

fn linear_blend(x: &[E], policy: &[E], value: &[E], lo: usize, hi: usize, w: E) -> Interpolated {
    let span = x[hi] - x[lo];
    let t = if span.abs() > 1e-16 { (w - x[lo]) / span } else { 0.0 };
    Interpolated {
        policy: policy[lo] + t * (policy[hi] - policy[lo]),
        value: value[lo] + t * (value[hi] - value[lo]),
    }
}

/// 2-D contract (spec.md §4.3): interpolates a secondary continuous state
/// `z` on its regular grid first, then blends the 1-D interpolations at the
/// two bracketing nodes. `slices` holds one `(x, policy, value, valid_len)`
/// tuple per node of `z_grid`, in the same order.
#[allow(clippy::too_many_arguments)]
pub fn interpolate_2d(
    z_grid: &[E],
    slices: &[(&[E], &[E], &[E], usize)],
    z: E,
    w: E,
    sc: StateChoice,
    model: &dyn ModelPrimitives,
    params: &Params,
) -> Interpolated {
    debug_assert_eq!(z_grid.len(), slices.len());
    debug_assert!(!z_grid.is_empty());

    if z_grid.len() == 1 || z <= z_grid[0] {
        let (x, p, v, n) = slices[0];
        return interpolate_1d(x, p, v, n, w, sc, model, params);
    }
    let last = z_grid.len() - 1;
    if z >= z_grid[last] {
        let (x, p, v, n) = slices[last];
        return interpolate_1d(x, p, v, n, w, sc, model, params);
    }

    let mut lo = 0usize;
    let mut hi = last;
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        if z_grid[mid] <= z {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let (x_lo, p_lo, v_lo, n_lo) = slices[lo];
    let (x_hi, p_hi, v_hi, n_hi) = slices[hi];
    let below = interpolate_1d(x_lo, p_lo, v_lo, n_lo, w, sc, model, params);
    let above = interpolate_1d(x_hi, p_hi, v_hi, n_hi, w, sc, model, params);

    let span = z_grid[hi] - z_grid[lo];
    let t = if span.abs() > 1e-16 { (z - z_grid[lo]) / span } else { 0.0 };
    Interpolated {
        policy: below.policy + t * (above.policy - below.policy),
        value: below.value + t * (above.value - below.value),
    }
}

//! State-space builder (S, SPEC_FULL.md §4.2 / spec.md §4.2).
//!
//! Built with the same chained `with_*` + terminal `build()` idiom the
//! teacher uses for its solver builders: every optional input is recorded,
//! then `build()` validates the whole configuration at once and returns a
//! `Result`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A discrete state vector: `[period, lagged_choice, endog vars…, exog vars…]`
/// (spec.md §3 — column order is fixed by convention).
pub type State = Vec<i64>;

/// Discrete state together with the choice taken from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChoiceRow {
    pub state: State,
    pub choice: i64,
}

/// The sparsity condition's verdict on a candidate state.
pub enum Sparsity {
    /// The state is valid as-is.
    Valid,
    /// The state is invalid; use `proxy` as its stand-in wherever the
    /// child-state map would otherwise reference it.
    ProxiedBy(State),
    /// The state cannot occur at all (no proxy either).
    Invalid,
}

/// User-supplied hooks consulted only while the state space is being built.
/// Kept separate from [`crate::callback::ModelPrimitives`], which is
/// consulted on the hot path once the space already exists.
pub trait StateSpaceSpec {
    /// `sparsity_condition(state) -> Sparsity` (spec.md §3, §4.2).
    fn sparsity(&self, state: &[i64]) -> Sparsity {
        let _ = state;
        Sparsity::Valid
    }

    /// Deterministic child state reached from `(state, choice)` at the
    /// `exog_index`-th realisation of the exogenous-state product, or
    /// `None` for an infeasible transition (sentinel −1 in spec.md §3).
    fn child_state(&self, state: &[i64], choice: i64, exog_index: usize) -> Option<State>;
}

/// Enumerated discrete state space plus the derived state-choice tables (S,
/// spec.md §4.2). This is also the unit of persistence for §6.4: the whole
/// struct is serialised as one opaque blob. The callback set is never part
/// of it and must be re-supplied on load.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateSpace {
    pub n_periods: i64,
    pub n_choices: usize,
    pub n_exog_states: usize,

    /// Dense table of states; `states[id]` is that state's column vector.
    pub states: Vec<State>,
    /// Inverse of `states`: state vector -> id, for valid, non-proxied states.
    pub index_of: BTreeMap<State, usize>,
    /// Like `index_of`, but invalid-and-proxied states resolve to their
    /// proxy's id, so the child map is total over every state the builder
    /// was asked about (spec.md §4.2 item 5).
    pub index_of_child: BTreeMap<State, usize>,

    pub state_choices: Vec<StateChoiceRow>,
    /// `parent_of[sc_id]` = the id in `states` of that state-choice's state.
    pub parent_of: Vec<usize>,
    /// `(state id, choice) -> state-choice id`, for resolving a child
    /// state's feasible choices back into solved-array lookups.
    pub sc_index: BTreeMap<(usize, i64), usize>,
    /// `children_of[sc_id]` = one entry per exogenous-state realisation;
    /// `None` marks an infeasible transition.
    pub children_of: Vec<Vec<Option<usize>>>,

    /// Contiguous chunks of state-choice ids for each period, ordered so
    /// that every batch's children are already solved (spec.md §4.2 item 6).
    pub batches_by_period: Vec<Vec<Vec<usize>>>,
}

impl StateSpace {
    /// State-choice ids belonging to `period`.
    pub fn state_choices_in_period(&self, period: i64) -> Vec<usize> {
        self.state_choices
            .iter()
            .enumerate()
            .filter(|(_, sc)| sc.state[0] == period)
            .map(|(id, _)| id)
            .collect()
    }
}

pub struct StateSpaceBuilder<'a> {
    n_periods: Option<i64>,
    choices: Option<Vec<i64>>,
    endog_state_grids: Vec<(String, Vec<i64>)>,
    n_exog_states: Option<usize>,
    spec: Option<&'a dyn StateSpaceSpec>,
    batch_shrink_factor: f64,
}

impl<'a> Default for StateSpaceBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> StateSpaceBuilder<'a> {
    pub fn new() -> Self {
        Self {
            n_periods: None,
            choices: None,
            endog_state_grids: Vec::new(),
            n_exog_states: None,
            spec: None,
            batch_shrink_factor: 0.95,
        }
    }

    pub fn with_n_periods(mut self, n_periods: i64) -> Self {
        self.n_periods = Some(n_periods);
        self
    }

    pub fn with_choices(mut self, choices: Vec<i64>) -> Self {
        self.choices = Some(choices);
        self
    }

    /// Adds an endogenous discrete state variable with the given admissible
    /// values (spec.md §6.2 `endogenous_states`).
    pub fn with_endog_state(mut self, name: impl Into<String>, values: Vec<i64>) -> Self {
        self.endog_state_grids.push((name.into(), values));
        self
    }

    pub fn with_n_exog_states(mut self, n_exog_states: usize) -> Self {
        self.n_exog_states = Some(n_exog_states);
        self
    }

    pub fn with_spec(mut self, spec: &'a dyn StateSpaceSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn build(self) -> Result<StateSpace, ConfigError> {
        let n_periods = self
            .n_periods
            .ok_or(ConfigError::TooFewPeriods { n_periods: 0 })?;
        if n_periods < 2 {
            return Err(ConfigError::TooFewPeriods { n_periods });
        }
        let choices = self.choices.unwrap_or_default();
        let n_choices = choices.len();
        let n_exog_states = self.n_exog_states.unwrap_or(1);
        let spec = self.spec;

        let mut states = Vec::new();
        let mut index_of = BTreeMap::new();
        let mut proxied_from: Vec<State> = Vec::new();
        let mut proxied_to: Vec<State> = Vec::new();

        let endog_combos = cartesian_product(&self.endog_state_grids);

        for period in 0..n_periods {
            for lagged_choice in &choices {
                for endog in &endog_combos {
                    for exog_state in 0..n_exog_states {
                        let mut state = vec![period, *lagged_choice];
                        state.extend(endog.iter().copied());
                        state.push(exog_state as i64);

                        let sparsity = spec
                            .map(|s| s.sparsity(&state))
                            .unwrap_or(Sparsity::Valid);
                        match sparsity {
                            Sparsity::Valid => {
                                index_of.insert(state.clone(), states.len());
                                states.push(state);
                            }
                            Sparsity::ProxiedBy(proxy) => {
                                proxied_from.push(state);
                                proxied_to.push(proxy);
                            }
                            Sparsity::Invalid => {}
                        }
                    }
                }
            }
        }

        // Every proxy target must itself be a valid, non-proxied state
        // (spec.md §3, §4.2 failure modes), and nothing can be both proxied
        // and independently declared valid.
        let mut index_of_child = index_of.clone();
        for (from, to) in proxied_from.iter().zip(proxied_to.iter()) {
            if index_of.contains_key(from) {
                return Err(ConfigError::ProxiedValidState { state: from.clone() });
            }
            let target_id = index_of.get(to).ok_or_else(|| ConfigError::InvalidProxyTarget {
                state: from.clone(),
                proxy: to.clone(),
            })?;
            index_of_child.insert(from.clone(), *target_id);
        }

        let mut state_choices = Vec::new();
        let mut parent_of = Vec::new();
        let mut sc_index = BTreeMap::new();
        for (state_id, state) in states.iter().enumerate() {
            for choice in &choices {
                sc_index.insert((state_id, *choice), state_choices.len());
                state_choices.push(StateChoiceRow {
                    state: state.clone(),
                    choice: *choice,
                });
                parent_of.push(state_id);
            }
        }

        let mut children_of = Vec::with_capacity(state_choices.len());
        for sc in &state_choices {
            let mut children = Vec::with_capacity(n_exog_states);
            for exog_index in 0..n_exog_states {
                let child = spec.and_then(|s| s.child_state(&sc.state, sc.choice, exog_index));
                let resolved = match child {
                    None => None,
                    Some(child_state) => match index_of_child.get(&child_state) {
                        Some(id) => Some(*id),
                        None => {
                            return Err(ConfigError::MissingProxy { state: child_state });
                        }
                    },
                };
                children.push(resolved);
            }
            if children.len() != n_exog_states {
                return Err(ConfigError::ChildVectorLengthMismatch {
                    sc_id: children_of.len(),
                    got: children.len(),
                    expected: n_exog_states,
                });
            }
            children_of.push(children);
        }

        let state_choice_index_of_state_id: HashMap<usize, Vec<usize>> = {
            let mut m: HashMap<usize, Vec<usize>> = HashMap::new();
            for (sc_id, parent) in parent_of.iter().enumerate() {
                m.entry(*parent).or_default().push(sc_id);
            }
            m
        };

        let mut batches_by_period = vec![Vec::new(); n_periods as usize];
        for period in 0..n_periods {
            let sc_ids: Vec<usize> = (0..state_choices.len())
                .filter(|&sc_id| state_choices[sc_id].state[0] == period)
                .collect();
            batches_by_period[period as usize] =
                partition_into_batches(&sc_ids, &children_of, &parent_of, self.batch_shrink_factor);
        }
        let _ = state_choice_index_of_state_id;

        Ok(StateSpace {
            n_periods,
            n_choices,
            n_exog_states,
            states,
            index_of,
            index_of_child,
            state_choices,
            parent_of,
            sc_index,
            children_of,
            batches_by_period,
        })
    }
}

/// Builder's batching step (spec.md §4.2 item 6): picks the largest batch
/// size ≤ `|sc_ids|`, shrinking it by `shrink_factor` each time, such that
/// every child referenced from a batch is not itself in that same batch —
/// the only way a same-period reference could violate "already solved in a
/// later-period batch" is a self-reference, since real DC-EGM children
/// always live one period ahead.
fn partition_into_batches(
    sc_ids: &[usize],
    children_of: &[Vec<Option<usize>>],
    parent_of: &[usize],
    shrink_factor: f64,
) -> Vec<Vec<usize>> {
    if sc_ids.is_empty() {
        return Vec::new();
    }
    let mut batch_size = sc_ids.len();
    loop {
        let chunks: Vec<Vec<usize>> = sc_ids.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect();
        if chunks
            .iter()
            .all(|chunk| batch_respects_dependencies(chunk, children_of, parent_of))
        {
            return chunks;
        }
        let next = ((batch_size as f64) * shrink_factor).floor() as usize;
        if next >= batch_size || next == 0 {
            // Can't shrink further; fall back to singleton batches, which
            // trivially respect the invariant (no state-choice depends on
            // itself within the same batch).
            return sc_ids.iter().map(|&id| vec![id]).collect();
        }
        batch_size = next;
    }
}

fn batch_respects_dependencies(
    chunk: &[usize],
    children_of: &[Vec<Option<usize>>],
    parent_of: &[usize],
) -> bool {
    let states_in_chunk: std::collections::HashSet<usize> =
        chunk.iter().map(|&sc_id| parent_of[sc_id]).collect();
    for &sc_id in chunk {
        for child in children_of[sc_id].iter().flatten() {
            if states_in_chunk.contains(child) {
                return false;
            }
        }
    }
    true
}

fn cartesian_product(grids: &[(String, Vec<i64>)]) -> Vec<Vec<i64>> {
    let mut result = vec![Vec::new()];
    for (_, values) in grids {
        let mut next = Vec::with_capacity(result.len() * values.len());
        for prefix in &result {
            for v in values {
                let mut combo = prefix.clone();
                combo.push(*v);
                next.push(combo);
            }
        }
        result = next;
    }
    result
}

//! Persisted model metadata (SPEC_FULL.md §6.4 / spec.md §6.4).
//!
//! [`crate::state_space::StateSpace`] is the unit of persistence: the state
//! space, index maps, and batch descriptor serialise as a single opaque
//! blob. The callback set is never part of it and must be re-supplied on
//! load (spec.md §6.4).

use crate::state_space::StateSpace;

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum PersistError {
    #[display("failed to encode model metadata: {_0}")]
    Encode(bincode::error::EncodeError),
    #[display("failed to decode model metadata: {_0}")]
    Decode(bincode::error::DecodeError),
}

/// Serialises a [`StateSpace`] into a single opaque blob.
pub fn save(state_space: &StateSpace) -> Result<Vec<u8>, PersistError> {
    bincode::serde::encode_to_vec(state_space, bincode::config::standard()).map_err(PersistError::Encode)
}

/// Deserialises a blob previously produced by [`save`].
pub fn load(bytes: &[u8]) -> Result<StateSpace, PersistError> {
    let (state_space, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard()).map_err(PersistError::Decode)?;
    Ok(state_space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_space::{Sparsity, State, StateSpaceBuilder, StateSpaceSpec};

    struct NoExogSpec;
    impl StateSpaceSpec for NoExogSpec {
        fn sparsity(&self, _state: &[i64]) -> Sparsity {
            Sparsity::Valid
        }
        fn child_state(&self, state: &[i64], choice: i64, exog_index: usize) -> Option<State> {
            let period = state[0];
            if period + 1 >= 2 {
                return None;
            }
            Some(vec![period + 1, choice, exog_index as i64])
        }
    }

    #[test]
    fn save_then_load_round_trips_byte_identical_metadata() {
        let spec = NoExogSpec;
        let state_space = StateSpaceBuilder::new()
            .with_n_periods(2)
            .with_choices(vec![0, 1])
            .with_n_exog_states(1)
            .with_spec(&spec)
            .build()
            .unwrap();

        let blob = save(&state_space).unwrap();
        let round_tripped = load(&blob).unwrap();

        assert_eq!(round_tripped.states, state_space.states);
        assert_eq!(round_tripped.state_choices.len(), state_space.state_choices.len());
        assert_eq!(round_tripped.batches_by_period.len(), state_space.batches_by_period.len());

        let blob_again = save(&round_tripped).unwrap();
        assert_eq!(blob, blob_again);
    }
}

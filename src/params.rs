//! Immutable, name-keyed parameter mapping (see SPEC_FULL.md §7, spec.md §9).
//!
//! The reference implementation's dynamic-typed, per-field param dictionary
//! is replaced here with a single flat `name -> f64` map, validated once at
//! setup against a required-name whitelist. There is no downcasting, no
//! per-field type: every param is promoted to [`E`] (`f64`).

use std::collections::HashMap;

use crate::E;
use crate::error::ConfigError;

/// The params every model needs regardless of its user-defined extras
/// (spec.md §6.3).
pub const REQUIRED_PARAMS: &[&str] = &["beta", "interest_rate", "lambda", "sigma"];

/// An immutable, name-keyed mapping of scalar model parameters.
///
/// Constructed once via [`Params::build`], which validates that every name
/// in a caller-supplied whitelist is present and finite. After construction
/// the map cannot be mutated, matching the "params by value, no runtime
/// indirection on the hot path" design note in spec.md §9.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    values: HashMap<String, E>,
}

impl Params {
    /// Validates `values` against `required` (in addition to the always-
    /// required [`REQUIRED_PARAMS`]) and returns an immutable [`Params`].
    pub fn build(
        values: HashMap<String, E>,
        required: &[&str],
    ) -> Result<Self, ConfigError> {
        for name in REQUIRED_PARAMS.iter().chain(required.iter()) {
            match values.get(*name) {
                None => {
                    return Err(ConfigError::MissingParam {
                        name: (*name).to_string(),
                    });
                }
                Some(v) if !v.is_finite() => {
                    return Err(ConfigError::NonFiniteParam {
                        name: (*name).to_string(),
                        value: *v,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(Self { values })
    }

    /// Look up a parameter by name. Panics if absent — callers must only
    /// request names that were part of the whitelist passed to
    /// [`Params::build`]; that is a programming error, not a runtime one.
    pub fn get(&self, name: &str) -> E {
        *self
            .values
            .get(name)
            .unwrap_or_else(|| panic!("param '{name}' was not validated at setup"))
    }

    pub fn get_opt(&self, name: &str) -> Option<E> {
        self.values.get(name).copied()
    }

    pub fn beta(&self) -> E {
        self.get("beta")
    }

    pub fn interest_rate(&self) -> E {
        self.get("interest_rate")
    }

    pub fn lambda(&self) -> E {
        self.get("lambda")
    }

    pub fn sigma(&self) -> E {
        self.get("sigma")
    }
}

/// Parses a flat `name = number` map (one assignment per top-level TOML key)
/// into a param table. Intentionally minimal: model topology (periods,
/// choices, states) is still built programmatically via
/// [`crate::state_space::StateSpaceBuilder`] — see SPEC_FULL.md §6.4.
#[cfg(feature = "toml-params")]
pub fn from_toml_str(
    text: &str,
    required: &[&str],
) -> Result<Params, ConfigError> {
    let table: toml::Table = toml::from_str(text)
        .map_err(|_| ConfigError::MissingParam { name: "<malformed toml>".to_string() })?;
    let mut values = HashMap::with_capacity(table.len());
    for (k, v) in table {
        let f = v
            .as_float()
            .or_else(|| v.as_integer().map(|i| i as E))
            .ok_or_else(|| ConfigError::NonFiniteParam { name: k.clone(), value: f64::NAN })?;
        values.insert(k, f);
    }
    Params::build(values, required)
}

#[cfg(feature = "json-params")]
pub fn from_json_str(
    text: &str,
    required: &[&str],
) -> Result<Params, ConfigError> {
    let table: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)
        .map_err(|_| ConfigError::MissingParam { name: "<malformed json>".to_string() })?;
    let mut values = HashMap::with_capacity(table.len());
    for (k, v) in table {
        let f = v
            .as_f64()
            .ok_or_else(|| ConfigError::NonFiniteParam { name: k.clone(), value: f64::NAN })?;
        values.insert(k, f);
    }
    Params::build(values, required)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_values() -> HashMap<String, E> {
        HashMap::from([
            ("beta".to_string(), 0.95),
            ("interest_rate".to_string(), 0.02),
            ("lambda".to_string(), 1.0),
            ("sigma".to_string(), 0.0),
        ])
    }

    #[test]
    fn build_succeeds_with_all_required_params() {
        let params = Params::build(base_values(), &[]).unwrap();
        assert_eq!(params.beta(), 0.95);
        assert_eq!(params.interest_rate(), 0.02);
    }

    #[test]
    fn build_rejects_missing_required_param() {
        let mut values = base_values();
        values.remove("beta");
        let err = Params::build(values, &[]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingParam {
                name: "beta".to_string()
            }
        );
    }

    #[test]
    fn build_rejects_non_finite_param() {
        let mut values = base_values();
        values.insert("beta".to_string(), f64::NAN);
        assert!(matches!(
            Params::build(values, &[]).unwrap_err(),
            ConfigError::NonFiniteParam { .. }
        ));
    }

    #[test]
    fn build_validates_extra_required_whitelist() {
        let values = base_values();
        let err = Params::build(values, &["ltc_cost"]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingParam {
                name: "ltc_cost".to_string()
            }
        );
    }
}

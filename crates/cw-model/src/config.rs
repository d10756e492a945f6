use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldMode {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteFidelityMode {
    Strict,
    Advisory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    Explore,
    Certify,
}

/// Dynamic abstention replaces the fixed `H_UND` floor with a pressure
/// signal computed from the run so far.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DynamicAbstentionConfig {
    pub enabled: bool,
    pub weight_unresolved_pairs: f64,
    pub weight_contradiction_density: f64,
    pub weight_non_discriminative: f64,
    pub weight_frame_inadequacy: f64,
    pub min_mass: f64,
    pub max_mass: f64,
}

impl Default for DynamicAbstentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            weight_unresolved_pairs: 0.30,
            weight_contradiction_density: 0.30,
            weight_non_discriminative: 0.20,
            weight_frame_inadequacy: 0.20,
            min_mass: 0.02,
            max_mass: 0.35,
        }
    }
}

/// Every tunable the engine consults, as one immutable value object.
///
/// Unknown keys are rejected at load time; every default is explicit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Confidence closure threshold.
    pub tau: f64,
    /// Frontier band below the leader.
    pub epsilon: f64,
    /// Prior mass for the none-of-the-above absorber (open world).
    pub gamma_noa: f64,
    /// Prior mass for the underdetermined absorber.
    pub gamma_und: f64,
    /// Damping coefficient blending the previous ledger mass.
    pub alpha: f64,
    /// Log-odds scale applied to the root multiplier.
    pub beta: f64,
    /// Symmetric clamp on the log-odds weight.
    pub weight_clamp: f64,
    /// Scheduling priority weight for VOI-lite slot selection.
    pub lambda_voi: f64,
    pub world: WorldMode,
    /// Required obligation slots instantiated for every named root.
    pub template_slots: Vec<String>,
    pub strict_contrastive: bool,
    pub require_typed_discriminators: bool,
    /// Drift bound for non-discriminative evaluations in strict mode.
    pub epsilon_nc: f64,
    pub active_set_size: usize,
    /// A contender below `leader_mass * mass_ratio_floor` leaves the
    /// active set. Zero disables the filter.
    pub mass_ratio_floor: f64,
    pub pair_budget: usize,
    pub dynamic_abstention: DynamicAbstentionConfig,
    pub frame_adequacy_threshold: f64,
    pub frame_cap: f64,
    pub calibration_cap: f64,
    pub calibration_validated: bool,
    pub profile_cap: f64,
    pub quote_fidelity: QuoteFidelityMode,
    pub reasoning_mode: ReasoningMode,
    /// Tag routing to a declarative policy bundle.
    pub profile: String,
    pub min_winner_margin: f64,
    pub min_decomposition_depth: usize,
    pub adjudication_required: bool,
    /// Credits held back for counterevidence probes at the end of the
    /// budget. Regular operations are blocked once only the reserve
    /// remains.
    pub counterevidence_reserve: u64,
    pub max_pair_overlap: u8,
    pub refund_on_port_failure: bool,
    pub sticky_lock: bool,
    pub value_prioritization: bool,
    pub balanced_targeting: bool,
    pub dual_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tau: 0.75,
            epsilon: 0.10,
            gamma_noa: 0.10,
            gamma_und: 0.10,
            alpha: 0.30,
            beta: 1.0,
            weight_clamp: 3.0,
            lambda_voi: 0.25,
            world: WorldMode::Open,
            template_slots: vec![
                "mechanism".to_owned(),
                "availability".to_owned(),
                "fit".to_owned(),
            ],
            strict_contrastive: false,
            require_typed_discriminators: false,
            epsilon_nc: 0.02,
            active_set_size: 3,
            mass_ratio_floor: 0.0,
            pair_budget: 6,
            dynamic_abstention: DynamicAbstentionConfig::default(),
            frame_adequacy_threshold: 0.5,
            frame_cap: 0.85,
            calibration_cap: 0.90,
            calibration_validated: false,
            profile_cap: 1.0,
            quote_fidelity: QuoteFidelityMode::Strict,
            reasoning_mode: ReasoningMode::Explore,
            profile: "explore_default".to_owned(),
            min_winner_margin: 0.15,
            min_decomposition_depth: 0,
            adjudication_required: false,
            counterevidence_reserve: 0,
            max_pair_overlap: 1,
            refund_on_port_failure: false,
            sticky_lock: true,
            value_prioritization: true,
            balanced_targeting: true,
            dual_output: true,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| ConfigError::Malformed {
                detail: err.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, value: f64| -> Result<(), ConfigError> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::OutOfRange {
                    option: name.to_owned(),
                    value,
                })
            }
        };
        unit("tau", self.tau)?;
        unit("epsilon", self.epsilon)?;
        unit("gamma_noa", self.gamma_noa)?;
        unit("gamma_und", self.gamma_und)?;
        unit("alpha", self.alpha)?;
        unit("lambda_voi", self.lambda_voi)?;
        unit("epsilon_nc", self.epsilon_nc)?;
        unit("mass_ratio_floor", self.mass_ratio_floor)?;
        unit("frame_adequacy_threshold", self.frame_adequacy_threshold)?;
        unit("frame_cap", self.frame_cap)?;
        unit("calibration_cap", self.calibration_cap)?;
        unit("profile_cap", self.profile_cap)?;
        unit("min_winner_margin", self.min_winner_margin)?;
        unit(
            "dynamic_abstention.min_mass",
            self.dynamic_abstention.min_mass,
        )?;
        unit(
            "dynamic_abstention.max_mass",
            self.dynamic_abstention.max_mass,
        )?;
        if self.gamma_noa + self.gamma_und >= 1.0 {
            return Err(ConfigError::OutOfRange {
                option: "gamma_noa + gamma_und".to_owned(),
                value: self.gamma_noa + self.gamma_und,
            });
        }
        if self.beta <= 0.0 {
            return Err(ConfigError::OutOfRange {
                option: "beta".to_owned(),
                value: self.beta,
            });
        }
        if self.weight_clamp <= 0.0 {
            return Err(ConfigError::OutOfRange {
                option: "weight_clamp".to_owned(),
                value: self.weight_clamp,
            });
        }
        if self.dynamic_abstention.min_mass > self.dynamic_abstention.max_mass {
            return Err(ConfigError::AbstentionBoundsInverted {
                min: self.dynamic_abstention.min_mass,
                max: self.dynamic_abstention.max_mass,
            });
        }
        if self.template_slots.is_empty() {
            return Err(ConfigError::EmptyTemplate);
        }
        if self.active_set_size < 2 {
            return Err(ConfigError::ActiveSetTooSmall {
                size: self.active_set_size,
            });
        }
        Ok(())
    }

    /// Apply the declarative bundle the profile tag routes to.
    pub fn apply_profile(&mut self) -> Result<ProfileBundle, ConfigError> {
        let bundle = resolve_profile(&self.profile)?;
        bundle.overlay(self);
        Ok(bundle)
    }
}

/// Declarative policy bundle a reasoning-profile tag routes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileBundle {
    pub tag: String,
    pub reasoning_mode: ReasoningMode,
    pub profile_cap: f64,
    pub strict_contrastive: bool,
    pub adjudication_required: bool,
    pub dual_output: bool,
}

impl ProfileBundle {
    pub fn overlay(&self, config: &mut Config) {
        config.reasoning_mode = self.reasoning_mode;
        config.profile_cap = self.profile_cap;
        config.strict_contrastive = self.strict_contrastive;
        config.adjudication_required = self.adjudication_required;
        config.dual_output = self.dual_output;
    }

    /// Stable fingerprint recorded in the session envelope.
    #[must_use]
    pub fn fingerprint(&self) -> cw_canon::CanonicalId {
        let serialized =
            serde_json::to_string(self).unwrap_or_else(|_| self.tag.clone());
        cw_canon::CanonicalId::of_bytes(serialized.as_bytes())
    }
}

pub fn resolve_profile(tag: &str) -> Result<ProfileBundle, ConfigError> {
    match tag {
        "explore_default" => Ok(ProfileBundle {
            tag: tag.to_owned(),
            reasoning_mode: ReasoningMode::Explore,
            profile_cap: 1.0,
            strict_contrastive: false,
            adjudication_required: false,
            dual_output: true,
        }),
        "certify_default" => Ok(ProfileBundle {
            tag: tag.to_owned(),
            reasoning_mode: ReasoningMode::Certify,
            profile_cap: 0.95,
            strict_contrastive: true,
            adjudication_required: true,
            dual_output: true,
        }),
        _ => Err(ConfigError::UnknownProfile {
            tag: tag.to_owned(),
        }),
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("configuration is malformed: {detail}")]
    Malformed { detail: String },
    #[error("option {option} has out-of-range value {value}")]
    OutOfRange { option: String, value: f64 },
    #[error("dynamic abstention bounds inverted: min {min} > max {max}")]
    AbstentionBoundsInverted { min: f64, max: f64 },
    #[error("template slot set must not be empty")]
    EmptyTemplate,
    #[error("active set needs at least two contenders, got {size}")]
    ActiveSetTooSmall { size: usize },
    #[error("unknown reasoning profile {tag:?}")]
    UnknownProfile { tag: String },
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigError, ReasoningMode};

    #[test]
    fn defaults_pass_validation() {
        Config::default().validate().expect("defaults are coherent");
    }

    #[test]
    fn unknown_keys_are_rejected_at_load_time() {
        let err = Config::from_json(r#"{"tau": 0.8, "turbo_mode": true}"#)
            .expect_err("unknown key must fail");
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn out_of_range_tau_is_rejected() {
        let err = Config::from_json(r#"{"tau": 1.5}"#).expect_err("range check");
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn certify_profile_overlays_mode_and_cap() {
        let mut config = Config::default();
        config.profile = "certify_default".to_owned();
        let bundle = config.apply_profile().expect("known profile");
        assert_eq!(config.reasoning_mode, ReasoningMode::Certify);
        assert!(config.strict_contrastive);
        assert!((config.profile_cap - 0.95).abs() < f64::EPSILON);
        assert_eq!(bundle.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn unknown_profile_tag_is_rejected() {
        let mut config = Config::default();
        config.profile = "yolo".to_owned();
        assert!(matches!(
            config.apply_profile(),
            Err(ConfigError::UnknownProfile { .. })
        ));
    }

    #[test]
    fn inverted_abstention_bounds_are_rejected() {
        let mut config = Config::default();
        config.dynamic_abstention.min_mass = 0.5;
        config.dynamic_abstention.max_mass = 0.1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AbstentionBoundsInverted { .. })
        ));
    }
}

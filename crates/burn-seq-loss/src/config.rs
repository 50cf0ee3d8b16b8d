use burn::config::Config;
use burn::nn::Initializer;
use serde_json::{Map, Value};

use crate::LossError;

/// Training criterion of an output layer, by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossName {
    /// Framewise cross-entropy.
    Ce,
    /// Cross-entropy on labelled batch entries, self-entropy on unlabelled ones.
    Entropy,
    /// Cross-entropy against the prior-divided softmax.
    Priori,
    /// Sum of squared errors.
    Sse,
    /// Scoring only.
    None,
    /// Connectionist temporal classification via the CTC operator.
    Ctc,
    /// Framewise cross-entropy against frame-aligned CTC labels.
    CeCtc,
    /// Log-space CTC built from tensor operations.
    Ctc2,
    /// Loss and error signal computed by the external sprint scorer.
    Sprint,
    /// Cross-entropy against a forced Viterbi alignment.
    Viterbi,
    /// Expected score under a Baum-Welch soft alignment.
    FastBw,
}

impl LossName {
    /// Snake case name, as used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ce => "ce",
            Self::Entropy => "entropy",
            Self::Priori => "priori",
            Self::Sse => "sse",
            Self::None => "none",
            Self::Ctc => "ctc",
            Self::CeCtc => "ce_ctc",
            Self::Ctc2 => "ctc2",
            Self::Sprint => "sprint",
            Self::Viterbi => "viterbi",
            Self::FastBw => "fast_bw",
        }
    }
}

impl core::fmt::Display for LossName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for LossName {
    type Err = LossError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| LossError::UnknownLoss(s.to_string()))
    }
}

/// How many frames of the activations take part in the loss.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeLimit {
    /// Use every frame of the index.
    #[default]
    Off,
    /// Ignore frames from this position on and rescale the normalization accordingly.
    Frames(usize),
    /// When training, pad the shorter of activations and targets to the longer one.
    Inf,
}

/// Configuration of an output layer.
///
/// The options form the configuration surface shared by every output layer kind. They are
/// validated once, when the loss criterion of a layer is built.
#[derive(Config, Debug)]
pub struct OutputLayerConfig {
    /// Number of output classes.
    pub n_out: usize,
    /// Training criterion.
    pub loss: LossName,
    /// Time limit policy.
    #[config(default = "TimeLimit::Off")]
    pub time_limit: TimeLimit,
    /// Use the index of the first source instead of the target index.
    #[config(default = false)]
    pub use_source_index: bool,
    /// Clip the gradient of the logits to `[-c, c]`.
    pub grad_clip_z: Option<f32>,
    /// Zero the gradient of logits whose magnitude exceeds this bound.
    pub grad_discard_out_of_bound_z: Option<f32>,
    /// Count errors per sequence instead of per frame.
    #[config(default = false)]
    pub normalize_length: bool,
    /// Track a running average of the predicted class distribution.
    #[config(default = false)]
    pub compute_priors: bool,
    /// Use an exponential average with this factor for the running prior, `0` for a cumulative
    /// average.
    #[config(default = 0.0)]
    pub compute_priors_exp_average: f32,
    /// Factor applied to the logits before the softmax.
    #[config(default = 1.0)]
    pub softmax_smoothing: f32,
    /// Whether the logits are normalized with a softmax. When disabled, the input already holds
    /// probabilities.
    #[config(default = true)]
    pub apply_softmax: bool,
    /// Scale of the dropout masks applied to the sources.
    #[config(default = 1.0)]
    pub mass: f32,
    /// Scale of the log prior subtracted from the acoustic scores.
    #[config(default = 0.0)]
    pub prior_scale: f32,
    /// Path of a text file holding one log prior per class.
    pub log_prior: Option<String>,
    /// Weight of the cross-entropy blended into sequence criteria.
    #[config(default = 0.0)]
    pub ce_smoothing: f32,
    /// Name of the layer whose Baum-Welch alignment is blended in by `ce_smoothing`.
    pub ce_target_layer_align: Option<String>,
    /// Feed normalized log probabilities to the sprint scorer instead of the raw logits.
    #[config(default = true)]
    pub exp_normalize: bool,
    /// Scale of the acoustic scores fed to the forward-backward operator.
    #[config(default = 1.0)]
    pub am_scale: f32,
    /// Exponent applied to the soft alignment.
    #[config(default = 1.0)]
    pub gamma: f32,
    /// Divide the soft alignment by its class average.
    #[config(default = false)]
    pub bw_norm_class_avg: bool,
    /// Report the sprint loss as a cross-entropy against the implied soft targets.
    #[config(default = false)]
    pub loss_like_ce: bool,
    /// Learn the prior as a softmax over trainable logits.
    #[config(default = false)]
    pub trained_softmax_prior: bool,
    /// Options of the external sprint toolkit, as a JSON object.
    pub sprint_opts: Option<String>,
    /// Initializer of the projection weights.
    #[config(default = "Initializer::XavierUniform{gain:1.0}")]
    pub initializer: Initializer,
}

impl OutputLayerConfig {
    pub(crate) fn validate(&self) -> Result<(), LossError> {
        if self.n_out == 0 {
            return Err(LossError::InvalidConfig("n_out must be positive".into()));
        }
        if let Some(clip) = self.grad_clip_z {
            if clip <= 0.0 {
                return Err(LossError::InvalidConfig(format!(
                    "grad_clip_z must be positive, got {clip}"
                )));
            }
        }
        if let Some(bound) = self.grad_discard_out_of_bound_z {
            if bound <= 0.0 {
                return Err(LossError::InvalidConfig(format!(
                    "grad_discard_out_of_bound_z must be positive, got {bound}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.compute_priors_exp_average) {
            return Err(LossError::InvalidConfig(format!(
                "compute_priors_exp_average must be in [0, 1], got {}",
                self.compute_priors_exp_average
            )));
        }
        if !(0.0..=1.0).contains(&self.ce_smoothing) {
            return Err(LossError::InvalidConfig(format!(
                "ce_smoothing must be in [0, 1], got {}",
                self.ce_smoothing
            )));
        }
        if self.softmax_smoothing <= 0.0 {
            return Err(LossError::InvalidConfig(format!(
                "softmax_smoothing must be positive, got {}",
                self.softmax_smoothing
            )));
        }
        if self.gamma <= 0.0 {
            return Err(LossError::InvalidConfig(format!(
                "gamma must be positive, got {}",
                self.gamma
            )));
        }
        if self.trained_softmax_prior && self.compute_priors {
            return Err(LossError::InvalidConfig(
                "trained_softmax_prior and compute_priors exclude each other".into(),
            ));
        }
        if let TimeLimit::Frames(0) = self.time_limit {
            return Err(LossError::InvalidConfig(
                "a frame time limit must be positive, use TimeLimit::Off instead".into(),
            ));
        }

        Ok(())
    }

    pub(crate) fn sprint_options(&self, loss: &'static str) -> Result<SprintOptions, LossError> {
        let raw = self.sprint_opts.as_deref().ok_or(LossError::MissingOption {
            loss,
            option: "sprint_opts",
        })?;

        SprintOptions::parse(raw)
    }
}

/// Options forwarded verbatim to the external sprint toolkit.
#[derive(Clone, Debug, PartialEq)]
pub struct SprintOptions(Map<String, Value>);

impl SprintOptions {
    /// Parse a JSON object.
    pub fn parse(raw: &str) -> Result<Self, LossError> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(LossError::SprintOptions(format!(
                "expected a JSON object, got {other}"
            ))),
            Err(err) => Err(LossError::SprintOptions(err.to_string())),
        }
    }

    /// Look up one option.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// All options.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_names_parse_from_snake_case() {
        assert_eq!("fast_bw".parse::<LossName>().unwrap(), LossName::FastBw);
        assert_eq!("ce_ctc".parse::<LossName>().unwrap(), LossName::CeCtc);
        assert_eq!(LossName::Ctc2.to_string(), "ctc2");
    }

    #[test]
    fn unknown_loss_name_is_rejected() {
        let err = "mmi".parse::<LossName>().unwrap_err();

        assert!(matches!(err, LossError::UnknownLoss(name) if name == "mmi"));
    }

    #[test]
    fn defaults_are_valid() {
        let config = OutputLayerConfig::new(4, LossName::Ce);

        assert_eq!(config.time_limit, TimeLimit::Off);
        assert!(config.apply_softmax);
        assert_eq!(config.softmax_smoothing, 1.0);
        config.validate().unwrap();
    }

    #[test]
    fn exclusive_prior_options_are_rejected() {
        let config = OutputLayerConfig::new(4, LossName::FastBw)
            .with_compute_priors(true)
            .with_trained_softmax_prior(true);

        assert!(matches!(
            config.validate(),
            Err(LossError::InvalidConfig(_))
        ));
    }

    #[test]
    fn time_limit_serializes_by_name() {
        let inf: TimeLimit = serde_json::from_str("\"inf\"").unwrap();
        let frames: TimeLimit = serde_json::from_str("{\"frames\": 20}").unwrap();

        assert_eq!(inf, TimeLimit::Inf);
        assert_eq!(frames, TimeLimit::Frames(20));
    }

    #[test]
    fn sprint_options_must_be_an_object() {
        let options = SprintOptions::parse(r#"{"sprintExecPath": "nn-trainer"}"#).unwrap();
        assert_eq!(
            options.get("sprintExecPath"),
            Some(&Value::String("nn-trainer".into()))
        );

        assert!(matches!(
            SprintOptions::parse("[1, 2]"),
            Err(LossError::SprintOptions(_))
        ));
        assert!(matches!(
            SprintOptions::parse("{"),
            Err(LossError::SprintOptions(_))
        ));
    }

    #[test]
    fn missing_sprint_options_are_reported() {
        let config = OutputLayerConfig::new(4, LossName::Sprint);

        assert!(matches!(
            config.sprint_options("sprint"),
            Err(LossError::MissingOption {
                option: "sprint_opts",
                ..
            })
        ));
    }
}

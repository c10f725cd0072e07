//! Read-only pricing and limits configuration.
//!
//! ```text
//! {
//!   "prices_per_million_tokens": {
//!     "gemini": {"input": 1.25, "output": 5.0, "usage_limits": {"max_cost_per_day": 10.0, "cooldown_minutes": 5}}
//!   },
//!   "thresholds": {"cost_per_day": {"warning": 50.0, "critical": 200.0}}
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConfigError, Error, Result};

/// Per-service limits. `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceLimits {
    #[serde(
        default,
        deserialize_with = "request_limit",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_requests_per_day: Option<u64>,
    #[serde(
        default,
        deserialize_with = "request_limit",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_requests_per_hour: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_per_day: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_per_month: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_minutes: Option<f64>,
}

/// Request limits may be written as any JSON number. Fractional limits round
/// up; negative ones clamp to zero.
fn request_limit<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<u64>, D::Error> {
    Ok(Option::<f64>::deserialize(de)?.map(|v| if v > 0.0 { v.ceil() as u64 } else { 0 }))
}

impl ServiceLimits {
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        *self == Self::default()
    }

    /// Configured `max_*` limits as display pairs.
    #[must_use]
    pub fn max_entries(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(v) = self.max_requests_per_day {
            out.push(("max_requests_per_day", v.to_string()));
        }
        if let Some(v) = self.max_requests_per_hour {
            out.push(("max_requests_per_hour", v.to_string()));
        }
        if let Some(v) = self.max_cost_per_day {
            out.push(("max_cost_per_day", format!("{v:.2}")));
        }
        if let Some(v) = self.max_cost_per_month {
            out.push(("max_cost_per_month", format!("{v:.2}")));
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicePricing {
    #[serde(default)]
    pub usage_limits: ServiceLimits,
    /// Token prices and anything else not interpreted here.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostThresholds {
    #[serde(default = "default_warning")]
    pub warning: f64,
    #[serde(default = "default_critical")]
    pub critical: f64,
}

fn default_warning() -> f64 {
    50.0
}

fn default_critical() -> f64 {
    200.0
}

impl Default for CostThresholds {
    fn default() -> Self {
        Self {
            warning: default_warning(),
            critical: default_critical(),
        }
    }
}

impl CostThresholds {
    /// Classify a cost; a threshold is crossed only when strictly exceeded.
    #[must_use]
    pub fn classify(&self, cost_usd: f64) -> ThresholdLevel {
        if cost_usd > self.critical {
            ThresholdLevel::Critical
        } else if cost_usd > self.warning {
            ThresholdLevel::Warning
        } else {
            ThresholdLevel::Normal
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub cost_per_day: CostThresholds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdLevel {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for ThresholdLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub prices_per_million_tokens: BTreeMap<String, ServicePricing>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PricingConfig {
    /// Load the pricing file. Its absence is fatal: limits cannot be
    /// enforced without it.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::MissingConfig {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(Error::io(path, e)),
        };
        Self::from_json(&raw).map_err(|e| match e {
            Error::Config(ConfigError::ParseFailed(msg)) => {
                ConfigError::ParseFailed(format!("{}: {msg}", path.display())).into()
            }
            other => other,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    /// Limits for `service`; unconfigured services are unbounded.
    #[must_use]
    pub fn limits_for(&self, service: &str) -> ServiceLimits {
        self.prices_per_million_tokens
            .get(service)
            .map(|p| p.usage_limits.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "prices_per_million_tokens": {
            "gemini": {
                "input": 1.25,
                "output": 5.0,
                "usage_limits": {"max_requests_per_hour": 20, "max_cost_per_day": 10.0, "cooldown_minutes": 5}
            },
            "o3": {"input": 10.0}
        },
        "thresholds": {"cost_per_day": {"warning": 25.0}},
        "version": 2
    }"#;

    #[test]
    fn parses_limits_and_defaults() {
        let config = PricingConfig::from_json(SAMPLE).unwrap();
        let gemini = config.limits_for("gemini");
        assert_eq!(gemini.max_requests_per_hour, Some(20));
        assert_eq!(gemini.max_cost_per_day, Some(10.0));
        assert_eq!(gemini.cooldown_minutes, Some(5.0));
        assert_eq!(gemini.max_requests_per_day, None);
        assert!(config.limits_for("o3").is_unbounded());
        assert!(config.limits_for("never-configured").is_unbounded());
        assert_eq!(config.thresholds.cost_per_day.warning, 25.0);
        assert_eq!(config.thresholds.cost_per_day.critical, 200.0);
        assert_eq!(config.extra["version"], 2);
    }

    #[test]
    fn missing_thresholds_use_defaults() {
        let config = PricingConfig::from_json("{}").unwrap();
        assert_eq!(config.thresholds.cost_per_day, CostThresholds::default());
    }

    #[test]
    fn classify_thresholds() {
        let t = CostThresholds::default();
        assert_eq!(t.classify(50.0), ThresholdLevel::Normal);
        assert_eq!(t.classify(50.01), ThresholdLevel::Warning);
        assert_eq!(t.classify(250.0), ThresholdLevel::Critical);
    }

    #[test]
    fn missing_file_is_missing_config() {
        let tmp = TempDir::new().unwrap();
        let err = PricingConfig::load(&tmp.path().join("model-pricing.json")).unwrap_err();
        assert!(matches!(err, Error::MissingConfig { .. }));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model-pricing.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = PricingConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseFailed(_))));
        assert!(err.to_string().contains("model-pricing.json"));
    }

    #[test]
    fn max_entries_lists_configured_limits() {
        let limits = PricingConfig::from_json(SAMPLE).unwrap().limits_for("gemini");
        let names: Vec<_> = limits.max_entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["max_requests_per_hour", "max_cost_per_day"]);
    }

    #[test]
    fn request_limits_accept_any_number() {
        let config = PricingConfig::from_json(
            r#"{"prices_per_million_tokens": {"gemini": {"usage_limits":
                {"max_requests_per_day": 100.0, "max_requests_per_hour": 2.5}}}}"#,
        )
        .unwrap();
        let gemini = config.limits_for("gemini");
        assert_eq!(gemini.max_requests_per_day, Some(100));
        assert_eq!(gemini.max_requests_per_hour, Some(3));

        let negative = PricingConfig::from_json(
            r#"{"prices_per_million_tokens": {"o3": {"usage_limits": {"max_requests_per_day": -1}}}}"#,
        )
        .unwrap();
        assert_eq!(negative.limits_for("o3").max_requests_per_day, Some(0));
    }
}

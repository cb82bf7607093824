//! Declarative test plans.
//!
//! A plan is a YAML document listing steps to execute in order, the sampling
//! cadence and the safety limits:
//!
//! ```yaml
//! sample_rate_hz: 2
//! hold_s: 600
//! status_every_s: 30
//! safety:
//!   vmax: 16.5
//!   maxtemp_c: 55
//!   negdv: { enabled: true, window_s: 300, threshold_v: -0.05, require_s: 240 }
//! steps:
//!   - psu: { ch: CH1, voltage: 14.4, current: 2.0 }
//!     dmm: { function: "VOLT:DC", range: 20 }
//!     hold_s: 3600
//!     terminate_on_negdv: true
//!   - psu: { ch: CH1, on: false }
//!     enable_vmin_abort: true
//!     scope: { channel: C2, tdiv: 0.0005, delay_s: 5 }
//! ```
//!
//! Missing keys take the defaults below. Unknown keys inside `safety:` are
//! rejected; a misspelled limit must not silently fall back to its default.

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::TriggerSlope;
use crate::safety::SafetyConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

/// A parsed plan document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Plan {
    /// Steps in execution order.
    pub steps: Vec<Step>,
    /// Target sampling rate.
    pub sample_rate_hz: f64,
    /// Hold for steps that do not set their own.
    pub hold_s: f64,
    /// Seconds between operator status lines; 0 disables them.
    pub status_every_s: f64,
    /// Abort limits.
    pub safety: SafetyConfig,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            sample_rate_hz: 1.0,
            hold_s: 1.0,
            status_every_s: 0.0,
            safety: SafetyConfig::default(),
        }
    }
}

/// One configure-then-sample phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    /// Supply configuration.
    pub psu: PsuStep,
    /// Meter configuration.
    pub dmm: DmmStep,
    /// Scope configuration; the scope is left alone when absent.
    pub scope: Option<ScopeStep>,
    /// Hold for this step; the plan default when absent.
    pub hold_s: Option<f64>,
    /// Keep voltage history from the previous step.
    pub accumulate_window: bool,
    /// Evaluate the negative-drift condition during this step.
    pub terminate_on_negdv: bool,
    /// Evaluate `vmin_abort` during this step (only while the output is on).
    pub enable_vmin_abort: bool,
}

/// Supply settings for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsuStep {
    /// Channel name (`CH1`, `CH2`, `CH3`).
    pub ch: String,
    /// Voltage setpoint; unchanged when absent.
    pub voltage: Option<f64>,
    /// Current limit; unchanged when absent.
    pub current: Option<f64>,
    /// Output state for the step.
    pub on: bool,
}

impl Default for PsuStep {
    fn default() -> Self {
        Self {
            ch: "CH1".to_string(),
            voltage: None,
            current: None,
            on: true,
        }
    }
}

/// Meter settings for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmmStep {
    /// SCPI function name.
    pub function: String,
    /// Manual range; autorange when absent.
    pub range: Option<f64>,
}

impl Default for DmmStep {
    fn default() -> Self {
        Self {
            function: "VOLT:DC".to_string(),
            range: None,
        }
    }
}

/// Scope settings for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeStep {
    /// Measured channel, also the trigger source.
    pub channel: String,
    /// Probe attenuation.
    pub probe: Option<f64>,
    /// Vertical scale (V/div).
    pub scale: Option<f64>,
    /// Horizontal scale (s/div).
    pub tdiv: f64,
    /// Trigger level (V).
    pub trig_level: f64,
    /// Trigger slope.
    pub trig_slope: TriggerSlope,
    /// Memory depth.
    pub points: Option<u32>,
    /// Seconds into the hold before the one measurement of the step.
    pub delay_s: f64,
}

impl Default for ScopeStep {
    fn default() -> Self {
        Self {
            channel: "C1".to_string(),
            probe: None,
            scale: None,
            tdiv: 0.001,
            trig_level: 0.02,
            trig_slope: TriggerSlope::Pos,
            points: None,
            delay_s: 0.0,
        }
    }
}

impl Plan {
    /// Parse and validate a plan document.
    pub fn from_yaml_str(text: &str) -> AppResult<Self> {
        // An empty document is an empty plan, not an error.
        let plan: Plan = if text.trim().is_empty() {
            Plan::default()
        } else {
            serde_yaml::from_str(text)?
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Read, parse and validate a plan file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DaqError::Plan(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
            .map_err(|e| DaqError::Plan(format!("{}: {}", path.display(), plain_message(e))))
    }

    /// Check every value the runner relies on.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(DaqError::Plan(format!(
                "sample_rate_hz must be > 0 (got {})",
                self.sample_rate_hz
            )));
        }
        checked_seconds("sample interval (1 / sample_rate_hz)", 1.0 / self.sample_rate_hz)?;
        checked_seconds("hold_s", self.hold_s)?;
        checked_seconds("status_every_s", self.status_every_s)?;

        for (idx, step) in self.steps.iter().enumerate() {
            if let Some(hold) = step.hold_s {
                checked_seconds(&format!("steps[{}].hold_s", idx), hold)?;
            }
            if let Some(scope) = &step.scope {
                checked_seconds(&format!("steps[{}].scope.delay_s", idx), scope.delay_s)?;
            }
            if step.psu.ch.trim().is_empty() {
                return Err(DaqError::Plan(format!("steps[{}].psu.ch is empty", idx)));
            }
        }

        self.safety.validate().map_err(DaqError::Plan)?;

        // The plan must still fit on the monotonic clock once started.
        let total = self
            .steps
            .iter()
            .try_fold(Duration::ZERO, |acc, step| acc.checked_add(self.hold_for(step)));
        match total.and_then(|t| Instant::now().checked_add(t)) {
            Some(_) => Ok(()),
            None => Err(DaqError::Plan("total hold time is too large".into())),
        }
    }

    /// Nominal time between ticks.
    pub fn sample_interval(&self) -> Duration {
        saturating_seconds(1.0 / self.sample_rate_hz)
    }

    /// Status line period, when enabled.
    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_every_s > 0.0).then(|| saturating_seconds(self.status_every_s))
    }

    /// Hold for `step`.
    pub fn hold_for(&self, step: &Step) -> Duration {
        saturating_seconds(step.hold_s.unwrap_or(self.hold_s))
    }

    /// Sum of all holds, the nominal plan duration.
    pub fn nominal_duration(&self) -> Duration {
        self.steps
            .iter()
            .fold(Duration::ZERO, |acc, s| acc.saturating_add(self.hold_for(s)))
    }
}

fn checked_seconds(name: &str, value: f64) -> AppResult<Duration> {
    if !(value.is_finite() && value >= 0.0) {
        return Err(DaqError::Plan(format!("{} must be >= 0 (got {})", name, value)));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|_| DaqError::Plan(format!("{} is too large (got {})", name, value)))
}

/// Negative and NaN map to zero, anything past `Duration::MAX` saturates.
fn saturating_seconds(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

fn plain_message(err: DaqError) -> String {
    match err {
        DaqError::Plan(message) => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let plan = Plan::from_yaml_str(
            r#"
steps:
  - psu: { voltage: 5.0 }
  - hold_s: 3
    scope: {}
"#,
        )
        .unwrap();

        assert_eq!(plan.sample_rate_hz, 1.0);
        assert_eq!(plan.hold_s, 1.0);
        assert_eq!(plan.status_interval(), None);
        assert_eq!(plan.safety, SafetyConfig::default());

        let first = &plan.steps[0];
        assert_eq!(first.psu.ch, "CH1");
        assert_eq!(first.psu.voltage, Some(5.0));
        assert!(first.psu.on);
        assert_eq!(first.dmm.function, "VOLT:DC");
        assert!(!first.accumulate_window);
        assert_eq!(plan.hold_for(first), Duration::from_secs(1));

        let scope = plan.steps[1].scope.as_ref().unwrap();
        assert_eq!(scope.channel, "C1");
        assert_eq!(scope.trig_slope, TriggerSlope::Pos);
        assert_eq!(scope.tdiv, 0.001);
        assert_eq!(plan.hold_for(&plan.steps[1]), Duration::from_secs(3));
        assert_eq!(plan.nominal_duration(), Duration::from_secs(4));
    }

    #[test]
    fn full_document() {
        let plan = Plan::from_yaml_str(
            r#"
sample_rate_hz: 5
hold_s: 2
status_every_s: 10
safety:
  vmax: 16.5
  vmin_abort: 3.0
  maxtemp_c: 55
  max_dtemp_c_per_min: 2.0
  negdv: { enabled: true, window_s: 300, threshold_v: -0.05, require_s: 240 }
steps:
  - psu: { ch: CH2, voltage: 14.4, current: 2.0, on: true }
    dmm: { function: "VOLT:DC", range: 20 }
    terminate_on_negdv: true
    accumulate_window: true
  - psu: { ch: CH2, on: false }
    enable_vmin_abort: true
    scope: { channel: C2, trig_slope: NEG, points: 14000, delay_s: 1.5 }
"#,
        )
        .unwrap();

        assert_eq!(plan.sample_interval(), Duration::from_millis(200));
        assert_eq!(plan.status_interval(), Some(Duration::from_secs(10)));
        assert_eq!(plan.safety.vmin_abort, Some(3.0));
        assert!(plan.safety.negdv.enabled);
        assert_eq!(plan.steps[0].dmm.range, Some(20.0));
        assert!(plan.steps[0].terminate_on_negdv);
        let scope = plan.steps[1].scope.as_ref().unwrap();
        assert_eq!(scope.trig_slope, TriggerSlope::Neg);
        assert_eq!(scope.points, Some(14000));
    }

    #[test]
    fn empty_document_is_empty_plan() {
        let plan = Plan::from_yaml_str("").unwrap();
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn rejects_invalid_values() {
        for doc in [
            "sample_rate_hz: 0",
            "sample_rate_hz: -1",
            "hold_s: -5",
            "steps: [ { hold_s: -1 } ]",
            "steps: [ { scope: { delay_s: -1 } } ]",
            "safety: { temp_window_s: 0 }",
            "safety: { negdv: { enabled: true, threshold_v: 0.1 } }",
            "safety: { vmaxx: 12 }",
            "hold_s: 1.0e20",
            "status_every_s: 1.0e20",
            "sample_rate_hz: 1.0e-320",
            "steps: [ { hold_s: 1.0e20 } ]",
            "safety: { max_hours: 1.0e20 }",
        ] {
            let err = Plan::from_yaml_str(doc).unwrap_err();
            assert!(err.is_configuration(), "{doc}: {err}");
        }
    }

    #[test]
    fn oversized_holds_never_panic() {
        let plan = Plan {
            hold_s: 1.0e20,
            status_every_s: f64::INFINITY,
            steps: vec![Step::default(), Step::default()],
            ..Default::default()
        };
        assert!(plan.validate().is_err());
        assert_eq!(plan.hold_for(&plan.steps[0]), Duration::MAX);
        assert_eq!(plan.nominal_duration(), Duration::MAX);
        assert_eq!(plan.status_interval(), Some(Duration::MAX));
    }

    #[test]
    fn load_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "sample_rate_hz: 0\n").unwrap();

        let message = Plan::load(&path).unwrap_err().to_string();
        assert!(message.contains("bad.yaml"));
        assert!(message.contains("sample_rate_hz"));

        let missing = Plan::load(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(missing, DaqError::Plan(_)));
    }
}

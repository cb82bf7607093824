//! Safety interlocks evaluated on every sampling tick.
//!
//! [`SafetyMonitor`] owns two [`SlidingWindow`]s (voltage and temperature) and
//! the thresholds from the plan's `safety:` section. It performs no I/O: the
//! plan runner feeds it one [`Observation`] per tick and, when a condition
//! fires, switches the supply off itself.
//!
//! Conditions are checked in a fixed order and the first hit wins:
//!
//! 1. `vmax`: the tick's voltage is strictly above the ceiling
//! 2. `vmin_abort`: the tick's voltage is below the floor, only on steps that
//!    enable it with the supply on
//! 3. `maxtemp_c`: the tick's temperature is strictly above the ceiling
//! 4. `max_dtemp_c_per_min`: oldest-to-newest temperature slope, once the
//!    window covers `max(10 s, temp_window_s / 4)`
//! 5. negdv: the voltage has fallen by at least `|threshold_v|` over at least
//!    `require_s`, only on steps with `terminate_on_negdv`
//!
//! The slope uses the two window endpoints rather than a fit, so a single noisy
//! endpoint sample can trip it at low sample rates.

mod window;

pub use window::SlidingWindow;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Minimum temperature window coverage before the slope is trusted.
pub const MIN_SLOPE_SPAN_S: f64 = 10.0;

/// Safety thresholds. Optional limits that are absent never fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyConfig {
    /// Voltage ceiling (V).
    pub vmax: f64,
    /// Voltage floor (V), gated per step.
    pub vmin_abort: Option<f64>,
    /// Whole-plan wall-clock cap (hours).
    pub max_hours: f64,
    /// Temperature ceiling (°C).
    pub maxtemp_c: Option<f64>,
    /// Temperature rise limit (°C/min).
    pub max_dtemp_c_per_min: Option<f64>,
    /// Temperature window span (s).
    pub temp_window_s: f64,
    /// Sustained negative voltage drift.
    pub negdv: NegDvConfig,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            vmax: 17.0,
            vmin_abort: None,
            max_hours: 12.0,
            maxtemp_c: None,
            max_dtemp_c_per_min: None,
            temp_window_s: 60.0,
            negdv: NegDvConfig::default(),
        }
    }
}

/// Negative-drift detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NegDvConfig {
    /// Master switch. Steps must also opt in.
    pub enabled: bool,
    /// Voltage window span (s).
    pub window_s: f64,
    /// Fires when newest − oldest is at or below this (negative, V).
    pub threshold_v: f64,
    /// Minimum window coverage (s).
    pub require_s: f64,
}

impl Default for NegDvConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_s: 60.0,
            threshold_v: -0.06,
            require_s: 120.0,
        }
    }
}

impl SafetyConfig {
    /// Reject thresholds that cannot be evaluated.
    pub fn validate(&self) -> Result<(), String> {
        if !self.vmax.is_finite() {
            return Err("safety.vmax must be a finite number".into());
        }
        if !is_positive(self.max_hours) {
            return Err(format!("safety.max_hours must be > 0 (got {})", self.max_hours));
        }
        if Duration::try_from_secs_f64(self.max_hours * 3600.0).is_err() {
            return Err(format!("safety.max_hours is too large (got {})", self.max_hours));
        }
        if !is_positive(self.temp_window_s) {
            return Err(format!(
                "safety.temp_window_s must be > 0 (got {})",
                self.temp_window_s
            ));
        }
        if self.negdv.enabled {
            if !is_positive(-self.negdv.threshold_v) {
                return Err(format!(
                    "safety.negdv.threshold_v must be negative (got {})",
                    self.negdv.threshold_v
                ));
            }
            if !is_positive(self.negdv.window_s) || self.negdv.require_s < 0.0 {
                return Err("safety.negdv.window_s must be > 0 and require_s >= 0".into());
            }
        }
        Ok(())
    }

    /// Wall-clock cap as a duration, saturating for caps no clock reaches.
    pub fn max_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_hours.max(0.0) * 3600.0).unwrap_or(Duration::MAX)
    }

    /// True when negdv can never fire because its window is shorter than the
    /// coverage it requires.
    pub fn negdv_unreachable(&self) -> bool {
        self.negdv.enabled && self.negdv.require_s > self.negdv.window_s
    }
}

fn is_positive(x: f64) -> bool {
    x.is_finite() && x > 0.0
}

/// Per-step switches for the gated conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepGates {
    /// Evaluate `vmin_abort` on this step.
    pub vmin: bool,
    /// Evaluate negdv on this step.
    pub negdv: bool,
}

/// One tick's inputs. `None` means the value was not measured this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Observation {
    /// Seconds since plan start.
    pub t_s: f64,
    /// Measured voltage.
    pub voltage: Option<f64>,
    /// Measured temperature (°C).
    pub temp_c: Option<f64>,
}

/// Why a run was stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// Voltage above `vmax`.
    OverVoltage {
        /// Measured voltage.
        volts: f64,
        /// Ceiling.
        limit: f64,
    },
    /// Voltage below `vmin_abort`.
    UnderVoltage {
        /// Measured voltage.
        volts: f64,
        /// Floor.
        limit: f64,
    },
    /// Temperature above `maxtemp_c`.
    OverTemperature {
        /// Measured temperature.
        temp_c: f64,
        /// Ceiling.
        limit: f64,
    },
    /// Temperature rising faster than `max_dtemp_c_per_min`.
    TemperatureSlope {
        /// Oldest-to-newest slope.
        c_per_min: f64,
        /// Limit.
        limit: f64,
    },
    /// Sustained negative voltage drift.
    NegativeDrift {
        /// Newest − oldest voltage.
        delta_v: f64,
        /// Window coverage.
        over_s: f64,
        /// Threshold.
        threshold_v: f64,
    },
    /// `max_hours` since plan start elapsed.
    ElapsedCap {
        /// Cap in hours.
        max_hours: f64,
    },
}

impl AbortReason {
    /// Short machine-friendly name.
    pub fn kind(&self) -> &'static str {
        match self {
            AbortReason::OverVoltage { .. } => "vmax",
            AbortReason::UnderVoltage { .. } => "vmin_abort",
            AbortReason::OverTemperature { .. } => "maxtemp_c",
            AbortReason::TemperatureSlope { .. } => "max_dtemp_c_per_min",
            AbortReason::NegativeDrift { .. } => "negdv",
            AbortReason::ElapsedCap { .. } => "max_hours",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::OverVoltage { volts, limit } => {
                write!(f, "vmax exceeded (v={} > {})", volts, limit)
            }
            AbortReason::UnderVoltage { volts, limit } => {
                write!(f, "vmin_abort triggered (v={} < {})", volts, limit)
            }
            AbortReason::OverTemperature { temp_c, limit } => {
                write!(f, "maxtemp_c exceeded (t={:.2}C > {}C)", temp_c, limit)
            }
            AbortReason::TemperatureSlope { c_per_min, limit } => write!(
                f,
                "max_dtemp_c_per_min exceeded (dT/dt={:.2}C/min > {}C/min)",
                c_per_min, limit
            ),
            AbortReason::NegativeDrift {
                delta_v,
                over_s,
                threshold_v,
            } => write!(
                f,
                "negdv triggered (dV={:.3}V over {:.0}s <= {}V)",
                delta_v, over_s, threshold_v
            ),
            AbortReason::ElapsedCap { max_hours } => {
                write!(f, "max_hours reached ({}h)", max_hours)
            }
        }
    }
}

/// Sliding-window state and thresholds for one run.
#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    config: SafetyConfig,
    voltage: SlidingWindow,
    temperature: SlidingWindow,
}

impl SafetyMonitor {
    /// Fresh monitor with empty windows.
    pub fn new(config: SafetyConfig) -> Self {
        let voltage = SlidingWindow::new(config.negdv.window_s);
        let temperature = SlidingWindow::new(config.temp_window_s);
        Self {
            config,
            voltage,
            temperature,
        }
    }

    /// Thresholds in effect.
    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Voltage history.
    pub fn voltage_window(&self) -> &SlidingWindow {
        &self.voltage
    }

    /// Temperature history.
    pub fn temperature_window(&self) -> &SlidingWindow {
        &self.temperature
    }

    /// Forget voltage history (step start without `accumulate_window`).
    pub fn clear_voltage(&mut self) {
        self.voltage.clear();
    }

    /// Record the tick's values, then evaluate.
    ///
    /// A voltage abort returns before the temperature is recorded.
    pub fn observe(&mut self, obs: &Observation, gates: StepGates) -> Option<AbortReason> {
        self.observe_voltage(obs.t_s, obs.voltage, gates)
            .or_else(|| self.observe_temperature(obs.t_s, obs.temp_c, gates))
    }

    /// Record the tick's voltage and check `vmax`, then `vmin_abort`.
    ///
    /// Called as soon as the meter has been read, ahead of any slower I/O.
    pub fn observe_voltage(
        &mut self,
        t_s: f64,
        voltage: Option<f64>,
        gates: StepGates,
    ) -> Option<AbortReason> {
        if let Some(v) = voltage {
            self.voltage.push(t_s, v);
        }
        self.check_voltage(voltage, gates)
    }

    /// Record the tick's temperature and check `maxtemp_c`, the slope, then
    /// negdv.
    pub fn observe_temperature(
        &mut self,
        t_s: f64,
        temp_c: Option<f64>,
        gates: StepGates,
    ) -> Option<AbortReason> {
        if let Some(temp) = temp_c {
            self.temperature.push(t_s, temp);
        }
        self.check_trends(temp_c, gates)
    }

    /// Evaluate all conditions against the current windows and the tick's
    /// instantaneous values.
    pub fn evaluate(&self, obs: &Observation, gates: StepGates) -> Option<AbortReason> {
        self.check_voltage(obs.voltage, gates)
            .or_else(|| self.check_trends(obs.temp_c, gates))
    }

    fn check_voltage(&self, voltage: Option<f64>, gates: StepGates) -> Option<AbortReason> {
        let cfg = &self.config;
        let volts = voltage?;
        if volts > cfg.vmax {
            return Some(AbortReason::OverVoltage {
                volts,
                limit: cfg.vmax,
            });
        }
        let limit = cfg.vmin_abort.filter(|_| gates.vmin)?;
        (volts < limit).then_some(AbortReason::UnderVoltage { volts, limit })
    }

    fn check_trends(&self, temp_c: Option<f64>, gates: StepGates) -> Option<AbortReason> {
        let cfg = &self.config;

        if let Some(temp_c) = temp_c {
            if let Some(limit) = cfg.maxtemp_c {
                if temp_c > limit {
                    return Some(AbortReason::OverTemperature { temp_c, limit });
                }
            }
            if let (Some(limit), Some(c_per_min)) =
                (cfg.max_dtemp_c_per_min, self.temperature_slope())
            {
                if c_per_min > limit {
                    return Some(AbortReason::TemperatureSlope { c_per_min, limit });
                }
            }
        }

        if gates.negdv && cfg.negdv.enabled {
            if let Some((over_s, delta_v)) = self.voltage.delta() {
                if over_s >= cfg.negdv.require_s && delta_v <= cfg.negdv.threshold_v {
                    return Some(AbortReason::NegativeDrift {
                        delta_v,
                        over_s,
                        threshold_v: cfg.negdv.threshold_v,
                    });
                }
            }
        }

        None
    }

    /// Oldest-to-newest temperature slope in °C/min, once the window covers
    /// enough time to be trusted.
    pub fn temperature_slope(&self) -> Option<f64> {
        let (span, delta) = self.temperature.delta()?;
        let eligible = MIN_SLOPE_SPAN_S.max(0.25 * self.config.temp_window_s);
        if span < eligible {
            return None;
        }
        Some(delta / span.max(1e-9) * 60.0)
    }

    /// `Some` once `elapsed` since plan start exceeds `max_hours`.
    pub fn check_elapsed(&self, elapsed: Duration) -> Option<AbortReason> {
        (elapsed > self.config.max_duration()).then_some(AbortReason::ElapsedCap {
            max_hours: self.config.max_hours,
        })
    }
}

//! One row of run output.

use crate::hardware::capabilities::SensorReading;
use serde::{Deserialize, Serialize};

/// Column names, in file order.
pub const FIELDS: [&str; 10] = [
    "t_s",
    "v_set",
    "i_set",
    "v_meas",
    "i_meas",
    "scope_vpp",
    "scope_vrms",
    "temp_c",
    "humidity_pct",
    "ens_ok",
];

/// Values captured on one sampling tick. `None` means not measured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Seconds since plan start.
    pub t_s: f64,
    /// Supply voltage setpoint of the step.
    pub v_set: Option<f64>,
    /// Supply current limit of the step.
    pub i_set: Option<f64>,
    /// Meter reading.
    pub v_meas: Option<f64>,
    /// Supply current readback.
    pub i_meas: Option<f64>,
    /// Scope peak-to-peak for the step.
    pub scope_vpp: Option<f64>,
    /// Scope RMS for the step.
    pub scope_vrms: Option<f64>,
    /// Sensor temperature.
    pub temp_c: Option<f64>,
    /// Sensor relative humidity.
    pub humidity_pct: Option<f64>,
    /// Sensor reading trusted; `None` without a sensor.
    pub ens_ok: Option<bool>,
}

impl OutputRecord {
    /// Copy the sensor columns from `reading`.
    pub fn with_sensor(mut self, reading: Option<&SensorReading>) -> Self {
        if let Some(reading) = reading {
            self.temp_c = reading.temp_c;
            self.humidity_pct = reading.rh_pct;
            self.ens_ok = Some(reading.ok);
        }
        self
    }

    /// The numeric columns in [`FIELDS`] order, `ens_ok` excluded.
    pub fn numeric_values(&self) -> [Option<f64>; 9] {
        [
            Some(self.t_s),
            self.v_set,
            self.i_set,
            self.v_meas,
            self.i_meas,
            self.scope_vpp,
            self.scope_vrms,
            self.temp_c,
            self.humidity_pct,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_field_order_matches_header() {
        let json = serde_json::to_value(OutputRecord::default()).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        let mut expected = FIELDS.to_vec();
        // serde_json maps sort keys unless preserve_order is enabled.
        expected.sort_unstable();
        let mut keys = keys;
        keys.sort_unstable();
        assert_eq!(keys, expected);
    }

    #[test]
    fn degraded_sensor_reading_marks_not_ok() {
        let record = OutputRecord::default().with_sensor(Some(&SensorReading::degraded()));
        assert_eq!(record.ens_ok, Some(false));
        assert_eq!(record.temp_c, None);

        let without = OutputRecord::default().with_sensor(None);
        assert_eq!(without.ens_ok, None);
    }
}

//! Oscillator driver abstraction (C1): a uniform interface over several
//! concrete device families, selected by name at startup rather than
//! through a runtime registry.

pub mod family_m;
pub mod family_s;
pub mod sim;

use crate::config::Config;
use crate::eeprom::DisciplingParameters;
use crate::error::OscillatordError;
use crate::status::DisciplingStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OscillatorTelemetry {
    pub fine_ctrl: u32,
    pub coarse_ctrl: u32,
    pub lock: bool,
    pub temperature: f64,
}

impl Default for OscillatorTelemetry {
    fn default() -> Self {
        OscillatorTelemetry { fine_ctrl: 0, coarse_ctrl: 0, lock: false, temperature: -3000.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    AdjustFine,
    AdjustCoarse,
    SaveCoarse,
    PhaseJump,
    Calibrate,
}

#[derive(Debug, Clone, Copy)]
pub struct ControlOutput {
    pub action: Action,
    pub setpoint: u32,
    pub value_phase_ctrl: i64,
}

impl Default for ControlOutput {
    fn default() -> Self {
        ControlOutput { action: Action::None, setpoint: 0, value_phase_ctrl: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationPlan {
    pub ctrl_points: Vec<u32>,
    pub nb_calibration: u32,
}

/// Matrix of measured phase samples, one row per control point, each
/// row holding `nb_calibration` raw phase-error readings in ns.
#[derive(Debug, Clone)]
pub struct CalibrationResults {
    pub samples: Vec<Vec<i64>>,
}

pub trait Oscillator: Send {
    fn get_ctrl(&mut self) -> Result<OscillatorTelemetry, OscillatordError>;

    fn apply_output(&mut self, output: &ControlOutput) -> Result<(), OscillatordError>;

    fn get_disciplining_parameters(&mut self) -> Result<DisciplingParameters, OscillatordError> {
        Err(OscillatordError::Unsupported("on-device disciplining parameters"))
    }

    fn apply_disciplining_parameters(
        &mut self,
        _params: &DisciplingParameters,
    ) -> Result<(), OscillatordError> {
        Err(OscillatordError::Unsupported("on-device disciplining parameters"))
    }

    fn push_gnss_info(&mut self, _fix_ok: bool, _last_fix_utc_secs: i64) -> Result<(), OscillatordError> {
        Ok(())
    }

    fn get_phase_error(&mut self) -> Result<i64, OscillatordError> {
        Err(OscillatordError::Unsupported("serial phase telemetry"))
    }

    fn get_disciplining_status(&mut self) -> Result<DisciplingStatus, OscillatordError> {
        Err(OscillatordError::Unsupported("on-device disciplining status"))
    }

    fn dac_min(&self) -> u32;
    fn dac_max(&self) -> u32;

    /// True for drivers (family S) that measure their own phase error
    /// over the serial link instead of relying on the PHC phasemeter.
    fn has_internal_phase_source(&self) -> bool {
        false
    }

    fn calibration_plan(&self, nb_calibration: u32) -> CalibrationPlan {
        let min = self.dac_min();
        let max = self.dac_max();
        let steps = 5u32;
        let span = max.saturating_sub(min);
        let ctrl_points = (0..steps)
            .map(|i| min + (span / (steps - 1).max(1)) * i)
            .collect();
        CalibrationPlan { ctrl_points, nb_calibration }
    }
}

/// Build a concrete driver by the config's `oscillator` family name.
/// Unknown names are a fatal configuration error.
pub fn build(config: &Config) -> Result<Box<dyn Oscillator>, OscillatordError> {
    match config.oscillator.as_str() {
        "mRO50" => Ok(Box::new(family_m::MRo50Oscillator::open(config)?)),
        "sa5x" => Ok(Box::new(family_s::Sa5xOscillator::open(config)?)),
        "sim" => Ok(Box::new(sim::SimulatedOscillator::new())),
        "dummy" => Ok(Box::new(sim::DummyOscillator::new())),
        other => Err(OscillatordError::Config(format!(
            "unknown oscillator family '{other}', expected one of mRO50, sa5x, sim, dummy"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedOscillator;
    impl Oscillator for FixedOscillator {
        fn get_ctrl(&mut self) -> Result<OscillatorTelemetry, OscillatordError> {
            Ok(OscillatorTelemetry::default())
        }
        fn apply_output(&mut self, _output: &ControlOutput) -> Result<(), OscillatordError> {
            Ok(())
        }
        fn dac_min(&self) -> u32 {
            0
        }
        fn dac_max(&self) -> u32 {
            4800
        }
    }

    #[test]
    fn calibration_plan_spans_full_range() {
        let osc = FixedOscillator;
        let plan = osc.calibration_plan(10);
        assert_eq!(plan.ctrl_points.first().copied(), Some(0));
        assert_eq!(plan.ctrl_points.last().copied(), Some(4800));
        assert_eq!(plan.nb_calibration, 10);
    }

    #[test]
    fn build_rejects_unknown_family() {
        let cfg = Config::load_for_test("oscillator=not-a-real-family\n");
        let err = build(&cfg).unwrap_err();
        assert!(matches!(err, OscillatordError::Config(_)));
    }

    #[test]
    fn build_accepts_sim() {
        let cfg = Config::load_for_test("oscillator=sim\n");
        assert!(build(&cfg).is_ok());
    }
}

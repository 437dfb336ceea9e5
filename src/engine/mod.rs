//! Disciplining engine interface (C5): the algorithm that turns phase
//! error plus oscillator telemetry into a device action is treated as
//! an opaque component behind this trait. `reference` supplies one
//! concrete, non-proprietary implementation so the daemon is runnable
//! and testable end to end.

pub mod reference;

use crate::eeprom::DisciplingParameters;
use crate::error::OscillatordError;
use crate::oscillator::{CalibrationPlan, CalibrationResults, ControlOutput};
use crate::status::DisciplingStatus;

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineInput {
    pub phase_error_ns: i64,
    pub valid: bool,
    pub lock: bool,
    pub fine_setpoint: u32,
    pub coarse_setpoint: u32,
    pub temperature: f64,
    pub q_err_ns: i32,
    pub ls_change: i8,
    pub calibration_requested: bool,
}

pub trait DiscipliningEngine: Send {
    fn process(&mut self, input: &EngineInput) -> Result<ControlOutput, OscillatordError>;
    fn get_calibration_parameters(&self) -> CalibrationPlan;
    fn calibrate(&mut self, plan: &CalibrationPlan, results: &CalibrationResults) -> Result<(), OscillatordError>;
    fn get_status(&self) -> DisciplingStatus;
    fn get_disciplining_parameters(&self) -> DisciplingParameters;
}

pub use reference::ReferenceEngine;

//! Reference disciplining engine: a PI control law over the fine DAC
//! plus a coarse-equilibrium tracker, generalized from a frequency-PPM
//! servo to the fine/coarse phase-error domain. This is a stand-in for
//! the proprietary control library; it is not tuned against real
//! hardware.

use super::{DiscipliningEngine, EngineInput};
use crate::config::EngineConfig;
use crate::eeprom::DisciplingParameters;
use crate::error::OscillatordError;
use crate::oscillator::{Action, CalibrationPlan, CalibrationResults, ControlOutput};
use crate::status::{ClockClass, DisciplingStatus, TrackingState};
use log::debug;

const HOLDOVER_TICKS_CEILING: u32 = 3600;

pub struct ReferenceEngine {
    config: EngineConfig,
    params: DisciplingParameters,
    dac_min: u32,
    dac_max: u32,
    integral: f64,
    lock_streak: u32,
    holdover_ticks: u32,
    status: DisciplingStatus,
    calibrate_pending: bool,
}

impl ReferenceEngine {
    pub fn new(config: EngineConfig, params: DisciplingParameters, dac_min: u32, dac_max: u32) -> Self {
        let calibrate_pending = config.calibrate_first;
        ReferenceEngine {
            config,
            params,
            dac_min,
            dac_max,
            integral: 0.0,
            lock_streak: 0,
            holdover_ticks: 0,
            status: DisciplingStatus::default(),
            calibrate_pending,
        }
    }

    fn reactivity_gain(&self, phase_error_ns: i64) -> f64 {
        let magnitude = (phase_error_ns.unsigned_abs() as f64).max(1.0);
        let normalized = (magnitude / self.config.ref_fluctuations_ns.max(1) as f64).min(100.0);
        let gain = self.config.reactivity_min
            + (self.config.reactivity_max - self.config.reactivity_min)
                * normalized.powf(self.config.reactivity_power).min(1.0);
        gain.clamp(self.config.reactivity_min, self.config.reactivity_max)
    }

    fn clamp_setpoint(&self, raw: i64) -> u32 {
        raw.clamp(self.dac_min as i64, self.dac_max as i64) as u32
    }

    fn update_lock_status(&mut self, input: &EngineInput) {
        if !input.valid {
            self.holdover_ticks += 1;
            self.lock_streak = 0;
            self.status.status = TrackingState::Holdover;
            self.status.clock_class = if self.holdover_ticks > HOLDOVER_TICKS_CEILING {
                ClockClass::Uncalibrated
            } else {
                ClockClass::Holdover
            };
            return;
        }
        self.holdover_ticks = 0;

        let in_tolerance = input.phase_error_ns.unsigned_abs() < self.config.phase_resolution_ns.max(1) as u64;
        if in_tolerance {
            self.lock_streak += 1;
        } else {
            self.lock_streak = 0;
        }

        self.status.current_phase_convergence_count = self.lock_streak;
        if self.lock_streak >= self.status.valid_phase_convergence_threshold {
            self.status.status = TrackingState::Lock;
            self.status.clock_class = ClockClass::Lock;
            self.status.convergence_progress = 1.0;
        } else if self.status.status == TrackingState::Init {
            self.status.status = TrackingState::Warmup;
            self.status.convergence_progress =
                self.lock_streak as f32 / self.status.valid_phase_convergence_threshold as f32;
        } else {
            self.status.status = TrackingState::Tracking;
            self.status.convergence_progress =
                self.lock_streak as f32 / self.status.valid_phase_convergence_threshold as f32;
        }
        self.status.ready_for_holdover = self.lock_streak >= self.status.valid_phase_convergence_threshold;
    }
}

impl DiscipliningEngine for ReferenceEngine {
    fn process(&mut self, input: &EngineInput) -> Result<ControlOutput, OscillatordError> {
        if self.calibrate_pending {
            self.calibrate_pending = false;
            self.status.status = TrackingState::Calibration;
            self.status.clock_class = ClockClass::Calibrating;
            return Ok(ControlOutput { action: Action::Calibrate, setpoint: 0, value_phase_ctrl: 0 });
        }

        self.update_lock_status(input);

        if !input.valid {
            return Ok(ControlOutput::default());
        }

        if input.phase_error_ns.unsigned_abs() as i64 > self.config.phase_jump_threshold_ns {
            return Ok(ControlOutput {
                action: Action::PhaseJump,
                setpoint: 0,
                value_phase_ctrl: input.phase_error_ns,
            });
        }

        let gain = self.reactivity_gain(input.phase_error_ns);
        let error = -(input.phase_error_ns as f64);
        self.integral += error * gain * 1e-9;
        let max_integral = self.config.max_allowed_coarse as f64;
        self.integral = self.integral.clamp(-max_integral, max_integral);

        let correction = error * gain * 1e-6 + self.integral;
        debug!(
            "reference engine: phase_error={}ns gain={:.3} integral={:.3} correction={:.3}",
            input.phase_error_ns, gain, self.integral, correction
        );

        if correction.abs() < self.config.fine_stop_tolerance as f64 {
            return Ok(ControlOutput::default());
        }

        let new_fine = self.clamp_setpoint(input.fine_setpoint as i64 + correction as i64);
        Ok(ControlOutput { action: Action::AdjustFine, setpoint: new_fine, value_phase_ctrl: 0 })
    }

    fn get_calibration_parameters(&self) -> CalibrationPlan {
        let span = self.dac_max.saturating_sub(self.dac_min);
        let steps = 5u32;
        let ctrl_points = (0..steps).map(|i| self.dac_min + span / (steps - 1).max(1) * i).collect();
        CalibrationPlan { ctrl_points, nb_calibration: self.config.nb_calibration }
    }

    fn calibrate(&mut self, plan: &CalibrationPlan, results: &CalibrationResults) -> Result<(), OscillatordError> {
        if plan.ctrl_points.len() != results.samples.len() {
            return Err(OscillatordError::AlgorithmError(
                "calibration sample matrix does not match the plan".to_string(),
            ));
        }
        let nodes_len = plan.ctrl_points.len().min(self.params.ctrl_load_nodes.len());
        for i in 0..nodes_len {
            let span = (self.dac_max - self.dac_min).max(1) as f32;
            self.params.ctrl_load_nodes[i] = (plan.ctrl_points[i] - self.dac_min) as f32 / span;
            let mean: f64 = if results.samples[i].is_empty() {
                0.0
            } else {
                results.samples[i].iter().sum::<i64>() as f64 / results.samples[i].len() as f64
            };
            self.params.ctrl_drift_coeffs[i] = mean as f32;
        }
        self.params.ctrl_nodes_length = nodes_len as u8;
        self.params.calibration_valid = true;
        self.params.calibration_date = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(())
    }

    fn get_status(&self) -> DisciplingStatus {
        self.status.clone()
    }

    fn get_disciplining_parameters(&self) -> DisciplingParameters {
        self.params.clone()
    }
}

//! Control loop (C6): orchestrates initial alignment and the
//! steady-state tick that drives telemetry, reference, and phase
//! samples through the disciplining engine and dispatches its output.

use crate::config::Config;
use crate::engine::{DiscipliningEngine, EngineInput};
use crate::error::OscillatordError;
use crate::gnss::{GnssEpoch, GnssReference, Utc};
use crate::oscillator::{family_m, Action, ControlOutput, Oscillator};
use crate::phasemeter::{PhaseStatus, Phasemeter};
use crate::phc::PhcClock;
use crate::status::StatusSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SETTLING_TIME: Duration = Duration::from_secs(5);
const TICK_TIMEOUT: Duration = Duration::from_secs(1);

/// Maps a raw reported phase error onto the sign convention the rest
/// of the control loop uses: positive means local leads GNSS.
pub fn apply_sign_convention(phase_error_ns: i64, opposite_phase_error: bool) -> i64 {
    if opposite_phase_error {
        -phase_error_ns
    } else {
        phase_error_ns
    }
}

/// The one-shot PHC offset to request for a given (signed) phase
/// error: retard the local clock by exactly the amount it leads.
pub fn phase_jump_offset(phase_error_ns: i64) -> i64 {
    -phase_error_ns
}

/// A single missed `GnssEpoch` update is tolerated; two in a row mark
/// the reference stale for the tick. Returns the updated miss counter.
pub fn track_reference_misses(reference: &GnssEpoch, last_seen: &mut Utc, consecutive_misses: u32) -> u32 {
    if reference.is_valid() && reference.last_fix_utc_time != *last_seen {
        *last_seen = reference.last_fix_utc_time;
        0
    } else {
        consecutive_misses + 1
    }
}

pub struct ControlLoop {
    config: Config,
    oscillator: Box<dyn Oscillator>,
    phc: Box<dyn PhcClock>,
    phasemeter: Option<Phasemeter>,
    gnss: GnssReference,
    engine: Box<dyn DiscipliningEngine>,
    status_sink: Arc<dyn StatusSink>,
    shutdown: Arc<AtomicBool>,
    ignore_next_irq: bool,
    consecutive_misses: u32,
    last_reference_time: Utc,
}

impl ControlLoop {
    pub fn new(
        config: Config,
        oscillator: Box<dyn Oscillator>,
        phc: Box<dyn PhcClock>,
        phasemeter: Option<Phasemeter>,
        gnss: GnssReference,
        engine: Box<dyn DiscipliningEngine>,
        status_sink: Arc<dyn StatusSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        ControlLoop {
            config,
            oscillator,
            phc,
            phasemeter,
            gnss,
            engine,
            status_sink,
            shutdown,
            ignore_next_irq: false,
            consecutive_misses: 0,
            last_reference_time: Utc { sec: 0, nsec: 0 },
        }
    }

    /// Runs the one-time sequence that brings the PHC coincident with
    /// GNSS UTC before steady-state tracking starts.
    pub fn initial_align(&mut self) -> Result<(), OscillatordError> {
        if !self.config.disciplining {
            return Ok(());
        }

        self.gnss.set_ptp_clock_time(self.phc.as_mut())?;

        let sample = self.wait_for_both_sample()?;
        let signed = apply_sign_convention(sample.phase_error_ns as i64, self.config.opposite_phase_error);
        self.phc.adjust_phase(phase_jump_offset(signed))?;

        std::thread::sleep(SETTLING_TIME);
        self.gnss.set_ptp_clock_time(self.phc.as_mut())?;
        Ok(())
    }

    fn wait_for_both_sample(&mut self) -> Result<crate::phasemeter::PhaseSample, OscillatordError> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(OscillatordError::Interrupted);
            }
            if let Some(phasemeter) = &self.phasemeter {
                if let Some(sample) = phasemeter.next(TICK_TIMEOUT) {
                    if sample.status == PhaseStatus::Both {
                        return Ok(sample);
                    }
                }
            } else {
                let raw = self.oscillator.get_phase_error()?;
                return Ok(crate::phasemeter::PhaseSample {
                    status: PhaseStatus::Both,
                    phase_error_ns: raw as i32,
                    timestamp_sec: 0,
                });
            }
        }
    }

    /// Runs the steady-state loop until the shutdown flag is observed.
    pub fn run(&mut self) -> Result<(), OscillatordError> {
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.tick() {
                log::warn!("control loop tick failed: {e}");
            }
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<(), OscillatordError> {
        let telemetry = match self.oscillator.get_ctrl() {
            Ok(t) => t,
            Err(e) => {
                log::warn!("telemetry read failed: {e}");
                return Ok(());
            }
        };

        let reference = self.gnss.snapshot();

        let _ = self.oscillator.push_gnss_info(reference.is_valid(), reference.last_fix_utc_time.sec);

        self.consecutive_misses =
            track_reference_misses(&reference, &mut self.last_reference_time, self.consecutive_misses);
        if self.consecutive_misses >= 2 {
            return Err(OscillatordError::ReferenceStale { missed_ticks: self.consecutive_misses });
        }

        let sample = if let Some(phasemeter) = &self.phasemeter {
            match phasemeter.next(TICK_TIMEOUT) {
                Some(s) => s,
                None => return Ok(()),
            }
        } else {
            // Families with an internal phase source have no phasemeter
            // condvar to block on, so the tick paces itself.
            std::thread::sleep(TICK_TIMEOUT);
            let raw = self.oscillator.get_phase_error()?;
            crate::phasemeter::PhaseSample { status: PhaseStatus::Both, phase_error_ns: raw as i32, timestamp_sec: 0 }
        };

        if self.ignore_next_irq {
            self.ignore_next_irq = false;
            return Ok(());
        }

        if sample.status != PhaseStatus::Both && sample.status != PhaseStatus::NoGnss {
            let status = self.current_status();
            self.status_sink.publish(&status, &telemetry, 0, &reference);
            return Ok(());
        }

        let signed_phase =
            apply_sign_convention(sample.phase_error_ns as i64, self.config.opposite_phase_error);

        let input = EngineInput {
            phase_error_ns: signed_phase,
            valid: reference.is_valid(),
            lock: telemetry.lock,
            fine_setpoint: telemetry.fine_ctrl,
            coarse_setpoint: telemetry.coarse_ctrl,
            temperature: telemetry.temperature,
            q_err_ns: reference.q_err_ns,
            ls_change: reference.ls_change,
            calibration_requested: false,
        };

        let output = self.engine.process(&input)?;
        self.dispatch(output)?;

        let status = self.current_status();
        self.status_sink.publish(&status, &telemetry, signed_phase, &reference);
        Ok(())
    }

    /// Prefers the driver's own notion of disciplining status (family S
    /// tracks its own lock/holdover state from the serial link) and
    /// falls back to the generic engine's status for drivers that don't
    /// report one of their own.
    fn current_status(&mut self) -> crate::status::DisciplingStatus {
        match self.oscillator.get_disciplining_status() {
            Ok(status) => status,
            Err(_) => self.engine.get_status(),
        }
    }

    fn dispatch(&mut self, output: ControlOutput) -> Result<(), OscillatordError> {
        match output.action {
            Action::PhaseJump => {
                self.phc.adjust_phase(phase_jump_offset(output.value_phase_ctrl))?;
                self.ignore_next_irq = true;
                Ok(())
            }
            Action::Calibrate => self.run_calibration(),
            Action::None | Action::AdjustFine | Action::AdjustCoarse | Action::SaveCoarse => {
                self.oscillator.apply_output(&output)
            }
        }
    }

    fn run_calibration(&mut self) -> Result<(), OscillatordError> {
        let plan = self.engine.get_calibration_parameters();
        let shutdown = self.shutdown.clone();
        let phasemeter = &self.phasemeter;
        let oscillator = self.oscillator.as_mut();

        let results = family_m::run_calibration_sweep(
            oscillator,
            &plan,
            SETTLING_TIME,
            || {
                phasemeter
                    .as_ref()
                    .and_then(|p| p.next(TICK_TIMEOUT))
                    .map(|s| s.phase_error_ns as i64)
                    .unwrap_or(0)
            },
            || shutdown.load(Ordering::SeqCst),
        );

        match results {
            Some(results) => {
                self.engine.calibrate(&plan, &results)?;
                let params = self.engine.get_disciplining_parameters();
                log::info!("calibration complete, stamped {}", params.calibration_date_string());
                Ok(())
            }
            None => {
                log::warn!("calibration aborted by shutdown, discarding partial results");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_convention_default_is_identity() {
        assert_eq!(apply_sign_convention(1234, false), 1234);
    }

    #[test]
    fn sign_convention_opposite_negates() {
        assert_eq!(apply_sign_convention(1234, true), -1234);
    }

    #[test]
    fn phase_jump_offset_is_negated_error() {
        assert_eq!(phase_jump_offset(1234), -1234);
        assert_eq!(phase_jump_offset(-1234), 1234);
    }

    #[test]
    fn scenario_s1_initial_phase_jump_value() {
        // S1: opposite-phase-error=false, initial phase +1234ns -> PHC offset -1234ns exactly once.
        let signed = apply_sign_convention(1234, false);
        assert_eq!(phase_jump_offset(signed), -1234);
    }

    fn valid_epoch(sec: i64) -> GnssEpoch {
        GnssEpoch {
            fix: crate::gnss::FIX_3D,
            fix_ok: true,
            ls_valid: true,
            last_fix_utc_time: Utc { sec, nsec: 0 },
            ..GnssEpoch::default()
        }
    }

    #[test]
    fn single_missed_update_is_tolerated() {
        let mut last_seen = Utc { sec: 100, nsec: 0 };
        // Same timestamp as before: one miss, not yet stale.
        let misses = track_reference_misses(&valid_epoch(100), &mut last_seen, 0);
        assert_eq!(misses, 1);
    }

    #[test]
    fn two_consecutive_misses_reach_the_stale_threshold() {
        let mut last_seen = Utc { sec: 100, nsec: 0 };
        let misses = track_reference_misses(&valid_epoch(100), &mut last_seen, 0);
        let misses = track_reference_misses(&valid_epoch(100), &mut last_seen, misses);
        assert_eq!(misses, 2);
    }

    #[test]
    fn invalid_epoch_counts_as_a_miss() {
        let mut last_seen = Utc { sec: 100, nsec: 0 };
        let misses = track_reference_misses(&GnssEpoch::default(), &mut last_seen, 0);
        assert_eq!(misses, 1);
    }

    #[test]
    fn fresh_epoch_resets_the_miss_counter() {
        let mut last_seen = Utc { sec: 100, nsec: 0 };
        let fresh = track_reference_misses(&valid_epoch(101), &mut last_seen, 1);
        assert_eq!(fresh, 0);
        assert_eq!(last_seen, Utc { sec: 101, nsec: 0 });
    }
}

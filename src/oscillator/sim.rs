//! Simulator and dummy drivers used for testing and dry runs — no
//! on-device state, plausible values only.

use super::{Action, ControlOutput, Oscillator, OscillatorTelemetry};
use crate::error::OscillatordError;

/// Tracks applied fine/coarse setpoints and reports a drifting
/// temperature, useful for exercising the control loop end to end.
pub struct SimulatedOscillator {
    fine: u32,
    coarse: u32,
    lock: bool,
    tick: u64,
}

impl SimulatedOscillator {
    pub fn new() -> Self {
        SimulatedOscillator { fine: 2400, coarse: 2_097_151, lock: false, tick: 0 }
    }
}

impl Default for SimulatedOscillator {
    fn default() -> Self {
        Self::new()
    }
}

impl Oscillator for SimulatedOscillator {
    fn get_ctrl(&mut self) -> Result<OscillatorTelemetry, OscillatordError> {
        self.tick += 1;
        if self.tick > 5 {
            self.lock = true;
        }
        let temperature = 35.0 + (self.tick as f64 * 0.01).sin();
        Ok(OscillatorTelemetry { fine_ctrl: self.fine, coarse_ctrl: self.coarse, lock: self.lock, temperature })
    }

    fn apply_output(&mut self, output: &ControlOutput) -> Result<(), OscillatordError> {
        match output.action {
            Action::AdjustFine => {
                self.fine = output.setpoint;
                Ok(())
            }
            Action::AdjustCoarse => {
                self.coarse = output.setpoint;
                Ok(())
            }
            Action::SaveCoarse | Action::None | Action::PhaseJump | Action::Calibrate => Ok(()),
        }
    }

    fn dac_min(&self) -> u32 {
        0
    }

    fn dac_max(&self) -> u32 {
        4800
    }
}

/// Always reports the same fixed telemetry and accepts any command
/// without effect; used for smoke-testing the control loop wiring.
pub struct DummyOscillator;

impl DummyOscillator {
    pub fn new() -> Self {
        DummyOscillator
    }
}

impl Default for DummyOscillator {
    fn default() -> Self {
        Self::new()
    }
}

impl Oscillator for DummyOscillator {
    fn get_ctrl(&mut self) -> Result<OscillatorTelemetry, OscillatordError> {
        Ok(OscillatorTelemetry { fine_ctrl: 2400, coarse_ctrl: 2_097_151, lock: true, temperature: 35.0 })
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_oscillator_locks_after_warmup() {
        let mut osc = SimulatedOscillator::new();
        for _ in 0..5 {
            let t = osc.get_ctrl().unwrap();
            assert!(!t.lock);
        }
        let t = osc.get_ctrl().unwrap();
        assert!(t.lock);
    }

    #[test]
    fn simulated_oscillator_applies_fine_setpoint() {
        let mut osc = SimulatedOscillator::new();
        osc.apply_output(&ControlOutput { action: Action::AdjustFine, setpoint: 1234, value_phase_ctrl: 0 })
            .unwrap();
        assert_eq!(osc.get_ctrl().unwrap().fine_ctrl, 1234);
    }

    #[test]
    fn dummy_oscillator_is_always_locked() {
        let mut osc = DummyOscillator::new();
        assert!(osc.get_ctrl().unwrap().lock);
    }
}

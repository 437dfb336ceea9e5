//! Serial ("family S") atomic oscillator driver: an ASCII line protocol
//! over a dedicated serial port, with an internal three-phase tau
//! schedule and a latch-based recovery path for out-of-range tuning.

use super::{Action, ControlOutput, Oscillator, OscillatorTelemetry};
use crate::config::Config;
use crate::error::OscillatordError;
use crate::status::{ClockClass, DisciplingStatus, TrackingState};
use std::io::{BufRead, BufReader, Write};
use std::time::{Duration, Instant};

const TAU_VALUES: [u32; 3] = [50, 500, 10_000];
const TAU_INTERVAL_SECS: [u64; 3] = [600, 7_200, 86_400];
const GNSS_LOSS_TIMEOUT_SECS: i64 = 24 * 3_600;
const LATCH_COMMAND: &str = "{latch}";
const DIGITAL_TUNING_MIN: i32 = -32_768;
const DIGITAL_TUNING_MAX: i32 = 32_767;

/// Transport seam so the protocol logic can be exercised without a
/// real serial port.
pub trait SerialTransport: Send {
    fn send_command(&mut self, command: &str) -> Result<String, OscillatordError>;
}

pub struct RealSerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl RealSerialTransport {
    pub fn open(path: &str) -> Result<Self, OscillatordError> {
        let port = serialport::new(path, 57_600)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| OscillatordError::DeviceAbsent {
                path: path.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;
        Ok(RealSerialTransport { port })
    }
}

impl SerialTransport for RealSerialTransport {
    fn send_command(&mut self, command: &str) -> Result<String, OscillatordError> {
        self.port
            .write_all(command.as_bytes())
            .map_err(|e| OscillatordError::DeviceIo { device: "sa5x-serial", source: e })?;
        let mut reader = BufReader::new(&mut self.port);
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| OscillatordError::DeviceIo { device: "sa5x-serial", source: e })?;
        Ok(line)
    }
}

pub struct Sa5xOscillator<T: SerialTransport = RealSerialTransport> {
    transport: T,
    lock_acquired_at: Option<Instant>,
    gnss_last_fix_secs: Option<i64>,
    current_digital_tuning: i32,
    last_correction: i32,
}

impl Sa5xOscillator<RealSerialTransport> {
    pub fn open(config: &Config) -> Result<Self, OscillatordError> {
        let path = config.get_raw("oscillator-serial-device").unwrap_or("/dev/ttyS1");
        let transport = RealSerialTransport::open(path)?;
        Ok(Sa5xOscillator::with_transport(transport))
    }
}

impl<T: SerialTransport> Sa5xOscillator<T> {
    pub fn with_transport(transport: T) -> Self {
        Sa5xOscillator {
            transport,
            lock_acquired_at: None,
            gnss_last_fix_secs: None,
            current_digital_tuning: 0,
            last_correction: 0,
        }
    }

    /// Current tau phase index (0, 1 or 2), based on elapsed locked
    /// time, per the fixed interval schedule.
    pub fn tau_phase(&self, now: Instant) -> usize {
        let Some(locked_since) = self.lock_acquired_at else {
            return 0;
        };
        let elapsed = now.duration_since(locked_since).as_secs();
        if elapsed >= TAU_INTERVAL_SECS[1] {
            2
        } else if elapsed >= TAU_INTERVAL_SECS[0] {
            1
        } else {
            0
        }
    }

    pub fn current_tau(&self, now: Instant) -> u32 {
        TAU_VALUES[self.tau_phase(now)]
    }

    /// Evaluate whether GNSS has been lost long enough to reset the
    /// tau schedule and force UNCALIBRATED status.
    pub fn clock_class_for_holdover(&self, now_secs: i64) -> ClockClass {
        match self.gnss_last_fix_secs {
            None => ClockClass::Uncalibrated,
            Some(last_fix) => {
                let elapsed = now_secs - last_fix;
                if elapsed > GNSS_LOSS_TIMEOUT_SECS {
                    ClockClass::Uncalibrated
                } else if elapsed > TAU_INTERVAL_SECS[0] as i64 {
                    ClockClass::Holdover
                } else {
                    ClockClass::Lock
                }
            }
        }
    }

    /// Disable discipline, issue a latch, clear digital tuning, then
    /// re-enable discipline — the recovery path for out-of-range
    /// digital tuning.
    pub fn latch_recover(&mut self) -> Result<(), OscillatordError> {
        self.transport.send_command("{disdisc}")?;
        self.transport.send_command(LATCH_COMMAND)?;
        self.current_digital_tuning = 0;
        self.transport.send_command("{endisc}")?;
        Ok(())
    }

    fn needs_latch(&self, proposed_tuning: i32) -> bool {
        proposed_tuning < DIGITAL_TUNING_MIN || proposed_tuning > DIGITAL_TUNING_MAX
    }
}

impl<T: SerialTransport> Oscillator for Sa5xOscillator<T> {
    fn get_ctrl(&mut self) -> Result<OscillatorTelemetry, OscillatordError> {
        let reply = self.transport.send_command("[?dtrm]")?;
        let locked = reply.trim_start().starts_with("[=");
        if locked && self.lock_acquired_at.is_none() {
            self.lock_acquired_at = Some(Instant::now());
        } else if !locked {
            self.lock_acquired_at = None;
        }
        Ok(OscillatorTelemetry {
            fine_ctrl: self.last_correction as u32,
            coarse_ctrl: self.current_tau(Instant::now()),
            lock: locked,
            temperature: -3000.0,
        })
    }

    fn apply_output(&mut self, output: &ControlOutput) -> Result<(), OscillatordError> {
        match output.action {
            Action::AdjustFine => {
                // ControlOutput setpoints travel in the driver's unsigned
                // [dac_min, dac_max] window; the wire protocol wants a
                // signed digital-tuning value.
                let proposed = output.setpoint as i32 - 32_768;
                if self.needs_latch(proposed) {
                    self.latch_recover()?;
                    return Ok(());
                }
                self.transport.send_command(&format!("{{dtrm,{proposed}}}"))?;
                self.current_digital_tuning = proposed;
                self.last_correction = proposed;
                Ok(())
            }
            Action::None
            | Action::AdjustCoarse
            | Action::SaveCoarse
            | Action::PhaseJump
            | Action::Calibrate => Ok(()),
        }
    }

    fn push_gnss_info(&mut self, fix_ok: bool, last_fix_utc_secs: i64) -> Result<(), OscillatordError> {
        if fix_ok {
            self.gnss_last_fix_secs = Some(last_fix_utc_secs);
        } else {
            // On loss of GNSS the tau schedule resets to its first stage.
            self.gnss_last_fix_secs = None;
            self.lock_acquired_at = None;
        }
        Ok(())
    }

    fn get_phase_error(&mut self) -> Result<i64, OscillatordError> {
        let reply = self.transport.send_command("[?phase]")?;
        parse_phase_reply(&reply).ok_or_else(|| {
            OscillatordError::ParameterFormat(format!("unparseable phase reply: {reply:?}"))
        })
    }

    fn get_disciplining_status(&mut self) -> Result<DisciplingStatus, OscillatordError> {
        let now_secs = self.gnss_last_fix_secs.unwrap_or(0);
        let clock_class = self.clock_class_for_holdover(now_secs);
        let status = match clock_class {
            ClockClass::Lock => TrackingState::Lock,
            ClockClass::Holdover => TrackingState::Holdover,
            ClockClass::Uncalibrated => TrackingState::Init,
            ClockClass::Calibrating => TrackingState::Calibration,
        };
        Ok(DisciplingStatus { status, clock_class, ..DisciplingStatus::default() })
    }

    fn dac_min(&self) -> u32 {
        (DIGITAL_TUNING_MIN + 32_768) as u32
    }

    fn dac_max(&self) -> u32 {
        (DIGITAL_TUNING_MAX + 32_768) as u32
    }

    fn has_internal_phase_source(&self) -> bool {
        true
    }
}

/// Parses a `[=phase,<ns>]` style reply into its signed nanosecond value.
fn parse_phase_reply(reply: &str) -> Option<i64> {
    let trimmed = reply.trim();
    if !trimmed.starts_with("[=phase,") {
        return None;
    }
    let inner = trimmed.trim_start_matches("[=phase,").trim_end_matches(']');
    inner.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeTransport {
        responses: VecDeque<String>,
        sent: Vec<String>,
    }

    impl FakeTransport {
        fn new(responses: &[&str]) -> Self {
            FakeTransport {
                responses: responses.iter().map(|s| s.to_string()).collect(),
                sent: Vec::new(),
            }
        }
    }

    impl SerialTransport for FakeTransport {
        fn send_command(&mut self, command: &str) -> Result<String, OscillatordError> {
            self.sent.push(command.to_string());
            Ok(self.responses.pop_front().unwrap_or_else(|| "[=ok]".to_string()))
        }
    }

    #[test]
    fn tau_schedule_starts_at_phase_zero_before_lock() {
        let transport = FakeTransport::new(&[]);
        let osc = Sa5xOscillator::with_transport(transport);
        assert_eq!(osc.current_tau(Instant::now()), TAU_VALUES[0]);
    }

    #[test]
    fn gnss_loss_past_601s_enters_holdover() {
        let transport = FakeTransport::new(&[]);
        let mut osc = Sa5xOscillator::with_transport(transport);
        osc.push_gnss_info(true, 0).unwrap();
        assert_eq!(osc.clock_class_for_holdover(601), ClockClass::Holdover);
    }

    #[test]
    fn gnss_loss_past_24h_enters_uncalibrated() {
        let transport = FakeTransport::new(&[]);
        let mut osc = Sa5xOscillator::with_transport(transport);
        osc.push_gnss_info(true, 0).unwrap();
        assert_eq!(osc.clock_class_for_holdover(24 * 3600 + 1), ClockClass::Uncalibrated);
    }

    #[test]
    fn gnss_still_fresh_stays_locked() {
        let transport = FakeTransport::new(&[]);
        let mut osc = Sa5xOscillator::with_transport(transport);
        osc.push_gnss_info(true, 0).unwrap();
        assert_eq!(osc.clock_class_for_holdover(60), ClockClass::Lock);
    }

    #[test]
    fn gnss_loss_resets_tau_schedule() {
        let transport = FakeTransport::new(&[]);
        let mut osc = Sa5xOscillator::with_transport(transport);
        osc.push_gnss_info(true, 0).unwrap();
        osc.lock_acquired_at = Some(Instant::now() - Duration::from_secs(TAU_INTERVAL_SECS[0] + 1));
        assert_eq!(osc.tau_phase(Instant::now()), 1);

        osc.push_gnss_info(false, 0).unwrap();
        assert_eq!(osc.tau_phase(Instant::now()), 0);
        assert_eq!(osc.clock_class_for_holdover(0), ClockClass::Uncalibrated);
    }

    #[test]
    fn out_of_range_tuning_triggers_latch_sequence() {
        let transport = FakeTransport::new(&["[=ok]", "[=ok]", "[=ok]"]);
        let mut osc = Sa5xOscillator::with_transport(transport);
        osc.apply_output(&ControlOutput {
            action: Action::AdjustFine,
            setpoint: 100_000,
            value_phase_ctrl: 0,
        })
        .unwrap();
        assert_eq!(osc.current_digital_tuning, 0);
        assert_eq!(osc.transport.sent, vec!["{disdisc}", "{latch}", "{endisc}"]);
    }

    #[test]
    fn phase_reply_parses_signed_value() {
        assert_eq!(parse_phase_reply("[=phase,-1234]"), Some(-1234));
        assert_eq!(parse_phase_reply("[?err]"), None);
    }

    #[test]
    fn in_range_tuning_applies_directly() {
        let transport = FakeTransport::new(&["[=ok]"]);
        let mut osc = Sa5xOscillator::with_transport(transport);
        osc.apply_output(&ControlOutput { action: Action::AdjustFine, setpoint: 32_868, value_phase_ctrl: 0 })
            .unwrap();
        assert_eq!(osc.current_digital_tuning, 100);
    }
}

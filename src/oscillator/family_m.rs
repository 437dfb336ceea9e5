//! Rubidium ("family M") driver: a character device with ioctl-based
//! fine/coarse/temperature/control-register access plus an on-chip
//! extended EEPROM blob.

use super::{Action, CalibrationPlan, CalibrationResults, ControlOutput, Oscillator, OscillatorTelemetry};
use crate::config::Config;
use crate::eeprom::{DisciplingParameters, DSC_CONFIG_SIZE, TEMP_TABLE_SIZE};
use crate::error::OscillatordError;
use nix::{ioctl_none, ioctl_read, ioctl_write_int, ioctl_write_ptr};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

pub const SETPOINT_MIN: u32 = 0;
pub const SETPOINT_MAX: u32 = 1_000_000;
pub const FINE_RANGE_MAX: u32 = 4800;
pub const COARSE_RANGE_MAX: u32 = 4_194_303;

const MRO_MAGIC: u8 = b'M';
const CMD_READ_FINE: u8 = 0x40;
const CMD_READ_COARSE: u8 = 0x42;
const CMD_SET_FINE: u8 = 0x41;
const CMD_SET_COARSE: u8 = 0x43;
const CMD_SAVE_COARSE: u8 = 0xc2;
const CMD_READ_TEMP: u8 = 0x3e;
const CMD_READ_CTRL: u8 = 0x44;
const CMD_READ_EXT_EEPROM: u8 = 0x50;
const CMD_WRITE_EXT_EEPROM: u8 = 0x51;

ioctl_read!(mro_read_fine, MRO_MAGIC, CMD_READ_FINE, u32);
ioctl_read!(mro_read_coarse, MRO_MAGIC, CMD_READ_COARSE, u32);
ioctl_write_int!(mro_set_fine, MRO_MAGIC, CMD_SET_FINE);
ioctl_write_int!(mro_set_coarse, MRO_MAGIC, CMD_SET_COARSE);
ioctl_none!(mro_save_coarse, MRO_MAGIC, CMD_SAVE_COARSE);
ioctl_read!(mro_read_temp_reg, MRO_MAGIC, CMD_READ_TEMP, u32);
ioctl_read!(mro_read_ctrl_reg, MRO_MAGIC, CMD_READ_CTRL, u32);
ioctl_read!(mro_read_ext_eeprom, MRO_MAGIC, CMD_READ_EXT_EEPROM, [u8; 512]);
ioctl_write_ptr!(mro_write_ext_eeprom, MRO_MAGIC, CMD_WRITE_EXT_EEPROM, [u8; 512]);

/// Converts the 12-bit temperature register into degrees Celsius using
/// the thermistor's Steinhart-Hart-derived formula for this part.
pub fn temperature_from_register(reg: u16) -> f64 {
    let x = (reg & 0x0FFF) as f64 / 4095.0;
    if (x - 1.0).abs() < f64::EPSILON {
        return -3000.0;
    }
    let r = 47000.0 * x / (1.0 - x);
    4100.0 * 298.15 / (298.15 * (1e-5 * r).ln() + 4100.0) - 273.14
}

pub struct MRo50Oscillator {
    file: File,
}

impl MRo50Oscillator {
    pub fn open(config: &Config) -> Result<Self, OscillatordError> {
        let path = config.get_raw("oscillator-device").unwrap_or("/dev/mro50.0").to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| OscillatordError::DeviceAbsent { path, source: e })?;
        Ok(MRo50Oscillator { file })
    }

    fn check_setpoint(&self, what: &'static str, value: u32, max: u32) -> Result<(), OscillatordError> {
        if value > max {
            return Err(OscillatordError::OutOfRange { what, value: value as i64, min: 0, max: max as i64 });
        }
        Ok(())
    }
}

impl Oscillator for MRo50Oscillator {
    fn get_ctrl(&mut self) -> Result<OscillatorTelemetry, OscillatordError> {
        let fd = self.file.as_raw_fd();
        let mut fine = 0u32;
        let mut coarse = 0u32;
        let mut temp_reg = 0u32;
        let mut ctrl_reg = 0u32;
        unsafe {
            mro_read_fine(fd, &mut fine)?;
            mro_read_coarse(fd, &mut coarse)?;
            mro_read_temp_reg(fd, &mut temp_reg)?;
            mro_read_ctrl_reg(fd, &mut ctrl_reg)?;
        }
        let lock = ctrl_reg & 0x2 != 0;
        let temperature = temperature_from_register(temp_reg as u16);
        Ok(OscillatorTelemetry { fine_ctrl: fine, coarse_ctrl: coarse, lock, temperature })
    }

    fn apply_output(&mut self, output: &ControlOutput) -> Result<(), OscillatordError> {
        let fd = self.file.as_raw_fd();
        match output.action {
            Action::AdjustFine => {
                self.check_setpoint("fine", output.setpoint, FINE_RANGE_MAX)?;
                unsafe { mro_set_fine(fd, output.setpoint as i32)? };
                Ok(())
            }
            Action::AdjustCoarse => {
                self.check_setpoint("coarse", output.setpoint, COARSE_RANGE_MAX)?;
                unsafe { mro_set_coarse(fd, output.setpoint as i32)? };
                Ok(())
            }
            Action::SaveCoarse => {
                unsafe { mro_save_coarse(fd)? };
                Ok(())
            }
            Action::None | Action::PhaseJump | Action::Calibrate => Ok(()),
        }
    }

    fn get_disciplining_parameters(&mut self) -> Result<DisciplingParameters, OscillatordError> {
        let fd = self.file.as_raw_fd();
        let mut blob = [0u8; 512];
        unsafe { mro_read_ext_eeprom(fd, &mut blob)? };
        decode_extended_blob(&blob)
    }

    fn apply_disciplining_parameters(
        &mut self,
        params: &DisciplingParameters,
    ) -> Result<(), OscillatordError> {
        let blob = encode_extended_blob(params);
        let fd = self.file.as_raw_fd();
        unsafe { mro_write_ext_eeprom(fd, &blob)? };
        Ok(())
    }

    fn dac_min(&self) -> u32 {
        SETPOINT_MIN
    }

    fn dac_max(&self) -> u32 {
        FINE_RANGE_MAX
    }

    fn calibration_plan(&self, nb_calibration: u32) -> CalibrationPlan {
        let steps = 5u32;
        let ctrl_points = (0..steps).map(|i| i * FINE_RANGE_MAX / (steps - 1)).collect();
        CalibrationPlan { ctrl_points, nb_calibration }
    }
}

/// Drive a calibration sweep over `plan`: apply each fine setpoint,
/// settle, then collect `nb_calibration` phase samples per point from
/// a caller-provided sampler closure. Aborts early (returning the
/// samples collected so far) if `should_abort` becomes true, matching
/// the control loop's "no partial results fed to the engine" contract.
pub fn run_calibration_sweep<F, G>(
    osc: &mut dyn Oscillator,
    plan: &CalibrationPlan,
    settle: std::time::Duration,
    mut sample_phase: F,
    mut should_abort: G,
) -> Option<CalibrationResults>
where
    F: FnMut() -> i64,
    G: FnMut() -> bool,
{
    let mut samples = Vec::with_capacity(plan.ctrl_points.len());
    for &point in &plan.ctrl_points {
        if should_abort() {
            return None;
        }
        let _ = osc.apply_output(&ControlOutput {
            action: Action::AdjustFine,
            setpoint: point,
            value_phase_ctrl: 0,
        });
        std::thread::sleep(settle);
        let mut row = Vec::with_capacity(plan.nb_calibration as usize);
        for _ in 0..plan.nb_calibration {
            if should_abort() {
                return None;
            }
            row.push(sample_phase());
        }
        samples.push(row);
    }
    Some(CalibrationResults { samples })
}

/// Packs the two EEPROM regions back to back into the on-chip extended
/// blob, the same layout `ParameterStore`'s file backend uses, just
/// concatenated into one 512-byte ioctl payload instead of two files.
fn encode_extended_blob(params: &DisciplingParameters) -> [u8; 512] {
    let config_region = params.encode_config_region();
    let temp_region = params.encode_temp_region();
    let mut blob = [0u8; 512];
    blob[..DSC_CONFIG_SIZE].copy_from_slice(&config_region);
    blob[DSC_CONFIG_SIZE..DSC_CONFIG_SIZE + TEMP_TABLE_SIZE].copy_from_slice(&temp_region);
    blob
}

fn decode_extended_blob(blob: &[u8; 512]) -> Result<DisciplingParameters, OscillatordError> {
    if blob.len() < DSC_CONFIG_SIZE + TEMP_TABLE_SIZE {
        return Err(OscillatordError::ParameterFormat("extended EEPROM blob too short".to_string()));
    }
    let mut config_region = [0u8; DSC_CONFIG_SIZE];
    config_region.copy_from_slice(&blob[..DSC_CONFIG_SIZE]);
    let mut temp_region = [0u8; TEMP_TABLE_SIZE];
    temp_region.copy_from_slice(&blob[DSC_CONFIG_SIZE..DSC_CONFIG_SIZE + TEMP_TABLE_SIZE]);
    DisciplingParameters::decode_regions(&config_region, &temp_region)
}

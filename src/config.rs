use crate::error::OscillatordError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level daemon configuration, loaded once at startup from a
/// newline-separated `key=value` file (`#` starts a comment line).
#[derive(Debug, Clone)]
pub struct Config {
    pub oscillator: String,
    pub disciplining: bool,
    pub monitoring: bool,
    pub ptp_clock: PathBuf,
    pub pps_device: Option<PathBuf>,
    pub opposite_phase_error: bool,
    pub debug: i32,
    /// Every key present in the file, including the ones already
    /// projected onto typed fields above. Engine keys are looked up
    /// here and forwarded to the engine verbatim.
    raw: HashMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, OscillatordError> {
        let text = std::fs::read_to_string(path).map_err(|e| OscillatordError::DeviceAbsent {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(Self::parse(&text))
    }

    fn parse(text: &str) -> Self {
        let mut raw = HashMap::new();
        for line in text.split('\n') {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                raw.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let oscillator = raw.get("oscillator").cloned().unwrap_or_else(|| "sim".to_string());
        let disciplining = get_bool_default(&raw, "disciplining", true);
        let monitoring = get_bool_default(&raw, "monitoring", false);
        let ptp_clock = raw
            .get("ptp-clock")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/dev/ptp0"));
        let pps_device = raw.get("pps-device").map(PathBuf::from);
        let opposite_phase_error = get_bool_default(&raw, "opposite-phase-error", false);
        let debug = raw
            .get("debug")
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);

        Config {
            oscillator,
            disciplining,
            monitoring,
            ptp_clock,
            pps_device,
            opposite_phase_error,
            debug,
            raw,
        }
    }

    #[cfg(test)]
    pub fn load_for_test(text: &str) -> Self {
        Self::parse(text)
    }

    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(|s| s.as_str())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::from_raw(&self.raw)
    }
}

/// Only accepts the literal strings "true"/"false", matching the
/// original config reader's strictness.
fn get_bool_default(raw: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match raw.get(key).map(|s| s.as_str()) {
        Some("true") => true,
        Some("false") => false,
        _ => default,
    }
}

fn get_u32(raw: &HashMap<String, String>, key: &str, default: u32) -> u32 {
    raw.get(key).and_then(|v| v.parse::<u32>().ok()).unwrap_or(default)
}

fn get_i64(raw: &HashMap<String, String>, key: &str, default: i64) -> i64 {
    raw.get(key).and_then(|v| v.parse::<i64>().ok()).unwrap_or(default)
}

fn get_f64(raw: &HashMap<String, String>, key: &str, default: f64) -> f64 {
    raw.get(key).and_then(|v| v.parse::<f64>().ok()).unwrap_or(default)
}

/// Configuration forwarded verbatim to the disciplining engine. Field
/// names mirror the config keys documented in the external interfaces.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub calibrate_first: bool,
    pub fine_stop_tolerance: u32,
    pub max_allowed_coarse: u32,
    pub nb_calibration: u32,
    pub phase_jump_threshold_ns: i64,
    pub phase_resolution_ns: i64,
    pub reactivity_min: f64,
    pub reactivity_max: f64,
    pub reactivity_power: f64,
    pub ref_fluctuations_ns: i64,
    pub oscillator_factory_settings: bool,
}

impl EngineConfig {
    fn from_raw(raw: &HashMap<String, String>) -> Self {
        EngineConfig {
            calibrate_first: get_bool_default(raw, "calibrate_first", false),
            fine_stop_tolerance: get_u32(raw, "fine_stop_tolerance", 30),
            max_allowed_coarse: get_u32(raw, "max_allowed_coarse", 30),
            nb_calibration: get_u32(raw, "nb_calibration", 10),
            phase_jump_threshold_ns: get_i64(raw, "phase_jump_threshold_ns", 1_000_000),
            phase_resolution_ns: get_i64(raw, "phase_resolution_ns", 50),
            reactivity_min: get_f64(raw, "reactivity_min", 0.25),
            reactivity_max: get_f64(raw, "reactivity_max", 6.0),
            reactivity_power: get_f64(raw, "reactivity_power", 2.0),
            ref_fluctuations_ns: get_i64(raw, "ref_fluctuations_ns", 30),
            oscillator_factory_settings: get_bool_default(raw, "oscillator_factory_settings", false),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::from_raw(&HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let cfg = Config::parse(
            "# a comment\n\noscillator=mRO50\ndisciplining=true\nphase_jump_threshold_ns=500000\n",
        );
        assert_eq!(cfg.oscillator, "mRO50");
        assert!(cfg.disciplining);
        assert_eq!(cfg.engine_config().phase_jump_threshold_ns, 500_000);
    }

    #[test]
    fn bool_parsing_is_strict() {
        let cfg = Config::parse("disciplining=yes\n");
        // "yes" is not a recognised literal, so the default applies.
        assert!(cfg.disciplining);
    }

    #[test]
    fn defaults_when_missing() {
        let cfg = Config::parse("");
        assert_eq!(cfg.oscillator, "sim");
        assert!(!cfg.monitoring);
        assert_eq!(cfg.ptp_clock, PathBuf::from("/dev/ptp0"));
    }

    #[test]
    fn engine_keys_forward_with_defaults() {
        let ec = EngineConfig::default();
        assert_eq!(ec.nb_calibration, 10);
        assert!((ec.reactivity_power - 2.0).abs() < f64::EPSILON);
    }
}

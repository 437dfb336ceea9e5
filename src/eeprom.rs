//! Versioned, two-region parameter store for the disciplining algorithm's
//! learned state (control-node polynomial, temperature table, equilibrium
//! coarse value).

use crate::error::OscillatordError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::path::{Path, PathBuf};

pub const DSC_CONFIG_SIZE: usize = 144;
pub const TEMP_TABLE_SIZE: usize = 368;
pub const MEAN_TEMPERATURE_ARRAY_MAX: usize = 150;
const MAX_CTRL_NODES: usize = 10;
const HEADER_MAGIC: u8 = 0x4F;
const FORMAT_VERSION: u8 = 1;

pub(crate) fn check_header_valid(header: u8) -> bool {
    header == HEADER_MAGIC
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisciplingParameters {
    pub ctrl_nodes_length: u8,
    pub ctrl_load_nodes: [f32; MAX_CTRL_NODES],
    pub ctrl_drift_coeffs: [f32; MAX_CTRL_NODES],
    pub coarse_equilibrium: i32,
    pub calibration_date: i64,
    pub calibration_valid: bool,
    pub ctrl_nodes_length_factory: u8,
    pub ctrl_load_nodes_factory: [f32; MAX_CTRL_NODES],
    pub ctrl_drift_coeffs_factory: [f32; MAX_CTRL_NODES],
    pub estimated_equilibrium_es: u32,
    pub mean_fine_over_temperature: Vec<u16>,
}

impl Default for DisciplingParameters {
    fn default() -> Self {
        DisciplingParameters {
            ctrl_nodes_length: 0,
            ctrl_load_nodes: [0.0; MAX_CTRL_NODES],
            ctrl_drift_coeffs: [0.0; MAX_CTRL_NODES],
            coarse_equilibrium: -1,
            calibration_date: 0,
            calibration_valid: false,
            ctrl_nodes_length_factory: 0,
            ctrl_load_nodes_factory: [0.0; MAX_CTRL_NODES],
            ctrl_drift_coeffs_factory: [0.0; MAX_CTRL_NODES],
            estimated_equilibrium_es: 0,
            mean_fine_over_temperature: vec![0; MEAN_TEMPERATURE_ARRAY_MAX],
        }
    }
}

impl DisciplingParameters {
    /// Renders `calibration_date` (unix seconds) as an RFC 3339 string for
    /// logging; falls back to the raw integer if it's out of chrono's range.
    pub fn calibration_date_string(&self) -> String {
        match chrono::DateTime::from_timestamp(self.calibration_date, 0) {
            Some(dt) => dt.to_rfc3339(),
            None => self.calibration_date.to_string(),
        }
    }

    pub(crate) fn encode_config_region(&self) -> [u8; DSC_CONFIG_SIZE] {
        let mut buf = [0u8; DSC_CONFIG_SIZE];
        let mut cur = Cursor::new(&mut buf[..]);
        let _ = cur.write_u8(HEADER_MAGIC);
        let _ = cur.write_u8(FORMAT_VERSION);
        let _ = cur.write_u8(self.ctrl_nodes_length);
        for v in &self.ctrl_load_nodes {
            let _ = cur.write_f32::<LittleEndian>(*v);
        }
        for v in &self.ctrl_drift_coeffs {
            let _ = cur.write_f32::<LittleEndian>(*v);
        }
        let _ = cur.write_i32::<LittleEndian>(self.coarse_equilibrium);
        let _ = cur.write_i64::<LittleEndian>(self.calibration_date);
        let _ = cur.write_u8(self.calibration_valid as u8);
        let _ = cur.write_u8(self.ctrl_nodes_length_factory);
        for v in &self.ctrl_load_nodes_factory {
            let _ = cur.write_f32::<LittleEndian>(*v);
        }
        for v in &self.ctrl_drift_coeffs_factory {
            let _ = cur.write_f32::<LittleEndian>(*v);
        }
        let _ = cur.write_u32::<LittleEndian>(self.estimated_equilibrium_es);
        buf
    }

    pub(crate) fn decode_config_region(buf: &[u8; DSC_CONFIG_SIZE]) -> Result<Self, OscillatordError> {
        let mut cur = Cursor::new(&buf[2..]);
        let ctrl_nodes_length = cur
            .read_u8()
            .map_err(|e| OscillatordError::ParameterFormat(e.to_string()))?;
        let mut ctrl_load_nodes = [0.0f32; MAX_CTRL_NODES];
        for v in ctrl_load_nodes.iter_mut() {
            *v = cur.read_f32::<LittleEndian>().unwrap_or(0.0);
        }
        let mut ctrl_drift_coeffs = [0.0f32; MAX_CTRL_NODES];
        for v in ctrl_drift_coeffs.iter_mut() {
            *v = cur.read_f32::<LittleEndian>().unwrap_or(0.0);
        }
        let coarse_equilibrium = cur.read_i32::<LittleEndian>().unwrap_or(-1);
        let calibration_date = cur.read_i64::<LittleEndian>().unwrap_or(0);
        let calibration_valid = cur.read_u8().unwrap_or(0) != 0;
        let ctrl_nodes_length_factory = cur.read_u8().unwrap_or(0);
        let mut ctrl_load_nodes_factory = [0.0f32; MAX_CTRL_NODES];
        for v in ctrl_load_nodes_factory.iter_mut() {
            *v = cur.read_f32::<LittleEndian>().unwrap_or(0.0);
        }
        let mut ctrl_drift_coeffs_factory = [0.0f32; MAX_CTRL_NODES];
        for v in ctrl_drift_coeffs_factory.iter_mut() {
            *v = cur.read_f32::<LittleEndian>().unwrap_or(0.0);
        }
        let estimated_equilibrium_es = cur.read_u32::<LittleEndian>().unwrap_or(0);

        Ok(DisciplingParameters {
            ctrl_nodes_length,
            ctrl_load_nodes,
            ctrl_drift_coeffs,
            coarse_equilibrium,
            calibration_date,
            calibration_valid,
            ctrl_nodes_length_factory,
            ctrl_load_nodes_factory,
            ctrl_drift_coeffs_factory,
            estimated_equilibrium_es,
            mean_fine_over_temperature: vec![0; MEAN_TEMPERATURE_ARRAY_MAX],
        })
    }

    pub(crate) fn encode_temp_region(&self) -> [u8; TEMP_TABLE_SIZE] {
        let mut buf = [0u8; TEMP_TABLE_SIZE];
        let mut cur = Cursor::new(&mut buf[..]);
        let _ = cur.write_u8(HEADER_MAGIC);
        let _ = cur.write_u8(FORMAT_VERSION);
        for v in self.mean_fine_over_temperature.iter().take(MEAN_TEMPERATURE_ARRAY_MAX) {
            let _ = cur.write_u16::<LittleEndian>(*v);
        }
        buf
    }

    pub(crate) fn decode_temp_region(buf: &[u8; TEMP_TABLE_SIZE]) -> Vec<u16> {
        let mut cur = Cursor::new(&buf[2..]);
        let mut table = vec![0u16; MEAN_TEMPERATURE_ARRAY_MAX];
        for v in table.iter_mut() {
            *v = cur.read_u16::<LittleEndian>().unwrap_or(0);
        }
        table
    }

    /// Decodes a pair of raw config/temp region buffers, dispatching on
    /// their header magic bytes exactly as `ParameterStore::read` does:
    /// both present is V1, neither present is legacy V0, exactly one is
    /// a corrupt/inconsistent store. Shared by the file-backed store and
    /// any other backend (e.g. an on-chip EEPROM blob) using the same
    /// two-region layout.
    pub(crate) fn decode_regions(
        config_buf: &[u8; DSC_CONFIG_SIZE],
        temp_buf: &[u8; TEMP_TABLE_SIZE],
    ) -> Result<Self, OscillatordError> {
        let config_has_magic = check_header_valid(config_buf[0]);
        let temp_has_magic = check_header_valid(temp_buf[0]);

        match (config_has_magic, temp_has_magic) {
            (true, true) => {
                if config_buf[1] != temp_buf[1] {
                    return Err(OscillatordError::ParameterFormat(format!(
                        "version mismatch: config={} temp={}",
                        config_buf[1], temp_buf[1]
                    )));
                }
                if config_buf[1] != FORMAT_VERSION {
                    return Err(OscillatordError::ParameterFormat(format!(
                        "unsupported version {}",
                        config_buf[1]
                    )));
                }
                let mut params = Self::decode_config_region(config_buf)?;
                params.mean_fine_over_temperature = Self::decode_temp_region(temp_buf);
                Ok(params)
            }
            (false, false) => Ok(Self::decode_v0(config_buf, temp_buf)),
            _ => Err(OscillatordError::ParameterFormat(
                "inconsistent header: exactly one region carries the magic byte".to_string(),
            )),
        }
    }

    /// Legacy V0 layout: the two regions concatenated, no header bytes,
    /// fields packed contiguously in the same order as the V1 struct.
    pub(crate) fn decode_v0(config_buf: &[u8; DSC_CONFIG_SIZE], temp_buf: &[u8; TEMP_TABLE_SIZE]) -> Self {
        let mut joined = Vec::with_capacity(DSC_CONFIG_SIZE + TEMP_TABLE_SIZE);
        joined.extend_from_slice(config_buf);
        joined.extend_from_slice(temp_buf);
        let mut cur = Cursor::new(&joined[..]);

        let ctrl_nodes_length = cur.read_u8().unwrap_or(0);
        let mut ctrl_load_nodes = [0.0f32; MAX_CTRL_NODES];
        for v in ctrl_load_nodes.iter_mut() {
            *v = cur.read_f32::<LittleEndian>().unwrap_or(0.0);
        }
        let mut ctrl_drift_coeffs = [0.0f32; MAX_CTRL_NODES];
        for v in ctrl_drift_coeffs.iter_mut() {
            *v = cur.read_f32::<LittleEndian>().unwrap_or(0.0);
        }
        let coarse_equilibrium = cur.read_i32::<LittleEndian>().unwrap_or(-1);
        let calibration_date = cur.read_i64::<LittleEndian>().unwrap_or(0);
        let calibration_valid = cur.read_u8().unwrap_or(0) != 0;
        let ctrl_nodes_length_factory = cur.read_u8().unwrap_or(0);
        let mut ctrl_load_nodes_factory = [0.0f32; MAX_CTRL_NODES];
        for v in ctrl_load_nodes_factory.iter_mut() {
            *v = cur.read_f32::<LittleEndian>().unwrap_or(0.0);
        }
        let mut ctrl_drift_coeffs_factory = [0.0f32; MAX_CTRL_NODES];
        for v in ctrl_drift_coeffs_factory.iter_mut() {
            *v = cur.read_f32::<LittleEndian>().unwrap_or(0.0);
        }
        let estimated_equilibrium_es = cur.read_u32::<LittleEndian>().unwrap_or(0);
        let mut mean_fine_over_temperature = vec![0u16; MEAN_TEMPERATURE_ARRAY_MAX];
        for v in mean_fine_over_temperature.iter_mut() {
            *v = cur.read_u16::<LittleEndian>().unwrap_or(0);
        }

        DisciplingParameters {
            ctrl_nodes_length,
            ctrl_load_nodes,
            ctrl_drift_coeffs,
            coarse_equilibrium,
            calibration_date,
            calibration_valid,
            ctrl_nodes_length_factory,
            ctrl_load_nodes_factory,
            ctrl_drift_coeffs_factory,
            estimated_equilibrium_es,
            mean_fine_over_temperature,
        }
    }
}

/// Where the two EEPROM regions physically live.
pub trait EepromBackend {
    fn read_config_region(&mut self) -> Result<[u8; DSC_CONFIG_SIZE], OscillatordError>;
    fn read_temp_region(&mut self) -> Result<[u8; TEMP_TABLE_SIZE], OscillatordError>;
    fn write_config_region(&mut self, buf: &[u8; DSC_CONFIG_SIZE]) -> Result<(), OscillatordError>;
    fn write_temp_region(&mut self, buf: &[u8; TEMP_TABLE_SIZE]) -> Result<(), OscillatordError>;
}

/// Plain-file backend: two raw files, one per region, matching the
/// original sysfs-attribute-as-a-file layout.
pub struct FileEepromBackend {
    config_path: PathBuf,
    temp_path: PathBuf,
}

impl FileEepromBackend {
    pub fn new(config_path: impl Into<PathBuf>, temp_path: impl Into<PathBuf>) -> Self {
        FileEepromBackend { config_path: config_path.into(), temp_path: temp_path.into() }
    }

    fn read_exact(path: &Path, size: usize) -> Result<Vec<u8>, OscillatordError> {
        let mut data = std::fs::read(path).map_err(|e| OscillatordError::DeviceAbsent {
            path: path.display().to_string(),
            source: e,
        })?;
        data.resize(size, 0);
        Ok(data)
    }
}

impl EepromBackend for FileEepromBackend {
    fn read_config_region(&mut self) -> Result<[u8; DSC_CONFIG_SIZE], OscillatordError> {
        let data = Self::read_exact(&self.config_path, DSC_CONFIG_SIZE)?;
        let mut buf = [0u8; DSC_CONFIG_SIZE];
        buf.copy_from_slice(&data[..DSC_CONFIG_SIZE]);
        Ok(buf)
    }

    fn read_temp_region(&mut self) -> Result<[u8; TEMP_TABLE_SIZE], OscillatordError> {
        let data = Self::read_exact(&self.temp_path, TEMP_TABLE_SIZE)?;
        let mut buf = [0u8; TEMP_TABLE_SIZE];
        buf.copy_from_slice(&data[..TEMP_TABLE_SIZE]);
        Ok(buf)
    }

    fn write_config_region(&mut self, buf: &[u8; DSC_CONFIG_SIZE]) -> Result<(), OscillatordError> {
        std::fs::write(&self.config_path, buf).map_err(|e| OscillatordError::DeviceIo {
            device: "eeprom-config",
            source: e,
        })
    }

    fn write_temp_region(&mut self, buf: &[u8; TEMP_TABLE_SIZE]) -> Result<(), OscillatordError> {
        std::fs::write(&self.temp_path, buf).map_err(|e| OscillatordError::DeviceIo {
            device: "eeprom-temp",
            source: e,
        })
    }
}

pub struct ParameterStore<B: EepromBackend> {
    backend: B,
}

impl<B: EepromBackend> ParameterStore<B> {
    pub fn new(backend: B) -> Self {
        ParameterStore { backend }
    }

    pub fn read(&mut self) -> Result<DisciplingParameters, OscillatordError> {
        let config_buf = self.backend.read_config_region()?;
        let temp_buf = self.backend.read_temp_region()?;
        DisciplingParameters::decode_regions(&config_buf, &temp_buf)
    }

    pub fn write(&mut self, params: &DisciplingParameters) -> Result<(), OscillatordError> {
        let config_buf = params.encode_config_region();
        let temp_buf = params.encode_temp_region();
        self.backend.write_config_region(&config_buf)?;
        self.backend.write_temp_region(&temp_buf)?;
        Ok(())
    }
}

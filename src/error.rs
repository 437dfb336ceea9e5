use std::fmt;

/// Error taxonomy for the disciplining core.
///
/// Per-tick variants are logged and swallowed by the control loop; the
/// `Config`/`DeviceAbsent`/`ParameterFormat` variants are fatal at startup.
#[derive(Debug)]
pub enum OscillatordError {
    Config(String),
    DeviceAbsent { path: String, source: std::io::Error },
    DeviceIo { device: &'static str, source: std::io::Error },
    OutOfRange { what: &'static str, value: i64, min: i64, max: i64 },
    ParameterFormat(String),
    ReferenceStale { missed_ticks: u32 },
    AlgorithmError(String),
    Interrupted,
    Unsupported(&'static str),
}

impl fmt::Display for OscillatordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OscillatordError::Config(msg) => write!(f, "configuration error: {msg}"),
            OscillatordError::DeviceAbsent { path, source } => {
                write!(f, "device not found at {path}: {source}")
            }
            OscillatordError::DeviceIo { device, source } => {
                write!(f, "I/O error on {device}: {source}")
            }
            OscillatordError::OutOfRange { what, value, min, max } => {
                write!(f, "{what}={value} out of range [{min}, {max}]")
            }
            OscillatordError::ParameterFormat(msg) => write!(f, "parameter format error: {msg}"),
            OscillatordError::ReferenceStale { missed_ticks } => {
                write!(f, "reference stale for {missed_ticks} ticks")
            }
            OscillatordError::AlgorithmError(msg) => write!(f, "disciplining algorithm error: {msg}"),
            OscillatordError::Interrupted => write!(f, "interrupted by shutdown request"),
            OscillatordError::Unsupported(what) => write!(f, "{what} not supported by this driver"),
        }
    }
}

impl std::error::Error for OscillatordError {}

impl From<std::io::Error> for OscillatordError {
    fn from(source: std::io::Error) -> Self {
        OscillatordError::DeviceIo { device: "unknown", source }
    }
}

impl From<nix::Error> for OscillatordError {
    fn from(e: nix::Error) -> Self {
        OscillatordError::DeviceIo {
            device: "ioctl",
            source: std::io::Error::from_raw_os_error(e as i32),
        }
    }
}

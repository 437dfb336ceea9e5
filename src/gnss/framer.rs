//! GNSS message framer seam. A production framer would decode a
//! UBX-class binary protocol with per-class/per-id callbacks; that is
//! out of scope here. `LineFramer` decodes a simple ASCII test fixture
//! protocol sufficient for unit and integration tests.

use super::{GnssEpoch, Utc};
use crate::error::OscillatordError;
use std::io::BufRead;

#[cfg_attr(test, mockall::automock)]
pub trait GnssFramer: Send {
    fn read_epoch(&mut self) -> Result<Option<GnssEpoch>, OscillatordError>;
}

/// Decodes lines of the form:
/// `$FIX,<fix>,<fixok>,<sats>,<leap>,<lsvalid>,<qerr_ns>,<utc_sec>,<utc_nsec>`
pub struct LineFramer<R: BufRead> {
    reader: R,
}

impl<R: BufRead> LineFramer<R> {
    pub fn new(reader: R) -> Self {
        LineFramer { reader }
    }
}

pub fn parse_line(line: &str) -> Option<GnssEpoch> {
    let line = line.trim();
    if !line.starts_with("$FIX,") {
        return None;
    }
    let fields: Vec<&str> = line[5..].split(',').collect();
    if fields.len() != 8 {
        return None;
    }
    let fix: u8 = fields[0].parse().ok()?;
    let fix_ok: bool = fields[1].parse().ok()?;
    let satellites_count: i32 = fields[2].parse().ok()?;
    let leap_seconds: i32 = fields[3].parse().ok()?;
    let ls_valid: bool = fields[4].parse().ok()?;
    let q_err_ns: i32 = fields[5].parse().ok()?;
    let utc_sec: i64 = fields[6].parse().ok()?;
    let utc_nsec: i32 = fields[7].parse().ok()?;

    Some(GnssEpoch {
        fix,
        fix_ok,
        satellites_count,
        antenna_power: 0,
        antenna_status: 1,
        leap_seconds,
        ls_change: 0,
        time_to_ls_event: 0,
        ls_valid,
        survey_in_position_error: 0.0,
        survey_completed: true,
        q_err_ns,
        last_fix_utc_time: Utc { sec: utc_sec, nsec: utc_nsec },
    })
}

impl<R: BufRead> GnssFramer for LineFramer<R> {
    fn read_epoch(&mut self) -> Result<Option<GnssEpoch>, OscillatordError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| OscillatordError::DeviceIo { device: "gnss-serial", source: e })?;
        if n == 0 {
            return Ok(None);
        }
        Ok(parse_line(&line))
    }
}

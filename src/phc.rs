//! PTP Hardware Clock (PHC) operations: POSIX clock calls plus the
//! ioctls used for external-timestamp events and PPS output.

use crate::error::OscillatordError;
use nix::ioctl_readwrite;
use std::fs::{File, OpenOptions};
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::Path;

pub const EXTTS_INDEX_GNSS_PPS: u32 = 0;
pub const EXTTS_INDEX_INTERNAL_PPS: u32 = 5;

const PTP_RISING_EDGE: u32 = 1 << 0;
const PTP_ENABLE_FEATURE: u32 = 1 << 0;

const PTP_MAGIC: u8 = b'=';
const PTP_EXTTS_REQUEST_CMD: u8 = 10;
const PTP_ENABLE_PPS_CMD: u8 = 4;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpExttsRequest {
    pub index: u32,
    pub flags: u32,
    pub rsv: [u32; 2],
}

ioctl_readwrite!(ptp_extts_request, PTP_MAGIC, PTP_EXTTS_REQUEST_CMD, PtpExttsRequest);
ioctl_readwrite!(ptp_enable_pps, PTP_MAGIC, PTP_ENABLE_PPS_CMD, i32);

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpExttsEvent {
    pub sec: u64,
    pub nsec: u32,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub fn sub(self, other: Timespec) -> i64 {
        (self.sec - other.sec) * 1_000_000_000 + (self.nsec - other.nsec)
    }
}

pub trait PhcClock: Send {
    fn get_time(&mut self) -> Result<Timespec, OscillatordError>;
    fn set_time(&mut self, ts: Timespec) -> Result<(), OscillatordError>;
    fn adjust_phase(&mut self, offset_ns: i64) -> Result<(), OscillatordError>;
    fn enable_extts(&mut self, index: u32) -> Result<(), OscillatordError>;
    fn disable_extts(&mut self, index: u32) -> Result<(), OscillatordError>;
    fn enable_pps(&mut self) -> Result<(), OscillatordError>;
    fn read_extts(&mut self) -> Result<PtpExttsEvent, OscillatordError>;
}

pub struct LinuxPhc {
    file: File,
}

impl LinuxPhc {
    pub fn open(path: &Path) -> Result<Self, OscillatordError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| OscillatordError::DeviceAbsent { path: path.display().to_string(), source: e })?;
        Ok(LinuxPhc { file })
    }

    fn set_extts(&mut self, index: u32, enable: bool) -> Result<(), OscillatordError> {
        let mut req = PtpExttsRequest {
            index,
            flags: if enable { PTP_RISING_EDGE | PTP_ENABLE_FEATURE } else { 0 },
            rsv: [0; 2],
        };
        unsafe { ptp_extts_request(self.file.as_raw_fd(), &mut req)? };
        Ok(())
    }
}

impl PhcClock for LinuxPhc {
    fn get_time(&mut self) -> Result<Timespec, OscillatordError> {
        let mut ts: libc::timespec = unsafe { mem::zeroed() };
        let ret = unsafe { libc::clock_gettime(fd_to_clockid(self.file.as_raw_fd()), &mut ts) };
        if ret < 0 {
            return Err(OscillatordError::DeviceIo { device: "phc", source: std::io::Error::last_os_error() });
        }
        Ok(Timespec { sec: ts.tv_sec as i64, nsec: ts.tv_nsec as i64 })
    }

    fn set_time(&mut self, ts: Timespec) -> Result<(), OscillatordError> {
        let libc_ts = libc::timespec { tv_sec: ts.sec as libc::time_t, tv_nsec: ts.nsec as libc::c_long };
        let ret = unsafe { libc::clock_settime(fd_to_clockid(self.file.as_raw_fd()), &libc_ts) };
        if ret < 0 {
            return Err(OscillatordError::DeviceIo { device: "phc", source: std::io::Error::last_os_error() });
        }
        Ok(())
    }

    fn adjust_phase(&mut self, offset_ns: i64) -> Result<(), OscillatordError> {
        let (sec_offset, nsec_offset) = split_phase_offset(offset_ns);
        let mut tx: libc::timex = unsafe { mem::zeroed() };
        tx.modes = libc::ADJ_SETOFFSET | libc::ADJ_NANO;
        tx.time.tv_sec = sec_offset as libc::time_t;
        tx.time.tv_usec = nsec_offset as libc::suseconds_t;
        let ret = unsafe { libc::clock_adjtime(fd_to_clockid(self.file.as_raw_fd()), &mut tx) };
        if ret < 0 {
            return Err(OscillatordError::DeviceIo { device: "phc", source: std::io::Error::last_os_error() });
        }
        Ok(())
    }

    fn enable_extts(&mut self, index: u32) -> Result<(), OscillatordError> {
        self.set_extts(index, true)
    }

    fn disable_extts(&mut self, index: u32) -> Result<(), OscillatordError> {
        self.set_extts(index, false)
    }

    fn enable_pps(&mut self) -> Result<(), OscillatordError> {
        let mut on: i32 = 1;
        unsafe { ptp_enable_pps(self.file.as_raw_fd(), &mut on)? };
        Ok(())
    }

    fn read_extts(&mut self) -> Result<PtpExttsEvent, OscillatordError> {
        use std::io::Read;
        // PTP clock event records are a fixed binary layout delivered by
        // read() on the clock device: {sec: u64, nsec: u32, index: u32}.
        let mut raw = [0u8; 16];
        self.file
            .read_exact(&mut raw)
            .map_err(|e| OscillatordError::DeviceIo { device: "phc-extts", source: e })?;
        use byteorder::{LittleEndian, ReadBytesExt};
        let mut cur = std::io::Cursor::new(&raw[..]);
        let sec = cur.read_u64::<LittleEndian>().unwrap();
        let nsec = cur.read_u32::<LittleEndian>().unwrap();
        let index = cur.read_u32::<LittleEndian>().unwrap();
        Ok(PtpExttsEvent { sec, nsec, index })
    }
}

/// Dynamic clockid encoding for PHC devices opened as regular files
/// (`CLOCKFD` scheme): `clockid = (~fd << 3) | CLOCKFD`.
fn fd_to_clockid(fd: i32) -> libc::clockid_t {
    const CLOCKFD: i32 = 3;
    ((!fd) << 3) | CLOCKFD
}

/// Splits a signed nanosecond phase offset into the `(sec, nsec)` pair
/// `clock_adjtime(ADJ_SETOFFSET | ADJ_NANO)` expects, where `nsec` must
/// be non-negative even for a negative overall offset.
pub fn split_phase_offset(offset_ns: i64) -> (i64, i64) {
    const NSEC_PER_SEC: i64 = 1_000_000_000;
    let mut sec = offset_ns / NSEC_PER_SEC;
    let mut nsec = offset_ns % NSEC_PER_SEC;
    if nsec < 0 {
        nsec += NSEC_PER_SEC;
        sec -= 1;
    }
    (sec, nsec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_positive_offset() {
        assert_eq!(split_phase_offset(1_500_000_000), (1, 500_000_000));
    }

    #[test]
    fn split_negative_offset_keeps_nsec_nonnegative() {
        let (sec, nsec) = split_phase_offset(-1_500_000_000);
        assert_eq!(sec, -2);
        assert_eq!(nsec, 500_000_000);
    }

    #[test]
    fn split_exact_second_negative() {
        let (sec, nsec) = split_phase_offset(-1_000_000_000);
        assert_eq!(sec, -1);
        assert_eq!(nsec, 0);
    }

    #[test]
    fn split_zero() {
        assert_eq!(split_phase_offset(0), (0, 0));
    }

    #[test]
    fn timespec_sub_computes_nanosecond_delta() {
        let a = Timespec { sec: 100, nsec: 500_000_000 };
        let b = Timespec { sec: 100, nsec: 200_000_000 };
        assert_eq!(a.sub(b), 300_000_000);
    }

    #[test]
    fn clockid_encoding_is_distinct_per_fd() {
        assert_ne!(fd_to_clockid(3), fd_to_clockid(4));
    }
}

//! GNSS reference adapter (C4): maintains fix/leap-second/antenna
//! status from a background serial reader and can set the PHC's wall
//! clock from the most recent usable epoch.

pub mod framer;

use crate::error::OscillatordError;
use crate::phc::{PhcClock, Timespec};
use framer::GnssFramer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub const FIX_NONE: u8 = 0;
pub const FIX_TIME_ONLY: u8 = 1;
pub const FIX_2D: u8 = 2;
pub const FIX_3D: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utc {
    pub sec: i64,
    pub nsec: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GnssEpoch {
    pub fix: u8,
    pub fix_ok: bool,
    pub satellites_count: i32,
    pub antenna_power: i8,
    pub antenna_status: i8,
    pub leap_seconds: i32,
    pub ls_change: i8,
    pub time_to_ls_event: i32,
    pub ls_valid: bool,
    pub survey_in_position_error: f32,
    pub survey_completed: bool,
    pub q_err_ns: i32,
    pub last_fix_utc_time: Utc,
}

impl Default for GnssEpoch {
    fn default() -> Self {
        GnssEpoch {
            fix: FIX_NONE,
            fix_ok: false,
            satellites_count: 0,
            antenna_power: -1,
            antenna_status: -1,
            leap_seconds: 0,
            ls_change: 0,
            time_to_ls_event: 0,
            ls_valid: false,
            survey_in_position_error: 0.0,
            survey_completed: false,
            q_err_ns: 0,
            last_fix_utc_time: Utc { sec: 0, nsec: 0 },
        }
    }
}

impl GnssEpoch {
    pub fn is_valid(&self) -> bool {
        self.fix_ok && (self.fix >= FIX_3D || self.fix == FIX_TIME_ONLY) && self.ls_valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GnssAction {
    None,
    Start,
    Stop,
    Soft,
    Hard,
    Cold,
    ResetSerial,
}

struct SharedEpoch {
    current: Mutex<GnssEpoch>,
    cond: Condvar,
}

pub struct GnssReference {
    shared: Arc<SharedEpoch>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    pending_action: Arc<Mutex<GnssAction>>,
}

impl GnssReference {
    pub fn start(mut framer: Box<dyn GnssFramer>, shutdown: Arc<AtomicBool>) -> Self {
        let shared = Arc::new(SharedEpoch { current: Mutex::new(GnssEpoch::default()), cond: Condvar::new() });
        let pending_action = Arc::new(Mutex::new(GnssAction::None));

        let thread_shared = shared.clone();
        let thread_shutdown = shutdown.clone();
        let thread_pending = pending_action.clone();

        let handle = std::thread::spawn(move || {
            while !thread_shutdown.load(Ordering::SeqCst) {
                {
                    let mut action = thread_pending.lock().unwrap();
                    if *action != GnssAction::None {
                        // A real implementation would reset/reopen the
                        // serial transport here per the requested action.
                        *action = GnssAction::None;
                    }
                }
                match framer.read_epoch() {
                    Ok(Some(epoch)) => {
                        let mut guard = thread_shared.current.lock().unwrap();
                        *guard = epoch;
                        thread_shared.cond.notify_all();
                    }
                    Ok(None) => {}
                    Err(_) => {
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        });

        GnssReference { shared, shutdown, handle: Some(handle), pending_action }
    }

    pub fn snapshot(&self) -> GnssEpoch {
        self.shared.current.lock().unwrap().clone()
    }

    pub fn request(&self, action: GnssAction) {
        *self.pending_action.lock().unwrap() = action;
    }

    /// Computes the next-second UTC instant from the most recent epoch
    /// plus leap seconds, and sets the PHC's wall clock to it.
    pub fn set_ptp_clock_time(&self, phc: &mut dyn PhcClock) -> Result<(), OscillatordError> {
        let epoch = self.snapshot();
        if !epoch.is_valid() {
            return Err(OscillatordError::ReferenceStale { missed_ticks: 0 });
        }
        let next_second = Timespec { sec: epoch.last_fix_utc_time.sec + 1, nsec: 0 };
        phc.set_time(next_second)
    }
}

impl Drop for GnssReference {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

//! Phasemeter (C3): pairs external-timestamp events from two PHC
//! channels into a signed phase-error sample between the GNSS PPS and
//! the card's internal PPS.

use crate::error::OscillatordError;
use crate::phc::{PhcClock, PtpExttsEvent, EXTTS_INDEX_GNSS_PPS, EXTTS_INDEX_INTERNAL_PPS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

const DISCARD_THRESHOLD_NS: i64 = 500_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Init,
    NoGnss,
    NoInternal,
    Both,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct PhaseSample {
    pub status: PhaseStatus,
    pub phase_error_ns: i32,
    pub timestamp_sec: u64,
}

impl Default for PhaseSample {
    fn default() -> Self {
        PhaseSample { status: PhaseStatus::Init, phase_error_ns: 0, timestamp_sec: 0 }
    }
}

/// One step of the phasemeter's internal state machine, expressed as
/// a pure function of the previous pending event and the next raw
/// extts event, so it can be unit tested without a real PHC.
pub fn pair_events(prev: PtpExttsEvent, next: PtpExttsEvent) -> (Option<PhaseSample>, PtpExttsEvent) {
    let prev_ns = prev.sec as i64 * 1_000_000_000 + prev.nsec as i64;
    let next_ns = next.sec as i64 * 1_000_000_000 + next.nsec as i64;

    if prev.index == next.index {
        let status = if prev.index == EXTTS_INDEX_INTERNAL_PPS { PhaseStatus::NoGnss } else { PhaseStatus::NoInternal };
        let sample = PhaseSample { status, phase_error_ns: 0, timestamp_sec: next.sec };
        return (Some(sample), next);
    }

    let mut delta = next_ns - prev_ns;
    if prev.index == EXTTS_INDEX_INTERNAL_PPS {
        delta = -delta;
    }

    if delta.abs() > DISCARD_THRESHOLD_NS {
        return (None, next);
    }

    let sample = PhaseSample { status: PhaseStatus::Both, phase_error_ns: delta as i32, timestamp_sec: next.sec };
    (Some(sample), next)
}

struct SharedState {
    latest: Mutex<Option<PhaseSample>>,
    cond: Condvar,
}

/// Owns the background thread that drains PHC external-timestamp
/// events and publishes paired phase samples to consumers.
pub struct Phasemeter {
    shared: Arc<SharedState>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Phasemeter {
    pub fn start(mut phc: Box<dyn PhcClock>, shutdown: Arc<AtomicBool>) -> Result<Self, OscillatordError> {
        phc.enable_extts(EXTTS_INDEX_GNSS_PPS)?;
        phc.enable_extts(EXTTS_INDEX_INTERNAL_PPS)?;

        let shared = Arc::new(SharedState { latest: Mutex::new(None), cond: Condvar::new() });
        let thread_shared = shared.clone();
        let thread_shutdown = shutdown.clone();

        let handle = std::thread::spawn(move || {
            let mut prev: Option<PtpExttsEvent> = None;
            let mut consecutive_errors = 0u32;

            while !thread_shutdown.load(Ordering::SeqCst) {
                match phc.read_extts() {
                    Ok(event) => {
                        consecutive_errors = 0;
                        match prev {
                            None => prev = Some(event),
                            Some(p) => {
                                let (sample, new_prev) = pair_events(p, event);
                                prev = Some(new_prev);
                                if let Some(sample) = sample {
                                    let mut guard = thread_shared.latest.lock().unwrap();
                                    *guard = Some(sample);
                                    thread_shared.cond.notify_all();
                                }
                            }
                        }
                    }
                    Err(_) => {
                        consecutive_errors += 1;
                        if consecutive_errors > 10 {
                            let mut guard = thread_shared.latest.lock().unwrap();
                            *guard = Some(PhaseSample { status: PhaseStatus::Error, ..PhaseSample::default() });
                            thread_shared.cond.notify_all();
                            break;
                        }
                    }
                }
            }
            let _ = phc.disable_extts(EXTTS_INDEX_GNSS_PPS);
            let _ = phc.disable_extts(EXTTS_INDEX_INTERNAL_PPS);
        });

        Ok(Phasemeter { shared, shutdown, handle: Some(handle) })
    }

    /// Blocks until the next fresh sample is available, or until
    /// `timeout` elapses (returns `None` on timeout so the control loop
    /// can re-check the shutdown flag).
    pub fn next(&self, timeout: std::time::Duration) -> Option<PhaseSample> {
        let guard = self.shared.latest.lock().unwrap();
        let (mut guard, result) = self.shared.cond.wait_timeout(guard, timeout).unwrap();
        if result.timed_out() {
            return None;
        }
        guard.take()
    }
}

impl Drop for Phasemeter {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(index: u32, sec: u64, nsec: u32) -> PtpExttsEvent {
        PtpExttsEvent { sec, nsec, index }
    }

    #[test]
    fn same_channel_twice_emits_no_gnss() {
        let a = ev(EXTTS_INDEX_INTERNAL_PPS, 1, 0);
        let b = ev(EXTTS_INDEX_INTERNAL_PPS, 2, 0);
        let (sample, _) = pair_events(a, b);
        assert_eq!(sample.unwrap().status, PhaseStatus::NoGnss);
    }

    #[test]
    fn same_gnss_channel_twice_emits_no_internal() {
        let a = ev(EXTTS_INDEX_GNSS_PPS, 1, 0);
        let b = ev(EXTTS_INDEX_GNSS_PPS, 2, 0);
        let (sample, _) = pair_events(a, b);
        assert_eq!(sample.unwrap().status, PhaseStatus::NoInternal);
    }

    #[test]
    fn cross_channel_small_delta_emits_both() {
        // GNSS event first, then internal 300ms later.
        let gnss = ev(EXTTS_INDEX_GNSS_PPS, 1, 0);
        let internal = ev(EXTTS_INDEX_INTERNAL_PPS, 1, 300_000_000);
        let (sample, _) = pair_events(gnss, internal);
        let sample = sample.unwrap();
        assert_eq!(sample.status, PhaseStatus::Both);
        assert_eq!(sample.phase_error_ns, 300_000_000);
    }

    #[test]
    fn cross_channel_reversed_order_negates() {
        let internal = ev(EXTTS_INDEX_INTERNAL_PPS, 1, 0);
        let gnss = ev(EXTTS_INDEX_GNSS_PPS, 1, 300_000_000);
        let (sample, _) = pair_events(internal, gnss);
        let sample = sample.unwrap();
        assert_eq!(sample.phase_error_ns, -300_000_000);
    }

    #[test]
    fn delta_over_threshold_is_discarded() {
        let internal = ev(EXTTS_INDEX_INTERNAL_PPS, 1, 0);
        let gnss = ev(EXTTS_INDEX_GNSS_PPS, 1, 700_000_000);
        let (sample, next) = pair_events(internal, gnss);
        assert!(sample.is_none());
        assert_eq!(next.nsec, 700_000_000);
    }

    #[test]
    fn scenario_s3_sliding_window() {
        // S3: internal@1.0s, gnss@1.7s (discarded), internal@2.0s paired with gnss -> +300ms
        let mut prev = ev(EXTTS_INDEX_INTERNAL_PPS, 1, 0);
        let gnss = ev(EXTTS_INDEX_GNSS_PPS, 1, 700_000_000);
        let (first, next) = pair_events(prev, gnss);
        assert!(first.is_none());
        prev = next;

        let internal2 = ev(EXTTS_INDEX_INTERNAL_PPS, 2, 0);
        let (second, _) = pair_events(prev, internal2);
        let second = second.unwrap();
        assert_eq!(second.status, PhaseStatus::Both);
        assert_eq!(second.phase_error_ns, 300_000_000);
    }

    #[test]
    fn phase_error_bound_property() {
        for delta_ms in [-499i64, 0, 499] {
            let internal = ev(EXTTS_INDEX_INTERNAL_PPS, 10, 0);
            let nsec = (delta_ms * 1_000_000).unsigned_abs() as u32;
            let gnss = if delta_ms >= 0 {
                ev(EXTTS_INDEX_GNSS_PPS, 10, nsec)
            } else {
                ev(EXTTS_INDEX_GNSS_PPS, 9, 1_000_000_000 - nsec)
            };
            let (sample, _) = pair_events(internal, gnss);
            if let Some(sample) = sample {
                if sample.status == PhaseStatus::Both {
                    assert!(sample.phase_error_ns.unsigned_abs() < 500_000_000);
                }
            }
        }
    }

    #[test]
    fn random_jitter_within_threshold_always_pairs() {
        use rand::Rng;
        let mut rng = rand::rng();
        for _ in 0..200 {
            let jitter_ns: i64 = rng.random_range(-499_000_000..=499_000_000);
            let internal = ev(EXTTS_INDEX_INTERNAL_PPS, 100, 0);
            let gnss = if jitter_ns >= 0 {
                ev(EXTTS_INDEX_GNSS_PPS, 100, jitter_ns as u32)
            } else {
                ev(EXTTS_INDEX_GNSS_PPS, 99, (1_000_000_000 + jitter_ns) as u32)
            };
            let (sample, _) = pair_events(internal, gnss);
            let sample = sample.expect("within-threshold delta must always pair");
            assert_eq!(sample.status, PhaseStatus::Both);
            assert_eq!(sample.phase_error_ns as i64, jitter_ns);
        }
    }
}

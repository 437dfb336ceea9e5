use crate::gnss::GnssEpoch;
use crate::oscillator::OscillatorTelemetry;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Daemon-wide disciplining state, reported upward to monitoring.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum TrackingState {
    Init,
    Warmup,
    Tracking,
    Holdover,
    Calibration,
    LockLowRes,
    Lock,
    FrequencyAdjustment,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ClockClass {
    Uncalibrated,
    Calibrating,
    Holdover,
    Lock,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DisciplingStatus {
    pub status: TrackingState,
    pub clock_class: ClockClass,
    pub convergence_progress: f32,
    pub current_phase_convergence_count: u32,
    pub valid_phase_convergence_threshold: u32,
    pub ready_for_holdover: bool,
}

impl Default for DisciplingStatus {
    fn default() -> Self {
        DisciplingStatus {
            status: TrackingState::Init,
            clock_class: ClockClass::Uncalibrated,
            convergence_progress: 0.0,
            current_phase_convergence_count: 0,
            valid_phase_convergence_threshold: 5,
            ready_for_holdover: false,
        }
    }
}

/// Published once per control tick by the control loop. The monitoring
/// socket server that would actually serve this data is out of scope;
/// this trait is the seam an integrator implements against.
pub trait StatusSink: Send + Sync {
    fn publish(
        &self,
        status: &DisciplingStatus,
        telemetry: &OscillatorTelemetry,
        phase_error_ns: i64,
        reference: &GnssEpoch,
    );
}

/// Shared in-memory status board, the one built-in `StatusSink`.
pub struct SharedStatusSink {
    inner: Arc<RwLock<DisciplingSnapshot>>,
}

#[derive(Clone, Debug, Default)]
pub struct DisciplingSnapshot {
    pub status: DisciplingStatus,
    pub telemetry: OscillatorTelemetry,
    pub phase_error_ns: i64,
    pub reference: GnssEpoch,
}

impl SharedStatusSink {
    pub fn new() -> Self {
        SharedStatusSink { inner: Arc::new(RwLock::new(DisciplingSnapshot::default())) }
    }

    pub fn handle(&self) -> Arc<RwLock<DisciplingSnapshot>> {
        self.inner.clone()
    }
}

impl Default for SharedStatusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink for SharedStatusSink {
    fn publish(
        &self,
        status: &DisciplingStatus,
        telemetry: &OscillatorTelemetry,
        phase_error_ns: i64,
        reference: &GnssEpoch,
    ) {
        if let Ok(mut guard) = self.inner.write() {
            guard.status = status.clone();
            guard.telemetry = telemetry.clone();
            guard.phase_error_ns = phase_error_ns;
            guard.reference = reference.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_init() {
        let s = DisciplingStatus::default();
        assert_eq!(s.status, TrackingState::Init);
        assert_eq!(s.clock_class, ClockClass::Uncalibrated);
    }

    #[test]
    fn serde_roundtrip() {
        let mut s = DisciplingStatus::default();
        s.status = TrackingState::Lock;
        s.convergence_progress = 1.0;
        let json = serde_json::to_string(&s).unwrap();
        let restored: DisciplingStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.status, TrackingState::Lock);
        assert!((restored.convergence_progress - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn shared_sink_publishes() {
        let sink = SharedStatusSink::new();
        let handle = sink.handle();
        let status = DisciplingStatus::default();
        let telemetry = OscillatorTelemetry::default();
        let reference = GnssEpoch::default();
        sink.publish(&status, &telemetry, 42, &reference);
        assert_eq!(handle.read().unwrap().phase_error_ns, 42);
    }
}

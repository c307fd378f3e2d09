//! Device-lost recovery protocol.
//!
//! Entered on every intercepted `Reset`. A device that is already usable is
//! being reset on purpose (e.g. a display mode switch) and goes straight to
//! the original call. Otherwise the session polls the cooperative level:
//!
//! - `LOST`: wait for a bounded interval, waking early on queued input
//! - `NOT_RESET`: call the original `Reset`, keep its result, poll again
//! - `DRIVER_ERROR`: notify the user once and give up
//! - `OK`: done
//!
//! There is no timeout. Device loss is transient by contract (e.g. the user
//! alt-tabbed out of a fullscreen game), so the loop spins at low frequency
//! until the driver either hands the device back or reports a hard fault.

use tracing::{debug, error, info, trace, warn};

use super::types::{CooperativeLevel, D3D_OK, HResult};
use crate::config::MonitorConfig;
use crate::platform::Host;

/// A device that can be queried and reset with the caller's parameters
pub trait ResettableDevice {
    /// `IDirect3DDevice9::TestCooperativeLevel`
    fn test_cooperative_level(&mut self) -> HResult;

    /// The original `IDirect3DDevice9::Reset`, with the caller's parameters
    fn reset(&mut self) -> HResult;
}

/// How an intercepted reset finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPath {
    /// Device was usable; the reset was passed straight through
    ModeChange,
    /// Device came back to `OK`
    Recovered,
    /// Driver reported a hard fault
    Unrecoverable,
}

/// Outcome of one intercepted reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Value returned to the caller of `Reset`
    pub result: HResult,
    pub path: ResetPath,
    pub reset_attempts: u32,
    pub waits: u32,
}

/// State of one in-progress reset call
pub struct RecoverySession<'a, D, H: ?Sized> {
    device: &'a mut D,
    host: &'a H,
    config: &'a MonitorConfig,
    level: CooperativeLevel,
    result: HResult,
    reset_attempts: u32,
    waits: u32,
}

impl<'a, D, H> RecoverySession<'a, D, H>
where
    D: ResettableDevice,
    H: Host + ?Sized,
{
    /// Start a session by reading the device's current cooperative level.
    pub fn new(device: &'a mut D, host: &'a H, config: &'a MonitorConfig) -> Self {
        let level = CooperativeLevel::from(device.test_cooperative_level());
        Self {
            device,
            host,
            config,
            level,
            result: D3D_OK,
            reset_attempts: 0,
            waits: 0,
        }
    }

    pub fn level(&self) -> CooperativeLevel {
        self.level
    }

    /// Drive the device to a terminal state.
    pub fn run(mut self) -> RecoveryReport {
        if self.level == CooperativeLevel::Ok {
            self.result = self.device.reset();
            self.reset_attempts = 1;
            debug!("Reset on usable device passed through: {}", self.result);
            return self.finish(ResetPath::ModeChange);
        }

        info!("Device reset requested while {}, recovering", self.level);

        loop {
            match self.level {
                CooperativeLevel::Lost => {
                    self.host.wait_for_events(self.config.poll_interval());
                    self.waits += 1;
                }
                CooperativeLevel::NotReset => {
                    self.result = self.device.reset();
                    self.reset_attempts += 1;
                    if self.result.is_ok() {
                        debug!("Reset attempt {} succeeded", self.reset_attempts);
                    } else {
                        warn!(
                            "Reset attempt {} failed: {}",
                            self.reset_attempts, self.result
                        );
                    }
                }
                CooperativeLevel::DriverError => {
                    error!(
                        "Unrecoverable device state after {} reset attempt(s), last result {}",
                        self.reset_attempts, self.result
                    );
                    self.host
                        .notify_unrecoverable(&self.config.notify_title, &self.config.notify_text);
                    return self.finish(ResetPath::Unrecoverable);
                }
                CooperativeLevel::Ok => {
                    info!(
                        "Device recovered after {} reset attempt(s) and {} wait(s)",
                        self.reset_attempts, self.waits
                    );
                    return self.finish(ResetPath::Recovered);
                }
            }

            self.level = CooperativeLevel::from(self.device.test_cooperative_level());
            trace!("Cooperative level: {}", self.level);
        }
    }

    fn finish(self, path: ResetPath) -> RecoveryReport {
        RecoveryReport {
            result: self.result,
            path,
            reset_attempts: self.reset_attempts,
            waits: self.waits,
        }
    }
}

/// Run the recovery protocol for one reset call.
pub fn reset_device<D, H>(device: &mut D, host: &H, config: &MonitorConfig) -> RecoveryReport
where
    D: ResettableDevice,
    H: Host + ?Sized,
{
    RecoverySession::new(device, host, config).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::d3d9::types::{
        D3DERR_DEVICELOST, D3DERR_DEVICENOTRESET, D3DERR_DRIVERINTERNALERROR, D3DERR_INVALIDCALL,
    };
    use crate::platform::{EventPump, Notifier};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    const OK: HResult = D3D_OK;
    const LOST: HResult = D3DERR_DEVICELOST;
    const NOT_RESET: HResult = D3DERR_DEVICENOTRESET;
    const DRIVER_ERROR: HResult = D3DERR_DRIVERINTERNALERROR;

    /// Device that replays scripted cooperative levels and reset results
    struct ScriptedDevice {
        levels: VecDeque<HResult>,
        resets: VecDeque<HResult>,
        queries: u32,
        reset_calls: u32,
    }

    impl ScriptedDevice {
        fn new(levels: &[HResult], resets: &[HResult]) -> Self {
            Self {
                levels: levels.iter().copied().collect(),
                resets: resets.iter().copied().collect(),
                queries: 0,
                reset_calls: 0,
            }
        }
    }

    impl ResettableDevice for ScriptedDevice {
        fn test_cooperative_level(&mut self) -> HResult {
            self.queries += 1;
            self.levels.pop_front().expect("queried past the end of the script")
        }

        fn reset(&mut self) -> HResult {
            self.reset_calls += 1;
            self.resets.pop_front().expect("reset called more often than scripted")
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        waits: Mutex<Vec<Duration>>,
        notifications: Mutex<Vec<(String, String)>>,
    }

    impl EventPump for RecordingHost {
        fn wait_for_events(&self, timeout: Duration) {
            self.waits.lock().unwrap().push(timeout);
        }
    }

    impl Notifier for RecordingHost {
        fn notify_unrecoverable(&self, title: &str, text: &str) {
            self.notifications
                .lock()
                .unwrap()
                .push((title.to_string(), text.to_string()));
        }
    }

    impl RecordingHost {
        fn wait_count(&self) -> usize {
            self.waits.lock().unwrap().len()
        }

        fn notification_count(&self) -> usize {
            self.notifications.lock().unwrap().len()
        }
    }

    fn run(levels: &[HResult], resets: &[HResult]) -> (RecoveryReport, ScriptedDevice, RecordingHost) {
        let mut device = ScriptedDevice::new(levels, resets);
        let host = RecordingHost::default();
        let report = reset_device(&mut device, &host, &MonitorConfig::default());
        (report, device, host)
    }

    #[test]
    fn test_usable_device_passes_reset_through() {
        let (report, device, host) = run(&[OK], &[D3DERR_INVALIDCALL]);

        assert_eq!(report.path, ResetPath::ModeChange);
        assert_eq!(report.result, D3DERR_INVALIDCALL);
        assert_eq!(device.reset_calls, 1);
        assert_eq!(device.queries, 1);
        assert_eq!(host.wait_count(), 0);
        assert_eq!(host.notification_count(), 0);
    }

    #[test]
    fn test_lost_twice_then_reset_succeeds() {
        let (report, device, host) = run(&[LOST, LOST, NOT_RESET, OK], &[D3D_OK]);

        assert_eq!(report.path, ResetPath::Recovered);
        assert_eq!(report.result, D3D_OK);
        assert_eq!(report.waits, 2);
        assert_eq!(report.reset_attempts, 1);
        assert_eq!(device.reset_calls, 1);
        assert_eq!(host.wait_count(), 2);
        assert_eq!(host.notification_count(), 0);
    }

    #[test]
    fn test_failed_reset_then_driver_error() {
        let (report, device, host) = run(&[NOT_RESET, LOST, DRIVER_ERROR], &[D3DERR_INVALIDCALL]);

        assert_eq!(report.path, ResetPath::Unrecoverable);
        assert_eq!(report.result, D3DERR_INVALIDCALL);
        assert_eq!(device.reset_calls, 1);
        assert_eq!(host.wait_count(), 1);

        let notifications = host.notifications.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].0, "Error");
        assert_eq!(
            notifications[0].1,
            "Unable to recover from Device Lost error."
        );
    }

    #[test]
    fn test_failed_reset_is_retried() {
        let (report, device, host) = run(
            &[NOT_RESET, LOST, NOT_RESET, OK],
            &[D3DERR_DEVICELOST, D3D_OK],
        );

        assert_eq!(report.path, ResetPath::Recovered);
        assert_eq!(report.result, D3D_OK);
        assert_eq!(device.reset_calls, 2);
        assert_eq!(host.wait_count(), 1);
    }

    #[test]
    fn test_driver_error_without_reset_returns_success_code() {
        let (report, device, host) = run(&[LOST, DRIVER_ERROR], &[]);

        assert_eq!(report.path, ResetPath::Unrecoverable);
        assert_eq!(report.result, D3D_OK);
        assert_eq!(device.reset_calls, 0);
        assert_eq!(host.notification_count(), 1);
    }

    #[test]
    fn test_unknown_code_is_unrecoverable() {
        let (report, device, host) = run(&[HResult::from_bits(0x8000_4005)], &[]);

        assert_eq!(report.path, ResetPath::Unrecoverable);
        assert_eq!(device.reset_calls, 0);
        assert_eq!(device.queries, 1);
        assert_eq!(host.notification_count(), 1);
    }

    #[test]
    fn test_wait_uses_configured_interval() {
        let mut device = ScriptedDevice::new(&[LOST, OK], &[]);
        let host = RecordingHost::default();
        let config = MonitorConfig::builder()
            .poll_interval(Duration::from_millis(33))
            .build();

        let report = reset_device(&mut device, &host, &config);

        assert_eq!(report.path, ResetPath::Recovered);
        assert_eq!(*host.waits.lock().unwrap(), vec![Duration::from_millis(33)]);
    }

    #[test]
    fn test_session_reports_initial_level() {
        let mut device = ScriptedDevice::new(&[NOT_RESET], &[]);
        let host = RecordingHost::default();
        let config = MonitorConfig::default();

        let session = RecoverySession::new(&mut device, &host, &config);
        assert_eq!(session.level(), CooperativeLevel::NotReset);
    }

    /// Every LOST/NOT_RESET prefix up to length 4, ending in OK or DRIVER_ERROR.
    #[test]
    fn test_all_short_sequences_terminate_correctly() {
        for len in 0..=4u32 {
            for mask in 0..(1u32 << len) {
                let prefix: Vec<HResult> = (0..len)
                    .map(|i| if mask & (1 << i) != 0 { NOT_RESET } else { LOST })
                    .collect();

                for terminal in [OK, DRIVER_ERROR] {
                    let mut levels = prefix.clone();
                    levels.push(terminal);

                    // Alternate failing and succeeding reset attempts.
                    let resets: Vec<HResult> = (0..5)
                        .map(|i| if i % 2 == 0 { D3DERR_INVALIDCALL } else { D3D_OK })
                        .collect();
                    let (report, device, host) = run(&levels, &resets);

                    if prefix.is_empty() && terminal == OK {
                        assert_eq!(report.path, ResetPath::ModeChange);
                        assert_eq!(device.reset_calls, 1);
                        continue;
                    }

                    let expected_resets = prefix.iter().filter(|&&l| l == NOT_RESET).count();
                    let expected_waits = prefix.iter().filter(|&&l| l == LOST).count();
                    let expected_result = match expected_resets {
                        0 => D3D_OK,
                        n => resets[n - 1],
                    };

                    assert_eq!(device.reset_calls as usize, expected_resets, "{levels:?}");
                    assert_eq!(host.wait_count(), expected_waits, "{levels:?}");
                    assert_eq!(report.result, expected_result, "{levels:?}");
                    assert_eq!(device.queries as usize, levels.len(), "{levels:?}");
                    if terminal == DRIVER_ERROR {
                        assert_eq!(report.path, ResetPath::Unrecoverable);
                        assert_eq!(host.notification_count(), 1);
                    } else {
                        assert_eq!(report.path, ResetPath::Recovered);
                        assert_eq!(host.notification_count(), 0);
                    }
                }
            }
        }
    }
}

//! Discovery Scanner: the top-level orchestrator that walks every
//! Parameter Group, opens one Bus Client per group, identifies every
//! slave in it, applies the inter-test delay policy, and streams
//! progress.
//!
//! Grounded in the pool's per-key open/use/close lifecycle
//! (`transport::manager`), generalized to a per-group loop with its own
//! cleanup guarantee; the callback trio is a plain notification API,
//! and the `mpsc`-backed `run_stream` is offered alongside it — a
//! driver can equally model progress as a pull channel it backpressures
//! and cancels by dropping.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::warn;

use crate::discovery::identifier::{DeviceIdentifier, IdentificationResult};
use crate::discovery::param_generator::{ParameterCombination, ParameterGenerator, ParameterGeneratorConfig, ParameterGroup};
use crate::error::ScanError;
use crate::transport::bus_key::BusKey;
use crate::transport::manager::{BusOpener, DefaultBusOpener};
use crate::transport::mutex_wrapper::MutexBusClient;
use crate::transport::slave_handle::SlaveHandle;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub port: String,
    pub timeout_ms: u64,
    pub delay_ms: u64,
    /// 0 means unlimited.
    pub max_devices: usize,
    pub verbose: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self { port: String::new(), timeout_ms: 1000, delay_ms: 100, max_devices: 1, verbose: false }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub combination: ParameterCombination,
    pub identification: IdentificationResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanProgressEvent {
    Testing(ParameterCombination),
    Found(DiscoveredDevice),
    NotFound(ParameterCombination),
    Progress { current: usize, total: usize, devices_found: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestAttemptStatus {
    Testing,
    Found,
    NotFound,
}

/// `on_progress` may abort the scan by returning an error; the other
/// two are infallible notifications.
#[derive(Default)]
pub struct ScanCallbacks {
    pub on_progress: Option<Box<dyn FnMut(usize, usize, usize) -> Result<(), ScanError> + Send>>,
    pub on_device_found: Option<Box<dyn FnMut(&DiscoveredDevice) + Send>>,
    pub on_test_attempt: Option<Box<dyn FnMut(&ParameterCombination, TestAttemptStatus) + Send>>,
}

/// If `should_continue` is false, no delay. Otherwise a found device
/// gets the full `delay_ms` to let the bus settle; a not-found probe
/// already burned `timeout_ms` waiting, so only the remainder is owed.
fn inter_test_delay(delay_ms: u64, timeout_ms: u64, device_found: bool, should_continue: bool) -> Duration {
    if !should_continue {
        Duration::ZERO
    } else if device_found {
        Duration::from_millis(delay_ms)
    } else {
        Duration::from_millis(delay_ms.saturating_sub(timeout_ms))
    }
}

async fn apply_inter_test_delay(delay_ms: u64, timeout_ms: u64, device_found: bool, should_continue: bool) {
    let wait = inter_test_delay(delay_ms, timeout_ms, device_found, should_continue);
    if !wait.is_zero() {
        sleep(wait).await;
    }
}

#[derive(Clone)]
pub struct DiscoveryScanner {
    opener: Arc<dyn BusOpener>,
}

impl DiscoveryScanner {
    pub fn new() -> Self {
        Self::with_opener(Arc::new(DefaultBusOpener))
    }

    pub fn with_opener(opener: Arc<dyn BusOpener>) -> Self {
        Self { opener }
    }

    fn emit_progress(callbacks: &mut ScanCallbacks, current: usize, total: usize, devices_found: usize) -> Result<(), ScanError> {
        match callbacks.on_progress.as_mut() {
            Some(cb) => cb(current, total, devices_found),
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_group(
        client: &Arc<MutexBusClient>,
        group: &ParameterGroup,
        opts: &ScanOptions,
        callbacks: &mut ScanCallbacks,
        current: &mut usize,
        total: usize,
        discovered: &mut Vec<DiscoveredDevice>,
    ) -> Result<(), ScanError> {
        for &address in &group.addresses {
            if opts.max_devices > 0 && discovered.len() >= opts.max_devices {
                break;
            }
            let combination = ParameterCombination { serial_params: group.serial_params, address };
            if let Some(cb) = callbacks.on_test_attempt.as_mut() {
                cb(&combination, TestAttemptStatus::Testing);
            }

            let handle = SlaveHandle::new(client.clone(), address, Duration::from_millis(opts.timeout_ms));
            let identification = DeviceIdentifier::identify(&handle).await;

            if identification.is_present() {
                let device = DiscoveredDevice { combination, identification };
                discovered.push(device.clone());
                if let Some(cb) = callbacks.on_test_attempt.as_mut() {
                    cb(&combination, TestAttemptStatus::Found);
                }
                if let Some(cb) = callbacks.on_device_found.as_mut() {
                    cb(&device);
                }
                let reached_limit = opts.max_devices > 0 && discovered.len() >= opts.max_devices;
                apply_inter_test_delay(opts.delay_ms, opts.timeout_ms, true, !reached_limit).await;
            } else {
                if let Some(cb) = callbacks.on_test_attempt.as_mut() {
                    cb(&combination, TestAttemptStatus::NotFound);
                }
                apply_inter_test_delay(opts.delay_ms, opts.timeout_ms, false, true).await;
            }

            *current += 1;
            Self::emit_progress(callbacks, *current, total, discovered.len())?;
        }
        Ok(())
    }

    /// Runs a full scan, invoking `callbacks` as it goes. The Bus
    /// Client for whichever group is currently open is always closed on
    /// the way out of the group's iteration, including when the inner
    /// loop returns early for `max_devices` or an aborting callback.
    pub async fn run(
        &self,
        generator_cfg: &ParameterGeneratorConfig,
        opts: &ScanOptions,
        mut callbacks: ScanCallbacks,
    ) -> Result<Vec<DiscoveredDevice>, ScanError> {
        let total = ParameterGenerator::count_combinations(generator_cfg);
        let mut current = 0usize;
        let mut discovered: Vec<DiscoveredDevice> = Vec::new();

        for group in ParameterGenerator::enumerate_groups(generator_cfg) {
            if opts.max_devices > 0 && discovered.len() >= opts.max_devices {
                break;
            }

            let key = BusKey::rtu(opts.port.clone(), group.serial_params);
            let raw_client = match self.opener.open(&key, 1).await {
                Ok(client) => client,
                Err(err) => {
                    if opts.verbose {
                        warn!(port = %opts.port, ?group.serial_params, error = %err, "bus open failed, skipping group");
                    }
                    current += group.addresses.len();
                    Self::emit_progress(&mut callbacks, current, total, discovered.len())?;
                    continue;
                }
            };

            let client = Arc::new(MutexBusClient::new(raw_client));
            let result = Self::drive_group(&client, &group, opts, &mut callbacks, &mut current, total, &mut discovered).await;
            if let Err(err) = client.close().await {
                warn!(error = %err, "error closing bus client for group");
            }
            result?;
        }

        Ok(discovered)
    }

    /// Same scan, reshaped as an event stream: every callback invocation
    /// becomes a channel send instead. Dropping the receiver is how a
    /// caller cancels — the next `try_send` simply fails silently and
    /// the scan runs to completion unobserved.
    pub fn run_stream(
        &self,
        generator_cfg: ParameterGeneratorConfig,
        opts: ScanOptions,
    ) -> (mpsc::Receiver<ScanProgressEvent>, tokio::task::JoinHandle<Result<Vec<DiscoveredDevice>, ScanError>>) {
        let (tx, rx) = mpsc::channel(64);
        let scanner = self.clone();

        let tx_progress = tx.clone();
        let tx_attempt = tx.clone();
        let callbacks = ScanCallbacks {
            on_progress: Some(Box::new(move |current, total, devices_found| {
                let _ = tx_progress.try_send(ScanProgressEvent::Progress { current, total, devices_found });
                Ok(())
            })),
            on_device_found: Some(Box::new(move |device: &DiscoveredDevice| {
                let _ = tx.try_send(ScanProgressEvent::Found(device.clone()));
            })),
            on_test_attempt: Some(Box::new(move |combination: &ParameterCombination, status| {
                let event = match status {
                    TestAttemptStatus::Testing => ScanProgressEvent::Testing(*combination),
                    TestAttemptStatus::NotFound => ScanProgressEvent::NotFound(*combination),
                    // `on_device_found` already emitted `Found`; avoid a duplicate event.
                    TestAttemptStatus::Found => return,
                };
                let _ = tx_attempt.try_send(event);
            })),
        };

        let handle = tokio::spawn(async move { scanner.run(&generator_cfg, &opts, callbacks).await });
        (rx, handle)
    }
}

impl Default for DiscoveryScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::bus_key::{Parity, SerialParams};
    use crate::transport::connection::BusClient;
    use crate::transport::test_support::{Scripted, StubBusClient};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::discovery::param_generator::{Strategy, SupportedConfig};

    struct CountingOpener {
        opens: AtomicUsize,
        always_present: bool,
        fail_keys: Vec<BusKey>,
    }

    impl CountingOpener {
        fn present() -> Self {
            Self { opens: AtomicUsize::new(0), always_present: true, fail_keys: Vec::new() }
        }
        fn absent() -> Self {
            Self { opens: AtomicUsize::new(0), always_present: false, fail_keys: Vec::new() }
        }
        fn failing(fail_keys: Vec<BusKey>) -> Self {
            Self { opens: AtomicUsize::new(0), always_present: true, fail_keys }
        }
    }

    #[async_trait]
    impl BusOpener for CountingOpener {
        async fn open(&self, key: &BusKey, _max_retries: u32) -> Result<Box<dyn BusClient>, crate::error::BusError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_keys.contains(key) {
                return Err(crate::error::BusError::Connect("stub refused".into()));
            }
            let stub = if self.always_present {
                StubBusClient::new().with_response(StubBusClient::FC_DEVICE_ID, 0, Scripted::Identification(Some("Acme".into())))
            } else {
                StubBusClient::new()
            };
            Ok(Box::new(stub))
        }
    }

    fn quick_cfg(lo: u8, hi: u8) -> ParameterGeneratorConfig {
        ParameterGeneratorConfig {
            strategy: Strategy::Quick,
            supported_config: Some(SupportedConfig {
                baud_rates: Some(vec![9600]),
                parities: Some(vec![Parity::None]),
                data_bits: Some(vec![8]),
                stop_bits: Some(vec![1]),
                address_range: Some((lo, hi)),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn max_devices_stop_issues_exactly_n_probes() {
        let opener = Arc::new(CountingOpener::present());
        let scanner = DiscoveryScanner::with_opener(opener);
        let cfg = quick_cfg(1, 10);
        let opts = ScanOptions { port: "/dev/ttyUSB0".into(), timeout_ms: 50, delay_ms: 0, max_devices: 2, verbose: false };

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_cb = attempts.clone();
        let callbacks = ScanCallbacks {
            on_test_attempt: Some(Box::new(move |_combo, status| {
                if status == TestAttemptStatus::Testing {
                    attempts_cb.fetch_add(1, Ordering::SeqCst);
                }
            })),
            ..Default::default()
        };

        let devices = scanner.run(&cfg, &opts, callbacks).await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn group_boundary_stop_never_opens_second_bus() {
        let opener = Arc::new(CountingOpener::present());
        let scanner = DiscoveryScanner::with_opener(opener.clone());
        let cfg = ParameterGeneratorConfig {
            strategy: Strategy::Quick,
            supported_config: Some(SupportedConfig {
                baud_rates: Some(vec![9600, 19200]),
                parities: Some(vec![Parity::None]),
                data_bits: Some(vec![8]),
                stop_bits: Some(vec![1]),
                address_range: Some((1, 5)),
            }),
            ..Default::default()
        };
        let opts = ScanOptions { port: "/dev/ttyUSB0".into(), timeout_ms: 50, delay_ms: 0, max_devices: 3, verbose: false };

        let devices = scanner.run(&cfg, &opts, ScanCallbacks::default()).await.unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_failure_skips_whole_group_and_advances_progress() {
        let bad_key = BusKey::rtu("/dev/ttyUSB0", SerialParams { baud_rate: 9600, parity: Parity::None, data_bits: 8, stop_bits: 1 });
        let opener = Arc::new(CountingOpener::failing(vec![bad_key]));
        let scanner = DiscoveryScanner::with_opener(opener);
        let cfg = quick_cfg(1, 2);
        let opts = ScanOptions { port: "/dev/ttyUSB0".into(), timeout_ms: 50, delay_ms: 0, max_devices: 0, verbose: false };

        let devices = scanner.run(&cfg, &opts, ScanCallbacks::default()).await.unwrap();
        assert!(devices.is_empty());
    }

    struct MixedOpener {
        fail_key: BusKey,
    }

    #[async_trait]
    impl BusOpener for MixedOpener {
        async fn open(&self, key: &BusKey, _max_retries: u32) -> Result<Box<dyn BusClient>, crate::error::BusError> {
            if *key == self.fail_key {
                return Err(crate::error::BusError::Connect("stub refused".into()));
            }
            Ok(Box::new(StubBusClient::new()))
        }
    }

    #[tokio::test]
    async fn one_group_fails_to_connect_other_has_no_devices_progress_advances_per_probe_and_per_skip() {
        // validBaudRates=[9600,19200], validAddressRange=[1,2]: 9600 fails
        // to connect (whole group of 2 skipped, progress jumps by 2),
        // 19200 connects but no slave answers (progress advances by 1 per
        // probe): (2,4,0), (3,4,0), (4,4,0).
        let bad_key = BusKey::rtu("/dev/ttyUSB0", SerialParams { baud_rate: 9600, parity: Parity::None, data_bits: 8, stop_bits: 1 });
        let opener = Arc::new(MixedOpener { fail_key: bad_key });
        let scanner = DiscoveryScanner::with_opener(opener);

        let cfg = ParameterGeneratorConfig {
            strategy: Strategy::Quick,
            supported_config: Some(SupportedConfig {
                baud_rates: Some(vec![9600, 19200]),
                parities: Some(vec![Parity::None]),
                data_bits: Some(vec![8]),
                stop_bits: Some(vec![1]),
                address_range: Some((1, 2)),
            }),
            ..Default::default()
        };
        let opts = ScanOptions { port: "/dev/ttyUSB0".into(), timeout_ms: 10, delay_ms: 0, max_devices: 0, verbose: false };

        let progresses = Arc::new(std::sync::Mutex::new(Vec::new()));
        let progresses_cb = progresses.clone();
        let callbacks = ScanCallbacks {
            on_progress: Some(Box::new(move |current, total, found| {
                progresses_cb.lock().unwrap().push((current, total, found));
                Ok(())
            })),
            ..Default::default()
        };

        let devices = scanner.run(&cfg, &opts, callbacks).await.unwrap();
        assert!(devices.is_empty());
        assert_eq!(*progresses.lock().unwrap(), vec![(2, 4, 0), (3, 4, 0), (4, 4, 0)]);
    }

    #[tokio::test]
    async fn not_found_probes_pay_the_full_delay_minus_timeout() {
        let opener = Arc::new(CountingOpener::absent());
        let scanner = DiscoveryScanner::with_opener(opener);
        let cfg = quick_cfg(1, 2);
        let opts = ScanOptions { port: "/dev/ttyUSB0".into(), timeout_ms: 10, delay_ms: 50, max_devices: 0, verbose: false };

        let start = Instant::now();
        let devices = scanner.run(&cfg, &opts, ScanCallbacks::default()).await.unwrap();
        assert!(devices.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn a_hit_under_the_device_limit_incurs_no_trailing_delay() {
        let opener = Arc::new(CountingOpener::present());
        let scanner = DiscoveryScanner::with_opener(opener);
        let cfg = quick_cfg(1, 2);
        let opts = ScanOptions { port: "/dev/ttyUSB0".into(), timeout_ms: 1000, delay_ms: 50, max_devices: 1, verbose: false };

        let start = Instant::now();
        let devices = scanner.run(&cfg, &opts, ScanCallbacks::default()).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn run_stream_emits_progress_events() {
        let opener = Arc::new(CountingOpener::present());
        let scanner = DiscoveryScanner::with_opener(opener);
        let cfg = quick_cfg(1, 2);
        let opts = ScanOptions { port: "/dev/ttyUSB0".into(), timeout_ms: 50, delay_ms: 0, max_devices: 1, verbose: false };

        let (mut rx, handle) = scanner.run_stream(cfg, opts);
        let mut saw_found = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, ScanProgressEvent::Found(_)) {
                saw_found = true;
            }
        }
        let devices = handle.await.unwrap().unwrap();
        assert_eq!(devices.len(), 1);
        assert!(saw_found);
    }
}

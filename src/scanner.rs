use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{
    AddressType, Central as _, CentralEvent, Peripheral as _, PeripheralProperties, ScanFilter,
};
use futures::{Stream, StreamExt as _};
use log::{debug, error, info, warn};
use tokio::time::{Interval, MissedTickBehavior};

use crate::advertisement::{
    AD_MANUFACTURER, AD_NAME_COMPLETE, AD_SERVICES_16_COMPLETE, push_record,
};
use crate::clock::Clock;
use crate::config::{self, ScanConfig};
use crate::messages::{AddressKind, ScanResult};
use crate::proximity::ProximityTracker;

/// xxxx0000-0000-1000-8000-00805f9b34fb with the 16-bit id masked out
const BLE_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

#[derive(Debug, Clone)]
pub struct ScanParams {
    pub duration: Duration,
    pub interval_us: u32,
    pub window_us: u32,
    pub active: bool,
    /// Idle gap between scans, and the period of timeout polls.
    pub yield_period: Duration,
}

impl ScanParams {
    pub fn from_config(config: &ScanConfig) -> Self {
        ScanParams {
            duration: Duration::from_millis(
                config
                    .duration_ms
                    .unwrap_or(config::DEFAULT_SCAN_DURATION_MS),
            ),
            interval_us: config
                .interval_us
                .unwrap_or(config::DEFAULT_SCAN_INTERVAL_US),
            window_us: config.window_us.unwrap_or(config::DEFAULT_SCAN_WINDOW_US),
            active: config.active.unwrap_or(true),
            yield_period: Duration::from_millis(
                config.yield_ms.unwrap_or(config::DEFAULT_SCAN_YIELD_MS),
            ),
        }
    }

    /// How long each scan stays on before it is stopped for the yield.
    pub fn active_window(&self) -> Duration {
        self.duration.saturating_sub(self.yield_period)
    }
}

pub type ScanResults = Pin<Box<dyn Stream<Item = ScanResult> + Send>>;

/// The radio's scan primitive. A scan is started, left running for a bounded
/// window, then stopped before the next one is issued.
pub trait Radio {
    async fn results(&self) -> anyhow::Result<ScanResults>;
    async fn start_scan(&self, params: &ScanParams) -> anyhow::Result<()>;
    async fn stop_scan(&self) -> anyhow::Result<()>;
}

pub struct Scanner<R, C> {
    radio: R,
    tracker: ProximityTracker<C>,
    params: ScanParams,
}

impl<R: Radio, C: Clock> Scanner<R, C> {
    pub fn new(radio: R, tracker: ProximityTracker<C>, params: ScanParams) -> Self {
        Scanner {
            radio,
            tracker,
            params,
        }
    }

    /// Runs scan cycles back to back: start, scan for the active window, stop,
    /// then yield. A new scan is issued every `duration`. Results and timeout
    /// polls are handled throughout. Returns when the radio stops delivering
    /// results.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut results = self.radio.results().await?;
        let mut poll = tokio::time::interval(self.params.yield_period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let active = self.params.active_window();
        let yield_period = self.params.yield_period;

        info!(target: "scanner", "Scanning for BLE devices: {:?}", self.params);
        loop {
            if let Err(err) = self.radio.start_scan(&self.params).await {
                warn!(target: "scanner", "Could not start scan, retrying next cycle: {:?}", err);
            }
            if !self.pump(&mut results, &mut poll, active).await {
                break;
            }
            if let Err(err) = self.radio.stop_scan().await {
                warn!(target: "scanner", "Could not stop scan: {:?}", err);
            }
            self.on_scan_complete();
            if !self.pump(&mut results, &mut poll, yield_period).await {
                break;
            }
        }
        info!(target: "scanner", "No more scan results");
        Ok(())
    }

    /// Handles results and timeout polls until `span` has passed. False once the
    /// result stream has ended.
    async fn pump(
        &mut self,
        results: &mut ScanResults,
        poll: &mut Interval,
        span: Duration,
    ) -> bool {
        let mut deadline = std::pin::pin!(tokio::time::sleep(span));
        loop {
            tokio::select! {
                biased;
                _ = &mut deadline => return true,
                _ = poll.tick() => {
                    self.tracker.poll();
                }
                result = results.next() => match result {
                    Some(result) => self.handle(&result),
                    None => return false,
                }
            }
        }
    }

    fn on_scan_complete(&mut self) {
        debug!(target: "scanner", "Scan cycle complete");
        self.tracker.poll();
    }

    fn handle(&mut self, result: &ScanResult) {
        let tracker = &mut self.tracker;
        if std::panic::catch_unwind(AssertUnwindSafe(|| tracker.on_scan_result(result))).is_err() {
            error!(
                target: "scanner",
                "Dropped advertisement from {} after a panic",
                result.address_string()
            );
        }
    }
}

pub struct BtleRadio {
    adapter: btleplug::platform::Adapter,
}

impl BtleRadio {
    pub fn new(adapter: btleplug::platform::Adapter) -> Self {
        BtleRadio { adapter }
    }
}

impl Radio for BtleRadio {
    async fn results(&self) -> anyhow::Result<ScanResults> {
        let events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let results = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok()??;
                scan_result(&properties)
            }
        });
        Ok(Box::pin(results))
    }

    async fn start_scan(&self, params: &ScanParams) -> anyhow::Result<()> {
        // BlueZ picks its own interval and window; only the re-issue cadence is ours.
        debug!(
            target: "scanner",
            "Issuing scan for {:?} (interval {}us, window {}us, active {})",
            params.active_window(),
            params.interval_us,
            params.window_us,
            params.active
        );
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> anyhow::Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }
}

/// BlueZ hands over parsed properties rather than raw advertising data, so
/// rebuild the records the tracker expects. Results without RSSI are dropped.
fn scan_result(properties: &PeripheralProperties) -> Option<ScanResult> {
    let rssi = properties.rssi?;
    let mut payload = Vec::new();
    if let Some(name) = &properties.local_name {
        push_record(&mut payload, AD_NAME_COMPLETE, name.as_bytes());
    }
    for (company_id, data) in &properties.manufacturer_data {
        let mut value = company_id.to_le_bytes().to_vec();
        value.extend_from_slice(data);
        push_record(&mut payload, AD_MANUFACTURER, &value);
    }
    let services = properties
        .services
        .iter()
        .filter_map(|uuid| short_service_id(uuid.as_u128()))
        .flat_map(u16::to_le_bytes)
        .collect::<Vec<_>>();
    if !services.is_empty() {
        push_record(&mut payload, AD_SERVICES_16_COMPLETE, &services);
    }

    Some(ScanResult {
        address: properties.address.into_inner(),
        address_kind: match properties.address_type {
            Some(AddressType::Public) => AddressKind::Public,
            Some(AddressType::Random) => AddressKind::Random,
            None => AddressKind::Unknown,
        },
        rssi,
        payload,
    })
}

fn short_service_id(uuid: u128) -> Option<u16> {
    if uuid & !(0xFFFF_FFFF_u128 << 96) == BLE_BASE_UUID && uuid >> 112 == 0 {
        Some((uuid >> 96) as u16)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use btleplug::api::BDAddr;
    use btleplug::api::bleuuid::uuid_from_u16;

    use super::*;
    use crate::advertisement;
    use crate::config::ProximityConfig;
    use crate::testing::ManualClock;

    /// Behaves like BlueZ: starting a scan while one is running fails.
    #[derive(Default)]
    struct FakeRadio {
        results: Mutex<Vec<ScanResult>>,
        hold_open: bool,
        discovering: AtomicBool,
        starts: AtomicUsize,
        stops: AtomicUsize,
        busy: AtomicUsize,
    }

    impl FakeRadio {
        fn with_results(results: Vec<ScanResult>) -> Self {
            FakeRadio {
                results: Mutex::new(results),
                ..Default::default()
            }
        }
    }

    impl Radio for &FakeRadio {
        async fn results(&self) -> anyhow::Result<ScanResults> {
            let results = std::mem::take(&mut *self.results.lock().unwrap());
            let results = futures::stream::iter(results);
            if self.hold_open {
                Ok(Box::pin(results.chain(futures::stream::pending())))
            } else {
                Ok(Box::pin(results))
            }
        }

        async fn start_scan(&self, _params: &ScanParams) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.discovering.swap(true, Ordering::SeqCst) {
                self.busy.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("org.bluez.Error.InProgress");
            }
            Ok(())
        }

        async fn stop_scan(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.discovering.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn phone(rssi: i16) -> PeripheralProperties {
        PeripheralProperties {
            address: BDAddr::from([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
            address_type: Some(AddressType::Random),
            local_name: Some("phone".to_string()),
            rssi: Some(rssi),
            manufacturer_data: HashMap::from([(0x004C, vec![0x10, 0x05])]),
            services: vec![uuid_from_u16(0x180F)],
            ..Default::default()
        }
    }

    fn params() -> ScanParams {
        ScanParams::from_config(&ScanConfig::default())
    }

    #[test]
    fn test_scan_result_from_properties() {
        let result = scan_result(&phone(-30)).unwrap();
        assert_eq!(result.address, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(result.address_kind, AddressKind::Random);
        assert_eq!(result.rssi, -30);

        let parsed = advertisement::parse(&result.payload);
        assert_eq!(parsed.name, Some("phone"));
        assert!(parsed.has_company_id(0x004C));
        assert_eq!(parsed.manufacturer, Some(&[0x4C, 0x00, 0x10, 0x05][..]));
        assert_eq!(parsed.service_ids().collect::<Vec<_>>(), vec![0x180F]);
    }

    #[test]
    fn test_result_without_rssi_is_dropped() {
        let mut properties = phone(-30);
        properties.rssi = None;
        assert!(scan_result(&properties).is_none());
    }

    #[test]
    fn test_short_service_id() {
        assert_eq!(short_service_id(uuid_from_u16(0xFE9F).as_u128()), Some(0xFE9F));
        assert_eq!(
            short_service_id(0x6E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E),
            None
        );
    }

    #[test]
    fn test_scan_params_defaults() {
        let params = params();
        assert_eq!(params.duration, Duration::from_millis(1000));
        assert_eq!(params.interval_us, 30_000);
        assert_eq!(params.window_us, 30_000);
        assert!(params.active);
        assert_eq!(params.yield_period, Duration::from_millis(100));
    }

    #[test]
    fn test_active_window_leaves_room_for_yield() {
        assert_eq!(params().active_window(), Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_run_feeds_tracker_until_results_end() {
        let radio = FakeRadio::with_results(vec![
            scan_result(&phone(-60)).unwrap(),
            scan_result(&phone(-30)).unwrap(),
        ]);
        // Someone else left discovery running.
        radio.discovering.store(true, Ordering::SeqCst);
        let tracker = ProximityTracker::new(ManualClock::new(0), &ProximityConfig::default());
        let handle = tracker.handle();

        Scanner::new(&radio, tracker, params()).run().await.unwrap();
        assert!(handle.is_tracking());
        assert_eq!(radio.starts.load(Ordering::SeqCst), 1);
        assert_eq!(radio.busy.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_stop_before_reissue_and_decay_while_running() {
        let radio = FakeRadio {
            hold_open: true,
            ..FakeRadio::with_results(vec![scan_result(&phone(-30)).unwrap()])
        };
        let clock = ManualClock::new(0);
        let tracker = ProximityTracker::new(clock.clone(), &ProximityConfig::default());
        let handle = tracker.handle();
        let params = ScanParams {
            duration: Duration::from_millis(20),
            yield_period: Duration::from_millis(5),
            ..params()
        };

        let run = tokio::time::timeout(
            Duration::from_millis(200),
            Scanner::new(&radio, tracker, params).run(),
        );
        let observe = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let tracked = handle.is_tracking();
            clock.advance(6_000);
            tokio::time::sleep(Duration::from_millis(50)).await;
            tracked
        };
        let (run, tracked) = tokio::join!(run, observe);

        assert!(run.is_err(), "scanner exited while results were still open");
        assert!(tracked);
        assert!(!handle.is_tracking());
        let starts = radio.starts.load(Ordering::SeqCst);
        let stops = radio.stops.load(Ordering::SeqCst);
        assert!(starts >= 5, "only {starts} scans issued");
        assert_eq!(radio.busy.load(Ordering::SeqCst), 0);
        assert!(stops == starts || stops + 1 == starts);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_the_loop() {
        let radio = FakeRadio::with_results(vec![
            scan_result(&phone(-30)).unwrap(),
            scan_result(&phone(-20)).unwrap(),
        ]);
        let tracker = ProximityTracker::new(ManualClock::new(0), &ProximityConfig::default())
            .on_tracking_started(|| panic!("listener failed"));
        let handle = tracker.handle();

        // Both results are consumed and the loop reaches the end of the stream.
        Scanner::new(&radio, tracker, params()).run().await.unwrap();
        assert!(handle.is_tracking());
        assert_eq!(radio.starts.load(Ordering::SeqCst), 1);
    }
}

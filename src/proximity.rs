use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info};

use crate::advertisement;
use crate::clock::{Clock, Millis};
use crate::config::{self, ProximityConfig, ScanMode};
use crate::gpio::Indicator;
use crate::messages::ScanResult;

/// State shared between the scan task (writer) and button handlers (readers).
/// Each field is a single word; writers only ever store already-consistent values.
#[derive(Debug, Default)]
struct ProximityState {
    tracking: AtomicBool,
    last_seen: AtomicU64,
}

/// Read-only view handed to the cover decision engine.
#[derive(Clone, Debug, Default)]
pub struct ProximityHandle {
    state: Arc<ProximityState>,
}

impl ProximityHandle {
    #[inline]
    pub fn is_tracking(&self) -> bool {
        self.state.tracking.load(Ordering::SeqCst)
    }

    pub fn last_seen(&self) -> Millis {
        self.state.last_seen.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ProximityHandle {
    pub fn force_tracking(&self, tracking: bool) {
        self.state.tracking.store(tracking, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Refreshed,
    Ended,
    Unchanged,
}

/// What qualifies an advertisement as "our peer, very close".
#[derive(Debug, Clone)]
pub struct Criterion {
    pub company_ids: Vec<u16>,
    pub address: Option<[u8; 6]>,
    pub rssi_floor: i16,
}

impl Criterion {
    pub fn from_config(config: &ProximityConfig) -> Self {
        Criterion {
            company_ids: config
                .manufacturer
                .clone()
                .unwrap_or(config::Manufacturer::Apple)
                .company_ids(),
            address: config.address.map(|a| a.bytes()),
            rssi_floor: config.rssi_floor.unwrap_or(config::DEFAULT_RSSI_FLOOR),
        }
    }

    pub fn matches(&self, result: &ScanResult, parsed: &advertisement::Advertisement<'_>) -> bool {
        result.rssi >= self.rssi_floor
            && self.address.is_none_or(|a| a == result.address)
            && self.company_ids.iter().any(|id| parsed.has_company_id(*id))
    }
}

type Listener = Box<dyn FnMut() + Send>;

pub struct ProximityTracker<C> {
    state: Arc<ProximityState>,
    clock: C,
    criterion: Criterion,
    mode: ScanMode,
    timeout_ms: Millis,
    indicator: Option<Box<dyn Indicator + Send>>,
    on_tracking_started: Option<Listener>,
    on_tracking_ended: Option<Listener>,
}

impl<C: Clock> ProximityTracker<C> {
    pub fn new(clock: C, config: &ProximityConfig) -> Self {
        ProximityTracker {
            state: Arc::default(),
            clock,
            criterion: Criterion::from_config(config),
            mode: config.mode.unwrap_or_default(),
            timeout_ms: config
                .timeout_ms
                .unwrap_or(config::DEFAULT_TRACKING_TIMEOUT_MS),
            indicator: None,
            on_tracking_started: None,
            on_tracking_ended: None,
        }
    }

    pub fn with_indicator(mut self, indicator: impl Indicator + Send + 'static) -> Self {
        self.indicator = Some(Box::new(indicator));
        self
    }

    /// Fired once per idle to tracking transition.
    pub fn on_tracking_started(mut self, listener: impl FnMut() + Send + 'static) -> Self {
        self.on_tracking_started = Some(Box::new(listener));
        self
    }

    /// Fired once per tracking to idle transition.
    pub fn on_tracking_ended(mut self, listener: impl FnMut() + Send + 'static) -> Self {
        self.on_tracking_ended = Some(Box::new(listener));
        self
    }

    pub fn handle(&self) -> ProximityHandle {
        ProximityHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn on_scan_result(&mut self, result: &ScanResult) -> Transition {
        if result.rssi < self.criterion.rssi_floor {
            return Transition::Unchanged;
        }
        let parsed = advertisement::parse(&result.payload);
        if !self.criterion.matches(result, &parsed) {
            return Transition::Unchanged;
        }

        match self.mode {
            ScanMode::Discovery => {
                info!(
                    target: "proximity",
                    "Device: {} | MAC: {} ({:?}) | RSSI: {}dB | services: {:04x?}",
                    parsed.name.unwrap_or("Unknown"),
                    result.address_string(),
                    result.address_kind,
                    result.rssi,
                    parsed.service_ids().collect::<Vec<_>>(),
                );
                Transition::Unchanged
            }
            ScanMode::Track => {
                self.state.last_seen.store(self.clock.now_ms(), Ordering::SeqCst);
                if self.state.tracking.swap(true, Ordering::SeqCst) {
                    debug!(target: "proximity", "Still tracking {}", result.address_string());
                    return Transition::Refreshed;
                }
                info!(
                    target: "proximity",
                    "Start tracking, device nearby | MAC: {} | RSSI: {}dB",
                    result.address_string(),
                    result.rssi
                );
                if let Some(indicator) = self.indicator.as_mut() {
                    indicator.set(true);
                }
                if let Some(listener) = self.on_tracking_started.as_mut() {
                    listener();
                }
                Transition::Started
            }
        }
    }

    /// Periodic timeout check. Decay is only discovered here, never pushed.
    pub fn poll(&mut self) -> Transition {
        if !self.state.tracking.load(Ordering::SeqCst) {
            return Transition::Unchanged;
        }
        let last_seen = self.state.last_seen.load(Ordering::SeqCst);
        if self.clock.now_ms().saturating_sub(last_seen) <= self.timeout_ms {
            return Transition::Unchanged;
        }

        self.state.tracking.store(false, Ordering::SeqCst);
        info!(
            target: "proximity",
            "Stop tracking, nothing seen for {}ms",
            self.timeout_ms
        );
        if let Some(indicator) = self.indicator.as_mut() {
            indicator.set(false);
        }
        if let Some(listener) = self.on_tracking_ended.as_mut() {
            listener();
        }
        Transition::Ended
    }
}

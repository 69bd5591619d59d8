//! Fakes shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::{Clock, Millis};
use crate::gateway::{GatewayError, RemoteState};
use crate::gpio::Indicator;

#[derive(Clone, Debug, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        ManualClock(Arc::new(AtomicU64::new(start)))
    }

    pub fn advance(&self, ms: Millis) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default)]
pub struct FakeIndicator {
    on: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl FakeIndicator {
    pub fn new(on: bool) -> Self {
        FakeIndicator {
            on: Arc::new(AtomicBool::new(on)),
            writes: Arc::default(),
        }
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Indicator for FakeIndicator {
    fn set(&mut self, on: bool) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.on.store(on, Ordering::SeqCst);
    }

    fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct RemoteLog {
    reported: Result<bool, GatewayError>,
    reads: usize,
    commands: Vec<(String, bool)>,
}

/// Remote service double. Records every call; commands never change `reported`.
#[derive(Clone, Debug)]
pub struct FakeRemote {
    log: Arc<Mutex<RemoteLog>>,
    fail_commands: bool,
}

impl FakeRemote {
    pub fn new(reported: Result<bool, GatewayError>) -> Self {
        FakeRemote {
            log: Arc::new(Mutex::new(RemoteLog {
                reported,
                reads: 0,
                commands: Vec::new(),
            })),
            fail_commands: false,
        }
    }

    pub fn failing_commands(mut self) -> Self {
        self.fail_commands = true;
        self
    }

    pub fn set_reported(&self, reported: Result<bool, GatewayError>) {
        self.log.lock().unwrap().reported = reported;
    }

    pub fn reads(&self) -> usize {
        self.log.lock().unwrap().reads
    }

    pub fn commands(&self) -> Vec<(String, bool)> {
        self.log.lock().unwrap().commands.clone()
    }
}

impl RemoteState for FakeRemote {
    async fn get_state(&self, _entity_id: &str) -> Result<bool, GatewayError> {
        let mut log = self.log.lock().unwrap();
        log.reads += 1;
        log.reported.clone()
    }

    async fn set_state(&self, entity_id: &str, on: bool) -> Result<(), GatewayError> {
        self.log
            .lock()
            .unwrap()
            .commands
            .push((entity_id.to_string(), on));
        if self.fail_commands {
            Err(GatewayError::Status(502))
        } else {
            Ok(())
        }
    }
}

use log::{debug, info};

use crate::clock::{Clock, Millis};
use crate::cover::{CoverEngine, Decision, LockState};
use crate::dispatch::{ButtonChannel, DeferredHandler};
use crate::gateway::RemoteState;
use crate::gpio::Indicator;
use crate::messages::ButtonTag;

struct Lock {
    state: LockState,
    indicator: Option<Box<dyn Indicator + Send>>,
}

impl Lock {
    fn show(&mut self) {
        if let Some(indicator) = self.indicator.as_mut() {
            indicator.set(self.state == LockState::Locked);
        }
    }
}

/// Runs every accepted press in task context. Owns the debounce channels and
/// the lock; nothing else mutates them.
pub struct CoverController<R, I, C> {
    clock: C,
    engine: CoverEngine<R, I>,
    outdoor: ButtonChannel,
    indoor: ButtonChannel,
    lock_button: ButtonChannel,
    lock: Option<Lock>,
}

impl<R, I, C> CoverController<R, I, C>
where
    R: RemoteState,
    I: Indicator,
    C: Clock,
{
    pub fn new(clock: C, engine: CoverEngine<R, I>, debounce_ms: Millis) -> Self {
        CoverController {
            clock,
            engine,
            outdoor: ButtonChannel::new(ButtonTag::OutdoorCover, debounce_ms),
            indoor: ButtonChannel::new(ButtonTag::IndoorCover, debounce_ms),
            lock_button: ButtonChannel::new(ButtonTag::Lock, debounce_ms),
            lock: None,
        }
    }

    /// Enables the lock. It starts locked, which gates the outdoor button.
    pub fn with_lock(mut self, indicator: Option<Box<dyn Indicator + Send>>) -> Self {
        let mut lock = Lock {
            state: LockState::default(),
            indicator,
        };
        lock.show();
        self.lock = Some(lock);
        self
    }

    pub fn lock_state(&self) -> Option<LockState> {
        self.lock.as_ref().map(|l| l.state)
    }

    fn toggle_lock(&mut self) {
        let Some(lock) = self.lock.as_mut() else {
            debug!(target: "controller", "Lock press without a lock configured");
            return;
        };
        lock.state = lock.state.toggled();
        info!(target: "controller", "Lock is now {:?}", lock.state);
        lock.show();
    }
}

impl<R, I, C> DeferredHandler for CoverController<R, I, C>
where
    R: RemoteState,
    I: Indicator,
    C: Clock,
{
    async fn on_deferred(&mut self, tag: ButtonTag) {
        let now = self.clock.now_ms();
        let channel = match tag {
            ButtonTag::OutdoorCover => &mut self.outdoor,
            ButtonTag::IndoorCover => &mut self.indoor,
            ButtonTag::Lock => &mut self.lock_button,
        };
        if !channel.try_accept(now) {
            return;
        }
        info!(target: "controller", "Press: {} button", tag.name());

        let lock = match tag {
            ButtonTag::Lock => return self.toggle_lock(),
            ButtonTag::OutdoorCover => self.lock_state().unwrap_or(LockState::Unlocked),
            ButtonTag::IndoorCover => LockState::Unlocked,
        };
        let decision = self.engine.on_cover_button_pressed(lock).await;
        if let Decision::Skipped(reason) = decision {
            debug!(target: "controller", "{} press skipped: {:?}", tag.name(), reason);
        }
    }
}

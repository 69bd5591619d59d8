use log::info;

use crate::config::CoverPolicy;
use crate::gateway::RemoteState;
use crate::gpio::Indicator;
use crate::proximity::ProximityHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Locked,
    Unlocked,
}

impl LockState {
    pub fn toggled(self) -> Self {
        match self {
            LockState::Locked => LockState::Unlocked,
            LockState::Unlocked => LockState::Locked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Locked,
    NoPeerInRange,
    RemoteUnavailable,
}

/// Outcome of one accepted cover button press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Opened,
    Closed,
    Skipped(SkipReason),
}

/// Decides whether a press opens or closes the cover. Closing is never gated
/// on proximity.
pub struct CoverEngine<R, I> {
    policy: CoverPolicy,
    remote: Option<R>,
    entity_id: String,
    indicator: I,
    proximity: ProximityHandle,
}

impl<R: RemoteState, I: Indicator> CoverEngine<R, I> {
    pub fn new(
        policy: CoverPolicy,
        remote: Option<R>,
        entity_id: String,
        indicator: I,
        proximity: ProximityHandle,
    ) -> Self {
        CoverEngine {
            policy,
            remote,
            entity_id,
            indicator,
            proximity,
        }
    }

    pub async fn on_cover_button_pressed(&mut self, lock: LockState) -> Decision {
        if lock == LockState::Locked {
            info!(target: "cover", "Locked, cover button ignored");
            return Decision::Skipped(SkipReason::Locked);
        }
        match self.policy {
            CoverPolicy::Remote => self.toggle_via_remote().await,
            CoverPolicy::Local => self.toggle_local().await,
        }
    }

    /// The remote state is read live on every press and never cached.
    async fn toggle_via_remote(&mut self) -> Decision {
        let Some(remote) = self.remote.as_ref() else {
            info!(target: "cover", "No remote service configured, doing nothing");
            return Decision::Skipped(SkipReason::RemoteUnavailable);
        };
        match remote.get_state(&self.entity_id).await {
            Ok(open) => self.apply(!open).await,
            Err(err) => {
                info!(target: "cover", "Cannot read cover state, doing nothing: {}", err);
                Decision::Skipped(SkipReason::RemoteUnavailable)
            }
        }
    }

    async fn toggle_local(&mut self) -> Decision {
        if self.indicator.is_on() {
            self.apply(false).await
        } else if self.proximity.is_tracking() {
            self.apply(true).await
        } else {
            info!(
                target: "cover",
                "Cannot open, no device in range (last seen at {}ms)",
                self.proximity.last_seen()
            );
            Decision::Skipped(SkipReason::NoPeerInRange)
        }
    }

    async fn apply(&mut self, open: bool) -> Decision {
        info!(target: "cover", "{} cover", if open { "Open" } else { "Close" });
        self.indicator.set(open);
        if let Some(remote) = self.remote.as_ref() {
            if remote.set_state(&self.entity_id, open).await.is_err() {
                info!(target: "cover", "Command not confirmed, press again to retry");
            }
        }
        if open {
            Decision::Opened
        } else {
            Decision::Closed
        }
    }
}

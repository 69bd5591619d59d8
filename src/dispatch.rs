use std::panic::AssertUnwindSafe;

use futures::FutureExt as _;
use log::{error, trace};
use tokio::sync::mpsc;

use crate::clock::Millis;
use crate::messages::ButtonTag;

/// Interrupt-side half of the deferred queue.
#[derive(Clone, Debug)]
pub struct EdgeSender {
    tx: mpsc::Sender<ButtonTag>,
}

impl EdgeSender {
    /// Never blocks. When the queue is full the newest tag is dropped; the
    /// user pressing again is the retry.
    pub fn on_edge(&self, tag: ButtonTag) {
        let _ = self.tx.try_send(tag);
    }
}

/// Task-side half of the deferred queue.
pub struct DeferredQueue {
    rx: mpsc::Receiver<ButtonTag>,
}

pub fn deferred_queue(depth: usize) -> (EdgeSender, DeferredQueue) {
    let (tx, rx) = mpsc::channel(depth);
    (EdgeSender { tx }, DeferredQueue { rx })
}

/// Work scheduled out of interrupt context.
pub trait DeferredHandler {
    async fn on_deferred(&mut self, tag: ButtonTag);
}

impl DeferredQueue {
    /// Drain tags in FIFO order, one handler call at a time, until every
    /// `EdgeSender` is gone.
    pub async fn run<H: DeferredHandler>(mut self, handler: &mut H) {
        while let Some(tag) = self.rx.recv().await {
            if AssertUnwindSafe(handler.on_deferred(tag))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(target: "dispatch", "Handler for {} button panicked", tag.name());
            }
        }
        trace!(target: "dispatch", "Deferred queue closed");
    }
}

/// Debounce bookkeeping for one physical button. Only touched from task context.
#[derive(Debug, Clone)]
pub struct ButtonChannel {
    tag: ButtonTag,
    debounce_ms: Millis,
    last_accepted: Option<Millis>,
}

impl ButtonChannel {
    pub fn new(tag: ButtonTag, debounce_ms: Millis) -> Self {
        ButtonChannel {
            tag,
            debounce_ms,
            last_accepted: None,
        }
    }

    /// Accepts the press and records it, or rejects it as a bounce.
    pub fn try_accept(&mut self, now: Millis) -> bool {
        if let Some(last) = self.last_accepted {
            if now.saturating_sub(last) < self.debounce_ms {
                trace!(target: "dispatch", "Ignoring bounce on {} button", self.tag.name());
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }
}

use anyhow::bail;
use log::info;

use crate::clock::Clock;
use crate::dispatch::{DeferredHandler, DeferredQueue};
use crate::scanner::{Radio, Scanner};

/// Runs the scan task and the deferred-button task side by side on one task.
pub struct Manager<R, C, H> {
    scanner: Scanner<R, C>,
    queue: DeferredQueue,
    handler: H,
}

impl<R, C, H> Manager<R, C, H>
where
    R: Radio,
    C: Clock,
    H: DeferredHandler,
{
    pub fn new(scanner: Scanner<R, C>, queue: DeferredQueue, handler: H) -> Self {
        Manager {
            scanner,
            queue,
            handler,
        }
    }

    /// Only returns if one side stops; proximity must never go stale silently.
    pub async fn run_loop(self) -> anyhow::Result<()> {
        let Manager {
            scanner,
            queue,
            mut handler,
        } = self;

        tokio::select! {
            result = scanner.run() => {
                result?;
                bail!("scan results stopped arriving");
            }
            _ = queue.run(&mut handler) => {
                info!(target: "main", "All button lines released");
            }
        }
        Ok(())
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{info, warn};

use crate::service::RelayService;

/// Periodically recycles abandoned claims, independent of agent polls.
pub fn spawn_reconciler(svc: Arc<RelayService>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every);
        loop {
            tick.tick().await;
            match svc.recover_stale().await {
                Ok(0) => {}
                Ok(n) => info!(recovered = n, "reconciler recycled stale claims"),
                Err(e) => warn!("reconcile tick error: {e:?}"),
            }
        }
    })
}

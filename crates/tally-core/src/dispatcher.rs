//! Instance dispatcher
//!
//! Two cooperating pieces: a single long-lived Monitor that polls for
//! instances with ready queue items, and one Processor task per active
//! instance that drains its queue in insertion order. A registry keyed by
//! instance id enforces at most one Processor per instance per node; a
//! registered entry doubles as the "currently processing" flag, so a
//! monitor tick that races an active Processor is a no-op. Processors
//! deregister on exit, including on failure.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::workers::{self, LinkJobQueue, ProcessOutcome};

type Registry = Arc<Mutex<HashSet<i64>>>;

/// Handle to a running dispatcher
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    monitor: JoinHandle<()>,
    registry: Registry,
}

impl DispatcherHandle {
    /// Signal shutdown and wait for the monitor to exit.
    ///
    /// Processors finish their in-flight command and stop at the next
    /// loop iteration; no new Processors are spawned afterwards.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.monitor.await {
            error!("monitor task join failed: {}", e);
        }
    }

    /// Number of currently registered Processors
    pub fn active_processors(&self) -> usize {
        self.registry
            .lock()
            .expect("processor registry lock poisoned")
            .len()
    }
}

/// Start the Monitor loop as a background task.
///
/// Every `config.poll_interval_ms` the Monitor sweeps stalled queue items
/// back to pending, queries the instances with ready work, and ensures a
/// Processor is running for each.
pub fn start(db: Database, config: Config, links: Arc<dyn LinkJobQueue>) -> DispatcherHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry: Registry = Arc::new(Mutex::new(HashSet::new()));

    info!(
        poll_interval_ms = config.poll_interval_ms,
        processor_name = %config.processor_name,
        "starting instance dispatcher"
    );

    let monitor = tokio::spawn(run_monitor(
        db,
        config,
        links,
        registry.clone(),
        shutdown_rx,
    ));

    DispatcherHandle {
        shutdown_tx,
        monitor,
        registry,
    }
}

async fn run_monitor(
    db: Database,
    config: Config,
    links: Arc<dyn LinkJobQueue>,
    registry: Registry,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_millis(config.poll_interval_ms.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                poll_once(&db, &config, &links, &registry, &shutdown_rx).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!("monitor loop stopped");
}

async fn poll_once(
    db: &Database,
    config: &Config,
    links: &Arc<dyn LinkJobQueue>,
    registry: &Registry,
    shutdown_rx: &watch::Receiver<bool>,
) {
    let sweep_db = db.clone();
    let threshold = chrono::Duration::seconds(config.stall_threshold_secs as i64);
    let swept = tokio::task::spawn_blocking(move || sweep_db.sweep_stalled(threshold)).await;
    match swept {
        Ok(Ok(count)) if count > 0 => warn!(count, "stalled queue items swept back to pending"),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("stalled sweep failed: {}", e),
        Err(e) => error!("stalled sweep task failed: {}", e),
    }

    let poll_db = db.clone();
    let instances = tokio::task::spawn_blocking(move || poll_db.instances_with_ready_work()).await;
    match instances {
        Ok(Ok(instance_ids)) => {
            for instance_id in instance_ids {
                ensure_processor(
                    db.clone(),
                    config.clone(),
                    links.clone(),
                    registry.clone(),
                    shutdown_rx.clone(),
                    instance_id,
                );
            }
        }
        Ok(Err(e)) => error!("ready-instance poll failed: {}", e),
        Err(e) => error!("ready-instance poll task failed: {}", e),
    }
}

/// Spawn a Processor for the instance unless one is already registered.
///
/// The registry insert is the claim: losing it means another Processor is
/// live and will pick up the new work on its own loop.
fn ensure_processor(
    db: Database,
    config: Config,
    links: Arc<dyn LinkJobQueue>,
    registry: Registry,
    shutdown_rx: watch::Receiver<bool>,
    instance_id: i64,
) {
    {
        let mut active = registry
            .lock()
            .expect("processor registry lock poisoned");
        if !active.insert(instance_id) {
            return;
        }
    }
    let slot = RegistrySlot {
        registry,
        instance_id,
    };

    tokio::spawn(async move {
        let _slot = slot;
        debug!(instance_id, "processor started");
        run_processor(&db, &config, &links, &shutdown_rx, instance_id).await;
        debug!(instance_id, "processor stopped");
    });
}

/// Releases the instance's registry slot when the Processor task ends,
/// however it ends.
struct RegistrySlot {
    registry: Registry,
    instance_id: i64,
}

impl Drop for RegistrySlot {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.instance_id);
    }
}

/// Drain the instance: fetch the oldest ready command, process it, repeat
/// until nothing is ready or shutdown is signalled.
async fn run_processor(
    db: &Database,
    config: &Config,
    links: &Arc<dyn LinkJobQueue>,
    shutdown_rx: &watch::Receiver<bool>,
    instance_id: i64,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let fetch_db = db.clone();
        let next =
            tokio::task::spawn_blocking(move || fetch_db.next_ready_command(instance_id)).await;

        let (command, _queue_item) = match next {
            Ok(Ok(Some(found))) => found,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                error!(instance_id, "fetching next command failed: {}", e);
                break;
            }
            Err(e) => {
                error!(instance_id, "fetch task failed: {}", e);
                break;
            }
        };

        let process_db = db.clone();
        let process_config = config.clone();
        let process_links = links.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            workers::process_command(
                &process_db,
                &process_config,
                process_links.as_ref(),
                &command,
            )
        })
        .await;

        match outcome {
            Ok(Ok(outcome)) => {
                if let ProcessOutcome::AlreadyClaimed = outcome {
                    debug!(instance_id, "command already claimed elsewhere");
                }
            }
            Ok(Err(e)) => {
                error!(instance_id, "processing failed: {}", e);
                break;
            }
            Err(e) => {
                error!(instance_id, "processing task failed: {}", e);
                break;
            }
        }
    }
}

/// Synchronously process every ready command for one instance.
///
/// The blocking equivalent of a Processor's drain loop; embedders without
/// a runtime (and tests) drive the queue with it. Returns the number of
/// commands taken through the pipeline.
pub fn drain_instance(
    db: &Database,
    config: &Config,
    links: &dyn LinkJobQueue,
    instance_id: i64,
) -> crate::error::Result<usize> {
    let mut processed = 0;
    while let Some((command, _queue_item)) = db.next_ready_command(instance_id)? {
        workers::process_command(db, config, links, &command)?;
        processed += 1;
    }
    Ok(processed)
}

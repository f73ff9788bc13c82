//! Registry of instances plus the reconciliation loop that drives them.
//!
//! The loop visits every instance once per second and dispatches its
//! pending operation. Requests are non-blocking for the caller; an
//! attached one-shot channel receives the outcome of the tick that
//! executed the request. The registry lock is only ever held briefly and
//! never across blocking work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use tracing::{error, info, warn};

use crate::config;
use crate::error::{Error, Result};
use crate::instance::{Instance, OpResult, Operation};
use crate::netdev::Netdev;

pub struct Supervisor {
    config_dir: PathBuf,
    runtime_dir: PathBuf,
    netdev: Arc<Netdev>,

    instances: RwLock<HashMap<String, Arc<Instance>>>,
    exit: AtomicBool,
    reconciler_done: Notify,
}

impl Supervisor {
    /// Build the supervisor, spawn the reconciler, and start every
    /// configured guest with `auto_start: true`.
    pub async fn new(config_dir: PathBuf, runtime_dir: PathBuf) -> Result<Arc<Supervisor>> {
        let supervisor = Arc::new(Supervisor {
            config_dir,
            runtime_dir,
            netdev: Arc::new(Netdev::new()),
            instances: RwLock::new(HashMap::new()),
            exit: AtomicBool::new(false),
            reconciler_done: Notify::new(),
        });

        tokio::spawn(Self::reconcile_loop(supervisor.clone()));

        let names = match config::list_configs(&supervisor.config_dir) {
            Ok(names) => names,
            Err(e) => {
                supervisor.cleanup().await;
                return Err(e);
            }
        };

        for name in names {
            match config::parse_config(&supervisor.config_dir, &name) {
                Ok(vm) if vm.auto_start => {
                    if let Err(e) = supervisor.start(&name, None).await {
                        error!("monitor: autostart: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => error!("monitor: autostart: {e}"),
            }
        }

        Ok(supervisor)
    }

    async fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances.read().await.get(name).cloned()
    }

    /// One pass over a snapshot of the registry. Instance ordering is
    /// unspecified.
    async fn tick(self: &Arc<Self>) {
        let names: Vec<String> = self.instances.read().await.keys().cloned().collect();

        for name in names {
            let Some(instance) = self.get(&name).await else {
                continue;
            };

            let (op, result) = instance.take_op().await;

            let outcome = match op {
                Operation::Start => match instance.start().await {
                    Err(e @ Error::RetryExhausted { .. }) => {
                        // give up in the same tick: tear the guest down
                        // and drop it from the registry
                        match instance.shutdown().await {
                            Ok(()) => {
                                self.instances.write().await.remove(&name);
                            }
                            Err(shutdown_err) => error!("monitor: {name}: {shutdown_err}"),
                        }
                        Err(e)
                    }
                    other => other,
                },

                Operation::Shutdown => match instance.shutdown().await {
                    Ok(()) => {
                        self.instances.write().await.remove(&name);
                        Ok(())
                    }
                    Err(e) => Err(e),
                },

                Operation::Reset => {
                    let outcome = instance.reset().await;
                    instance.finish_reset().await;
                    outcome
                }
            };

            match result {
                Some(sender) => {
                    // the caller may have given up; don't lose the error
                    if let Err(Err(e)) = sender.send(outcome) {
                        error!("monitor: {name}: {e}");
                    }
                }
                None => {
                    if let Err(e) = outcome {
                        error!("monitor: {name}: {e}");
                    }
                }
            }
        }
    }

    async fn reconcile_loop(self: Arc<Self>) {
        loop {
            self.tick().await;

            if self.exit.load(Ordering::SeqCst) {
                self.reconciler_done.notify_one();
                return;
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Register `name` for supervision. Fails when the guest is already
    /// running; a registered-but-down guest is left to the reconciler.
    /// Config and NIC allocation errors are synchronous; the launch
    /// outcome goes to `result` if attached.
    pub async fn start(&self, name: &str, result: Option<OpResult>) -> Result<()> {
        info!("monitor: requesting start: {name}");

        if let Some(instance) = self.get(name).await {
            if instance.running().await {
                return Err(Error::AlreadyRunning(name.to_string()));
            }
            return Ok(());
        }

        let mut instances = self.instances.write().await;
        // a racing start may have won the write lock
        if instances.contains_key(name) {
            return Ok(());
        }

        let instance = Instance::new(
            &self.config_dir,
            &self.runtime_dir,
            self.netdev.clone(),
            name,
            result,
        )?;
        instances.insert(name.to_string(), Arc::new(instance));

        Ok(())
    }

    pub async fn shutdown(&self, name: &str, result: Option<OpResult>) -> Result<()> {
        info!("monitor: requesting shutdown: {name}");

        let Some(instance) = self.get(name).await else {
            return Err(Error::NotRunning(name.to_string()));
        };

        instance.request_op(Operation::Shutdown, result).await;
        Ok(())
    }

    pub async fn reset(&self, name: &str, result: Option<OpResult>) -> Result<()> {
        info!("monitor: requesting reset: {name}");

        let Some(instance) = self.get(name).await else {
            return Err(Error::NotRunning(name.to_string()));
        };

        instance.request_op(Operation::Reset, result).await;
        Ok(())
    }

    /// Configured and supervised names, deduplicated and sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = config::list_configs(&self.config_dir)?;

        for name in self.instances.read().await.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Monitor status of `name`, `stopped` when it is not supervised.
    pub async fn status(&self, name: &str) -> String {
        match self.get(name).await {
            Some(instance) => instance.status().await,
            None => "stopped".to_string(),
        }
    }

    pub async fn running(&self, name: &str) -> bool {
        match self.get(name).await {
            Some(instance) => instance.running().await,
            None => false,
        }
    }

    /// Stop the reconciler and force every remaining guest down. Called
    /// once, on daemon shutdown.
    pub async fn cleanup(&self) {
        info!("monitor: cleanup");

        let done = self.reconciler_done.notified();
        self.exit.store(true, Ordering::SeqCst);
        done.await;

        let remaining: Vec<Arc<Instance>> =
            self.instances.read().await.values().cloned().collect();

        for instance in remaining {
            match instance.shutdown().await {
                Ok(()) => {
                    self.instances
                        .write()
                        .await
                        .remove(instance.name());
                }
                Err(e) => error!("monitor: {}: {e}", instance.name()),
            }
        }

        warn!("monitor: cleanup: done");
    }
}

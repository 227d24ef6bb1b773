use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use herd_protocol::InstanceSnapshot;
use herd_protocol::SessionState;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::classifier::DeathCause;
use crate::config::HerdConfig;
use crate::env::encode_env;
use crate::error::HerdErr;
use crate::error::Result;
use crate::scratch::ScratchDir;
use crate::supervisor::Instance;
use crate::supervisor::Launched;
use crate::supervisor::launch;

/// Directory of live and recently dead instances, keyed by worker pid.
///
/// Constructed once at process start with [`InstanceRegistry::start`] and torn
/// down with [`InstanceRegistry::shutdown`]. Cloning yields another handle to
/// the same registry.
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    config: HerdConfig,
    scratch: ScratchDir,
    instances: Mutex<HashMap<i32, Arc<Instance>>>,
    /// Spawned workers whose `create` has not returned yet.
    pending: Mutex<HashMap<i32, Arc<Instance>>>,
}

fn remove_same(map: &mut HashMap<i32, Arc<Instance>>, instance: &Arc<Instance>) -> bool {
    let same = map
        .get(&instance.id())
        .is_some_and(|current| Arc::ptr_eq(current, instance));
    if same {
        map.remove(&instance.id());
    }
    same
}

impl RegistryInner {
    /// Drops `instance` unless its id has since been taken by another one.
    /// An instance still pending is dropped from there, so it is never
    /// published.
    pub(crate) async fn evict(&self, instance: &Arc<Instance>) {
        let mut instances = self.instances.lock().await;
        if remove_same(&mut instances, instance) {
            tracing::info!(pid = instance.id(), "evicted dead instance");
            return;
        }
        if remove_same(&mut *self.pending.lock().await, instance) {
            tracing::debug!(pid = instance.id(), "evicted instance before it was published");
        }
    }

    /// Moves a pending instance into the registry. Returns false when it was
    /// evicted or stopped in the meantime.
    async fn publish(&self, instance: &Arc<Instance>) -> bool {
        let mut instances = self.instances.lock().await;
        if !remove_same(&mut *self.pending.lock().await, instance) {
            return false;
        }
        instances.insert(instance.id(), Arc::clone(instance));
        true
    }

    async fn forget_pending(&self, instance: &Arc<Instance>) {
        remove_same(&mut *self.pending.lock().await, instance);
    }
}

/// Stops a pending worker in the background if `create` is dropped while
/// waiting for it.
struct PendingLaunch {
    registry: Arc<RegistryInner>,
    instance: Arc<Instance>,
    armed: bool,
}

impl PendingLaunch {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingLaunch {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        tracing::debug!(pid = self.instance.id(), "create abandoned, stopping worker");
        let registry = Arc::clone(&self.registry);
        let instance = Arc::clone(&self.instance);
        runtime.spawn(async move {
            instance.shutdown(DeathCause::NeverReady).await;
            registry.forget_pending(&instance).await;
        });
    }
}

impl InstanceRegistry {
    /// Prepares an empty control socket directory and an empty registry.
    pub fn start(config: HerdConfig) -> Result<Self> {
        let scratch = ScratchDir::create(&config.scratch_dir)?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                scratch,
                instances: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &HerdConfig {
        &self.inner.config
    }

    /// Spawns a worker and returns it once it is awaiting login. On failure
    /// the worker is shut down and never becomes visible. Dropping the
    /// returned future stops the worker as well.
    pub async fn create(
        &self,
        agent_label: String,
        config: &Map<String, Value>,
    ) -> Result<Arc<Instance>> {
        let launched = self.launch_worker(agent_label, config)?;
        let instance = launched.instance;
        let mut guard = PendingLaunch {
            registry: Arc::clone(&self.inner),
            instance: Arc::clone(&instance),
            armed: true,
        };
        self.inner
            .pending
            .lock()
            .await
            .insert(instance.id(), Arc::clone(&instance));

        let ready_timeout = self.inner.config.ready_timeout();
        match tokio::time::timeout(ready_timeout, launched.ready).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                instance.shutdown(DeathCause::NeverReady).await;
                self.inner.forget_pending(&instance).await;
                guard.disarm();
                let exit = instance.process().wait_exit().await;
                tracing::warn!(pid = instance.id(), "worker exited before login: {exit}");
                return Err(HerdErr::WorkerExited {
                    status: exit.to_string(),
                });
            }
            Err(_) => {
                instance.shutdown(DeathCause::NeverReady).await;
                self.inner.forget_pending(&instance).await;
                guard.disarm();
                tracing::warn!(pid = instance.id(), "worker never presented a login code");
                return Err(HerdErr::ReadyTimeout {
                    timeout_ms: self.inner.config.ready_timeout_ms,
                });
            }
        }

        let published = self.inner.publish(&instance).await;
        guard.disarm();
        if !published {
            let exit = instance.process().wait_exit().await;
            tracing::warn!(pid = instance.id(), "worker stopped before it was published: {exit}");
            return Err(HerdErr::WorkerExited {
                status: exit.to_string(),
            });
        }
        Ok(instance)
    }

    fn launch_worker(&self, agent_label: String, config: &Map<String, Value>) -> Result<Launched> {
        let control_address = self.inner.scratch.allocate();
        let env = encode_env(config, &control_address);
        launch(
            &self.inner.config,
            agent_label,
            &env,
            control_address,
            Arc::downgrade(&self.inner),
        )
    }

    pub async fn get(&self, id: i32) -> Result<Arc<Instance>> {
        self.inner
            .instances
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(HerdErr::NotFound { id })
    }

    /// Every instance, ordered by id.
    pub async fn list(&self) -> Vec<Arc<Instance>> {
        let mut instances: Vec<Arc<Instance>> =
            self.inner.instances.lock().await.values().cloned().collect();
        instances.sort_by_key(|instance| instance.id());
        instances
    }

    pub async fn snapshot(&self, id: i32) -> Result<InstanceSnapshot> {
        let instance = self.get(id).await?;
        Ok(instance.snapshot().await)
    }

    pub async fn snapshots(&self) -> Vec<InstanceSnapshot> {
        let instances = self.list().await;
        join_all(instances.iter().map(|instance| instance.snapshot())).await
    }

    /// Forgets the instance right away and stops its worker in the
    /// background.
    pub async fn delete(&self, id: i32) -> Result<()> {
        let instance = self
            .inner
            .instances
            .lock()
            .await
            .remove(&id)
            .ok_or(HerdErr::NotFound { id })?;
        tracing::info!(pid = id, agent_label = %instance.agent_label(), "deleting instance");
        tokio::spawn(async move {
            instance.shutdown(DeathCause::Deleted).await;
        });
        Ok(())
    }

    /// Pauses or resumes message handling for `id`.
    pub async fn update(&self, id: i32, target: SessionState) -> Result<Arc<Instance>> {
        let instance = self.get(id).await?;
        instance.toggle(target).await?;
        Ok(instance)
    }

    /// Stops every instance, including those still being created, empties the
    /// registry and removes the control socket directory.
    pub async fn shutdown(&self) {
        let mut instances: Vec<Arc<Instance>> = self
            .inner
            .instances
            .lock()
            .await
            .drain()
            .map(|(_, instance)| instance)
            .collect();
        instances.extend(
            self.inner
                .pending
                .lock()
                .await
                .drain()
                .map(|(_, instance)| instance),
        );
        tracing::info!(count = instances.len(), "stopping all instances");
        join_all(
            instances
                .iter()
                .map(|instance| instance.shutdown(DeathCause::RegistryStopped)),
        )
        .await;
        self.inner.scratch.remove();
    }
}

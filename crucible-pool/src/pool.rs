use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crucible_core::{ChatId, WorkerName};
use crucible_orchestrator::{
    generate_worker_name, with_retries, Orchestrator, RetryStrategy, WorkerObservation,
    WorkerPhase, WorkerSpec,
};

use crate::error::PoolError;
use crate::worker::{TrackedWorker, WorkerState};

/// Tuning for the warm pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of `Ready` + `Provisioning` workers to maintain.
    pub target: usize,
    /// Worker names are this prefix plus a random suffix.
    pub worker_name_prefix: String,
    /// Manifest used for every worker.
    pub worker_spec: WorkerSpec,
    /// Bound on `Provisioning`; workers stuck longer are force-deleted.
    pub provisioning_timeout: Duration,
    /// Bound on `Terminating`; entries older than this are dropped even if
    /// the orchestrator never confirmed deletion.
    pub terminating_timeout: Duration,
    /// Period of the housekeeping tick (stuck-state scan + replenish retry).
    pub tick_interval: Duration,
    /// Pause before re-subscribing after the watch stream breaks.
    pub watch_reconnect_backoff: Duration,
    /// Retries per worker creation attempt.
    pub create_max_retries: u32,
    /// Backoff between creation retries.
    pub retry_strategy: RetryStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target: 2,
            worker_name_prefix: "code-executor-".to_owned(),
            worker_spec: WorkerSpec {
                image: "localhost/code-executor:local".to_owned(),
                resources: serde_json::Value::Null,
                spec_extra: serde_json::Value::Null,
                owner: "crucible".to_owned(),
            },
            provisioning_timeout: Duration::from_secs(120),
            terminating_timeout: Duration::from_secs(120),
            tick_interval: Duration::from_secs(5),
            watch_reconnect_backoff: Duration::from_secs(1),
            create_max_retries: 2,
            retry_strategy: RetryStrategy::default(),
        }
    }
}

/// Gauges for health reporting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub provisioning: usize,
    pub ready: usize,
    pub assigned: usize,
    pub terminating: usize,
    pub waiters: usize,
    pub target: usize,
}

enum PoolMsg {
    Acquire {
        chat_id: ChatId,
        waiter_id: Uuid,
        reply: oneshot::Sender<WorkerName>,
    },
    CancelWaiter {
        waiter_id: Uuid,
    },
    Release {
        name: WorkerName,
    },
    Observe(WorkerObservation),
    /// Fresh list of every matching worker, sent on each watch
    /// (re)subscription. Tracked workers missing from it are gone.
    Resync(Vec<WorkerObservation>),
    CreateFailed {
        name: WorkerName,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Tick,
}

struct Waiter {
    id: Uuid,
    chat_id: ChatId,
    reply: oneshot::Sender<WorkerName>,
}

/// Handle to the warm pool.
///
/// All pool state lives in a single task; this handle posts messages to it
/// and awaits replies, so no lock ordering exists anywhere in the pool.
#[derive(Clone)]
pub struct Pool {
    tx: mpsc::Sender<PoolMsg>,
}

impl Pool {
    /// Spawn the pool task, its watch forwarder, and the housekeeping tick.
    /// The pool shuts down when the last handle is dropped.
    pub fn spawn(orchestrator: Arc<dyn Orchestrator>, config: PoolConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(watch_forwarder(
            Arc::clone(&orchestrator),
            config.worker_name_prefix.clone(),
            config.watch_reconnect_backoff,
            tx.clone(),
        ));

        let tick_tx = tx.clone();
        let tick_interval = config.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tick_tx.send(PoolMsg::Tick).await.is_err() {
                    return;
                }
            }
        });

        let task = PoolTask {
            orchestrator,
            config,
            workers: HashMap::new(),
            ready: VecDeque::new(),
            waiters: VecDeque::new(),
            tx: tx.clone(),
        };
        tokio::spawn(task.run(rx));

        Self { tx }
    }

    /// Take a ready worker, waiting up to `deadline` for one to appear.
    /// Waiters are served strictly in arrival order. On timeout the waiter
    /// entry is withdrawn and the call fails `Unavailable`.
    pub async fn acquire(
        &self,
        chat_id: ChatId,
        deadline: Duration,
    ) -> Result<WorkerName, PoolError> {
        let waiter_id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolMsg::Acquire {
                chat_id,
                waiter_id,
                reply,
            })
            .await
            .map_err(|_| PoolError::Closed)?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(name)) => Ok(name),
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                let _ = self.tx.send(PoolMsg::CancelWaiter { waiter_id }).await;
                Err(PoolError::Unavailable(format!(
                    "no worker became ready within {deadline:?}"
                )))
            }
        }
    }

    /// Return a worker after use. Workers are single-use: release always
    /// destroys, never recycles.
    pub async fn release(&self, name: WorkerName) {
        let _ = self.tx.send(PoolMsg::Release { name }).await;
    }

    /// Current gauges.
    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolMsg::Stats { reply })
            .await
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }
}

/// Re-subscribes to the orchestrator watch forever, feeding the pool task.
/// Each (re)subscription starts with the re-listed snapshot so the pool can
/// diff away workers that vanished while the stream was down.
async fn watch_forwarder(
    orchestrator: Arc<dyn Orchestrator>,
    prefix: String,
    backoff: Duration,
    tx: mpsc::Sender<PoolMsg>,
) {
    loop {
        match orchestrator.watch_workers(&prefix).await {
            Ok(watch) => {
                if tx.send(PoolMsg::Resync(watch.snapshot)).await.is_err() {
                    return;
                }
                let mut events = watch.events;
                while let Some(event) = events.next().await {
                    match event {
                        Ok(observation) => {
                            if tx.send(PoolMsg::Observe(observation)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "worker watch stream failed");
                            break;
                        }
                    }
                }
                debug!("worker watch disconnected, re-listing");
            }
            Err(e) => {
                warn!(error = %e, "could not subscribe to worker watch");
            }
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(backoff).await;
    }
}

struct PoolTask {
    orchestrator: Arc<dyn Orchestrator>,
    config: PoolConfig,
    workers: HashMap<WorkerName, TrackedWorker>,
    /// FIFO of idle `Ready` workers.
    ready: VecDeque<WorkerName>,
    /// FIFO of pending acquires.
    waiters: VecDeque<Waiter>,
    tx: mpsc::Sender<PoolMsg>,
}

impl PoolTask {
    async fn run(mut self, mut rx: mpsc::Receiver<PoolMsg>) {
        info!(
            target = self.config.target,
            prefix = %self.config.worker_name_prefix,
            "pool task started"
        );
        while let Some(msg) = rx.recv().await {
            match msg {
                PoolMsg::Acquire {
                    chat_id,
                    waiter_id,
                    reply,
                } => {
                    self.handle_acquire(chat_id, waiter_id, reply);
                    self.replenish();
                }
                PoolMsg::CancelWaiter { waiter_id } => {
                    self.waiters.retain(|w| w.id != waiter_id);
                }
                PoolMsg::Release { name } => {
                    self.handle_release(name);
                    self.replenish();
                }
                PoolMsg::Observe(observation) => {
                    self.handle_observation(observation);
                    self.replenish();
                }
                PoolMsg::Resync(snapshot) => {
                    self.handle_resync(snapshot);
                    self.replenish();
                }
                PoolMsg::CreateFailed { name } => {
                    // Retried by the next tick, not immediately, so a down
                    // control plane does not turn replenishment into a busy
                    // loop.
                    self.remove_worker(&name);
                }
                PoolMsg::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                PoolMsg::Tick => {
                    self.expire_stuck_workers();
                    self.replenish();
                }
            }
        }
        debug!("pool task stopped");
    }

    fn handle_acquire(
        &mut self,
        chat_id: ChatId,
        waiter_id: Uuid,
        reply: oneshot::Sender<WorkerName>,
    ) {
        while let Some(name) = self.ready.pop_front() {
            let Some(worker) = self.workers.get_mut(&name) else {
                continue;
            };
            worker.transition(WorkerState::Assigned);
            worker.chat_id = Some(chat_id.clone());
            debug!(worker = %name, chat_id = %chat_id, "worker assigned");
            if let Err(name) = reply.send(name) {
                // Caller gave up between queueing and assignment; the
                // worker goes back to the front of the line.
                let worker = self.workers.get_mut(&name).expect("just assigned");
                worker.transition(WorkerState::Ready);
                self.ready.push_front(name);
            }
            return;
        }
        self.waiters.push_back(Waiter {
            id: waiter_id,
            chat_id,
            reply,
        });
    }

    fn handle_release(&mut self, name: WorkerName) {
        let Some(worker) = self.workers.get_mut(&name) else {
            return;
        };
        debug!(worker = %name, "releasing worker");
        worker.transition(WorkerState::Terminating);
        self.ready.retain(|n| n != &name);
        self.spawn_delete(name);
    }

    fn handle_observation(&mut self, observation: WorkerObservation) {
        let WorkerObservation { name, phase, ready } = observation;

        if phase.is_terminal() {
            if self.remove_worker(&name) {
                debug!(worker = %name, ?phase, "worker gone");
                // The control plane may keep a record of the dead
                // container; sweep it so names do not accumulate.
                self.spawn_delete(name);
            }
            return;
        }

        match self.workers.get(&name).map(|w| w.state) {
            None => {
                // Prefix-matching but untracked: residue of a previous
                // broker instance. Adopt it and let the normal lifecycle
                // take over.
                info!(worker = %name, ?phase, "adopting unknown worker");
                self.workers
                    .insert(name.clone(), TrackedWorker::new(WorkerState::Provisioning));
                if phase == WorkerPhase::Running && ready {
                    self.promote_ready(name);
                }
            }
            Some(WorkerState::Provisioning) if phase == WorkerPhase::Running && ready => {
                self.promote_ready(name);
            }
            // Duplicate or stale observations are no-ops; watch replay
            // after a reconnect must be idempotent.
            Some(_) => {}
        }
    }

    fn handle_resync(&mut self, snapshot: Vec<WorkerObservation>) {
        let seen: std::collections::HashSet<&WorkerName> =
            snapshot.iter().map(|o| &o.name).collect();
        let vanished: Vec<WorkerName> = self
            .workers
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in vanished {
            debug!(worker = %name, "worker vanished during watch outage");
            self.remove_worker(&name);
        }
        for observation in snapshot {
            self.handle_observation(observation);
        }
    }

    /// A worker became ready: hand it straight to the oldest waiter, or
    /// queue it.
    fn promote_ready(&mut self, name: WorkerName) {
        let Some(worker) = self.workers.get_mut(&name) else {
            return;
        };
        while let Some(waiter) = self.waiters.pop_front() {
            worker.transition(WorkerState::Assigned);
            worker.chat_id = Some(waiter.chat_id.clone());
            match waiter.reply.send(name.clone()) {
                Ok(()) => {
                    debug!(worker = %name, chat_id = %waiter.chat_id, "worker handed to waiter");
                    return;
                }
                // Waiter timed out; try the next one.
                Err(_) => continue,
            }
        }
        worker.transition(WorkerState::Ready);
        debug!(worker = %name, "worker ready");
        self.ready.push_back(name);
    }

    /// Forget a worker entirely (the terminal state). Returns whether it
    /// was tracked.
    fn remove_worker(&mut self, name: &WorkerName) -> bool {
        self.ready.retain(|n| n != name);
        self.workers.remove(name).is_some()
    }

    /// Top the pool back up to the target. Assigned workers are single-use
    /// and never come back, so only `Provisioning` and `Ready` count.
    fn replenish(&mut self) {
        let stats = self.stats();
        let deficit = self
            .config
            .target
            .saturating_sub(stats.provisioning + stats.ready);
        if deficit == 0 {
            return;
        }
        info!(
            deficit,
            provisioning = stats.provisioning,
            ready = stats.ready,
            "replenishing pool"
        );
        for _ in 0..deficit {
            self.spawn_create();
        }
    }

    fn spawn_create(&mut self) {
        let name = generate_worker_name(&self.config.worker_name_prefix);
        self.workers
            .insert(name.clone(), TrackedWorker::new(WorkerState::Provisioning));

        let orchestrator = Arc::clone(&self.orchestrator);
        let spec = self.config.worker_spec.clone();
        let retries = self.config.create_max_retries;
        let strategy = self.config.retry_strategy.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = with_retries("create_worker", retries, &strategy, || {
                orchestrator.create_worker(&name, &spec)
            })
            .await;
            if let Err(e) = result {
                warn!(worker = %name, error = %e, "failed to create worker");
                // A half-created worker must not linger; deletion of a
                // nonexistent one is a no-op.
                let _ = orchestrator.delete_worker(&name).await;
                let _ = tx.send(PoolMsg::CreateFailed { name }).await;
            }
        });
    }

    fn spawn_delete(&self, name: WorkerName) {
        let orchestrator = Arc::clone(&self.orchestrator);
        let retries = self.config.create_max_retries;
        let strategy = self.config.retry_strategy.clone();
        tokio::spawn(async move {
            if let Err(e) = with_retries("delete_worker", retries, &strategy, || {
                orchestrator.delete_worker(&name)
            })
            .await
            {
                warn!(worker = %name, error = %e, "failed to delete worker");
            }
        });
    }

    /// Enforce the state timers: no non-terminal state may be held forever.
    fn expire_stuck_workers(&mut self) {
        let now = Instant::now();
        let provisioning_deadline = self.config.provisioning_timeout;
        let terminating_deadline = self.config.terminating_timeout;

        let stuck: Vec<(WorkerName, WorkerState)> = self
            .workers
            .iter()
            .filter_map(|(name, worker)| match worker.state {
                WorkerState::Provisioning
                    if now.duration_since(worker.since) > provisioning_deadline =>
                {
                    Some((name.clone(), worker.state))
                }
                WorkerState::Terminating
                    if now.duration_since(worker.since) > terminating_deadline =>
                {
                    Some((name.clone(), worker.state))
                }
                _ => None,
            })
            .collect();

        for (name, state) in stuck {
            warn!(worker = %name, ?state, "worker stuck, force-deleting");
            self.remove_worker(&name);
            self.spawn_delete(name);
        }
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            target: self.config.target,
            waiters: self.waiters.len(),
            ..PoolStats::default()
        };
        for worker in self.workers.values() {
            match worker.state {
                WorkerState::Provisioning => stats.provisioning += 1,
                WorkerState::Ready => stats.ready += 1,
                WorkerState::Assigned => stats.assigned += 1,
                WorkerState::Terminating => stats.terminating += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crucible_orchestrator_memory::MemoryOrchestrator;

    fn config(target: usize) -> PoolConfig {
        PoolConfig {
            target,
            worker_name_prefix: "pool-".to_owned(),
            tick_interval: Duration::from_millis(20),
            watch_reconnect_backoff: Duration::from_millis(10),
            provisioning_timeout: Duration::from_millis(200),
            terminating_timeout: Duration::from_millis(200),
            retry_strategy: RetryStrategy::Constant {
                delay: Duration::from_millis(1),
            },
            ..PoolConfig::default()
        }
    }

    async fn wait_until<F>(mut predicate: F)
    where
        F: FnMut() -> futures_util::future::BoxFuture<'static, bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if predicate().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition should hold within 5s");
    }

    fn ready_count(pool: Pool) -> impl FnMut() -> futures_util::future::BoxFuture<'static, bool> {
        move || {
            let pool = pool.clone();
            Box::pin(async move {
                let stats = pool.stats().await.unwrap();
                stats.ready == stats.target && stats.provisioning == 0
            })
        }
    }

    #[tokio::test]
    async fn converges_to_target_on_startup() {
        let orch = MemoryOrchestrator::new();
        let pool = Pool::spawn(Arc::new(orch.clone()), config(3));

        wait_until(ready_count(pool.clone())).await;
        assert_eq!(orch.worker_names().len(), 3);
        for name in orch.worker_names() {
            assert!(name.starts_with("pool-"));
        }
    }

    #[tokio::test]
    async fn acquire_assigns_and_replenishes() {
        let orch = MemoryOrchestrator::new();
        let pool = Pool::spawn(Arc::new(orch.clone()), config(2));
        wait_until(ready_count(pool.clone())).await;

        let name = pool
            .acquire(ChatId::from("s1"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(name.as_str().starts_with("pool-"));

        // The assigned worker left the warm set; the pool tops back up.
        wait_until(ready_count(pool.clone())).await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.assigned, 1);
        assert_eq!(stats.ready, 2);
    }

    #[tokio::test]
    async fn waiters_are_served_fifo() {
        let orch = MemoryOrchestrator::manual();
        let pool = Pool::spawn(Arc::new(orch.clone()), config(1));

        // Workers exist but are not ready yet; both acquires must queue.
        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire(ChatId::from("first"), Duration::from_secs(5)).await }
        });
        wait_until({
            let pool = pool.clone();
            move || {
                let pool = pool.clone();
                Box::pin(async move { pool.stats().await.unwrap().waiters == 1 })
            }
        })
        .await;
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire(ChatId::from("second"), Duration::from_secs(5)).await }
        });
        wait_until({
            let pool = pool.clone();
            move || {
                let pool = pool.clone();
                Box::pin(async move { pool.stats().await.unwrap().waiters == 2 })
            }
        })
        .await;

        // Make the provisioned workers ready one at a time.
        let names = orch.worker_names();
        assert!(!names.is_empty());
        orch.make_ready(&WorkerName::new(names[0].clone()));

        let first_name = first.await.unwrap().unwrap();
        assert_eq!(first_name.as_str(), names[0]);
        assert!(!second.is_finished(), "second waiter must still be queued");

        // Keep promoting whatever the pool provisions until the second
        // waiter is served.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !second.is_finished() {
                for name in orch.worker_names() {
                    orch.make_ready(&WorkerName::new(name));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("second waiter should be served");
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn acquire_times_out_and_withdraws_the_waiter() {
        let orch = MemoryOrchestrator::manual();
        let pool = Pool::spawn(Arc::new(orch.clone()), config(1));

        let err = pool
            .acquire(ChatId::from("s1"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Unavailable(_)));

        wait_until({
            let pool = pool.clone();
            move || {
                let pool = pool.clone();
                Box::pin(async move { pool.stats().await.unwrap().waiters == 0 })
            }
        })
        .await;

        // A worker becoming ready later lands in the queue, not on the
        // dead waiter.
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire(ChatId::from("s2"), Duration::from_secs(5)).await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while !second.is_finished() {
                for name in orch.worker_names() {
                    orch.make_ready(&WorkerName::new(name));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("fresh acquire should be served");
        let name = second.await.unwrap().unwrap();
        assert!(name.as_str().starts_with("pool-"));
    }

    #[tokio::test]
    async fn release_destroys_the_worker() {
        let orch = MemoryOrchestrator::new();
        let pool = Pool::spawn(Arc::new(orch.clone()), config(1));
        wait_until(ready_count(pool.clone())).await;

        let name = pool
            .acquire(ChatId::from("s1"), Duration::from_secs(5))
            .await
            .unwrap();
        pool.release(name.clone()).await;

        wait_until({
            let orch = orch.clone();
            let name = name.clone();
            move || {
                let orch = orch.clone();
                let name = name.clone();
                Box::pin(async move { !orch.worker_names().contains(&name.as_str().to_owned()) })
            }
        })
        .await;

        // Never recycled: the pool refills with a different worker.
        wait_until(ready_count(pool.clone())).await;
        let next = pool
            .acquire(ChatId::from("s2"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(next, name);
    }

    #[tokio::test]
    async fn worker_failure_triggers_replenishment() {
        let orch = MemoryOrchestrator::new();
        let pool = Pool::spawn(Arc::new(orch.clone()), config(2));
        wait_until(ready_count(pool.clone())).await;

        let victim = WorkerName::new(orch.worker_names().remove(0));
        orch.fail_worker(&victim);

        wait_until(ready_count(pool.clone())).await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.assigned, 0);
    }

    #[tokio::test]
    async fn create_failures_are_retried_on_later_ticks() {
        let orch = MemoryOrchestrator::new();
        orch.fail_next_creates(6);
        let pool = Pool::spawn(Arc::new(orch.clone()), config(1));

        // Every early create fails (including its internal retries); once
        // the injected failures run out, a tick-driven replenish succeeds.
        wait_until(ready_count(pool.clone())).await;
    }

    #[tokio::test]
    async fn watch_reconnect_serves_waiter_from_relisted_worker() {
        let orch = MemoryOrchestrator::manual();
        let pool = Pool::spawn(Arc::new(orch.clone()), config(0));

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire(ChatId::from("s1"), Duration::from_secs(5)).await }
        });
        wait_until({
            let pool = pool.clone();
            move || {
                let pool = pool.clone();
                Box::pin(async move { pool.stats().await.unwrap().waiters == 1 })
            }
        })
        .await;

        // Sever the watch, then bring up a ready worker while the pool is
        // blind. Only the re-list after reconnect can reveal it.
        orch.disconnect_watchers();
        let name = WorkerName::new("pool-relist");
        orch.create_worker(
            &name,
            &WorkerSpec {
                image: "executor:test".into(),
                resources: serde_json::Value::Null,
                spec_extra: serde_json::Value::Null,
                owner: "test".into(),
            },
        )
        .await
        .unwrap();
        orch.make_ready(&name);

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, name);
    }

    #[tokio::test]
    async fn stuck_provisioning_workers_are_force_deleted() {
        let orch = MemoryOrchestrator::manual();
        let pool = Pool::spawn(Arc::new(orch.clone()), config(1));

        wait_until({
            let orch = orch.clone();
            move || {
                let orch = orch.clone();
                Box::pin(async move { !orch.worker_names().is_empty() })
            }
        })
        .await;
        let first = orch.worker_names().remove(0);

        // Never made ready: past the provisioning bound the pool deletes
        // it and provisions a replacement.
        wait_until({
            let orch = orch.clone();
            let first = first.clone();
            move || {
                let orch = orch.clone();
                let first = first.clone();
                Box::pin(async move {
                    let names = orch.worker_names();
                    !names.contains(&first) && !names.is_empty()
                })
            }
        })
        .await;
        let _ = pool;
    }
}

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::record::Record;
use crate::ruleset::Ruleset;

/// A named record channel. The engine only holds references; producers and
/// consumers live with the host. Backlog is tracked with an explicit depth
/// counter updated on enqueue/dequeue, so the auto-scaler never needs to
/// introspect the underlying channel.
pub struct RecordQueue {
    name: String,
    tx: mpsc::UnboundedSender<Record>,
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Record>>>,
    depth: AtomicUsize,
}

impl RecordQueue {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(RecordQueue {
            name: name.into(),
            tx,
            rx: tokio::sync::Mutex::new(Some(rx)),
            depth: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, record: Record) -> Result<()> {
        self.tx
            .send(record)
            .map_err(|_| EngineError::channel(format!("channel {} is closed", self.name)))?;
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Receive the next record. Single-consumer: the engine holds upstream
    /// receivers, the host holds downstream ones.
    pub async fn recv(&self) -> Option<Record> {
        let mut guard = self.rx.lock().await;
        let rx = guard.as_mut()?;
        let record = rx.recv().await;
        if record.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        record
    }

    /// Non-blocking receive, used by drain-free consumers and tests.
    pub fn try_recv(&self) -> Option<Record> {
        let mut guard = self.rx.try_lock().ok()?;
        let rx = guard.as_mut()?;
        match rx.try_recv() {
            Ok(record) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Some(record)
            }
            Err(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Elastic worker pool over a semaphore: growing adds permits, shrinking
/// retires them asynchronously as workers release.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: Mutex<usize>,
    target: AtomicUsize,
}

impl WorkerPool {
    pub fn new(initial: usize) -> Self {
        WorkerPool {
            semaphore: Arc::new(Semaphore::new(initial)),
            size: Mutex::new(initial),
            target: AtomicUsize::new(initial),
        }
    }

    pub fn size(&self) -> usize {
        self.target.load(Ordering::Relaxed)
    }

    /// Adjust pool capacity. Shrinks take effect as busy workers finish.
    pub fn resize(&self, new_size: usize) {
        let mut size = self.size.lock();
        if new_size == *size {
            return;
        }
        if new_size > *size {
            self.semaphore.add_permits(new_size - *size);
        } else {
            let shrink = *size - new_size;
            let semaphore = self.semaphore.clone();
            tokio::spawn(async move {
                for _ in 0..shrink {
                    match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit.forget(),
                        Err(_) => break,
                    }
                }
            });
        }
        *size = new_size;
        self.target.store(new_size, Ordering::Relaxed);
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::channel("worker pool is closed"))
    }

    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Backlog ladder mapping aggregate upstream depth to a pool size.
fn scale_target(backlog: usize, min: usize, max: usize) -> usize {
    let target = if backlog > 1000 {
        max
    } else if backlog > 512 {
        max * 3 / 4
    } else if backlog > 256 {
        max / 2
    } else if backlog > 32 {
        max / 4
    } else {
        min
    };
    target.clamp(min, max)
}

/// One row of the external daily-stats provider, used to restore the
/// processing accumulator on start.
#[derive(Debug, Clone, Serialize)]
pub struct DailyStatRow {
    pub component_id: String,
    pub component_type: String,
    pub project_node_sequence: String,
    pub total_messages: u64,
}

#[async_trait]
pub trait DailyStats: Send + Sync {
    async fn get(
        &self,
        date: &str,
        component_id: &str,
        component_type: &str,
    ) -> Result<Vec<DailyStatRow>>;
}

/// Production-mode record sampler; never invoked for `TEST.`-prefixed
/// instances.
#[async_trait]
pub trait Sampler: Send + Sync {
    async fn sample(&self, record: &Record, sequence: &str, project_id: &str);
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub pool_size: usize,
    pub upstream_backlog: usize,
    pub downstream_backlog: usize,
    pub metrics: MetricsSnapshot,
    pub ruleset_id: String,
}

/// The runtime for one ruleset instance: upstream consumers feeding an
/// elastic worker pool, fan-out to every downstream channel, an auto-scaler
/// and a QPS loop, with a drain-aware stop.
pub struct Engine {
    ruleset: Arc<Ruleset>,
    config: EngineConfig,
    upstreams: Vec<Arc<RecordQueue>>,
    downstreams: Vec<Arc<RecordQueue>>,
    pool: Arc<WorkerPool>,
    metrics: Arc<EngineMetrics>,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    daily_stats: Option<Arc<dyn DailyStats>>,
    sampler: Option<Arc<dyn Sampler>>,
    running: AtomicBool,
}

impl Engine {
    pub fn new(ruleset: Arc<Ruleset>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (min, _) = config.pool_bounds();
        Ok(Engine {
            ruleset,
            config,
            upstreams: Vec::new(),
            downstreams: Vec::new(),
            pool: Arc::new(WorkerPool::new(min)),
            metrics: Arc::new(EngineMetrics::new()),
            stop: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            daily_stats: None,
            sampler: None,
            running: AtomicBool::new(false),
        })
    }

    pub fn bind_upstream(&mut self, queue: Arc<RecordQueue>) {
        self.upstreams.push(queue);
    }

    pub fn bind_downstream(&mut self, queue: Arc<RecordQueue>) {
        self.downstreams.push(queue);
    }

    pub fn with_daily_stats(&mut self, provider: Arc<dyn DailyStats>) {
        self.daily_stats = Some(provider);
    }

    pub fn with_sampler(&mut self, sampler: Arc<dyn Sampler>) {
        self.sampler = Some(sampler);
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.running.load(Ordering::Relaxed),
            pool_size: self.pool.size(),
            upstream_backlog: self.upstreams.iter().map(|q| q.len()).sum(),
            downstream_backlog: self.downstreams.iter().map(|q| q.len()).sum(),
            metrics: self.metrics.snapshot(),
            ruleset_id: self.ruleset.id().to_string(),
        }
    }

    /// Bring the instance up: restore counters, spawn one consumer per
    /// upstream channel, the auto-scaler and the QPS loop.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::internal("engine is already started"));
        }
        info!(ruleset = %self.ruleset.id(), upstreams = self.upstreams.len(), "starting rule engine");

        self.restore_daily_total().await;

        let mut tasks = self.tasks.lock();
        for queue in &self.upstreams {
            tasks.push(self.spawn_consumer(queue.clone()));
        }
        tasks.push(self.spawn_auto_scaler());
        tasks.push(self.spawn_metrics_loop());
        info!(ruleset = %self.ruleset.id(), "rule engine started");
        Ok(())
    }

    async fn restore_daily_total(&self) {
        let Some(provider) = &self.daily_stats else {
            return;
        };
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        match provider.get(&today, "", "").await {
            Ok(rows) => {
                for row in rows {
                    if row.project_node_sequence == self.config.project_node_sequence {
                        self.metrics.restore_total(row.total_messages);
                        info!(
                            total = row.total_messages,
                            "restored process_total from daily stats"
                        );
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to restore daily stats; starting from zero"),
        }
    }

    fn spawn_consumer(&self, queue: Arc<RecordQueue>) -> JoinHandle<()> {
        let stop = self.stop.clone();
        let pool = self.pool.clone();
        let ruleset = self.ruleset.clone();
        let downstreams = self.downstreams.clone();
        let metrics = self.metrics.clone();
        let sampler = self.sampler.clone();
        let test_mode = self.config.is_test_mode();
        let sequence = self.config.project_node_sequence.clone();
        let project_id = self.config.project_id.clone();

        tokio::spawn(async move {
            info!(channel = %queue.name(), "upstream consumer started");
            loop {
                tokio::select! {
                    biased;
                    maybe = queue.recv() => {
                        let Some(record) = maybe else { break };
                        let permit = match pool.acquire().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        metrics.incr_total();
                        Self::submit(
                            permit,
                            record,
                            ruleset.clone(),
                            downstreams.clone(),
                            sampler.clone(),
                            test_mode,
                            sequence.clone(),
                            project_id.clone(),
                        );
                    }
                    _ = stop.cancelled() => {
                        // Keep consuming through the drain phase; exit once
                        // the channel is empty.
                        if queue.is_empty() {
                            break;
                        }
                    }
                }
            }
            info!(channel = %queue.name(), "upstream consumer stopped");
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn submit(
        permit: OwnedSemaphorePermit,
        record: Record,
        ruleset: Arc<Ruleset>,
        downstreams: Vec<Arc<RecordQueue>>,
        sampler: Option<Arc<dyn Sampler>>,
        test_mode: bool,
        sequence: String,
        project_id: String,
    ) {
        tokio::spawn(async move {
            let _permit = permit;
            if let Some(sampler) = &sampler {
                if !test_mode {
                    sampler.sample(&record, &sequence, &project_id).await;
                }
            }
            let outputs = ruleset.evaluate(&record).await;
            for output in &outputs {
                for queue in &downstreams {
                    if let Err(e) = queue.send(output.clone()) {
                        error!(channel = %queue.name(), error = %e, "downstream send failed");
                    }
                }
            }
        });
    }

    fn spawn_auto_scaler(&self) -> JoinHandle<()> {
        let stop = self.stop.clone();
        let pool = self.pool.clone();
        let upstreams = self.upstreams.clone();
        let (min, max) = self.config.pool_bounds();
        let period = Duration::from_secs(self.config.scale_interval_secs);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let backlog: usize = upstreams.iter().map(|q| q.len()).sum();
                        let target = scale_target(backlog, min, max);
                        if target != pool.size() {
                            info!(backlog, from = pool.size(), to = target, "resizing worker pool");
                            pool.resize(target);
                        }
                    }
                }
            }
            debug!("auto-scaler stopped");
        })
    }

    fn spawn_metrics_loop(&self) -> JoinHandle<()> {
        let stop = self.stop.clone();
        let metrics = self.metrics.clone();
        let period = Duration::from_secs(self.config.qps_interval_secs);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let qps = metrics.tick_qps();
                        debug!(qps, "engine throughput");
                    }
                }
            }
            debug!("metrics loop stopped");
        })
    }

    /// Graceful shutdown: signal stop, give the upstream side and then the
    /// downstream side each up to the drain timeout, then release the pool,
    /// close the threshold caches and join background tasks. Calling stop
    /// twice is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(ruleset = %self.ruleset.id(), "stopping rule engine");
        self.stop.cancel();

        let drain = Duration::from_secs(self.config.drain_timeout_secs);
        if !Self::wait_drained(&self.upstreams, drain).await {
            warn!("upstream channels did not drain in time; forcing shutdown");
        }
        if !Self::wait_drained(&self.downstreams, drain).await {
            warn!("downstream channels did not drain in time; forcing shutdown");
        }

        self.teardown().await;
        info!(ruleset = %self.ruleset.id(), "rule engine stopped");
    }

    /// Shutdown without the drain phases, for tests.
    pub async fn stop_for_testing(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.pool.close();
        self.ruleset.close().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("background task did not stop in time");
            }
        }
    }

    async fn wait_drained(queues: &[Arc<RecordQueue>], limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if queues.iter().all(|q| q.is_empty()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }
}

use crate::command::ProcessEngine;
use crate::error::{EngineError, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Tunables of one executor node.
#[derive(Clone, Debug)]
pub struct JobExecutorConfig {
    /// Lock owner written into acquired jobs; unique per node.
    pub node_id: String,
    /// How many due jobs one poll may claim.
    pub max_jobs_per_acquisition: usize,
    /// How long an acquired job stays locked before another node may steal
    /// it.
    pub lock_duration_ms: u64,
    /// Poll interval bounds for the adaptive backoff.
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
    pub backoff_factor: f64,
    /// Upper bound on concurrently executing jobs.
    pub max_pool_size: usize,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", Uuid::now_v7()),
            max_jobs_per_acquisition: 3,
            lock_duration_ms: 5 * 60_000,
            min_wait_ms: 50,
            max_wait_ms: 60_000,
            backoff_factor: 2.0,
            max_pool_size: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorState {
    Stopped,
    /// Acquisition task spawned but not yet polling.
    Starting,
    Running,
    Stopping,
}

/// Background job executor: polls the store for due jobs, locks them for
/// this node, and dispatches each into a bounded worker pool. Idle polling
/// backs off exponentially and snaps back to the minimum as soon as work
/// appears or the engine hints at new jobs.
pub struct JobExecutor {
    engine: Arc<ProcessEngine>,
    config: JobExecutorConfig,
    state: Arc<Mutex<ExecutorState>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobExecutor {
    pub fn new(engine: Arc<ProcessEngine>, config: JobExecutorConfig) -> Self {
        Self {
            engine,
            config,
            state: Arc::new(Mutex::new(ExecutorState::Stopped)),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.lock().expect("executor state lock poisoned")
    }

    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("executor state lock poisoned");
            if *state != ExecutorState::Stopped {
                return Err(EngineError::ProcessEngine(
                    "job executor already started".into(),
                ));
            }
            *state = ExecutorState::Starting;
        }
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(acquisition_loop(
            self.engine.clone(),
            self.config.clone(),
            self.state.clone(),
            rx,
        ));
        *self.shutdown.lock().expect("executor shutdown lock poisoned") = Some(tx);
        *self.handle.lock().expect("executor handle lock poisoned") = Some(handle);
        Ok(())
    }

    /// Graceful shutdown: stop acquiring, then wait for in-flight jobs.
    pub async fn shutdown(&self) {
        self.stop(true).await;
    }

    /// Stops acquiring without waiting for in-flight jobs. Locked jobs that
    /// were still running become re-acquirable once their locks expire.
    pub async fn shutdown_now(&self) {
        self.stop(false).await;
    }

    async fn stop(&self, graceful: bool) {
        let sender = self
            .shutdown
            .lock()
            .expect("executor shutdown lock poisoned")
            .take();
        let Some(sender) = sender else {
            return;
        };
        *self.state.lock().expect("executor state lock poisoned") = ExecutorState::Stopping;
        let _ = sender.send(true);
        let handle = self
            .handle
            .lock()
            .expect("executor handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if graceful {
                let _ = handle.await;
            } else {
                handle.abort();
                let _ = handle.await;
            }
        }
        *self.state.lock().expect("executor state lock poisoned") = ExecutorState::Stopped;
    }
}

fn next_wait(wait: Duration, factor: f64, max: Duration) -> Duration {
    wait.mul_f64(factor).min(max)
}

async fn acquisition_loop(
    engine: Arc<ProcessEngine>,
    config: JobExecutorConfig,
    state: Arc<Mutex<ExecutorState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let pool = Arc::new(Semaphore::new(config.max_pool_size));
    let min = Duration::from_millis(config.min_wait_ms);
    let max = Duration::from_millis(config.max_wait_ms);
    let mut wait = min;
    {
        // Shutdown may already have been requested; don't mask it.
        let mut state = state.lock().expect("executor state lock poisoned");
        if *state == ExecutorState::Starting {
            *state = ExecutorState::Running;
        }
    }
    info!(node = %config.node_id, "job executor started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = engine.job_notifier().notified() => {
                wait = min;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let now = engine.clock().now();
        let due = match engine
            .store()
            .due_jobs(now, config.max_jobs_per_acquisition)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "job acquisition query failed");
                wait = next_wait(wait, config.backoff_factor, max);
                continue;
            }
        };

        let until = now + chrono::Duration::milliseconds(config.lock_duration_ms as i64);
        let mut acquired = 0usize;
        for job in due {
            match engine
                .store()
                .try_lock_job(job.id, &config.node_id, now, until)
                .await
            {
                Ok(Some(locked)) => {
                    acquired += 1;
                    let Ok(permit) = pool.clone().acquire_owned().await else {
                        break;
                    };
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = engine.execute_job(locked.id).await {
                            warn!(job = %locked.id, error = %e, "job execution failed");
                            if let Err(e) = engine.fail_job(locked.id, &e.to_string()).await {
                                warn!(job = %locked.id, error = %e, "failure bookkeeping failed");
                            }
                        }
                    });
                }
                // Another node got there first.
                Ok(None) => {}
                Err(e) => warn!(job = %job.id, error = %e, "job lock failed"),
            }
        }

        wait = if acquired > 0 {
            min
        } else {
            next_wait(wait, config.backoff_factor, max)
        };
    }

    // Wait for in-flight jobs before reporting stopped.
    let _ = pool.acquire_many(config.max_pool_size as u32).await;
    info!(node = %config.node_id, "job executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::model::ProcessDefinition;
    use crate::test_support::test_engine;
    use std::collections::BTreeMap;

    fn fast_config() -> JobExecutorConfig {
        JobExecutorConfig {
            node_id: "test-node".into(),
            min_wait_ms: 5,
            max_wait_ms: 100,
            ..JobExecutorConfig::default()
        }
    }

    #[test]
    fn wait_backoff_doubles_and_caps() {
        let max = Duration::from_millis(100);
        let w1 = next_wait(Duration::from_millis(10), 2.0, max);
        assert_eq!(w1, Duration::from_millis(20));
        let w2 = next_wait(Duration::from_millis(80), 2.0, max);
        assert_eq!(w2, max);
    }

    #[tokio::test(start_paused = true)]
    async fn executes_due_jobs_in_background() -> anyhow::Result<()> {
        let (engine, _clock) = test_engine();
        let def = ProcessDefinition::builder("async-linear")
            .start_event("start")
            .service_task_async("work")
            .end_event("end")
            .flow("start", "work")
            .flow("work", "end")
            .build()?;
        engine.deploy(def);
        let instance_id = engine
            .start_instance("async-linear", BTreeMap::new())
            .await?;

        let executor = JobExecutor::new(engine.clone(), fast_config());
        executor.start()?;

        let mut completed = false;
        for _ in 0..500 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let tree = engine
                .instance(instance_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("instance disappeared"))?;
            if tree.state.is_terminal() {
                completed = true;
                break;
            }
        }
        executor.shutdown().await;
        assert!(completed, "instance should complete through the executor");
        assert!(engine.store().jobs_for_instance(instance_id).await?.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_states() {
        let (engine, _clock) = test_engine();
        let executor = JobExecutor::new(engine, fast_config());
        assert_eq!(executor.state(), ExecutorState::Stopped);
        executor.start().unwrap();
        assert_eq!(executor.state(), ExecutorState::Starting);
        // The acquisition task flips to running at its first poll.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(executor.state(), ExecutorState::Running);
        assert!(executor.start().is_err());
        executor.shutdown().await;
        assert_eq!(executor.state(), ExecutorState::Stopped);
        // Shutting down an already stopped executor is a no-op.
        executor.shutdown().await;
        // A stopped executor may be started again.
        executor.start().unwrap();
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn two_nodes_do_not_double_execute() {
        let (engine, clock) = test_engine();
        let job = crate::job::JobEntity::new("counting", serde_json::json!({}), clock.now());
        engine.store().insert_job(&job).await.unwrap();

        use std::sync::atomic::{AtomicUsize, Ordering};
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        struct Counting;
        #[async_trait::async_trait]
        impl crate::command::JobHandler for Counting {
            fn handler_type(&self) -> &'static str {
                "counting"
            }
            async fn execute(
                &self,
                _: &ProcessEngine,
                _: &crate::job::JobEntity,
            ) -> crate::error::Result<crate::command::JobOutcome> {
                RUNS.fetch_add(1, Ordering::SeqCst);
                Ok(crate::command::JobOutcome::Completed)
            }
        }
        engine.register_handler(Arc::new(Counting));

        let a = JobExecutor::new(
            engine.clone(),
            JobExecutorConfig {
                node_id: "node-a".into(),
                ..fast_config()
            },
        );
        let b = JobExecutor::new(
            engine.clone(),
            JobExecutorConfig {
                node_id: "node-b".into(),
                ..fast_config()
            },
        );
        a.start().unwrap();
        b.start().unwrap();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if engine.store().load_job(job.id).await.unwrap().is_none() {
                break;
            }
        }
        a.shutdown().await;
        b.shutdown().await;
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }
}

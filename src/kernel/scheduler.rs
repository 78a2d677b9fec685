//! Cooperative interval scheduler.
//!
//! Each registered task gets its own loop: an optional immediate run, then one
//! execution every `interval`, measured from the start of the previous
//! execution. Loops share nothing but the cancellation token, so a slow or
//! failing task never delays another one.
//!
//! Errors, panics and tick timeouts are recorded in the task's stats and
//! logged; the loop keeps its schedule. `stop()` cancels the loops and waits a
//! bounded time for them to observe it. In-flight work is never aborted.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::recovery::with_recovery_async;
use crate::types::{Error, Result, SchedulerConfig};

/// Zero-argument unit of work that may suspend.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Execution counters for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub runs: u64,
    pub failures: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct ScheduledTask {
    name: String,
    work: TaskFn,
    interval: Duration,
    run_immediately: bool,
    stats: Arc<Mutex<TaskStats>>,
    /// Set once the task's loop is spawned.
    cancel: Option<CancellationToken>,
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("run_immediately", &self.run_immediately)
            .finish_non_exhaustive()
    }
}

/// Interval scheduler. Single use: once stopped it cannot be restarted.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    token: CancellationToken,
    tasks: Mutex<BTreeMap<String, ScheduledTask>>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
    started: Mutex<bool>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            token: CancellationToken::new(),
            tasks: Mutex::new(BTreeMap::new()),
            handles: Mutex::new(Vec::new()),
            started: Mutex::new(false),
        }
    }

    /// Register `work` under `name`. Re-adding a name replaces the previous
    /// task; if the scheduler is already running the old loop is cancelled and
    /// the new one starts right away.
    pub fn add(
        &self,
        name: impl Into<String>,
        work: TaskFn,
        interval: Duration,
        run_immediately: bool,
    ) -> Result<()> {
        let name = name.into();
        crate::validation::validate_non_empty(&name, "task name")?;
        crate::validation::validate_non_zero_duration(interval, "task interval")?;

        let mut task = ScheduledTask {
            stats: Arc::new(Mutex::new(TaskStats {
                name: name.clone(),
                interval,
                ..TaskStats::default()
            })),
            name: name.clone(),
            work,
            interval,
            run_immediately,
            cancel: None,
        };

        // Hold `started` across the insert so a concurrent start() sees either
        // the task in the map or spawns nothing for it.
        let started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        if *started && !self.token.is_cancelled() {
            let cancel = self.token.child_token();
            let handle = self.spawn_loop(&task, cancel.clone());
            task.cancel = Some(cancel);
            self.handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((name.clone(), handle));
        }

        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), task);
        drop(started);

        if let Some(old) = previous {
            if let Some(cancel) = old.cancel {
                cancel.cancel();
            }
            tracing::debug!("task_replaced: name={}", name);
        } else {
            tracing::debug!("task_added: name={}, interval={:?}", name, interval);
        }
        Ok(())
    }

    /// Spawn one loop per task and block until [`Scheduler::stop`] is called.
    pub async fn start(&self) -> Result<()> {
        {
            let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
            if *started {
                return Err(Error::state_transition("scheduler already started"));
            }
            if self.token.is_cancelled() {
                return Err(Error::state_transition("scheduler already stopped"));
            }
            *started = true;

            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            for task in tasks.values_mut() {
                let cancel = self.token.child_token();
                handles.push((task.name.clone(), self.spawn_loop(task, cancel.clone())));
                task.cancel = Some(cancel);
            }
            tracing::info!("scheduler_started: tasks={}", tasks.len());
        }

        self.token.cancelled().await;
        Ok(())
    }

    /// Signal every loop and wait up to the configured stop timeout.
    pub async fn stop(&self) {
        self.token.cancel();

        let handles: Vec<_> = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if handles.is_empty() {
            return;
        }

        let (names, joins): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        match tokio::time::timeout(self.config.stop_timeout, join_all(joins)).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        tracing::error!("task_loop_join_failed: name={}, error={}", name, e);
                    }
                }
                tracing::info!("scheduler_stopped: tasks={}", names.len());
            }
            Err(_) => {
                // Dropping the handles detaches the loops; in-flight work finishes on its own.
                tracing::warn!(
                    "scheduler_stop_timeout: timeout={:?}, tasks={}",
                    self.config.stop_timeout,
                    names.len()
                );
            }
        }
    }

    /// Whether `start()` has run and `stop()` has not.
    pub fn is_running(&self) -> bool {
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) && !self.token.is_cancelled()
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of every task's counters, sorted by name.
    pub fn stats(&self) -> Vec<TaskStats> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|t| t.stats.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect()
    }

    fn spawn_loop(&self, task: &ScheduledTask, cancel: CancellationToken) -> JoinHandle<()> {
        let name = task.name.clone();
        let work = task.work.clone();
        let interval = task.interval;
        let run_immediately = task.run_immediately;
        let stats = task.stats.clone();
        let tick_timeout = self.config.tick_timeout;

        tokio::spawn(async move {
            let mut next = if run_immediately {
                Instant::now()
            } else {
                Instant::now() + interval
            };

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sleep_until(next) => {}
                }

                let started = Instant::now();
                let outcome =
                    match tokio::time::timeout(tick_timeout, with_recovery_async(work(), &name))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::timeout(format!(
                            "execution exceeded {:?}",
                            tick_timeout
                        ))),
                    };
                record(&stats, &name, outcome);

                next = started + interval;
            }
            tracing::debug!("task_loop_stopped: name={}", name);
        })
    }
}

fn record(stats: &Mutex<TaskStats>, name: &str, outcome: Result<()>) {
    let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
    stats.runs += 1;
    stats.last_run = Some(Utc::now());
    if let Err(e) = outcome {
        let err = Error::task_execution(name, e);
        tracing::error!("task_failed: {}", err);
        stats.failures += 1;
        stats.last_error = Some(err.to_string());
    }
}

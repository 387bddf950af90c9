// ── Sweep scheduler ──
//
// One lightweight worker per target, a shared semaphore bounding how many
// iterations are in flight at once. Worker count scales with the fleet
// (thousands of targets is fine); the gate bounds simultaneous device
// sessions doing network I/O. Cancellation is cooperative and observed
// only between iterations -- in-flight work always finishes and emits its
// result first.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::filter::project;
use crate::fleet::{FleetSession, SessionFactory};
use crate::script::Script;
use crate::task::{ExecMode, Task};

/// Per-target streams hold one iteration's result; a worker waits for the
/// consumer before producing the next.
const STREAM_DEPTH: usize = 1;

/// Scheduling knobs for one sweep.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// How many iterations may run concurrently past the gate.
    pub limit: usize,
    /// Fixed pause between successive commands within one iteration.
    pub delay: Option<Duration>,
    /// Repeat each worker's command list at this interval; `None` runs
    /// each target exactly once.
    pub loop_interval: Option<Duration>,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            limit: 25,
            delay: None,
            loop_interval: None,
        }
    }
}

/// One iteration's outcome for one target. Emitted once per loop turn,
/// streamed to the consumer, never retained.
#[derive(Debug)]
pub struct SweepResult {
    pub target: String,
    pub outcome: Result<Vec<Value>, CoreError>,
}

/// The fleet-wide scheduler.
///
/// [`push`](Self::push) registers one worker per target and returns that
/// target's result stream. [`cancel`](Self::cancel) asks looping workers
/// to stop after their current iteration; [`close`](Self::close) joins
/// everything. Results arrive in completion order across targets; within
/// one target, commands run strictly in declaration order.
pub struct TaskPool<F: SessionFactory> {
    factory: Arc<F>,
    gate: Arc<Semaphore>,
    delay: Option<Duration>,
    loop_interval: Option<Duration>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl<F: SessionFactory> TaskPool<F> {
    pub fn new(factory: F, options: SweepOptions) -> Self {
        Self {
            factory: Arc::new(factory),
            gate: Arc::new(Semaphore::new(options.limit.max(1))),
            delay: options.delay,
            loop_interval: options.loop_interval,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the worker for one target and return its result stream.
    ///
    /// The task list is shared read-only across workers; the session is
    /// exclusively owned by the spawned worker.
    pub fn push(
        &self,
        target: impl Into<String>,
        tasks: Arc<[Task]>,
        script: Option<Arc<dyn Script>>,
    ) -> ReceiverStream<SweepResult> {
        let target = target.into();
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);

        match self.factory.session(&target) {
            Ok(session) => {
                self.tracker.spawn(run_worker(
                    session,
                    target,
                    tasks,
                    script,
                    Arc::clone(&self.gate),
                    self.cancel.clone(),
                    self.delay,
                    self.loop_interval,
                    tx,
                ));
            }
            Err(e) => {
                // Session construction is pure setup; a failure here is
                // the worker's one and only result.
                let _ = tx.try_send(SweepResult {
                    target,
                    outcome: Err(e.into()),
                });
            }
        }
        ReceiverStream::new(rx)
    }

    /// Ask looping workers to stop after their current iteration.
    /// In-flight iterations always finish and emit their result.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Join every worker. After this returns, all per-target streams have
    /// emitted their final value and draining them never blocks.
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker<S: FleetSession + Send + 'static>(
    mut session: S,
    target: String,
    tasks: Arc<[Task]>,
    script: Option<Arc<dyn Script>>,
    gate: Arc<Semaphore>,
    cancel: CancellationToken,
    delay: Option<Duration>,
    loop_interval: Option<Duration>,
    tx: mpsc::Sender<SweepResult>,
) {
    // One dial per worker; iterations reuse the session and the session
    // itself refreshes stale credentials at the dial boundary.
    if let Err(e) = session.dial().await {
        let _ = tx
            .send(SweepResult {
                target: target.clone(),
                outcome: Err(e.into()),
            })
            .await;
        if let Err(e) = session.close().await {
            debug!(target = %target, error = %e, "close after failed dial");
        }
        return;
    }

    loop {
        let (outcome, stop) = {
            let Ok(_permit) = gate.acquire().await else {
                break;
            };
            match run_iteration(&mut session, &tasks, script.as_deref(), delay).await {
                Ok((payload, script_stop)) => (Ok(payload), script_stop),
                Err(e) => {
                    let fatal = e.is_auth_fatal();
                    (Err(e), fatal)
                }
            }
            // Permit drops here -- never wait on the consumer while
            // holding a slot of the gate.
        };

        let delivered = tx
            .send(SweepResult {
                target: target.clone(),
                outcome,
            })
            .await
            .is_ok();
        if !delivered || stop {
            break;
        }
        let Some(interval) = loop_interval else { break };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }

    if let Err(e) = session.close().await {
        warn!(target = %target, error = %e, "session close failed");
    }
}

/// Run the full command list once, in declaration order, then hand the
/// collected step results to the script collaborator if one is attached.
async fn run_iteration<S: FleetSession>(
    session: &mut S,
    tasks: &[Task],
    script: Option<&dyn Script>,
    delay: Option<Duration>,
) -> Result<(Vec<Value>, bool), CoreError> {
    let mut payload = Vec::with_capacity(tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        if i > 0 {
            if let Some(pause) = delay {
                tokio::time::sleep(pause).await;
            }
        }
        payload.push(run_task(session, task).await?);
    }
    if let Some(script) = script {
        let (post, stop) = script.run(session, &payload).await?;
        return Ok((vec![post], stop));
    }
    Ok((payload, false))
}

async fn run_task<S: FleetSession>(session: &mut S, task: &Task) -> Result<Value, CoreError> {
    let mut value = match task.mode {
        ExecMode::Api => {
            let raw = session.show(&task.command).await?;
            match &task.filter {
                Some(chain) => chain.eval(raw)?,
                None => raw,
            }
        }
        ExecMode::Shell => {
            let line = task.shell_command_line()?;
            Value::String(session.exec_shell(&line, None).await?)
        }
    };
    if let Some(attrs) = &task.attrs {
        let lines = project(&value, Some(attrs))?;
        value = Value::Array(lines.into_iter().map(Value::String).collect());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::future::BoxFuture;
    use serde_json::json;
    use tokio_stream::StreamExt;

    use crate::fleet::SessionApi;
    use mdsweep_api::Error as ApiError;

    #[derive(Clone, Default)]
    struct FakeFactory {
        fail_dial: bool,
        fail_show: Option<&'static str>, // "auth" | "protocol"
        show_delay: Option<Duration>,
        running: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
        commands: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicUsize>,
    }

    struct FakeSession {
        target: String,
        shared: FakeFactory,
    }

    impl SessionFactory for FakeFactory {
        type Session = FakeSession;

        fn session(&self, target: &str) -> Result<FakeSession, ApiError> {
            Ok(FakeSession {
                target: target.to_owned(),
                shared: self.clone(),
            })
        }
    }

    impl SessionApi for FakeSession {
        fn target(&self) -> &str {
            &self.target
        }

        fn api_get<'a>(
            &'a mut self,
            _cfg_path: &'a str,
            _endpoint: &'a str,
            _params: Vec<(String, String)>,
        ) -> BoxFuture<'a, Result<Value, ApiError>> {
            Box::pin(async { Ok(Value::Null) })
        }

        fn api_post<'a>(
            &'a mut self,
            _cfg_path: &'a str,
            _endpoint: &'a str,
            _body: Option<Value>,
        ) -> BoxFuture<'a, Result<Value, ApiError>> {
            Box::pin(async { Ok(Value::Null) })
        }
    }

    impl FleetSession for FakeSession {
        async fn dial(&mut self) -> Result<(), ApiError> {
            if self.shared.fail_dial {
                return Err(ApiError::Authentication {
                    message: "bad credentials".into(),
                });
            }
            Ok(())
        }

        async fn show(&mut self, command: &str) -> Result<Value, ApiError> {
            let now = self.shared.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.shared.max_seen.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.shared.show_delay {
                tokio::time::sleep(delay).await;
            }
            self.shared.running.fetch_sub(1, Ordering::SeqCst);
            self.shared
                .commands
                .lock()
                .expect("lock")
                .push(format!("{}:{command}", self.target));
            match self.shared.fail_show {
                Some("auth") => Err(ApiError::Authentication {
                    message: "session revoked".into(),
                }),
                Some(_) => Err(ApiError::Protocol {
                    status: 500,
                    message: "flaky device".into(),
                }),
                None => Ok(json!({"_data": [format!("output of {command}")]})),
            }
        }

        async fn exec_shell(
            &mut self,
            command_line: &str,
            _stdin: Option<&str>,
        ) -> Result<String, ApiError> {
            Ok(format!("shell: {command_line}"))
        }

        async fn close(&mut self) -> Result<(), ApiError> {
            self.shared.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn tasks(specs: &[&str]) -> Arc<[Task]> {
        specs
            .iter()
            .map(|s| Task::new(*s, None, None, ExecMode::Api).expect("task"))
            .collect::<Vec<_>>()
            .into()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gate_bounds_concurrent_iterations() {
        let factory = FakeFactory {
            show_delay: Some(Duration::from_millis(20)),
            ..FakeFactory::default()
        };
        let max_seen = Arc::clone(&factory.max_seen);
        let pool = TaskPool::new(
            factory,
            SweepOptions {
                limit: 2,
                ..SweepOptions::default()
            },
        );

        let list = tasks(&["show version"]);
        let streams: Vec<_> = (0..8)
            .map(|i| pool.push(format!("10.0.0.{i}"), Arc::clone(&list), None))
            .collect();
        pool.close().await;

        let mut results = 0;
        for mut stream in streams {
            while let Some(result) = stream.next().await {
                assert!(result.outcome.is_ok());
                results += 1;
            }
        }
        assert_eq!(results, 8);
        assert!(
            max_seen.load(Ordering::SeqCst) <= 2,
            "more than 2 iterations ran concurrently"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_dial_emits_exactly_one_error_result() {
        let factory = FakeFactory {
            fail_dial: true,
            ..FakeFactory::default()
        };
        let closed = Arc::clone(&factory.closed);
        let pool = TaskPool::new(factory, SweepOptions::default());

        let mut stream = pool.push("10.0.0.1", tasks(&["show version"]), None);
        pool.close().await;

        let first = stream.next().await.expect("one result");
        assert_eq!(first.target, "10.0.0.1");
        assert!(matches!(
            first.outcome,
            Err(CoreError::Session(ApiError::Authentication { .. }))
        ));
        assert!(stream.next().await.is_none(), "stream must close after the error");
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commands_run_in_declaration_order() {
        let factory = FakeFactory::default();
        let commands = Arc::clone(&factory.commands);
        let pool = TaskPool::new(factory, SweepOptions::default());

        let mut stream = pool.push(
            "10.0.0.1",
            tasks(&["show version", "show clock", "show switches"]),
            None,
        );
        pool.close().await;

        let result = stream.next().await.expect("result");
        let payload = result.outcome.expect("payload");
        assert_eq!(payload.len(), 3);
        assert_eq!(
            *commands.lock().expect("lock"),
            vec![
                "10.0.0.1:show version",
                "10.0.0.1:show clock",
                "10.0.0.1:show switches"
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_joins_workers_and_streams_never_block() {
        let factory = FakeFactory::default();
        let pool = TaskPool::new(factory, SweepOptions::default());

        let list = tasks(&["show version"]);
        let streams: Vec<_> = (0..4)
            .map(|i| pool.push(format!("10.0.0.{i}"), Arc::clone(&list), None))
            .collect();
        pool.close().await;

        // Everything already terminated; draining must complete instantly.
        let drain = async {
            let mut total = 0;
            for mut stream in streams {
                while stream.next().await.is_some() {
                    total += 1;
                }
            }
            total
        };
        let total = tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .expect("draining blocked after close");
        assert_eq!(total, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_stops_looping_workers_between_iterations() {
        let factory = FakeFactory::default();
        let pool = Arc::new(TaskPool::new(
            factory,
            SweepOptions {
                loop_interval: Some(Duration::from_millis(5)),
                ..SweepOptions::default()
            },
        ));

        let list = tasks(&["show version"]);
        let mut consumers = Vec::new();
        for i in 0..3 {
            let mut stream = pool.push(format!("10.0.0.{i}"), Arc::clone(&list), None);
            consumers.push(tokio::spawn(async move {
                let mut seen = 0;
                while let Some(result) = stream.next().await {
                    assert!(result.outcome.is_ok());
                    seen += 1;
                }
                seen
            }));
        }

        tokio::time::sleep(Duration::from_millis(40)).await;
        pool.cancel();
        pool.close().await;

        for consumer in consumers {
            let seen = consumer.await.expect("consumer");
            assert!(seen >= 1, "each target reports at least one iteration");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auth_fatal_failure_ends_a_looping_worker() {
        let factory = FakeFactory {
            fail_show: Some("auth"),
            ..FakeFactory::default()
        };
        let pool = TaskPool::new(
            factory,
            SweepOptions {
                loop_interval: Some(Duration::from_secs(3600)),
                ..SweepOptions::default()
            },
        );

        let mut stream = pool.push("10.0.0.1", tasks(&["show version"]), None);
        // Close returns promptly because the worker gives up instead of
        // sleeping out the hour-long interval.
        tokio::time::timeout(Duration::from_secs(1), pool.close())
            .await
            .expect("close blocked on an auth-dead worker");

        let first = stream.next().await.expect("error result");
        assert!(first.outcome.is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_fatal_failures_keep_a_looping_worker_alive() {
        let factory = FakeFactory {
            fail_show: Some("protocol"),
            ..FakeFactory::default()
        };
        let pool = Arc::new(TaskPool::new(
            factory,
            SweepOptions {
                loop_interval: Some(Duration::from_millis(5)),
                ..SweepOptions::default()
            },
        ));

        let mut stream = pool.push("10.0.0.1", tasks(&["show version"]), None);
        let consumer = tokio::spawn(async move {
            let mut errors = 0;
            while let Some(result) = stream.next().await {
                assert!(result.outcome.is_err());
                errors += 1;
            }
            errors
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        pool.cancel();
        pool.close().await;

        let errors = consumer.await.expect("consumer");
        assert!(errors >= 2, "worker should have retried, saw {errors}");
    }

    struct StopScript;

    impl Script for StopScript {
        fn run<'a>(
            &'a self,
            _session: &'a mut dyn SessionApi,
            steps: &'a [Value],
        ) -> BoxFuture<'a, Result<(Value, bool), CoreError>> {
            Box::pin(async move { Ok((json!({"steps": steps.len()}), true)) })
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn script_replaces_payload_and_can_stop_the_loop() {
        let factory = FakeFactory::default();
        let pool = TaskPool::new(
            factory,
            SweepOptions {
                loop_interval: Some(Duration::from_secs(3600)),
                ..SweepOptions::default()
            },
        );

        let mut stream = pool.push(
            "10.0.0.1",
            tasks(&["show version", "show clock"]),
            Some(Arc::new(StopScript)),
        );
        tokio::time::timeout(Duration::from_secs(1), pool.close())
            .await
            .expect("close blocked despite script stop request");

        let result = stream.next().await.expect("result");
        let payload = result.outcome.expect("payload");
        assert_eq!(payload, vec![json!({"steps": 2})]);
        assert!(stream.next().await.is_none());
    }
}

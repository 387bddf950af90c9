// ── Scripting collaborator seam ──
//
// Post-processing of fetched step results is delegated to an external
// engine behind the `Script` trait; the core never sees the runtime's
// internals. Engines are usually single-threaded per invocation, so
// `ScriptSet` keeps a fixed set of execution contexts behind a counting
// gate and loans them out one worker at a time.

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};

use crate::error::CoreError;
use crate::fleet::SessionApi;

/// Post-processes one iteration's fetched results.
///
/// Returns the replacement result value and whether the worker should
/// stop looping. Implementations may call back into the session.
pub trait Script: Send + Sync {
    fn run<'a>(
        &'a self,
        session: &'a mut dyn SessionApi,
        steps: &'a [Value],
    ) -> BoxFuture<'a, Result<(Value, bool), CoreError>>;
}

/// One execution context of the external engine. Contexts are stateful
/// and must never run two invocations at once.
pub trait ScriptContext: Send {
    fn run<'a>(
        &'a mut self,
        session: &'a mut dyn SessionApi,
        steps: &'a [Value],
    ) -> BoxFuture<'a, Result<(Value, bool), CoreError>>;
}

/// A fixed pool of script contexts loaned out under a counting gate.
///
/// `Script` is implemented by borrowing a free context for the duration
/// of one invocation, so any number of workers can share one `ScriptSet`
/// while each context stays single-threaded.
pub struct ScriptSet {
    contexts: Mutex<Vec<Box<dyn ScriptContext>>>,
    gate: Semaphore,
}

impl ScriptSet {
    /// Build a pool from pre-created contexts. At least one is required.
    pub fn new(contexts: Vec<Box<dyn ScriptContext>>) -> Result<Self, CoreError> {
        if contexts.is_empty() {
            return Err(CoreError::Script {
                message: "script pool needs at least one execution context".into(),
            });
        }
        let gate = Semaphore::new(contexts.len());
        Ok(Self {
            contexts: Mutex::new(contexts),
            gate,
        })
    }
}

impl Script for ScriptSet {
    fn run<'a>(
        &'a self,
        session: &'a mut dyn SessionApi,
        steps: &'a [Value],
    ) -> BoxFuture<'a, Result<(Value, bool), CoreError>> {
        Box::pin(async move {
            let _permit = self.gate.acquire().await.map_err(|_| CoreError::Script {
                message: "script pool closed".into(),
            })?;
            let mut context = {
                let mut free = self.contexts.lock().await;
                free.pop().ok_or_else(|| CoreError::Script {
                    message: "no free script context despite permit".into(),
                })?
            };
            let result = context.run(session, steps).await;
            self.contexts.lock().await.push(context);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSession;

    impl SessionApi for NullSession {
        fn target(&self) -> &str {
            "test"
        }

        fn api_get<'a>(
            &'a mut self,
            _cfg_path: &'a str,
            _endpoint: &'a str,
            _params: Vec<(String, String)>,
        ) -> BoxFuture<'a, Result<Value, mdsweep_api::Error>> {
            Box::pin(async { Ok(Value::Null) })
        }

        fn api_post<'a>(
            &'a mut self,
            _cfg_path: &'a str,
            _endpoint: &'a str,
            _body: Option<Value>,
        ) -> BoxFuture<'a, Result<Value, mdsweep_api::Error>> {
            Box::pin(async { Ok(Value::Null) })
        }
    }

    /// Records how many invocations overlap.
    struct TracingContext {
        running: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    impl ScriptContext for TracingContext {
        fn run<'a>(
            &'a mut self,
            _session: &'a mut dyn SessionApi,
            steps: &'a [Value],
        ) -> BoxFuture<'a, Result<(Value, bool), CoreError>> {
            Box::pin(async move {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok((Value::Array(steps.to_vec()), false))
            })
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pool_never_exceeds_context_count() {
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let contexts: Vec<Box<dyn ScriptContext>> = (0..2)
            .map(|_| {
                Box::new(TracingContext {
                    running: Arc::clone(&running),
                    max_seen: Arc::clone(&max_seen),
                }) as Box<dyn ScriptContext>
            })
            .collect();
        let set = Arc::new(ScriptSet::new(contexts).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let set = Arc::clone(&set);
            handles.push(tokio::spawn(async move {
                let mut session = NullSession;
                set.run(&mut session, &[Value::Null]).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(
            ScriptSet::new(Vec::new()),
            Err(CoreError::Script { .. })
        ));
    }
}

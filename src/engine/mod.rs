//! `ExpressionEngine` trait: sandboxed evaluation over a capability whitelist.
//!
//! Two backends implement it: [`rhai::RhaiEngine`] (fixed-arity overloads
//! synthesized per capability) and [`jinja::JinjaEngine`] (native variadic
//! functions). Both compile and run inside one detached blocking task raced
//! against the caller's timeout.

pub mod jinja;
pub mod rhai;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::capability::registry::EvaluationGuard;
use crate::error::EngineError;

/// Largest argument count a capability can be called with.
///
/// The overloaded backend registers one overload per arity `0..=MAX_CAPABILITY_ARGS`;
/// calls with more arguments fail to compile in both backends.
pub const MAX_CAPABILITY_ARGS: usize = 8;

/// Environment bindings of one evaluation request.
pub type Env = Map<String, Value>;

#[async_trait]
pub trait ExpressionEngine: Send + Sync {
    /// Short language tag, used in logs (`"rhai"`, `"jinja"`).
    fn language(&self) -> &'static str;

    /// Compiles `expression` against the whitelist plus the names in `env`,
    /// then runs it with `env` bound.
    ///
    /// Returns [`EngineError::DeadlineExceeded`] once `timeout` elapses, even
    /// if the evaluation itself is still running.
    async fn execute(
        &self,
        timeout: Duration,
        expression: &str,
        env: &Env,
    ) -> Result<Value, EngineError>;
}

/// Sets the abandonment flag when dropped.
///
/// Dropped on every exit path of [`run_detached`]: completion, deadline, or
/// the caller's future being cancelled.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Runs `job` on a blocking thread and waits at most `timeout` for it.
///
/// The job cannot be preempted. On timeout it is detached: it keeps running
/// until it returns, but capability calls it starts afterwards are refused
/// and its result is dropped.
pub(crate) async fn run_detached<F>(timeout: Duration, job: F) -> Result<Value, EngineError>
where
    F: FnOnce() -> Result<Value, EngineError> + Send + 'static,
{
    let abandoned = Arc::new(AtomicBool::new(false));
    let _abandon = AbandonOnDrop(abandoned.clone());

    let task = tokio::task::spawn_blocking(move || {
        let _guard = EvaluationGuard::enter(abandoned);
        job()
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(EngineError::Execution(format!("evaluation task failed: {e}"))),
        Err(_) => {
            warn!("evaluation exceeded {timeout:?}, detaching");
            Err(EngineError::DeadlineExceeded(timeout))
        }
    }
}

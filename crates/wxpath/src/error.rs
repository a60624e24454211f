use std::collections::BTreeMap;
use std::future::Future;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::value::Value;

/// Error taxonomy of the evaluator. `Syntax` and `Dispatch` abort an
/// evaluation; the remaining kinds are per-branch and subject to the
/// active [`ErrorPolicy`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("no operator registered for segment: {0}")]
    Dispatch(String),

    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("could not parse a document out of {url}")]
    Parse { url: String },

    #[error("xpath error in `{expr}`: {reason}")]
    Xpath { expr: String, reason: String },
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Syntax(_) | Error::Dispatch(_))
    }
}

/// What to do with a per-branch XPath runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Swallow completely.
    Ignore,
    /// Log at error level, then drop the branch.
    Log,
    /// Turn the error into a `{_error, _ctx}` map yielded downstream.
    Collect,
    /// Propagate, ending the evaluation.
    Raise,
}

static DEFAULT_POLICY: Lazy<RwLock<ErrorPolicy>> = Lazy::new(|| RwLock::new(ErrorPolicy::Log));

tokio::task_local! {
    static SCOPED_POLICY: ErrorPolicy;
}

/// Replace the process-wide default policy.
pub fn set_default_error_policy(policy: ErrorPolicy) {
    *DEFAULT_POLICY.write().unwrap() = policy;
}

/// The policy in effect for the current task: the innermost
/// [`with_error_policy`] scope, or the process default.
pub fn current_error_policy() -> ErrorPolicy {
    SCOPED_POLICY
        .try_with(|p| *p)
        .unwrap_or_else(|_| *DEFAULT_POLICY.read().unwrap())
}

/// Run `fut` with `policy` as the task-local error policy. The previous
/// policy is restored when the future completes or is dropped.
pub async fn with_error_policy<F>(policy: ErrorPolicy, fut: F) -> F::Output
where
    F: Future,
{
    SCOPED_POLICY.scope(policy, fut).await
}

/// Apply the given policy to a per-branch error. Returns `Ok(None)` when the
/// branch should be dropped, `Ok(Some(value))` when the error is collected
/// into the output stream, and `Err` when it must propagate.
pub fn apply_policy(
    err: Error,
    policy: ErrorPolicy,
    ctx: BTreeMap<String, Value>,
) -> Result<Option<Value>, Error> {
    match policy {
        ErrorPolicy::Ignore => Ok(None),
        ErrorPolicy::Log => {
            log::error!("processing error: {err} ({ctx:?})");
            Ok(None)
        }
        ErrorPolicy::Collect => {
            let mut map = BTreeMap::new();
            map.insert("_error".to_string(), Value::from(err.to_string()));
            map.insert("_ctx".to_string(), Value::Map(ctx));
            Ok(Some(Value::Map(map)))
        }
        ErrorPolicy::Raise => Err(err),
    }
}

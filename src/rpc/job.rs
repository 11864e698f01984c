//! Two-hop job calls: submit, then block on `core.job_wait`.
//!
//! Long-running daemon methods (pool creation, installs, replication) return
//! a job handle instead of their result. [`run`] hides that: it submits the
//! call, waits on the handle and returns the job's final result as if the
//! original call had produced it.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::error::RpcError;
use super::service::RpcService;

pub const JOB_WAIT: &str = "core.job_wait";

/// Opaque job handle returned by job-backed methods.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle(Value);

impl JobHandle {
    pub fn new(value: Value) -> Result<Self, RpcError> {
        if value.is_null() {
            return Err(RpcError::decode("job handle", "submit returned null"));
        }
        Ok(Self(value))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deadlines for the two hops of a job call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTimeouts {
    pub submit: Option<Duration>,
    pub wait: Option<Duration>,
}

/// Issue `method` and return the job handle it yields.
pub async fn submit<S: RpcService>(
    service: &S,
    method: &str,
    params: Vec<Value>,
    timeout: Option<Duration>,
) -> Result<JobHandle, RpcError> {
    let handle = JobHandle::new(service.call_raw(method, params, timeout).await?)?;
    debug!(method, job_id = %handle, "Job submitted");
    Ok(handle)
}

/// Block until the job finishes and return its result.
pub async fn wait<S: RpcService>(
    service: &S,
    handle: &JobHandle,
    timeout: Option<Duration>,
) -> Result<Value, RpcError> {
    debug!(job_id = %handle, "Waiting for job to complete");
    service
        .call_raw(JOB_WAIT, vec![handle.as_value().clone()], timeout)
        .await
}

/// Submit `method` and wait for its job. No wait is issued if the submit fails.
pub async fn run<S: RpcService>(
    service: &S,
    method: &str,
    params: Vec<Value>,
    timeouts: JobTimeouts,
) -> Result<Value, RpcError> {
    let handle = submit(service, method, params, timeouts.submit).await?;
    wait(service, &handle, timeouts.wait).await
}

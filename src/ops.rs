// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! Long-running operation tracking, cancellation and metric polling.
use crate::exec::OP_CANCEL;
use crate::manager::VmManager;
use crate::types::*;
use crate::vmerr;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Bounded history per VM; the oldest sample drops on overflow.
pub const METRIC_RING_CAPACITY: usize = 300;

const METRIC_INTERVAL_MIN: Duration = Duration::from_secs(1);
const METRIC_INTERVAL_MAX: Duration = Duration::from_secs(300);

/// Ticks tolerated before a poll loop gives up: either consecutive
/// sampling errors or consecutive non-running observations.
const METRIC_STRIKE_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OpState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

struct OperationInner {
    state: OpState,
    result: Option<Value>,
    error: Option<VmError>,
}

struct Operation {
    id: String,
    tool_name: String,
    started_at_ms: u64,
    cancel: CancellationToken,
    inner: Mutex<OperationInner>,
}

impl Operation {
    fn snapshot(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let mut v = json!({
            "operation_id": self.id,
            "tool": self.tool_name,
            "started_at_ms": self.started_at_ms,
            "state": inner.state,
        });
        if let Some(r) = &inner.result {
            v["result"] = r.clone();
        }
        if let Some(e) = &inner.error {
            v["error"] = e.to_envelope();
        }
        v
    }

    fn transition(&self, state: OpState, result: Option<Value>, error: Option<VmError>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = state;
        inner.result = result;
        inner.error = error;
    }
}

struct MetricLoop {
    cancel: CancellationToken,
    ring: Arc<Mutex<VecDeque<MetricSample>>>,
    subscribers: Mutex<u32>,
    /// Set when the loop exits on repeated sampling errors.
    failure: Arc<Mutex<Option<VmError>>>,
}

/// Tracks long-running operations on a bounded worker pool and owns the
/// per-VM metric poll loops.
pub struct Coordinator {
    manager: Arc<VmManager>,
    pool: Arc<Semaphore>,
    counter: AtomicU64,
    ops: Mutex<HashMap<String, Arc<Operation>>>,
    metric_loops: Mutex<HashMap<String, Arc<MetricLoop>>>,
    default_metric_interval: Duration,
}

impl Coordinator {
    pub fn new(
        manager: Arc<VmManager>,
        pool_size: usize,
        default_metric_interval: Duration,
    ) -> Self {
        Self {
            manager,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            counter: AtomicU64::new(0),
            ops: Mutex::new(HashMap::new()),
            metric_loops: Mutex::new(HashMap::new()),
            default_metric_interval,
        }
    }

    // ---- operations -----------------------------------------------------

    /// Registers the operation, queues the work on the pool and returns a
    /// handle immediately. Per-VM serialization stays with the manager's
    /// locks; the pool only bounds overall parallelism.
    pub async fn start(
        &self,
        tool_name: String,
        fut: Pin<Box<dyn Future<Output = VmResult<Value>> + Send>>,
    ) -> VmResult<Value> {
        let id = format!("op-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        let op = Arc::new(Operation {
            id: id.clone(),
            tool_name: tool_name.clone(),
            started_at_ms: now_ms(),
            cancel: CancellationToken::new(),
            inner: Mutex::new(OperationInner {
                state: OpState::Pending,
                result: None,
                error: None,
            }),
        });
        self.ops.lock().unwrap().insert(id.clone(), op.clone());

        let pool = self.pool.clone();
        let task_op = op.clone();
        tokio::spawn(async move {
            let token = task_op.cancel.clone();
            // Waiting for a pool slot is a suspension point too.
            let _permit = tokio::select! {
                _ = token.cancelled() => {
                    task_op.transition(
                        OpState::Cancelled,
                        None,
                        Some(vmerr!(@e Cancelled,
                            "operation cancelled before it started")),
                    );
                    return;
                }
                permit = pool.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => {
                        task_op.transition(
                            OpState::Failed,
                            None,
                            Some(VmError::internal("worker pool closed")),
                        );
                        return;
                    }
                },
            };
            task_op.transition(OpState::Running, None, None);
            log::info!(
                "operation {} ({}) running",
                task_op.id,
                task_op.tool_name
            );
            let mut scoped = std::pin::pin!(OP_CANCEL.scope(token.clone(), fut));
            let result = tokio::select! {
                r = &mut scoped => r,
                _ = token.cancelled() => {
                    // Give the handler the kill-grace window to observe the
                    // signal and unwind; a handler stuck past that is
                    // abandoned so the operation still reaches a terminal
                    // state in bounded time.
                    match tokio::time::timeout(
                        crate::exec::KILL_GRACE + Duration::from_millis(500),
                        &mut scoped,
                    )
                    .await
                    {
                        Ok(r) => r,
                        Err(_) => Err(vmerr!(@e Cancelled,
                            "operation abandoned after cancellation")),
                    }
                }
            };
            let outcome = match result {
                _ if token.is_cancelled() => {
                    // The side effects of work that finished despite the
                    // signal stay; the operation still reports cancelled.
                    task_op.transition(
                        OpState::Cancelled,
                        None,
                        Some(vmerr!(@e Cancelled, "operation cancelled")),
                    );
                    "cancelled"
                }
                Ok(v) => {
                    task_op.transition(OpState::Succeeded, Some(v), None);
                    "succeeded"
                }
                Err(e) if e.kind == ErrorKind::Cancelled => {
                    task_op.transition(OpState::Cancelled, None, Some(e));
                    "cancelled"
                }
                Err(e) => {
                    task_op.transition(OpState::Failed, None, Some(e));
                    "failed"
                }
            };
            log::info!(
                "operation {} ({}) {}",
                task_op.id,
                task_op.tool_name,
                outcome
            );
        });

        Ok(json!({
            "operation_id": id,
            "tool": tool_name,
            "state": OpState::Pending,
        }))
    }

    pub fn get(&self, operation_id: &str) -> VmResult<Value> {
        self.ops
            .lock()
            .unwrap()
            .get(operation_id)
            .map(|op| op.snapshot())
            .ok_or_else(|| {
                vmerr!(@e InvalidArguments,
                    "unknown operation {:?}", operation_id)
            })
    }

    pub fn list(&self) -> Vec<Value> {
        let ops = self.ops.lock().unwrap();
        let mut v: Vec<Value> = ops.values().map(|op| op.snapshot()).collect();
        v.sort_by_key(|o| {
            o["started_at_ms"].as_u64().unwrap_or(0)
        });
        v
    }

    /// Best effort: signals the operation; returns whether a non-terminal
    /// operation observed the signal.
    pub fn cancel(&self, operation_id: &str) -> VmResult<bool> {
        let ops = self.ops.lock().unwrap();
        let Some(op) = ops.get(operation_id) else {
            return vmerr!(
                InvalidArguments,
                "unknown operation {:?}",
                operation_id
            );
        };
        if op.inner.lock().unwrap().state.is_terminal() {
            return Ok(false);
        }
        op.cancel.cancel();
        Ok(true)
    }

    // ---- metrics --------------------------------------------------------

    /// Starts (or joins) the poll loop for a VM.
    pub async fn metrics_start(
        &self,
        vm_id: &str,
        interval: Option<Duration>,
    ) -> VmResult<()> {
        let interval = interval
            .unwrap_or(self.default_metric_interval)
            .clamp(METRIC_INTERVAL_MIN, METRIC_INTERVAL_MAX);
        {
            let loops = self.metric_loops.lock().unwrap();
            if let Some(l) = loops.get(vm_id) {
                *l.subscribers.lock().unwrap() += 1;
                return Ok(());
            }
        }
        // Metric collection must be enabled before the first query.
        self.manager
            .setup_metrics(vm_id, interval.as_secs() as u32)
            .await?;

        let ml = Arc::new(MetricLoop {
            cancel: CancellationToken::new(),
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(
                METRIC_RING_CAPACITY,
            ))),
            subscribers: Mutex::new(1),
            failure: Arc::new(Mutex::new(None)),
        });
        self.metric_loops
            .lock()
            .unwrap()
            .insert(vm_id.to_string(), ml.clone());

        let manager = self.manager.clone();
        let vm = vm_id.to_string();
        let ring = ml.ring.clone();
        let failure = ml.failure.clone();
        let token = ml.cancel.clone();
        tokio::spawn(async move {
            let mut error_strikes = 0u32;
            let mut idle_strikes = 0u32;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match manager.sample_metrics(&vm).await {
                    Ok(sample) => {
                        error_strikes = 0;
                        let mut ring = ring.lock().unwrap();
                        if ring.len() == METRIC_RING_CAPACITY {
                            ring.pop_front();
                        }
                        ring.push_back(sample);
                    }
                    Err(e) => {
                        error_strikes += 1;
                        log::warn!(
                            "metric sample for {} failed ({}/{}): {}",
                            vm,
                            error_strikes,
                            METRIC_STRIKE_LIMIT,
                            e
                        );
                        if error_strikes >= METRIC_STRIKE_LIMIT {
                            *failure.lock().unwrap() = Some(e);
                            break;
                        }
                        continue;
                    }
                }
                match manager.backend().vm_state(&vm).await {
                    Ok(s) if !s.is_running() => {
                        idle_strikes += 1;
                        if idle_strikes >= METRIC_STRIKE_LIMIT {
                            log::info!(
                                "metric loop for {} stopping: VM stayed {}",
                                vm,
                                s
                            );
                            break;
                        }
                    }
                    Ok(_) => idle_strikes = 0,
                    Err(_) => {}
                }
            }
        });
        Ok(())
    }

    /// Drops one subscription; the loop dies with the last subscriber.
    pub fn metrics_stop(&self, vm_id: &str) -> VmResult<bool> {
        let mut loops = self.metric_loops.lock().unwrap();
        let Some(l) = loops.get(vm_id) else {
            return Ok(false);
        };
        let mut subs = l.subscribers.lock().unwrap();
        *subs = subs.saturating_sub(1);
        if *subs == 0 {
            l.cancel.cancel();
            drop(subs);
            loops.remove(vm_id);
        }
        Ok(true)
    }

    /// Readers get a copy of the ring; the loop keeps sole write access.
    pub fn metrics_read(&self, vm_id: &str) -> VmResult<Vec<MetricSample>> {
        let loops = self.metric_loops.lock().unwrap();
        let Some(l) = loops.get(vm_id) else {
            return vmerr!(
                InvalidArguments,
                "no metric subscription for VM {:?}",
                vm_id
            );
        };
        if let Some(e) = l.failure.lock().unwrap().clone() {
            return Err(e);
        }
        let samples = l.ring.lock().unwrap().iter().cloned().collect();
        Ok(samples)
    }

    // ---- shutdown -------------------------------------------------------

    /// Drains in-flight operations for up to `grace`, then cancels the
    /// stragglers. Metric loops stop immediately.
    pub async fn shutdown(&self, grace: Duration) {
        for l in self.metric_loops.lock().unwrap().values() {
            l.cancel.cancel();
        }
        let deadline = Instant::now() + grace;
        loop {
            let pending: Vec<Arc<Operation>> = {
                let ops = self.ops.lock().unwrap();
                ops.values()
                    .filter(|op| !op.inner.lock().unwrap().state.is_terminal())
                    .cloned()
                    .collect()
            };
            if pending.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                for op in &pending {
                    op.cancel.cancel();
                }
                tokio::time::sleep(crate::exec::KILL_GRACE).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{Exec, ExecOutput, ExecRequest};

    struct NoopExec;

    #[async_trait::async_trait]
    impl Exec for NoopExec {
        async fn exec(&self, _req: ExecRequest) -> VmResult<ExecOutput> {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
                duration: Duration::from_millis(1),
            })
        }
    }

    fn coordinator() -> Coordinator {
        let exec = Arc::new(NoopExec);
        let backend =
            Arc::new(crate::virtualbox::VBoxManage::new(exec));
        let manager =
            Arc::new(VmManager::new(backend, Duration::from_secs(5)));
        Coordinator::new(manager, 4, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn operation_reaches_succeeded_with_result() {
        let c = coordinator();
        let handle = c
            .start(
                "vm_management.create".into(),
                Box::pin(async { Ok(json!({"vm_id": "u-1"})) }),
            )
            .await
            .unwrap();
        let id = handle["operation_id"].as_str().unwrap().to_string();
        assert_eq!(handle["state"], "pending");

        let mut state = String::new();
        for _ in 0..100 {
            let snap = c.get(&id).unwrap();
            state = snap["state"].as_str().unwrap().to_string();
            if state == "succeeded" {
                assert_eq!(snap["result"]["vm_id"], "u-1");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, "succeeded");
    }

    #[tokio::test]
    async fn cancel_reaches_terminal_state_quickly() {
        let c = coordinator();
        let handle = c
            .start(
                "vm_management.clone".into(),
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(json!({}))
                }),
            )
            .await
            .unwrap();
        let id = handle["operation_id"].as_str().unwrap().to_string();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c.cancel(&id).unwrap(), true);

        let started = Instant::now();
        loop {
            let snap = c.get(&id).unwrap();
            if snap["state"] == "cancelled" {
                break;
            }
            assert!(
                started.elapsed() < Duration::from_secs(3),
                "cancellation exceeded the 3s bound"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn cancel_of_terminal_operation_returns_false() {
        let c = coordinator();
        let handle = c
            .start("x".into(), Box::pin(async { Ok(json!(1)) }))
            .await
            .unwrap();
        let id = handle["operation_id"].as_str().unwrap().to_string();
        for _ in 0..100 {
            if c.get(&id).unwrap()["state"] == "succeeded" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(c.cancel(&id).unwrap(), false);
    }

    #[tokio::test]
    async fn failed_operation_carries_error_envelope() {
        let c = coordinator();
        let handle = c
            .start(
                "x".into(),
                Box::pin(async {
                    Err(vmerr!(@e VmNotFound, "no such VM"))
                }),
            )
            .await
            .unwrap();
        let id = handle["operation_id"].as_str().unwrap().to_string();
        for _ in 0..100 {
            let snap = c.get(&id).unwrap();
            if snap["state"] == "failed" {
                assert_eq!(snap["error"]["error_kind"], "VmNotFound");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("operation never failed");
    }

    #[test]
    fn unknown_operation_is_invalid_arguments() {
        let c = coordinator();
        assert!(c.get("op-404").is_err());
        assert!(c.cancel("op-404").is_err());
    }
}

// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! The stateful half of the adapter: identifier resolution, per-VM
//! serialization, transient-error retry and state-wait polling.
//!
//! The hypervisor owns all VM state; this layer only holds coordination
//! state (the listing cache and the lock map) and re-reads everything else.
use crate::exec::current_cancel_token;
use crate::types::*;
use crate::vmerr;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::OwnedMutexGuard;

/// How long a `list_vms` result may serve name resolution.
pub const LIST_CACHE_TTL: Duration = Duration::from_secs(5);

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_MAX_ELAPSED: Duration = Duration::from_secs(10);

const POLL_INITIAL: Duration = Duration::from_millis(250);
const POLL_MAX: Duration = Duration::from_secs(2);

struct ListingCache {
    vms: Vec<Vm>,
    fetched_at: Instant,
}

pub struct VmManager {
    backend: Arc<dyn Hypervisor>,
    /// One fair mutex per canonical VM id; tokio's mutex queues waiters
    /// FIFO, which is the fairness the contract promises.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Taken instead of a per-VM lock by host-global mutations.
    global_lock: Arc<tokio::sync::Mutex<()>>,
    cache: Mutex<Option<ListingCache>>,
    default_timeout: Duration,
}

impl VmManager {
    pub fn new(backend: Arc<dyn Hypervisor>, default_timeout: Duration) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
            global_lock: Arc::new(tokio::sync::Mutex::new(())),
            cache: Mutex::new(None),
            default_timeout,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Hypervisor> { &self.backend }

    fn wait_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.default_timeout)
    }

    // ---- identifier resolution ------------------------------------------

    /// Resolves a name or id to the canonical VM id, via the TTL cache
    /// first and a fresh listing on miss.
    pub async fn resolve(&self, id_or_name: &str) -> VmResult<String> {
        if let Some(id) = self.cache_lookup(id_or_name) {
            return Ok(id);
        }
        self.refresh_listing().await?;
        self.cache_lookup(id_or_name).ok_or_else(|| {
            vmerr!(@e VmNotFound, "no VM named or identified by {:?}", id_or_name)
        })
    }

    fn cache_lookup(&self, id_or_name: &str) -> Option<String> {
        let cache = self.cache.lock().unwrap();
        let c = cache.as_ref()?;
        if c.fetched_at.elapsed() > LIST_CACHE_TTL {
            return None;
        }
        c.vms
            .iter()
            .find(|v| v.id == id_or_name || v.name == id_or_name)
            .map(|v| v.id.clone())
    }

    async fn refresh_listing(&self) -> VmResult<Vec<Vm>> {
        let vms = self.retry_query(|| self.backend.list_vms()).await?;
        *self.cache.lock().unwrap() = Some(ListingCache {
            vms: vms.clone(),
            fetched_at: Instant::now(),
        });
        Ok(vms)
    }

    /// External actors mutate VMs behind our back, so local mutations only
    /// ever drop the cache, never patch it.
    fn invalidate(&self) {
        *self.cache.lock().unwrap() = None;
    }

    // ---- locking --------------------------------------------------------

    fn vm_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Lock acquisition is a suspension point and observes the ambient
    /// operation token.
    async fn acquire(
        lock: Arc<tokio::sync::Mutex<()>>,
    ) -> VmResult<OwnedMutexGuard<()>> {
        match current_cancel_token() {
            Some(token) => tokio::select! {
                _ = token.cancelled() => {
                    vmerr!(Cancelled, "cancelled while waiting for the VM lock")
                }
                guard = lock.lock_owned() => Ok(guard),
            },
            None => Ok(lock.lock_owned().await),
        }
    }

    async fn lock_for(&self, id: &str) -> VmResult<OwnedMutexGuard<()>> {
        Self::acquire(self.vm_lock(id)).await
    }

    async fn lock_global(&self) -> VmResult<OwnedMutexGuard<()>> {
        Self::acquire(self.global_lock.clone()).await
    }

    // ---- retry ----------------------------------------------------------

    /// Queries are idempotent, so the whole transient-error budget applies.
    async fn retry_query<T, F, Fut>(&self, op: F) -> VmResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = VmResult<T>>,
    {
        let started = Instant::now();
        let mut delay = RETRY_BASE;
        for attempt in 1..=RETRY_MAX_ATTEMPTS {
            match op().await {
                Err(e)
                    if e.is_retriable()
                        && attempt < RETRY_MAX_ATTEMPTS
                        && started.elapsed() + delay < RETRY_MAX_ELAPSED =>
                {
                    log::debug!(
                        "transient failure (attempt {}): {}; retrying in {:?}",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                r => return r,
            }
        }
        unreachable!("retry loop returns on the final attempt")
    }

    /// Mutations are retried only when the failure provably preceded any
    /// state transition: the state read back must equal the state observed
    /// before the attempt.
    async fn retry_mutation<F, Fut>(
        &self,
        id: &str,
        pre_state: VmState,
        op: F,
    ) -> VmResult<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = VmResult<()>>,
    {
        let started = Instant::now();
        let mut delay = RETRY_BASE;
        for attempt in 1..=RETRY_MAX_ATTEMPTS {
            match op().await {
                Err(e)
                    if e.is_retriable()
                        && attempt < RETRY_MAX_ATTEMPTS
                        && started.elapsed() + delay < RETRY_MAX_ELAPSED =>
                {
                    let now = self.backend.vm_state(id).await?;
                    if now != pre_state {
                        // Something moved; the command may have taken
                        // partial effect. Surface the original failure.
                        return Err(e);
                    }
                    log::debug!(
                        "transient failure on {} (attempt {}): {}; \
                         retrying in {:?}",
                        id,
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                r => return r,
            }
        }
        unreachable!("retry loop returns on the final attempt")
    }

    // ---- state polling --------------------------------------------------

    /// Polls until the VM reaches one of `targets`, with bounded jittered
    /// backoff. Transient states are waited out, never returned.
    pub async fn wait_for_state(
        &self,
        id: &str,
        targets: &[VmState],
        timeout: Duration,
    ) -> VmResult<VmState> {
        let started = Instant::now();
        let mut delay = POLL_INITIAL;
        loop {
            let state = self.backend.vm_state(id).await?;
            if targets.contains(&state) {
                return Ok(state);
            }
            if started.elapsed() >= timeout {
                return vmerr!(
                    Timeout,
                    "VM {} did not reach {:?} within {:?} (still {})",
                    id,
                    targets,
                    timeout,
                    state
                );
            }
            if let Some(token) = current_cancel_token() {
                if token.is_cancelled() {
                    return vmerr!(Cancelled, "cancelled while polling VM state");
                }
            }
            tokio::time::sleep(jittered(delay)).await;
            delay = (delay * 2).min(POLL_MAX);
        }
    }

    // ---- queries --------------------------------------------------------

    /// Always a fresh read; the TTL cache only serves name resolution.
    pub async fn list_vms(&self) -> VmResult<Vec<Vm>> {
        let mut vms = self.refresh_listing().await?;
        // `list vms` carries no state; the running set fills in the one
        // distinction callers act on.
        let running = self
            .retry_query(|| self.backend.list_running_vms())
            .await?;
        for vm in &mut vms {
            if running.iter().any(|r| r.id == vm.id) {
                vm.state = Some(VmState::Running);
            }
        }
        Ok(vms)
    }

    pub async fn vm_info(&self, id_or_name: &str) -> VmResult<VmInfo> {
        let id = self.resolve(id_or_name).await?;
        self.retry_query(|| self.backend.vm_info(&id)).await
    }

    pub async fn snapshot_tree(&self, id_or_name: &str) -> VmResult<SnapshotTree> {
        let id = self.resolve(id_or_name).await?;
        self.retry_query(|| self.backend.snapshot_tree(&id)).await
    }

    pub async fn list_adapters(
        &self,
        id_or_name: &str,
    ) -> VmResult<Vec<NetworkAdapter>> {
        let id = self.resolve(id_or_name).await?;
        self.retry_query(|| self.backend.list_adapters(&id)).await
    }

    pub async fn list_disks(&self) -> VmResult<Vec<DiskInfo>> {
        self.retry_query(|| self.backend.list_disks()).await
    }

    pub async fn list_hostonly_ifs(&self) -> VmResult<Vec<HostOnlyIf>> {
        self.retry_query(|| self.backend.list_hostonly_ifs()).await
    }

    pub async fn host_info(&self) -> VmResult<HostInfo> {
        self.retry_query(|| self.backend.host_info()).await
    }

    pub async fn os_types(&self) -> VmResult<Vec<OsType>> {
        self.retry_query(|| self.backend.os_types()).await
    }

    pub async fn version(&self) -> VmResult<String> {
        self.retry_query(|| self.backend.version()).await
    }

    pub async fn sample_metrics(&self, id: &str) -> VmResult<MetricSample> {
        self.backend.sample_metrics(id).await
    }

    pub async fn setup_metrics(&self, id: &str, period_secs: u32) -> VmResult<()> {
        self.backend.setup_metrics(id, period_secs).await
    }

    // ---- lifecycle ------------------------------------------------------

    /// Creating a VM mutates host-global registration state.
    pub async fn create_vm(&self, spec: &CreateVmSpec) -> VmResult<String> {
        let _g = self.lock_global().await?;
        let vms = self.refresh_listing().await?;
        if vms.iter().any(|v| v.name == spec.name) {
            return vmerr!(
                ResourceConflict,
                "a VM named {:?} already exists",
                spec.name
            );
        }
        let id = self.backend.create_vm(spec).await?;
        self.invalidate();
        Ok(id)
    }

    pub async fn start_vm(
        &self,
        id_or_name: &str,
        mode: StartMode,
        timeout: Option<Duration>,
    ) -> VmResult<()> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        let state = self.backend.vm_state(&id).await?;
        match state {
            VmState::PowerOff | VmState::Saved | VmState::Aborted => {}
            s => {
                return vmerr!(
                    InvalidState,
                    "cannot start VM {} in state {}",
                    id,
                    s
                )
            }
        }
        self.retry_mutation(&id, state, || self.backend.start_vm(&id, mode))
            .await?;
        self.invalidate();
        self.wait_for_state(&id, &[VmState::Running], self.wait_timeout(timeout))
            .await?;
        Ok(())
    }

    /// ACPI and save land in different stable states; force always ends in
    /// `poweroff`.
    pub async fn stop_vm(
        &self,
        id_or_name: &str,
        style: StopStyle,
        timeout: Option<Duration>,
    ) -> VmResult<VmState> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        let state = self.backend.vm_state(&id).await?;
        let acceptable = match style {
            StopStyle::Acpi => state == VmState::Running,
            StopStyle::Force => {
                matches!(state, VmState::Running | VmState::Paused | VmState::Stuck)
            }
            StopStyle::Save => {
                matches!(state, VmState::Running | VmState::Paused)
            }
        };
        if !acceptable {
            return vmerr!(
                InvalidState,
                "cannot stop VM {} in state {}",
                id,
                state
            );
        }
        let (action, targets): (ControlAction, &[VmState]) = match style {
            StopStyle::Acpi => {
                (ControlAction::AcpiPowerButton, &[VmState::PowerOff])
            }
            StopStyle::Force => (ControlAction::PowerOff, &[VmState::PowerOff]),
            StopStyle::Save => (ControlAction::SaveState, &[VmState::Saved]),
        };
        self.retry_mutation(&id, state, || self.backend.control_vm(&id, action))
            .await?;
        self.invalidate();
        self.wait_for_state(&id, targets, self.wait_timeout(timeout)).await
    }

    pub async fn reset_vm(&self, id_or_name: &str) -> VmResult<()> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        let state = self.backend.vm_state(&id).await?;
        if state != VmState::Running {
            return vmerr!(
                InvalidState,
                "cannot reset VM {} in state {}",
                id,
                state
            );
        }
        self.retry_mutation(&id, state, || {
            self.backend.control_vm(&id, ControlAction::Reset)
        })
        .await?;
        self.invalidate();
        Ok(())
    }

    pub async fn pause_vm(
        &self,
        id_or_name: &str,
        timeout: Option<Duration>,
    ) -> VmResult<()> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        let state = self.backend.vm_state(&id).await?;
        if state != VmState::Running {
            return vmerr!(
                InvalidState,
                "cannot pause VM {} in state {}",
                id,
                state
            );
        }
        self.retry_mutation(&id, state, || {
            self.backend.control_vm(&id, ControlAction::Pause)
        })
        .await?;
        self.invalidate();
        self.wait_for_state(&id, &[VmState::Paused], self.wait_timeout(timeout))
            .await?;
        Ok(())
    }

    pub async fn resume_vm(
        &self,
        id_or_name: &str,
        timeout: Option<Duration>,
    ) -> VmResult<()> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        let state = self.backend.vm_state(&id).await?;
        if state != VmState::Paused {
            return vmerr!(
                InvalidState,
                "cannot resume VM {} in state {}",
                id,
                state
            );
        }
        self.retry_mutation(&id, state, || {
            self.backend.control_vm(&id, ControlAction::Resume)
        })
        .await?;
        self.invalidate();
        self.wait_for_state(&id, &[VmState::Running], self.wait_timeout(timeout))
            .await?;
        Ok(())
    }

    pub async fn delete_vm(
        &self,
        id_or_name: &str,
        with_disks: bool,
    ) -> VmResult<()> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        let state = self.backend.vm_state(&id).await?;
        if !matches!(
            state,
            VmState::PowerOff | VmState::Saved | VmState::Aborted
        ) {
            return vmerr!(
                InvalidState,
                "cannot delete VM {} in state {}; stop it first",
                id,
                state
            );
        }
        self.backend.delete_vm(&id, with_disks).await?;
        self.invalidate();
        self.locks.lock().unwrap().remove(&id);
        Ok(())
    }

    pub async fn clone_vm(
        &self,
        src: &str,
        new_name: &str,
        mode: CloneMode,
    ) -> VmResult<String> {
        let src_id = self.resolve(src).await?;
        let _g = self.lock_for(&src_id).await?;
        let vms = self.refresh_listing().await?;
        if vms.iter().any(|v| v.name == new_name) {
            return vmerr!(
                ResourceConflict,
                "a VM named {:?} already exists",
                new_name
            );
        }
        let state = self.backend.vm_state(&src_id).await?;
        if !matches!(state, VmState::PowerOff | VmState::Saved) {
            return vmerr!(
                InvalidState,
                "cannot clone VM {} in state {}; stop it first",
                src_id,
                state
            );
        }
        let id = self.backend.clone_vm(&src_id, new_name, mode).await?;
        self.invalidate();
        Ok(id)
    }

    // ---- snapshots ------------------------------------------------------

    /// A running VM only accepts online snapshots; when the caller does not
    /// say, the live flag follows the current state.
    pub async fn take_snapshot(
        &self,
        id_or_name: &str,
        name: &str,
        description: Option<&str>,
        live: Option<bool>,
    ) -> VmResult<String> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        let state = self.backend.vm_state(&id).await?;
        let live = live.unwrap_or(state.is_running());
        if state.is_running() && !live {
            return vmerr!(
                InvalidState,
                "VM {} is running; only live snapshots are possible",
                id
            );
        }
        if let Ok(tree) = self.backend.snapshot_tree(&id).await {
            if tree.lookup(name).is_some() {
                return vmerr!(
                    ResourceConflict,
                    "snapshot {:?} already exists on VM {}",
                    name,
                    id
                );
            }
        }
        let snap = self
            .backend
            .take_snapshot(&id, name, description, live)
            .await?;
        self.invalidate();
        Ok(snap)
    }

    /// Restore on a running or paused VM is rejected; callers stop or save
    /// first. No implicit stops.
    pub async fn restore_snapshot(
        &self,
        id_or_name: &str,
        snapshot: &str,
    ) -> VmResult<()> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        let state = self.backend.vm_state(&id).await?;
        if matches!(state, VmState::Running | VmState::Paused) {
            return vmerr!(
                InvalidState,
                "cannot restore a snapshot while VM {} is {}; stop it first",
                id,
                state
            );
        }
        self.backend.restore_snapshot(&id, snapshot).await?;
        self.invalidate();
        Ok(())
    }

    pub async fn delete_snapshot(
        &self,
        id_or_name: &str,
        snapshot: &str,
    ) -> VmResult<()> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        self.backend.delete_snapshot(&id, snapshot).await?;
        self.invalidate();
        Ok(())
    }

    // ---- storage --------------------------------------------------------

    pub async fn attach_disk(
        &self,
        id_or_name: &str,
        attachment: &StorageAttachment,
    ) -> VmResult<()> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        self.backend.attach_disk(&id, attachment).await?;
        self.invalidate();
        Ok(())
    }

    pub async fn detach_disk(
        &self,
        id_or_name: &str,
        controller: &str,
        port: u32,
        device: u32,
    ) -> VmResult<()> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        self.backend.detach_disk(&id, controller, port, device).await?;
        self.invalidate();
        Ok(())
    }

    pub async fn create_disk(
        &self,
        path: &str,
        size_mb: u64,
        format: &str,
    ) -> VmResult<String> {
        let _g = self.lock_global().await?;
        self.backend.create_disk(path, size_mb, format).await
    }

    pub async fn delete_disk(&self, path: &str) -> VmResult<()> {
        let _g = self.lock_global().await?;
        self.backend.delete_disk(path).await
    }

    // ---- network --------------------------------------------------------

    /// `modifyvm` needs a mutable machine, so the adapter config only
    /// changes on a powered-off VM.
    pub async fn configure_adapter(
        &self,
        id_or_name: &str,
        config: &AdapterConfig,
    ) -> VmResult<()> {
        let id = self.resolve(id_or_name).await?;
        let _g = self.lock_for(&id).await?;
        let state = self.backend.vm_state(&id).await?;
        if state != VmState::PowerOff {
            return vmerr!(
                InvalidState,
                "adapters can only be reconfigured while VM {} is poweroff \
                 (currently {})",
                id,
                state
            );
        }
        self.backend.configure_adapter(&id, config).await?;
        self.invalidate();
        Ok(())
    }

    pub async fn create_hostonly_if(&self) -> VmResult<String> {
        let _g = self.lock_global().await?;
        self.backend.create_hostonly_if().await
    }
}

fn jittered(d: Duration) -> Duration {
    // +-10% keeps concurrent pollers from phase-locking.
    let factor = 0.9 + rand::random::<f64>() * 0.2;
    d.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let j = jittered(base);
            assert!(j >= Duration::from_millis(900));
            assert!(j <= Duration::from_millis(1100));
        }
    }
}

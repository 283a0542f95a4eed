//! Instance state machine.
//!
//! An instance is one execution of a program, possibly across several
//! processes. Its lock protects status, the `exists` and `transient` flags,
//! process and service handles, the alternate debug image, tags, and the
//! stop signal. The lock is held across short synchronous image operations
//! and released before anything that blocks on the outside world.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::api::{
    trap_status, Cause, DebugConfig, DebugOp, DebugRequest, DebugResponse, InstanceInfo,
    InstanceUpdate, State, Status, KNOWN_MODULE_SOURCE,
};
use crate::image::{CallMap, InstanceImage, ProgramImage};
use crate::image::storage::ImageStorage;
use crate::runtime::{DebugLog, InstanceServices, Process, ProcessPolicy, ServiceBuffers};
use crate::trap::Trap;
use crate::types::ids::instance_storage_key;
use crate::types::{Error, InstanceId, ModuleId, PrincipalId, Result};

struct InstanceState {
    exists: bool,
    transient: bool,
    status: Status,
    /// Present while the instance is stopped; the driver checks it out for
    /// the duration of a serve.
    image: Option<InstanceImage>,
    buffers: Option<ServiceBuffers>,
    process: Option<Arc<dyn Process>>,
    services: Option<Arc<dyn InstanceServices>>,
    /// Alternate program image when the breakpoint set diverges from the
    /// program's own.
    alt_image: Option<ProgramImage>,
    /// Current breakpoint set, mirrored here so Config-Get works while the
    /// image is checked out.
    breakpoints: Vec<u64>,
    tags: Vec<String>,
    time_resolution: Duration,
    debug_log: Option<DebugLog>,
    /// Fresh channel per run; flips to true when the driver stops.
    stopped: watch::Sender<bool>,
}

pub(crate) struct Instance {
    pub(crate) id: InstanceId,
    pub(crate) principal: Option<PrincipalId>,
    pub(crate) module: ModuleId,
    mu: Mutex<InstanceState>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("module", &self.module)
            .finish()
    }
}

/// Everything the driver needs for one serve, checked out of the state.
pub(crate) struct ServeHandles {
    pub(crate) process: Arc<dyn Process>,
    pub(crate) services: Arc<dyn InstanceServices>,
    pub(crate) image: InstanceImage,
    pub(crate) buffers: ServiceBuffers,
    pub(crate) transient: bool,
}

/// First phase of a debug request, computed under the instance lock.
pub(crate) enum DebugPhase {
    Done(DebugResponse),
    /// Program must be rebuilt with `new` outside the lock; `observed` is
    /// the breakpoint set at plan time, used for conflict detection.
    Rebuild {
        observed: Vec<u64>,
        new: Vec<u64>,
    },
}

#[allow(clippy::too_many_arguments)]
impl Instance {
    pub(crate) fn new(
        id: InstanceId,
        principal: Option<PrincipalId>,
        module: ModuleId,
        image: InstanceImage,
        process: Option<Arc<dyn Process>>,
        services: Option<Arc<dyn InstanceServices>>,
        transient: bool,
        tags: Vec<String>,
        time_resolution: Duration,
        debug_log: Option<DebugLog>,
    ) -> Arc<Self> {
        let breakpoints = Vec::new();
        let (stopped, _) = watch::channel(false);
        Arc::new(Self {
            id,
            principal,
            module,
            mu: Mutex::new(InstanceState {
                exists: false,
                transient,
                status: Status {
                    state: State::Suspended,
                    cause: Cause::Normal,
                    result: 0,
                    error: None,
                },
                image: Some(image),
                buffers: Some(ServiceBuffers::default()),
                process,
                services,
                alt_image: None,
                breakpoints,
                tags,
                time_resolution,
                debug_log,
                stopped,
            }),
        })
    }

    fn storage_key(&self) -> Option<String> {
        self.principal
            .as_ref()
            .map(|pri| instance_storage_key(pri, &self.id))
    }

    fn release_handles(state: &mut InstanceState) {
        if let Some(services) = state.services.take() {
            services.close();
        }
        state.process = None;
        state.debug_log = None;
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Exactly-once transition out of *created* (and out of *resumed*).
    /// Binds the image to storage, then either derives a terminal status
    /// from a final image, publishes a suspended instance (no process), or
    /// starts the process. On process-start failure the image is closed and
    /// a created instance never becomes `exists`. Returns whether a driver
    /// loop must be spawned.
    pub(crate) async fn start_or_annihilate(&self, text: bytes::Bytes) -> Result<bool> {
        let mut state = self.mu.lock().await;

        let image_final;
        let entry_addr;
        {
            let image = match &state.image {
                Some(image) => image,
                None => return Err(Error::internal("instance image missing at start")),
            };
            image_final = image.is_final();
            entry_addr = image.entry_addr();
        }

        if image_final {
            let image = match &state.image {
                Some(image) => image,
                None => return Err(Error::internal("instance image missing at start")),
            };
            state.status = final_status(image.trap(), image.result(), state.transient);
            Self::release_handles(&mut state);
            state.exists = true;
            let _ = state.stopped.send(true);
            return Ok(false);
        }

        let Some(process) = state.process.clone() else {
            // Suspend-launch: published without a process.
            state.status = Status {
                state: State::Suspended,
                cause: Cause::Normal,
                result: 0,
                error: None,
            };
            Self::release_handles(&mut state);
            state.exists = true;
            let _ = state.stopped.send(true);
            return Ok(false);
        };

        let policy = ProcessPolicy {
            time_resolution: state.time_resolution,
            debug_log: state.debug_log.take(),
        };
        if let Err(err) = process.start(text, entry_addr, policy).await {
            state.image = None;
            Self::release_handles(&mut state);
            state.status = Status {
                state: State::Killed,
                cause: Cause::Internal,
                result: 0,
                error: Some(err.to_string()),
            };
            let _ = state.stopped.send(true);
            return Err(err);
        }

        state.status = Status::running();
        state.exists = true;
        Ok(true)
    }

    /// Persist the current image under the instance's storage key. No-op
    /// for anonymous instances. The image is cloned out so the lock is
    /// not held across the write.
    pub(crate) async fn store(&self, storage: &dyn ImageStorage) -> Result<()> {
        let Some(key) = self.storage_key() else {
            return Ok(());
        };
        let image = {
            let state = self.mu.lock().await;
            match &state.image {
                Some(image) => image.clone(),
                None => return Ok(()),
            }
        };
        storage.store_instance(&key, &image).await
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub(crate) async fn status(&self) -> Status {
        self.mu.lock().await.status.clone()
    }

    pub(crate) async fn info(&self) -> Option<InstanceInfo> {
        let state = self.mu.lock().await;
        if !state.exists {
            return None;
        }
        Some(InstanceInfo {
            instance: self.id.clone(),
            module: self.module.clone(),
            status: state.status.clone(),
            transient: state.transient,
            debugging: state.alt_image.is_some() || !state.breakpoints.is_empty(),
            tags: state.tags.clone(),
        })
    }

    /// Block until the instance stops or the token is cancelled, then
    /// return the status at that point. Safe for concurrent callers.
    pub(crate) async fn wait(&self, cancel: &CancellationToken) -> Status {
        let mut rx = {
            let state = self.mu.lock().await;
            if state.status.state != State::Running {
                return state.status.clone();
            }
            state.stopped.subscribe()
        };
        loop {
            if *rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        self.status().await
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Ask the process to terminate. Idempotent, non-blocking.
    pub(crate) async fn kill(&self) {
        let process = self.mu.lock().await.process.clone();
        if let Some(process) = process {
            process.kill();
        }
    }

    /// Ask the process to suspend. When `set_non_transient` is set and the
    /// instance is Running, the transient flag is cleared in the same
    /// critical section.
    pub(crate) async fn suspend(&self, set_non_transient: bool) {
        let process = {
            let mut state = self.mu.lock().await;
            if set_non_transient && state.status.state == State::Running {
                state.transient = false;
            }
            state.process.clone()
        };
        if let Some(process) = process {
            process.suspend();
        }
    }

    /// Connect the caller's stream pair to the program. Returns false
    /// without blocking if the instance has no live services.
    pub(crate) async fn connect(
        &self,
        cancel: CancellationToken,
        input: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>,
        output: std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    ) -> Result<bool> {
        let services = self.mu.lock().await.services.clone();
        let Some(services) = services else {
            return Ok(false);
        };
        services.connect(cancel, input, output).await?;
        Ok(true)
    }

    // ========================================================================
    // Resume
    // ========================================================================

    fn check_resume_locked(state: &InstanceState, function: &str) -> Result<()> {
        if !state.exists {
            return Err(Error::InstanceNotFound);
        }
        match state.status.state {
            State::Suspended if function.is_empty() => Ok(()),
            State::Suspended => Err(Error::instance_status(
                "entry function cannot be changed on a suspended instance",
            )),
            State::Halted if !function.is_empty() => Ok(()),
            State::Halted => Err(Error::instance_status(
                "halted instance requires an entry function",
            )),
            _ => Err(Error::instance_status("instance is not suspended or halted")),
        }
    }

    pub(crate) async fn check_resume(&self, function: &str) -> Result<()> {
        let state = self.mu.lock().await;
        Self::check_resume_locked(&state, function)
    }

    /// Install a fresh process and transition back to Running. The caller
    /// must follow up with [`Instance::start_or_annihilate`] and spawn a
    /// driver. `entry_addr` is set for halted instances resuming into a new
    /// function.
    pub(crate) async fn resume(
        &self,
        function: &str,
        entry_addr: Option<u64>,
        process: Arc<dyn Process>,
        services: Arc<dyn InstanceServices>,
        time_resolution: Duration,
        debug_log: Option<DebugLog>,
    ) -> Result<()> {
        let mut state = self.mu.lock().await;
        Self::check_resume_locked(&state, function)?;

        if let Some(addr) = entry_addr {
            match &mut state.image {
                Some(image) => image.set_entry_addr(addr),
                None => return Err(Error::internal("instance image missing at resume")),
            }
        }

        let (stopped, _) = watch::channel(false);
        state.stopped = stopped;
        state.process = Some(process);
        state.services = Some(services);
        state.time_resolution = time_resolution;
        state.debug_log = debug_log;
        state.status = Status::running();
        Ok(())
    }

    // ========================================================================
    // Driver handoff
    // ========================================================================

    /// Check the serve handles out of the state. Called once per run by the
    /// driver loop.
    pub(crate) async fn checkout_for_serve(&self) -> Result<ServeHandles> {
        let mut state = self.mu.lock().await;
        let process = state
            .process
            .clone()
            .ok_or_else(|| Error::internal("instance has no process to serve"))?;
        let services = state
            .services
            .clone()
            .ok_or_else(|| Error::internal("instance has no services to serve"))?;
        let image = state
            .image
            .take()
            .ok_or_else(|| Error::internal("instance image already checked out"))?;
        let buffers = state.buffers.take().unwrap_or_default();
        Ok(ServeHandles {
            process,
            services,
            image,
            buffers,
            transient: state.transient,
        })
    }

    /// Reinstate the image after a serve and release every per-run handle.
    /// The final status is withheld until [`Instance::publish_stop`], after
    /// the driver's storage write and events. Returns whether the instance
    /// is transient (and must be annihilated by the caller).
    pub(crate) async fn complete_serve(
        &self,
        mut image: InstanceImage,
        buffers: ServiceBuffers,
        make_final: bool,
    ) -> bool {
        let mut state = self.mu.lock().await;
        if make_final {
            image.set_final();
        }
        state.image = Some(image);
        state.buffers = Some(buffers);
        Self::release_handles(&mut state);
        state.transient
    }

    /// The serve ended without an image to give back (the process failed
    /// before returning it). Any remaining image is left final.
    pub(crate) async fn abort_serve(&self) {
        let mut state = self.mu.lock().await;
        if let Some(image) = &mut state.image {
            image.set_final();
        }
        Self::release_handles(&mut state);
    }

    /// Install the final status and wake the waiters. Last step of a run;
    /// a waiter observing a non-Running status is guaranteed that the
    /// driver's storage write, stop events and transient deletion have
    /// already happened.
    pub(crate) async fn publish_stop(&self, status: Status) {
        let mut state = self.mu.lock().await;
        state.status = status;
        let _ = state.stopped.send(true);
    }

    // ========================================================================
    // Deletion and update
    // ========================================================================

    fn annihilate_locked(state: &mut InstanceState) {
        state.image = None;
        state.alt_image = None;
        state.exists = false;
    }

    async fn delete_stored(&self, storage: &dyn ImageStorage) -> Result<()> {
        if let Some(key) = self.storage_key() {
            storage.delete_instance(&key).await?;
        }
        Ok(())
    }

    /// Terminal local deletion: close the images, clear `exists`, remove
    /// storage. Only allowed when not Running.
    pub(crate) async fn annihilate(&self, storage: &dyn ImageStorage) -> Result<()> {
        {
            let mut state = self.mu.lock().await;
            if !state.exists {
                return Err(Error::InstanceNotFound);
            }
            if state.status.state == State::Running {
                return Err(Error::instance_status("instance is running"));
            }
            Self::annihilate_locked(&mut state);
        }
        self.delete_stored(storage).await
    }

    /// Driver-side deletion of a transient instance whose run has ended
    /// but whose final status is not yet published.
    pub(crate) async fn annihilate_unpublished(&self, storage: &dyn ImageStorage) -> Result<()> {
        {
            let mut state = self.mu.lock().await;
            if !state.exists {
                return Err(Error::InstanceNotFound);
            }
            Self::annihilate_locked(&mut state);
        }
        self.delete_stored(storage).await
    }

    /// Update metadata. Mutates the argument so that only the fields that
    /// actually changed remain set; returns whether anything changed.
    pub(crate) async fn update(&self, update: &mut InstanceUpdate) -> Result<bool> {
        let mut state = self.mu.lock().await;
        if !state.exists {
            return Err(Error::InstanceNotFound);
        }
        let mut changed = false;

        if update.persist {
            if state.transient {
                state.transient = false;
                changed = true;
            } else {
                update.persist = false;
            }
        }
        if !update.tags.is_empty() {
            if state.tags != update.tags {
                state.tags = update.tags.clone();
                changed = true;
            } else {
                update.tags.clear();
            }
        }
        Ok(changed)
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Read the instance image while verifying the instance is stopped.
    /// The lock is held for the duration of `f`, which must not block.
    pub(crate) async fn with_stopped_image<T>(
        &self,
        f: impl FnOnce(&InstanceImage) -> Result<T>,
    ) -> Result<T> {
        let state = self.mu.lock().await;
        if !state.exists {
            return Err(Error::InstanceNotFound);
        }
        if state.status.state == State::Running {
            return Err(Error::instance_status("instance is running"));
        }
        match &state.image {
            Some(image) => f(image),
            None => Err(Error::internal("instance image checked out")),
        }
    }

    // ========================================================================
    // Debug
    // ========================================================================

    fn debug_response(&self, state: &InstanceState, data: Vec<u8>) -> DebugResponse {
        DebugResponse {
            module: format!("{}/{}", KNOWN_MODULE_SOURCE, self.module),
            status: state.status.clone(),
            config: DebugConfig {
                breakpoints: state.breakpoints.clone(),
            },
            data,
        }
    }

    fn require_stopped(state: &MutexGuard<'_, InstanceState>) -> Result<()> {
        if state.status.state == State::Running {
            return Err(Error::instance_status("instance is running"));
        }
        Ok(())
    }

    /// First phase of a debug request, under the instance lock. Mutating
    /// operations whose breakpoint set settles on the program's own set are
    /// completed here; a divergent set is handed back for a rebuild.
    pub(crate) async fn debug_plan(
        &self,
        req: &DebugRequest,
        prog_image: &ProgramImage,
        max_breakpoints: usize,
    ) -> Result<DebugPhase> {
        let mut state = self.mu.lock().await;
        if !state.exists {
            return Err(Error::InstanceNotFound);
        }

        match req.op {
            DebugOp::ConfigGet => {
                return Ok(DebugPhase::Done(self.debug_response(&state, Vec::new())));
            }
            DebugOp::ReadStack => {
                Self::require_stopped(&state)?;
                let call_map: &CallMap = match &state.alt_image {
                    Some(alt) => alt.call_map(),
                    None => prog_image.call_map(),
                };
                let data = match &state.image {
                    Some(image) => image.export_stack(call_map)?,
                    None => return Err(Error::internal("instance image checked out")),
                };
                return Ok(DebugPhase::Done(self.debug_response(&state, data)));
            }
            DebugOp::ConfigSet | DebugOp::ConfigUnion | DebugOp::ConfigComplement => {
                Self::require_stopped(&state)?;
            }
        }

        let mut new: Vec<u64> = match req.op {
            DebugOp::ConfigSet => req.config.breakpoints.clone(),
            DebugOp::ConfigUnion => {
                let mut set = state.breakpoints.clone();
                set.extend_from_slice(&req.config.breakpoints);
                set
            }
            DebugOp::ConfigComplement => state
                .breakpoints
                .iter()
                .copied()
                .filter(|b| !req.config.breakpoints.contains(b))
                .collect(),
            _ => unreachable!(),
        };
        new.sort_unstable();
        new.dedup();
        if new.len() > max_breakpoints {
            return Err(Error::resource_limit("breakpoint limit exceeded"));
        }

        if new == prog_image.breakpoints() {
            // Settle on the program's own image.
            state.alt_image = None;
            state.breakpoints = new;
            return Ok(DebugPhase::Done(self.debug_response(&state, Vec::new())));
        }

        Ok(DebugPhase::Rebuild {
            observed: state.breakpoints.clone(),
            new,
        })
    }

    /// Swap in a rebuilt alternate image. Fails with a conflict if the
    /// breakpoint set changed while the rebuild was in flight.
    pub(crate) async fn debug_apply(
        &self,
        observed: Vec<u64>,
        new: Vec<u64>,
        alt_image: ProgramImage,
    ) -> Result<DebugResponse> {
        let mut state = self.mu.lock().await;
        if state.breakpoints != observed {
            return Err(Error::InstanceDebugState("conflict".to_string()));
        }
        Self::require_stopped(&state)?;
        state.alt_image = Some(alt_image);
        state.breakpoints = new;
        Ok(self.debug_response(&state, Vec::new()))
    }

    /// Alternate program text for the next serve, when debugging.
    pub(crate) async fn active_text(&self, prog_image: &ProgramImage) -> bytes::Bytes {
        let state = self.mu.lock().await;
        match &state.alt_image {
            Some(alt) => alt.text().clone(),
            None => prog_image.text().clone(),
        }
    }
}

/// Terminal status derived from a stored trap id.
pub(crate) fn final_status(trap: Trap, result: i32, transient: bool) -> Status {
    match trap {
        Trap::Exit => {
            let state = if transient || result == 0 {
                State::Terminated
            } else {
                State::Halted
            };
            Status {
                state,
                cause: Cause::Normal,
                result,
                error: None,
            }
        }
        _ => {
            let (state, cause) = trap_status(trap);
            Status {
                state,
                cause,
                result,
                error: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_status_exit() {
        let status = final_status(Trap::Exit, 0, false);
        assert_eq!(status.state, State::Terminated);
        assert_eq!(status.cause, Cause::Normal);

        // A nonzero exit of a persistent instance stays resumable.
        let status = final_status(Trap::Exit, 1, false);
        assert_eq!(status.state, State::Halted);
        assert_eq!(status.result, 1);

        let status = final_status(Trap::Exit, 1, true);
        assert_eq!(status.state, State::Terminated);
    }

    #[test]
    fn test_final_status_traps() {
        let status = final_status(Trap::Suspended, 0, false);
        assert_eq!(status.state, State::Suspended);
        assert_eq!(status.cause, Cause::Normal);

        let status = final_status(Trap::Killed, 0, true);
        assert_eq!(status.state, State::Killed);
        assert_eq!(status.cause, Cause::Normal);

        let status = final_status(Trap::MemoryAccessOutOfBounds, 0, false);
        assert_eq!(status.state, State::Killed);
        assert_eq!(status.cause, Cause::MemoryAccessOutOfBounds);

        let status = final_status(Trap::Breakpoint, 0, false);
        assert_eq!(status.state, State::Suspended);
        assert_eq!(status.cause, Cause::Breakpoint);
    }
}

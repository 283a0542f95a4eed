//! Executor seam.
//!
//! The sandbox that actually runs program code is an external collaborator.
//! The core sees it as a [`ProcessFactory`] handing out [`Process`] objects
//! which execute one (program, instance) pair to completion, and an
//! [`InstanceServices`] bundle that carries the instance's I/O while it runs.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::image::InstanceImage;
use crate::trap::Trap;
use crate::types::Result;

/// Debug output sink, transferred into the process for its lifetime.
/// Dropping it closes the sink.
pub type DebugLog = Pin<Box<dyn AsyncWrite + Send>>;

/// I/O state captured across suspensions and carried between processes of
/// the same instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceBuffers {
    pub input: Vec<u8>,
    pub output: Vec<u8>,
}

/// Execution policy for one process.
pub struct ProcessPolicy {
    /// Granularity of time observable by the program.
    pub time_resolution: Duration,
    pub debug_log: Option<DebugLog>,
}

impl std::fmt::Debug for ProcessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPolicy")
            .field("time_resolution", &self.time_resolution)
            .field("debug_log", &self.debug_log.is_some())
            .finish()
    }
}

/// Exit state of a served process.
#[derive(Debug)]
pub struct ServeResult {
    /// The instance image handed back after the process released it.
    pub image: InstanceImage,
    pub buffers: ServiceBuffers,
    pub result: i32,
    pub trap: Trap,
}

/// One OS-level sandboxed execution. Owned by exactly one instance and
/// closed exactly once, on stop (by drop).
#[async_trait]
pub trait Process: Send + Sync {
    /// Prime the sandbox with the program text and entry address. Must be
    /// called exactly once, before `serve`.
    async fn start(&self, text: Bytes, entry_addr: u64, policy: ProcessPolicy) -> Result<()>;

    /// Execute until the program exits, suspends, or is killed. Takes
    /// possession of the instance image and service buffers and returns
    /// them with the exit result. Blocks for the process lifetime.
    async fn serve(
        &self,
        services: Arc<dyn InstanceServices>,
        image: InstanceImage,
        buffers: ServiceBuffers,
    ) -> Result<ServeResult>;

    /// Ask the process to suspend at the next safe point. Idempotent,
    /// non-blocking.
    fn suspend(&self);

    /// Terminate the process. Idempotent, non-blocking.
    fn kill(&self);
}

/// Hands out processes. The concrete factory is the container/sandbox
/// runtime; tests substitute scripted fakes.
#[async_trait]
pub trait ProcessFactory: Send + Sync {
    async fn new_process(&self) -> Result<Arc<dyn Process>>;
}

/// Service bundle attached to a running instance: the program's I/O channel
/// plus whatever host services the instance's scope granted.
#[async_trait]
pub trait InstanceServices: Send + Sync {
    /// Transfer bidirectional traffic between the caller and the program
    /// until the program closes the pipe, the instance stops, or the token
    /// is cancelled.
    async fn connect(
        &self,
        cancel: CancellationToken,
        input: Pin<Box<dyn AsyncRead + Send>>,
        output: Pin<Box<dyn AsyncWrite + Send>>,
    ) -> Result<()>;

    /// Release the bundle. Idempotent; called when the instance stops.
    fn close(&self);
}

/// Hands out service bundles for new and resumed instances.
pub trait ServiceFactory: Send + Sync {
    fn new_services(&self) -> Arc<dyn InstanceServices>;
}

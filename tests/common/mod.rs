//! Scripted collaborators for server tests.
//!
//! The loader accepts any byte blob as a module and exports two entry
//! functions: `main` (writes a greeting and exits) and `loop` (runs until
//! suspended or killed). The process factory interprets the entry address
//! accordingly, so tests can drive real lifecycle transitions without a
//! sandbox.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use gate_core::builder::ModuleLoader;
use gate_core::image::storage::{ImageStorage, MemoryStorage};
use gate_core::image::{CallMap, InstanceImage, ProgramImage};
use gate_core::runtime::{
    InstanceServices, Process, ProcessFactory, ProcessPolicy, ServeResult, ServiceBuffers,
    ServiceFactory,
};
use gate_core::server::events::{Event, EventType, Monitor};
use gate_core::trap::Trap;
use gate_core::types::{ModuleId, Result};

pub const MAIN_ADDR: u64 = 0x40;
pub const LOOP_ADDR: u64 = 0x80;
pub const STALL_ADDR: u64 = 0xC0;
pub const GREETING: &[u8] = b"hello, world\n";

// ============================================================================
// Loader
// ============================================================================

pub struct FakeLoader;

impl ModuleLoader for FakeLoader {
    fn load(&self, module: Bytes, breakpoints: &[u64]) -> Result<ProgramImage> {
        let mut entries = BTreeMap::new();
        entries.insert("main".to_string(), MAIN_ADDR);
        entries.insert("loop".to_string(), LOOP_ADDR);
        entries.insert("stall".to_string(), STALL_ADDR);
        Ok(ProgramImage::new(
            module.clone(),
            module,
            64,
            128,
            entries,
            breakpoints.to_vec(),
            CallMap {
                funcs: vec![(0x00, 0), (MAIN_ADDR, 1), (LOOP_ADDR, 2), (STALL_ADDR, 3)],
            },
        ))
    }

    fn snapshot(&self, program: &ProgramImage, instance: &InstanceImage) -> Result<Bytes> {
        let mut combined = program.module_bytes().to_vec();
        combined.extend_from_slice(b"#snapshot:");
        combined.extend_from_slice(&instance.entry_addr().to_le_bytes());
        combined.extend_from_slice(instance.memory());
        Ok(Bytes::from(combined))
    }
}

// ============================================================================
// Processes
// ============================================================================

struct FakeProcess {
    entry_addr: Mutex<Option<u64>>,
    suspend: CancellationToken,
    kill: CancellationToken,
    stdout: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl Process for FakeProcess {
    async fn start(&self, _text: Bytes, entry_addr: u64, _policy: ProcessPolicy) -> Result<()> {
        *self.entry_addr.lock().unwrap() = Some(entry_addr);
        Ok(())
    }

    async fn serve(
        &self,
        _services: Arc<dyn InstanceServices>,
        mut image: InstanceImage,
        mut buffers: ServiceBuffers,
    ) -> Result<ServeResult> {
        let entry_addr = self.entry_addr.lock().unwrap().unwrap_or(LOOP_ADDR);

        if entry_addr == MAIN_ADDR {
            self.stdout.lock().unwrap().extend_from_slice(GREETING);
            buffers.output.extend_from_slice(GREETING);
            return Ok(ServeResult {
                image,
                buffers,
                result: 0,
                trap: Trap::Exit,
            });
        }

        // Loop forever until told otherwise; `stall` ignores suspension.
        let trap = if entry_addr == STALL_ADDR {
            self.kill.cancelled().await;
            Trap::Killed
        } else {
            tokio::select! {
                _ = self.suspend.cancelled() => Trap::Suspended,
                _ = self.kill.cancelled() => Trap::Killed,
            }
        };
        if trap == Trap::Suspended {
            // Leave a frame inside the loop function on the stack.
            image.stack_mut()[8..16].copy_from_slice(&(LOOP_ADDR + 4).to_le_bytes());
        }
        Ok(ServeResult {
            image,
            buffers,
            result: 0,
            trap,
        })
    }

    fn suspend(&self) {
        self.suspend.cancel();
    }

    fn kill(&self) {
        self.kill.cancel();
    }
}

#[derive(Default)]
pub struct FakeProcessFactory {
    stdout: Arc<Mutex<Vec<u8>>>,
}

impl FakeProcessFactory {
    pub fn stdout(&self) -> Vec<u8> {
        self.stdout.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessFactory for FakeProcessFactory {
    async fn new_process(&self) -> Result<Arc<dyn Process>> {
        Ok(Arc::new(FakeProcess {
            entry_addr: Mutex::new(None),
            suspend: CancellationToken::new(),
            kill: CancellationToken::new(),
            stdout: self.stdout.clone(),
        }))
    }
}

// ============================================================================
// Services
// ============================================================================

struct FakeServices {
    stdout: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl InstanceServices for FakeServices {
    async fn connect(
        &self,
        _cancel: CancellationToken,
        _input: Pin<Box<dyn AsyncRead + Send>>,
        mut output: Pin<Box<dyn AsyncWrite + Send>>,
    ) -> Result<()> {
        let buffered = self.stdout.lock().unwrap().clone();
        output.write_all(&buffered).await?;
        output.shutdown().await?;
        Ok(())
    }

    fn close(&self) {}
}

pub struct FakeServiceFactory {
    stdout: Arc<Mutex<Vec<u8>>>,
}

impl FakeServiceFactory {
    pub fn sharing_stdout(factory: &FakeProcessFactory) -> Self {
        Self {
            stdout: factory.stdout.clone(),
        }
    }
}

impl ServiceFactory for FakeServiceFactory {
    fn new_services(&self) -> Arc<dyn InstanceServices> {
        Arc::new(FakeServices {
            stdout: self.stdout.clone(),
        })
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Memory store with a configurable latency on instance writes, standing in
/// for a durable backend.
pub struct SlowStorage {
    inner: MemoryStorage,
    write_delay: Duration,
}

impl SlowStorage {
    pub fn new(write_delay: Duration) -> Self {
        Self {
            inner: MemoryStorage::new(),
            write_delay,
        }
    }
}

#[async_trait]
impl ImageStorage for SlowStorage {
    async fn store_program(&self, id: &ModuleId, content: Bytes) -> Result<()> {
        self.inner.store_program(id, content).await
    }

    async fn load_program(&self, id: &ModuleId) -> Result<Option<Bytes>> {
        self.inner.load_program(id).await
    }

    async fn delete_program(&self, id: &ModuleId) -> Result<()> {
        self.inner.delete_program(id).await
    }

    async fn list_programs(&self) -> Result<Vec<ModuleId>> {
        self.inner.list_programs().await
    }

    async fn store_instance(&self, key: &str, state: &InstanceImage) -> Result<()> {
        tokio::time::sleep(self.write_delay).await;
        self.inner.store_instance(key, state).await
    }

    async fn load_instance(&self, key: &str) -> Result<Option<InstanceImage>> {
        self.inner.load_instance(key).await
    }

    async fn delete_instance(&self, key: &str) -> Result<()> {
        self.inner.delete_instance(key).await
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        self.inner.list_instances().await
    }
}

// ============================================================================
// Monitor
// ============================================================================

#[derive(Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<Event>>,
}

impl RecordingMonitor {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, typ: EventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.typ == typ)
            .count()
    }
}

impl Monitor for RecordingMonitor {
    fn event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

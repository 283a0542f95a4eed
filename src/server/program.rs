//! Reference-counted programs.
//!
//! A program is an immutable compiled artifact shared between the server's
//! program map, account pins, and instance records. Every holder owns one
//! unit of the explicit reference count, which is mutated only under the
//! server lock; when the count reaches zero the image is closed. The
//! `stored` flip is idempotent and serialised by the program's own mutex.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, error};

use crate::image::storage::ImageStorage;
use crate::image::ProgramImage;
use crate::types::{Error, ModuleId, Result};

pub(crate) struct Program {
    pub(crate) id: ModuleId,
    image: Mutex<Option<ProgramImage>>,
    /// Holder count. Mutated only under the server lock; atomic so the
    /// drop-time leak check needs no lock.
    ref_count: AtomicUsize,
    stored: tokio::sync::Mutex<bool>,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("id", &self.id)
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Program {
    /// New program with one reference, owned by the returned handle.
    pub(crate) fn new(id: ModuleId, image: ProgramImage, stored: bool) -> ProgramRef {
        let prog = Arc::new(Self {
            id,
            image: Mutex::new(Some(image)),
            ref_count: AtomicUsize::new(1),
            stored: tokio::sync::Mutex::new(stored),
        });
        ProgramRef { prog: Some(prog) }
    }

    /// Add a reference. Caller must hold the server lock.
    pub(crate) fn add_ref(self: &Arc<Self>) -> ProgramRef {
        let prev = self.ref_count.fetch_add(1, Ordering::Relaxed);
        assert!(prev > 0, "referencing a dead program");
        ProgramRef {
            prog: Some(self.clone()),
        }
    }

    fn unref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "unreferencing a dead program");
        if prev == 1 {
            self.close_image();
            debug!(module = %self.id, "program_closed");
        }
    }

    fn close_image(&self) {
        self.image
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Snapshot of the immutable image. Fails after close.
    pub(crate) fn image(&self) -> Result<ProgramImage> {
        self.image
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::internal("program image closed"))
    }

    /// Canonical module bytes. Fails after close.
    pub(crate) fn module_bytes(&self) -> Result<Bytes> {
        Ok(self.image()?.module_bytes())
    }

    /// Persist the module content. Idempotent; callers pin modules or
    /// suspend instances only after this succeeds.
    pub(crate) async fn ensure_storage(&self, storage: &dyn ImageStorage) -> Result<()> {
        let mut stored = self.stored.lock().await;
        if *stored {
            return Ok(());
        }
        storage.store_program(&self.id, self.module_bytes()?).await?;
        *stored = true;
        Ok(())
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        let count = self.ref_count.load(Ordering::Relaxed);
        if count != 0 {
            error!(module = %self.id, count, "program_dropped_with_live_references");
        }
    }
}

/// One unit of a program's reference count. Must be consumed through
/// [`ProgramRef::into_program`] (ownership transfer into a map) or
/// [`ProgramRef::unref`] (under the server lock); dropping an unconsumed
/// reference is a leak and is logged.
pub(crate) struct ProgramRef {
    prog: Option<Arc<Program>>,
}

impl std::fmt::Debug for ProgramRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramRef").field("prog", &self.prog).finish()
    }
}

impl ProgramRef {
    pub(crate) fn program(&self) -> &Arc<Program> {
        match &self.prog {
            Some(prog) => prog,
            None => unreachable!("consumed program reference"),
        }
    }

    pub(crate) fn id(&self) -> &ModuleId {
        &self.program().id
    }

    /// Transfer the owned count unit into a map slot.
    pub(crate) fn into_program(mut self) -> Arc<Program> {
        match self.prog.take() {
            Some(prog) => prog,
            None => unreachable!("consumed program reference"),
        }
    }

    /// Drop the owned count unit. Caller must hold the server lock.
    pub(crate) fn unref(mut self) {
        if let Some(prog) = self.prog.take() {
            prog.unref();
        }
    }

    /// Re-wrap a count unit previously transferred into a map slot.
    pub(crate) fn from_program(prog: Arc<Program>) -> Self {
        Self { prog: Some(prog) }
    }
}

impl Drop for ProgramRef {
    fn drop(&mut self) {
        if let Some(prog) = &self.prog {
            error!(module = %prog.id, "program_reference_leaked");
        }
    }
}

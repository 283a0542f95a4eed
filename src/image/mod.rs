//! Program and instance images.
//!
//! A program image is the immutable compiled artifact a loader produces from
//! a WebAssembly module: canonical module bytes, opaque text, entry address
//! table, breakpoint set, and call map. An instance image is the mutable
//! execution state of one instance: memory, stack, trap id, result, and the
//! breakpoint list currently fixed into its text.
//!
//! Images are plain in-memory buffers here; durability goes through the
//! [`storage::ImageStorage`] trait.

pub mod storage;

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::trap::Trap;
use crate::types::{Error, Result};

// ============================================================================
// Call map
// ============================================================================

/// Mapping from text addresses to function indices, sorted by address.
/// Produced by the loader alongside the text it describes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMap {
    /// (text address, function index) pairs in ascending address order.
    pub funcs: Vec<(u64, u32)>,
}

impl CallMap {
    /// Function index containing the given return address, if any.
    pub fn func_index(&self, addr: u64) -> Option<u32> {
        match self.funcs.binary_search_by_key(&addr, |&(a, _)| a) {
            Ok(i) => Some(self.funcs[i].1),
            Err(0) => None,
            Err(i) => Some(self.funcs[i - 1].1),
        }
    }

    pub fn func_count(&self) -> usize {
        self.funcs.len()
    }
}

// ============================================================================
// Program image
// ============================================================================

/// Immutable compiled program artifact. Never mutated after it leaves the
/// loader; shared by reference count through its owning program.
#[derive(Debug, Clone)]
pub struct ProgramImage {
    module: Bytes,
    text: Bytes,
    stack_usage: usize,
    memory_size: usize,
    entry_funcs: BTreeMap<String, u64>,
    breakpoints: Vec<u64>,
    call_map: CallMap,
}

impl ProgramImage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        module: Bytes,
        text: Bytes,
        stack_usage: usize,
        memory_size: usize,
        entry_funcs: BTreeMap<String, u64>,
        breakpoints: Vec<u64>,
        call_map: CallMap,
    ) -> Self {
        Self {
            module,
            text,
            stack_usage,
            memory_size,
            entry_funcs,
            breakpoints,
            call_map,
        }
    }

    /// Canonical module bytes. Cheap clone (shared buffer).
    pub fn module_bytes(&self) -> Bytes {
        self.module.clone()
    }

    pub fn module_size(&self) -> u64 {
        self.module.len() as u64
    }

    pub fn text(&self) -> &Bytes {
        &self.text
    }

    pub fn stack_usage(&self) -> usize {
        self.stack_usage
    }

    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    pub fn breakpoints(&self) -> &[u64] {
        &self.breakpoints
    }

    pub fn call_map(&self) -> &CallMap {
        &self.call_map
    }

    /// Resolve an entry function name to its text address. Empty name means
    /// the module's start routine, which every image has at address 0.
    pub fn resolve_entry(&self, function: &str) -> Result<u64> {
        if function.is_empty() {
            return Ok(0);
        }
        self.entry_funcs
            .get(function)
            .copied()
            .ok_or_else(|| Error::function_not_found(function))
    }

    /// Allocate a fresh instance image for this program.
    pub fn new_instance(&self, entry_addr: u64) -> InstanceImage {
        InstanceImage::new(
            self.memory_size,
            self.stack_usage,
            entry_addr,
            self.breakpoints.clone(),
        )
    }
}

// ============================================================================
// Instance image
// ============================================================================

const STACK_CANARY: u64 = 0x7015_e5e5_dead_beef;

/// Mutable execution state of one instance. Owned by exactly one instance;
/// mutated only by its driver loop or its debug path, never while a process
/// is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceImage {
    memory: Vec<u8>,
    /// Suspended stack contents: little-endian u64 text addresses, topmost
    /// frame first. Guarded by a canary in the first slot.
    stack: Vec<u8>,
    entry_addr: u64,
    trap: Trap,
    result: i32,
    final_state: bool,
}

impl InstanceImage {
    fn new(memory_size: usize, stack_size: usize, entry_addr: u64, _breakpoints: Vec<u64>) -> Self {
        let mut stack = vec![0u8; stack_size.max(8)];
        stack[..8].copy_from_slice(&STACK_CANARY.to_le_bytes());
        Self {
            memory: vec![0u8; memory_size],
            stack,
            entry_addr,
            trap: Trap::Exit,
            result: 0,
            final_state: false,
        }
    }

    pub fn entry_addr(&self) -> u64 {
        self.entry_addr
    }

    pub fn set_entry_addr(&mut self, addr: u64) {
        self.entry_addr = addr;
    }

    pub fn trap(&self) -> Trap {
        self.trap
    }

    pub fn set_trap(&mut self, trap: Trap) {
        self.trap = trap;
    }

    pub fn result(&self) -> i32 {
        self.result
    }

    pub fn set_result(&mut self, result: i32) {
        self.result = result;
    }

    /// A final image cannot run again; restoring it yields a terminal status
    /// computed from the stored trap without starting a process.
    pub fn is_final(&self) -> bool {
        self.final_state
    }

    pub fn set_final(&mut self) {
        self.final_state = true;
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub fn stack(&self) -> &[u8] {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut [u8] {
        &mut self.stack
    }

    /// Verify that the process did not corrupt the image envelope. The
    /// canary slot at the bottom of the stack must survive every serve.
    pub fn check_mutation(&self) -> Result<()> {
        if self.stack.len() < 8 {
            return Err(Error::internal("instance stack truncated"));
        }
        let mut canary = [0u8; 8];
        canary.copy_from_slice(&self.stack[..8]);
        if u64::from_le_bytes(canary) != STACK_CANARY {
            return Err(Error::internal("instance image mutated"));
        }
        Ok(())
    }

    /// Export the suspended stack as decoded frames: little-endian u32
    /// function indices, topmost first, resolved through the given call map.
    /// Frames whose address falls outside the map terminate the export.
    pub fn export_stack(&self, call_map: &CallMap) -> Result<Vec<u8>> {
        self.check_mutation()?;
        let mut out = Vec::new();
        for frame in self.stack[8..].chunks_exact(8) {
            let mut addr = [0u8; 8];
            addr.copy_from_slice(frame);
            let addr = u64::from_le_bytes(addr);
            if addr == 0 {
                break;
            }
            let index = call_map
                .func_index(addr)
                .ok_or_else(|| Error::internal("stack frame outside call map"))?;
            out.extend_from_slice(&index.to_le_bytes());
        }
        Ok(out)
    }
}

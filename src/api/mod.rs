//! Public operation surface types.
//!
//! Everything a protocol façade (HTTP, D-Bus, CLI) exchanges with the server
//! core: statuses, infos, operation options, and debug requests. Framing and
//! transport authentication live in the façades, not here.

use std::fmt;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::trap::Trap;
use crate::types::{InstanceId, ModuleId};

/// Source name for content-hash module ids.
pub const KNOWN_MODULE_SOURCE: &str = "sha384";

/// Instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Running,
    Suspended,
    Halted,
    Terminated,
    Killed,
}

impl State {
    /// Terminated and Killed are final; the image cannot run again.
    pub fn is_final(self) -> bool {
        matches!(self, State::Terminated | State::Killed)
    }
}

/// Why an instance is in its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    Normal,
    Unreachable,
    CallStackExhausted,
    MemoryAccessOutOfBounds,
    IndirectCallIndexOutOfBounds,
    IndirectCallSignatureMismatch,
    IntegerDivideByZero,
    IntegerOverflow,
    Breakpoint,
    AbiDeficiency,
    AbiViolation,
    Internal,
}

impl Default for Cause {
    fn default() -> Self {
        Cause::Normal
    }
}

impl Cause {
    /// Like-named cause for a trap id.
    pub fn from_trap(trap: Trap) -> Self {
        match trap {
            Trap::Exit | Trap::Suspended | Trap::Killed => Cause::Normal,
            Trap::Unreachable => Cause::Unreachable,
            Trap::CallStackExhausted => Cause::CallStackExhausted,
            Trap::MemoryAccessOutOfBounds => Cause::MemoryAccessOutOfBounds,
            Trap::IndirectCallIndexOutOfBounds => Cause::IndirectCallIndexOutOfBounds,
            Trap::IndirectCallSignatureMismatch => Cause::IndirectCallSignatureMismatch,
            Trap::IntegerDivideByZero => Cause::IntegerDivideByZero,
            Trap::IntegerOverflow => Cause::IntegerOverflow,
            Trap::Breakpoint => Cause::Breakpoint,
            Trap::AbiDeficiency => Cause::AbiDeficiency,
            Trap::AbiViolation => Cause::AbiViolation,
            Trap::NoFunction | Trap::InternalError => Cause::Internal,
        }
    }
}

/// Convert a non-exit trap id to a non-final state and cause. Total over the
/// trap enumeration; `Exit` must be handled by the caller since its state
/// depends on the instance (transient, result) rather than the trap.
pub fn trap_status(trap: Trap) -> (State, Cause) {
    match trap {
        Trap::Suspended => (State::Suspended, Cause::Normal),
        Trap::CallStackExhausted | Trap::AbiDeficiency | Trap::Breakpoint => {
            (State::Suspended, Cause::from_trap(trap))
        }
        Trap::Killed => (State::Killed, Cause::Normal),
        _ => (State::Killed, Cause::from_trap(trap)),
    }
}

/// (state, cause, result) triple summarising an instance's condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub state: State,
    pub cause: Cause,
    pub result: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Status {
    pub fn running() -> Self {
        Self {
            state: State::Running,
            cause: Cause::Normal,
            result: 0,
            error: None,
        }
    }
}

/// Non-secret module metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub tags: Vec<String>,
}

/// Non-secret instance metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance: InstanceId,
    pub module: ModuleId,
    pub status: Status,
    pub transient: bool,
    pub debugging: bool,
    pub tags: Vec<String>,
}

/// Server capability listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub scope: Vec<String>,
    pub module_sources: Vec<String>,
}

/// Module byte stream for uploads. The server takes possession of the stream
/// at its commit point; `take_stream` transfers it out exactly once.
pub struct ModuleUpload {
    pub stream: Option<Pin<Box<dyn AsyncRead + Send>>>,
    pub length: u64,
    /// Alleged content hash; empty means unknown. Validated in constant time
    /// against the computed digest.
    pub hash: String,
}

impl ModuleUpload {
    pub fn new(stream: Pin<Box<dyn AsyncRead + Send>>, length: u64, hash: String) -> Self {
        Self {
            stream: Some(stream),
            length,
            hash,
        }
    }

    /// Upload from an in-memory buffer; hash left empty.
    pub fn from_bytes(content: impl Into<bytes::Bytes>) -> Self {
        let content = content.into();
        let length = content.len() as u64;
        Self {
            stream: Some(Box::pin(std::io::Cursor::new(content))),
            length,
            hash: String::new(),
        }
    }

    pub fn take_stream(&mut self) -> Option<Pin<Box<dyn AsyncRead + Send>>> {
        self.stream.take()
    }
}

impl fmt::Debug for ModuleUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleUpload")
            .field("stream", &self.stream.is_some())
            .field("length", &self.length)
            .field("hash", &self.hash)
            .finish()
    }
}

/// Module registration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleOptions {
    /// Pin the module to the calling principal's account.
    pub pin: bool,
    pub tags: Vec<String>,
}

/// Invocation options common to launch and resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeOptions {
    /// Debug option string; parsed by the configured debug-log opener.
    pub debug_log: String,
}

/// Instance creation options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Entry function name; empty means the module's start routine.
    pub function: String,
    /// Requested instance id; generated when absent.
    pub instance: Option<InstanceId>,
    /// Create suspended without starting a process.
    pub suspend: bool,
    /// Delete the instance automatically when it stops.
    pub transient: bool,
    /// Requested access scope.
    pub scope: Vec<String>,
    pub tags: Vec<String>,
    pub invoke: InvokeOptions,
}

/// Instance resumption options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeOptions {
    /// Entry function; required for halted instances, forbidden for
    /// suspended ones.
    pub function: String,
    pub invoke: InvokeOptions,
}

/// Instance metadata update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceUpdate {
    /// Make a transient instance persistent. The reverse is not possible.
    pub persist: bool,
    /// Replacement tag list; empty leaves tags untouched.
    pub tags: Vec<String>,
}

/// Debug sub-operations over an instance's breakpoint set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugOp {
    ConfigGet,
    ConfigSet,
    ConfigUnion,
    ConfigComplement,
    ReadStack,
}

/// Breakpoint configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugConfig {
    pub breakpoints: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugRequest {
    pub op: DebugOp,
    #[serde(default)]
    pub config: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugResponse {
    /// `<source>/<module-id>` locator of the program being debugged.
    pub module: String,
    pub status: Status,
    pub config: DebugConfig,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub data: Vec<u8>,
}

/// Server operation types, as carried in event metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    ModuleList,
    ModuleInfo,
    ModuleDownload,
    ModuleUpload,
    ModuleSource,
    ModulePin,
    ModuleUnpin,
    LaunchExtant,
    LaunchUpload,
    LaunchSource,
    InstanceList,
    InstanceInfo,
    InstanceConnect,
    InstanceWait,
    InstanceKill,
    InstanceSuspend,
    InstanceResume,
    InstanceSnapshot,
    InstanceDelete,
    InstanceUpdate,
    InstanceDebug,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trap_status_table() {
        assert_eq!(trap_status(Trap::Suspended), (State::Suspended, Cause::Normal));
        assert_eq!(
            trap_status(Trap::CallStackExhausted),
            (State::Suspended, Cause::CallStackExhausted)
        );
        assert_eq!(
            trap_status(Trap::AbiDeficiency),
            (State::Suspended, Cause::AbiDeficiency)
        );
        assert_eq!(
            trap_status(Trap::Breakpoint),
            (State::Suspended, Cause::Breakpoint)
        );
        assert_eq!(trap_status(Trap::Killed), (State::Killed, Cause::Normal));
        assert_eq!(
            trap_status(Trap::AbiViolation),
            (State::Killed, Cause::AbiViolation)
        );
        assert_eq!(
            trap_status(Trap::MemoryAccessOutOfBounds),
            (State::Killed, Cause::MemoryAccessOutOfBounds)
        );
    }

    #[test]
    fn test_final_states() {
        assert!(State::Terminated.is_final());
        assert!(State::Killed.is_final());
        assert!(!State::Suspended.is_final());
        assert!(!State::Halted.is_final());
        assert!(!State::Running.is_final());
    }

    #[test]
    fn test_status_serde() {
        let status = Status {
            state: State::Terminated,
            cause: Cause::Normal,
            result: 0,
            error: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("error"));
        let back: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_upload_take_stream_once() {
        let mut upload = ModuleUpload::from_bytes(&b"\0asm"[..]);
        assert_eq!(upload.length, 4);
        assert!(upload.take_stream().is_some());
        assert!(upload.take_stream().is_none());
    }
}

//! Event model.
//!
//! Every mutating operation emits exactly one high-level event on the
//! monitor callback. Events carry request metadata extracted from the
//! operation context plus a module, instance, or failure sub-record.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::api::{Op, Status};
use crate::types::{FailKind, InstanceId, ModuleId, PrincipalId};

// ============================================================================
// Event payloads
// ============================================================================

/// Request metadata extracted from the operation context.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Meta {
    /// Façade that accepted the request (http, daemon, cli).
    pub iface: String,
    pub request_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<Op>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<PrincipalId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleRecord {
    pub module: ModuleId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    pub instance: InstanceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<ModuleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_count: Option<usize>,
}

impl InstanceRecord {
    pub fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            module: None,
            status: None,
            transient: false,
            tag_count: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailKind>,
    /// Subsystem tag for internal failures (service io, image storage,
    /// source cache).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<ModuleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceId>,
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ModuleUploadNew,
    ModuleUploadExist,
    ModuleSourceNew,
    ModuleSourceExist,
    ModulePin,
    ModuleUnpin,
    ModuleDownload,
    ModuleInfo,
    ModuleList,
    InstanceCreateKnown,
    InstanceCreateStream,
    InstanceConnect,
    InstanceDisconnect,
    InstanceSuspend,
    InstanceResume,
    InstanceKill,
    InstanceSnapshot,
    InstanceDelete,
    InstanceUpdate,
    InstanceDebug,
    InstanceInfo,
    InstanceList,
    InstanceWait,
    InstanceStop,
    FailRequest,
    FailInternal,
    FailProtocol,
    FailNetwork,
    IfaceAccess,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub typ: EventType,
    pub time: chrono::DateTime<chrono::Utc>,
    pub meta: Meta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<ModuleRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail: Option<FailRecord>,
    /// Causing error string; only on internal failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn new(typ: EventType, meta: Meta) -> Self {
        Self {
            typ,
            time: chrono::Utc::now(),
            meta,
            module: None,
            instance: None,
            fail: None,
            error: None,
        }
    }

    pub fn with_module(mut self, module: ModuleId, tag_count: Option<usize>) -> Self {
        self.module = Some(ModuleRecord { module, tag_count });
        self
    }

    pub fn with_instance(mut self, record: InstanceRecord) -> Self {
        self.instance = Some(record);
        self
    }

    pub fn fail_request(meta: Meta, kind: FailKind) -> Self {
        let mut event = Self::new(EventType::FailRequest, meta);
        event.fail = Some(FailRecord {
            kind: Some(kind),
            subsystem: None,
            module: None,
            instance: None,
        });
        event
    }

    pub fn fail_internal(meta: Meta, subsystem: &str, err: &crate::types::Error) -> Self {
        let mut event = Self::new(EventType::FailInternal, meta);
        event.fail = Some(FailRecord {
            kind: None,
            subsystem: Some(subsystem.to_string()),
            module: None,
            instance: None,
        });
        event.error = Some(err.to_string());
        event
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Event sink. Implementations must not block; the server calls this while
/// holding no locks but on the request path.
pub trait Monitor: Send + Sync {
    fn event(&self, event: &Event);
}

/// Default monitor: structured log records via `tracing`.
#[derive(Debug, Default)]
pub struct LogMonitor;

impl Monitor for LogMonitor {
    fn event(&self, event: &Event) {
        match event.typ {
            EventType::FailInternal => {
                error!(event = ?event.typ, error = event.error.as_deref(), "server_event");
            }
            EventType::FailRequest | EventType::FailProtocol | EventType::FailNetwork => {
                warn!(event = ?event.typ, fail = ?event.fail, "server_event");
            }
            _ => {
                info!(event = ?event.typ, iface = %event.meta.iface, "server_event");
            }
        }
    }
}

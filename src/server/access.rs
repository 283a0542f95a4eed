//! Authorization and quota hook points.
//!
//! Every public operation runs through an [`Authorizer`] before touching
//! server state. The authorizer may enrich the operation context (resolved
//! principal, granted scope) and narrows the resource policies the rest of
//! the operation must respect. [`PublicAccess`] is the permissive default:
//! everyone, including anonymous callers, gets the configured limits.

use std::time::Duration;

use async_trait::async_trait;

use crate::api::Op;
use crate::server::events::Meta;
use crate::types::config::DefaultLimits;
use crate::types::{PrincipalId, Result};

/// Largest accepted scope element count.
pub const MAX_SCOPE: usize = 10;

/// Per-request context threaded through an operation. The authorizer may
/// rewrite `principal` and `scope`.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    /// Façade that accepted the request (http, daemon, cli).
    pub iface: String,
    pub request_id: u64,
    pub addr: Option<String>,
    pub op: Option<Op>,
    pub principal: Option<PrincipalId>,
    pub scope: Vec<String>,
}

impl OpContext {
    pub fn anonymous(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            ..Self::default()
        }
    }

    pub fn for_principal(iface: impl Into<String>, principal: PrincipalId) -> Self {
        Self {
            iface: iface.into(),
            principal: Some(principal),
            ..Self::default()
        }
    }

    pub fn with_op(mut self, op: Op) -> Self {
        self.op = Some(op);
        self
    }

    pub(crate) fn meta(&self) -> Meta {
        Meta {
            iface: self.iface.clone(),
            request_id: self.request_id,
            addr: self.addr.clone(),
            op: self.op,
            principal: self.principal.clone(),
        }
    }
}

/// Budget for building a program.
#[derive(Debug, Clone)]
pub struct ProgramPolicy {
    pub max_module_size: usize,
    pub max_text_size: usize,
    pub max_stack_size: usize,
}

/// Budget for running an instance.
#[derive(Debug, Clone)]
pub struct InstancePolicy {
    pub max_memory_size: usize,
    pub max_breakpoints: usize,
    pub time_resolution: Duration,
}

/// Policy decisions for the server core. Implementations see the operation
/// context before any resource is touched and tighten the policies in
/// place; refusal propagates as `PermissionDenied` or a rate-limit error.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Operations touching neither programs nor instances (listing, info).
    async fn authorize(&self, ctx: &mut OpContext) -> Result<()>;

    /// Operations building or fetching a program.
    async fn authorize_program(&self, ctx: &mut OpContext, prog: &mut ProgramPolicy) -> Result<()>;

    /// Operations touching an existing instance.
    async fn authorize_instance(&self, ctx: &mut OpContext, inst: &mut InstancePolicy)
        -> Result<()>;

    /// Operations creating an instance from a program.
    async fn authorize_program_instance(
        &self,
        ctx: &mut OpContext,
        prog: &mut ProgramPolicy,
        inst: &mut InstancePolicy,
    ) -> Result<()>;

    /// Operations fetching a program from a source URI, possibly also
    /// creating an instance.
    async fn authorize_program_source(
        &self,
        ctx: &mut OpContext,
        prog: &mut ProgramPolicy,
        inst: Option<&mut InstancePolicy>,
        source_uri: &str,
    ) -> Result<()>;
}

/// Allow-everyone authorizer handing out the configured default limits.
#[derive(Debug, Clone)]
pub struct PublicAccess {
    limits: DefaultLimits,
}

impl PublicAccess {
    pub fn new(limits: DefaultLimits) -> Self {
        Self { limits }
    }

    fn fill_program(&self, prog: &mut ProgramPolicy) {
        prog.max_module_size = prog.max_module_size.min(self.limits.max_module_size);
        prog.max_text_size = prog.max_text_size.min(self.limits.max_text_size);
        prog.max_stack_size = prog.max_stack_size.min(self.limits.max_stack_size);
    }

    fn fill_instance(&self, inst: &mut InstancePolicy) {
        inst.max_memory_size = inst.max_memory_size.min(self.limits.max_memory_size);
        inst.max_breakpoints = inst.max_breakpoints.min(self.limits.max_breakpoints);
        inst.time_resolution = inst.time_resolution.max(self.limits.time_resolution);
    }
}

impl Default for PublicAccess {
    fn default() -> Self {
        Self::new(DefaultLimits::default())
    }
}

#[async_trait]
impl Authorizer for PublicAccess {
    async fn authorize(&self, _ctx: &mut OpContext) -> Result<()> {
        Ok(())
    }

    async fn authorize_program(
        &self,
        _ctx: &mut OpContext,
        prog: &mut ProgramPolicy,
    ) -> Result<()> {
        self.fill_program(prog);
        Ok(())
    }

    async fn authorize_instance(
        &self,
        _ctx: &mut OpContext,
        inst: &mut InstancePolicy,
    ) -> Result<()> {
        self.fill_instance(inst);
        Ok(())
    }

    async fn authorize_program_instance(
        &self,
        _ctx: &mut OpContext,
        prog: &mut ProgramPolicy,
        inst: &mut InstancePolicy,
    ) -> Result<()> {
        self.fill_program(prog);
        self.fill_instance(inst);
        Ok(())
    }

    async fn authorize_program_source(
        &self,
        _ctx: &mut OpContext,
        prog: &mut ProgramPolicy,
        inst: Option<&mut InstancePolicy>,
        _source_uri: &str,
    ) -> Result<()> {
        self.fill_program(prog);
        if let Some(inst) = inst {
            self.fill_instance(inst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_public_access_caps_policies() {
        let limits = DefaultLimits::default();
        let access = PublicAccess::new(limits.clone());
        let mut ctx = OpContext::anonymous("test");

        let mut prog = ProgramPolicy {
            max_module_size: usize::MAX,
            max_text_size: usize::MAX,
            max_stack_size: usize::MAX,
        };
        let mut inst = InstancePolicy {
            max_memory_size: usize::MAX,
            max_breakpoints: usize::MAX,
            time_resolution: Duration::ZERO,
        };
        access
            .authorize_program_instance(&mut ctx, &mut prog, &mut inst)
            .await
            .unwrap();

        assert_eq!(prog.max_module_size, limits.max_module_size);
        assert_eq!(inst.max_breakpoints, limits.max_breakpoints);
        assert_eq!(inst.time_resolution, limits.time_resolution);
    }
}

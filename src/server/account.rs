//! Per-principal ownership sets.
//!
//! An account records which programs a principal has pinned (with tags) and
//! which instances it owns. Every method here is called with the server
//! lock held; the maps are never touched from anywhere else.

use std::collections::HashMap;
use std::sync::Arc;

use crate::api::ModuleInfo;
use crate::server::instance::Instance;
use crate::server::program::{Program, ProgramRef};
use crate::types::{Error, InstanceId, ModuleId, PrincipalId, Result};

struct Pin {
    prog: Arc<Program>,
    tags: Vec<String>,
}

/// Instance record: the instance plus the program count unit it owns. The
/// unit is separate from any pin of the same program.
pub(crate) struct AccountInstance {
    pub(crate) inst: Arc<Instance>,
    prog: Arc<Program>,
}

impl AccountInstance {
    pub(crate) fn new(inst: Arc<Instance>, prog: ProgramRef) -> Self {
        Self {
            inst,
            prog: prog.into_program(),
        }
    }

    /// Release the record's program count unit. Caller must hold the
    /// server lock.
    pub(crate) fn release(self) -> Arc<Instance> {
        ProgramRef::from_program(self.prog).unref();
        self.inst
    }
}

pub(crate) struct Account {
    pub(crate) principal: PrincipalId,
    programs: HashMap<ModuleId, Pin>,
    instances: HashMap<InstanceId, AccountInstance>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("principal", &self.principal)
            .field("programs", &self.programs.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl Account {
    pub(crate) fn new(principal: PrincipalId) -> Self {
        Self {
            principal,
            programs: HashMap::new(),
            instances: HashMap::new(),
        }
    }

    /// Pin a program, taking one count unit, or update the tags of an
    /// existing pin. Returns whether anything changed.
    pub(crate) fn ensure_program_ref(&mut self, prog: &Arc<Program>, tags: &[String]) -> bool {
        if let Some(pin) = self.programs.get_mut(&prog.id) {
            if pin.tags == tags {
                return false;
            }
            pin.tags = tags.to_vec();
            return true;
        }
        self.programs.insert(
            prog.id.clone(),
            Pin {
                prog: prog.add_ref().into_program(),
                tags: tags.to_vec(),
            },
        );
        true
    }

    /// Drop a pin. Returns whether one existed.
    pub(crate) fn unref_program(&mut self, id: &ModuleId) -> bool {
        match self.programs.remove(id) {
            Some(pin) => {
                ProgramRef::from_program(pin.prog).unref();
                true
            }
            None => false,
        }
    }

    pub(crate) fn program_info(&self, id: &ModuleId) -> Option<ModuleInfo> {
        self.programs.get(id).map(|pin| ModuleInfo {
            id: id.clone(),
            tags: pin.tags.clone(),
        })
    }

    pub(crate) fn modules(&self) -> Vec<ModuleInfo> {
        let mut infos: Vec<_> = self
            .programs
            .iter()
            .map(|(id, pin)| ModuleInfo {
                id: id.clone(),
                tags: pin.tags.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub(crate) fn check_unique_instance_id(&self, id: &InstanceId) -> Result<()> {
        if self.instances.contains_key(id) {
            return Err(Error::InstanceIdExists);
        }
        Ok(())
    }

    pub(crate) fn install_instance(&mut self, id: InstanceId, record: AccountInstance) {
        self.instances.insert(id, record);
    }

    pub(crate) fn remove_instance(&mut self, id: &InstanceId) -> Option<AccountInstance> {
        self.instances.remove(id)
    }

    pub(crate) fn instance(&self, id: &InstanceId) -> Option<Arc<Instance>> {
        self.instances.get(id).map(|record| record.inst.clone())
    }

    pub(crate) fn instances(&self) -> impl Iterator<Item = &Arc<Instance>> {
        self.instances.values().map(|record| &record.inst)
    }

    /// Drop all pins and detach the instance records for the caller to
    /// suspend and drain.
    pub(crate) fn shutdown(&mut self) -> HashMap<InstanceId, AccountInstance> {
        for (_, pin) in self.programs.drain() {
            ProgramRef::from_program(pin.prog).unref();
        }
        std::mem::take(&mut self.instances)
    }
}

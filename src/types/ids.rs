//! Strongly-typed identifiers.
//!
//! Module ids are content hashes, instance ids are RFC 4122 UUID v4 strings
//! (validated on input), and principal ids are opaque identities whose raw
//! form keys the accounts mapping.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::errors::Error;

/// Content hash of a WebAssembly module in canonical form. Doubles as the
/// storage key for the program image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn from_string(s: String) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::ModuleNotFound);
        }
        Ok(Self(s))
    }

    pub(crate) fn from_digest(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instance identifier: an RFC 4122 UUID version 4.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Validate a client-supplied id.
    pub fn from_string(s: String) -> Result<Self, Error> {
        match uuid::Uuid::parse_str(&s) {
            Ok(x) if x.get_version_num() == 4 && x.get_variant() == uuid::Variant::RFC4122 => {
                Ok(Self(s))
            }
            _ => Err(Error::InstanceIdInvalid(
                "instance id must be an RFC 4122 UUID version 4".to_string(),
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Principal identity: a local name or an encoded public key. The derived
/// raw form is the hash key for the accounts mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrincipalId(String);

impl PrincipalId {
    pub fn from_string(s: String) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::unauthenticated("empty principal id"));
        }
        Ok(Self(s))
    }

    /// Local (non-key) principal, mostly for tests and single-user setups.
    pub fn local(name: impl Into<String>) -> Self {
        Self(format!("local:{}", name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage key for an instance image: `<principal>.<uuid>`.
pub(crate) fn instance_storage_key(pri: &PrincipalId, inst: &InstanceId) -> String {
    format!("{}.{}", pri, inst)
}

/// Inverse of [`instance_storage_key`].
pub(crate) fn parse_instance_storage_key(key: &str) -> Result<(PrincipalId, InstanceId), Error> {
    let Some(i) = key.rfind('.') else {
        return Err(Error::internal(format!("invalid instance storage key: {key:?}")));
    };
    let pri = PrincipalId::from_string(key[..i].to_string())
        .map_err(|_| Error::internal(format!("invalid instance storage key: {key:?}")))?;
    let inst = InstanceId::from_string(key[i + 1..].to_string())?;
    Ok((pri, inst))
}

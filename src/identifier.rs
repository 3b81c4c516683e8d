//! Identifiers for meshes and the objects they contain.
//!
//! A [`NetworkIdentifier`] names a mesh or an external resource
//! (`scheme://host/path`). An [`ObjectIdentifier`] names one object and is
//! written `mesh#local`; the empty local part is the mesh's home object.
//!
//! Both are immutable values compared by their canonical string.

use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between the mesh and the local part of an object identifier.
const OBJECT_SEPARATOR: char = '#';

/// Canonical identifier of a mesh or external resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkIdentifier(String);

impl NetworkIdentifier {
    /// Parse and canonicalize.
    ///
    /// Scheme and host are lower-cased; a bare host gets a trailing `/`.
    /// Strings without a scheme are kept as opaque names.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MeshError::Config("empty network identifier".to_string()));
        }
        if trimmed.contains(OBJECT_SEPARATOR) {
            return Err(MeshError::Config(format!(
                "network identifier must not contain '{}': {}",
                OBJECT_SEPARATOR, trimmed
            )));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(MeshError::Config(format!(
                "network identifier contains whitespace: {}",
                trimmed
            )));
        }

        let canonical = match trimmed.split_once("://") {
            Some((scheme, rest)) => {
                if scheme.is_empty() || rest.is_empty() {
                    return Err(MeshError::Config(format!(
                        "malformed network identifier: {}",
                        trimmed
                    )));
                }
                let (host, path) = match rest.find('/') {
                    Some(idx) => (&rest[..idx], &rest[idx..]),
                    None => (rest, "/"),
                };
                format!(
                    "{}://{}{}",
                    scheme.to_ascii_lowercase(),
                    host.to_ascii_lowercase(),
                    path
                )
            }
            None => trimmed.to_string(),
        };
        Ok(Self(canonical))
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scheme, if the identifier is URL-shaped.
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    /// Host, if the identifier is URL-shaped.
    pub fn host(&self) -> Option<&str> {
        self.0.split_once("://").map(|(_, rest)| match rest.find('/') {
            Some(idx) => &rest[..idx],
            None => rest,
        })
    }

    /// Path, if the identifier is URL-shaped.
    pub fn path(&self) -> Option<&str> {
        self.0
            .split_once("://")
            .and_then(|(_, rest)| rest.find('/').map(|idx| &rest[idx..]))
    }

    /// Identifier of this mesh's home object.
    pub fn home_object(&self) -> ObjectIdentifier {
        ObjectIdentifier::new(self.clone(), "")
    }

    /// Identifier of an object in this mesh.
    pub fn object(&self, local: impl Into<String>) -> ObjectIdentifier {
        ObjectIdentifier::new(self.clone(), local)
    }
}

impl fmt::Display for NetworkIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NetworkIdentifier {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NetworkIdentifier {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<NetworkIdentifier> for String {
    fn from(value: NetworkIdentifier) -> Self {
        value.0
    }
}

/// Identifier of one object: owning mesh plus a local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectIdentifier {
    mesh: NetworkIdentifier,
    local: String,
}

impl ObjectIdentifier {
    pub fn new(mesh: NetworkIdentifier, local: impl Into<String>) -> Self {
        Self {
            mesh,
            local: local.into(),
        }
    }

    /// Parse `mesh#local`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (mesh, local) = raw.trim().rsplit_once(OBJECT_SEPARATOR).ok_or_else(|| {
            MeshError::Config(format!("object identifier missing '#': {}", raw))
        })?;
        Ok(Self::new(NetworkIdentifier::parse(mesh)?, local))
    }

    /// The mesh where this object was created.
    pub fn mesh(&self) -> &NetworkIdentifier {
        &self.mesh
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    /// True for the home object of its mesh.
    pub fn is_home(&self) -> bool {
        self.local.is_empty()
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.mesh, OBJECT_SEPARATOR, self.local)
    }
}

impl FromStr for ObjectIdentifier {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectIdentifier {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ObjectIdentifier> for String {
    fn from(value: ObjectIdentifier) -> Self {
        value.to_string()
    }
}

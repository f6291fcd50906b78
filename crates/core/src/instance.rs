//! Parsed string tokens: entity [`Instance`]s and observation-local [`EntityRef`]s.
//!
//! Both are immutable value types. They are parsed once by a validating
//! factory and keep their canonical string form alongside the parsed parts,
//! so the token can be printed or used as a map key without re-parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{AirembrError, Result};

/// Identifies an entity's kind, optional role and optional external id.
///
/// Token grammar: `[*]kind[:role][#id]`. A leading `*` marks the actor side
/// of a flattened fact record. Whitespace around each part is ignored.
///
/// ```
/// use airembr::Instance;
///
/// let inst: Instance = "person:customer#42".parse().unwrap();
/// assert_eq!(inst.kind(), "person");
/// assert_eq!(inst.role(), Some("customer"));
/// assert_eq!(inst.id(), Some("42"));
/// assert!(!inst.is_abstract());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Instance {
    kind: String,
    role: Option<String>,
    id: Option<String>,
    actor: bool,
    token: String,
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')
}

fn check_name(part: &str, what: &str, input: &str) -> Result<()> {
    if part.is_empty() {
        return Err(AirembrError::Format(format!(
            "instance {input:?} has an empty {what}"
        )));
    }
    if let Some(bad) = part.chars().find(|c| !is_name_char(*c)) {
        return Err(AirembrError::Format(format!(
            "instance {input:?} has invalid character {bad:?} in {what}"
        )));
    }
    Ok(())
}

impl Instance {
    /// Parse an instance token, failing with [`AirembrError::Format`] on
    /// malformed input.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let (actor, rest) = match trimmed.strip_prefix('*') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, trimmed),
        };

        let (head, id) = match rest.split_once('#') {
            Some((head, id)) => {
                let id = id.trim();
                if id.is_empty() {
                    return Err(AirembrError::Format(format!(
                        "instance {input:?} has an empty id after '#'"
                    )));
                }
                (head, Some(id.to_string()))
            }
            None => (rest, None),
        };

        let (kind, role) = match head.split_once(':') {
            Some((kind, role)) => {
                let role = role.trim();
                check_name(role, "role", input)?;
                (kind.trim(), Some(role.to_string()))
            }
            None => (head.trim(), None),
        };
        check_name(kind, "kind", input)?;

        Ok(Self::assemble(kind.to_string(), role, id, actor))
    }

    /// An abstract instance of `kind` (no role, no id).
    pub fn of(kind: &str) -> Result<Self> {
        check_name(kind.trim(), "kind", kind)?;
        Ok(Self::assemble(kind.trim().to_string(), None, None, false))
    }

    /// An instance of `kind` with the given id and no role.
    pub fn typed(kind: &str, id: impl Into<String>) -> Result<Self> {
        Self::of(kind)?.with_id(id)
    }

    fn assemble(kind: String, role: Option<String>, id: Option<String>, actor: bool) -> Self {
        let mut token = String::new();
        if actor {
            token.push('*');
        }
        token.push_str(&kind);
        if let Some(role) = &role {
            token.push(':');
            token.push_str(role);
        }
        if let Some(id) = &id {
            token.push('#');
            token.push_str(id);
        }
        Self {
            kind,
            role,
            id,
            actor,
            token,
        }
    }

    /// Copy of this instance carrying `id`, keeping kind, role and actor flag.
    pub fn with_id(&self, id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let id = id.trim();
        if id.is_empty() {
            return Err(AirembrError::Format(format!(
                "empty id for instance {}",
                self.token
            )));
        }
        Ok(Self::assemble(
            self.kind.clone(),
            self.role.clone(),
            Some(id.to_string()),
            self.actor,
        ))
    }

    // Infallible variant of `with_id` for ids generated or hashed internally.
    pub(crate) fn identified(&self, id: String) -> Self {
        Self::assemble(self.kind.clone(), self.role.clone(), Some(id), self.actor)
    }

    /// Copy of this instance with the given role.
    pub fn with_role(&self, role: &str) -> Result<Self> {
        check_name(role.trim(), "role", role)?;
        Ok(Self::assemble(
            self.kind.clone(),
            Some(role.trim().to_string()),
            self.id.clone(),
            self.actor,
        ))
    }

    /// Copy of this instance marked as the actor side.
    pub fn as_actor(&self) -> Self {
        Self::assemble(self.kind.clone(), self.role.clone(), self.id.clone(), true)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn is_actor(&self) -> bool {
        self.actor
    }

    /// An abstract instance carries no externally supplied id.
    pub fn is_abstract(&self) -> bool {
        self.id.is_none()
    }

    /// Human label: `kind` or `kind:role`.
    pub fn label(&self) -> String {
        match &self.role {
            Some(role) => format!("{}:{}", self.kind, role),
            None => self.kind.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }
}

impl FromStr for Instance {
    type Err = AirembrError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Instance {
    type Error = AirembrError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Instance> for String {
    fn from(value: Instance) -> Self {
        value.token
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// The local handle of an entity inside one observation: `link[:role]`.
///
/// References are weak: they name an entity in the owning observation's
/// entity map and never own it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityRef {
    link: String,
    role: Option<String>,
}

fn is_link_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '*' | '-' | '_')
}

fn is_role_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
}

impl EntityRef {
    /// Parse a reference token, failing with [`AirembrError::Format`].
    pub fn parse(input: &str) -> Result<Self> {
        let (link, role) = match input.split_once(':') {
            Some((link, role)) => (link.trim(), Some(role.trim())),
            None => (input.trim(), None),
        };
        if link.is_empty() || !link.chars().all(is_link_char) {
            return Err(AirembrError::Format(format!(
                "invalid entity reference {input:?}"
            )));
        }
        if let Some(role) = role {
            if role.is_empty() || !role.chars().all(is_role_char) {
                return Err(AirembrError::Format(format!(
                    "invalid role in entity reference {input:?}"
                )));
            }
        }
        Ok(Self {
            link: link.to_string(),
            role: role.map(str::to_string),
        })
    }

    /// A fresh random reference (`ref-<ulid>`).
    pub fn generate() -> Self {
        Self {
            link: format!("ref-{}", Ulid::new().to_string().to_lowercase()),
            role: None,
        }
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }
}

impl FromStr for EntityRef {
    type Err = AirembrError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EntityRef {
    type Error = AirembrError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for EntityRef {
    type Error = AirembrError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<EntityRef> for String {
    fn from(value: EntityRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.role {
            Some(role) => write!(f, "{}:{}", self.link, role),
            None => f.write_str(&self.link),
        }
    }
}

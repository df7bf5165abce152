//! The role-reference mini-language used in policy role sets.
//!
//! - `#<attribute>` references a role attribute
//! - `@<id-or-name>` references one entity directly
//! - `#all` matches every entity of the governed kind and must stand alone

use std::fmt;

use crate::errors::{FieldError, PerimeterError};

pub const ROLE_ALL: &str = "#all";

const ALL_ATTRIBUTE: &str = "all";

/// A single parsed role-set entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoleRef {
    Attribute(String),
    Entity(String),
    Wildcard,
}

impl RoleRef {
    pub fn parse(s: &str) -> Option<Self> {
        if s == ROLE_ALL {
            Some(RoleRef::Wildcard)
        } else if let Some(attr) = s.strip_prefix('#') {
            Some(RoleRef::Attribute(attr.to_string()))
        } else {
            s.strip_prefix('@')
                .map(|id_or_name| RoleRef::Entity(id_or_name.to_string()))
        }
    }
}

impl fmt::Display for RoleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleRef::Attribute(attr) => write!(f, "#{attr}"),
            RoleRef::Entity(id) => write!(f, "@{id}"),
            RoleRef::Wildcard => f.write_str(ROLE_ALL),
        }
    }
}

/// A role set split into its three kinds of reference, prefixes removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSet {
    pub all: bool,
    pub attributes: Vec<String>,
    pub entity_refs: Vec<String>,
}

impl RoleSet {
    pub fn is_empty(&self) -> bool {
        !self.all && self.attributes.is_empty() && self.entity_refs.is_empty()
    }
}

/// Validate a role set before anything is persisted.
pub fn validate_roles(field: &str, values: &[String]) -> Result<(), FieldError> {
    if values.len() > 1 && values.iter().any(|v| v == ROLE_ALL) {
        return Err(FieldError::new(
            "if using #all, it should be the only role specified",
            field,
            values,
        ));
    }

    let invalid: Vec<String> = values
        .iter()
        .filter(|v| !v.starts_with('#') && !v.starts_with('@'))
        .cloned()
        .collect();
    if !invalid.is_empty() {
        return Err(FieldError::new(
            "role entries must prefixed with # (to indicate role attributes) or @ (to indicate a name or id)",
            field,
            &invalid,
        ));
    }

    Ok(())
}

/// Partition a role set. Fails on an entry without a prefix, which only
/// happens when validation was bypassed.
pub fn split_roles(values: &[String]) -> Result<RoleSet, PerimeterError> {
    let mut set = RoleSet::default();
    for entry in values {
        match RoleRef::parse(entry) {
            Some(RoleRef::Wildcard) => set.all = true,
            Some(RoleRef::Attribute(attr)) if attr == ALL_ATTRIBUTE => set.all = true,
            Some(RoleRef::Attribute(attr)) => set.attributes.push(attr),
            Some(RoleRef::Entity(id)) => set.entity_refs.push(id),
            None => {
                return Err(PerimeterError::Other(format!(
                    "{entry} is neither role attribute (prefixed with #) or an entity id or name (prefixed with @)"
                )))
            }
        }
    }
    Ok(set)
}

/// Whether a role set references the given entity by id or name.
pub fn references_entity(values: &[String], id: &str, name: &str) -> bool {
    values
        .iter()
        .filter_map(|v| v.strip_prefix('@'))
        .any(|r| r == id || r == name)
}

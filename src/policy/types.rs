use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::FieldError;

/// Whether a policy's attribute list must be fully contained in (`AllOf`) or
/// merely intersect (`AnyOf`) an entity's role attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Semantic {
    #[default]
    AllOf,
    AnyOf,
}

impl Semantic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Semantic::AllOf => "AllOf",
            Semantic::AnyOf => "AnyOf",
        }
    }
}

impl fmt::Display for Semantic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Semantic {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AllOf" => Ok(Semantic::AllOf),
            "AnyOf" => Ok(Semantic::AnyOf),
            other => Err(FieldError::new(
                "semantic must be AllOf or AnyOf",
                "semantic",
                &[other.to_string()],
            )),
        }
    }
}

/// Selects which denormalized collections a service policy feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyType {
    Dial,
    Bind,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Dial => "Dial",
            PolicyType::Bind => "Bind",
        }
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyType {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Dial" => Ok(PolicyType::Dial),
            "Bind" => Ok(PolicyType::Bind),
            other => Err(FieldError::new(
                "policy type must be Dial or Bind",
                "type",
                &[other.to_string()],
            )),
        }
    }
}

/// The kinds of entity a policy can govern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Identity,
    Service,
    EdgeRouter,
    PostureCheck,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Identity,
        EntityKind::Service,
        EntityKind::EdgeRouter,
        EntityKind::PostureCheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Identity => "identity",
            EntityKind::Service => "service",
            EntityKind::EdgeRouter => "edge-router",
            EntityKind::PostureCheck => "posture-check",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three policy kinds. They share the evaluation algorithm and differ in
/// role fields and denormalization targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    EdgeRouterPolicy,
    ServicePolicy,
    ServiceEdgeRouterPolicy,
}

impl PolicyKind {
    pub const ALL: [PolicyKind; 3] = [
        PolicyKind::EdgeRouterPolicy,
        PolicyKind::ServicePolicy,
        PolicyKind::ServiceEdgeRouterPolicy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::EdgeRouterPolicy => "edge-router-policy",
            PolicyKind::ServicePolicy => "service-policy",
            PolicyKind::ServiceEdgeRouterPolicy => "service-edge-router-policy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn role_fields(&self) -> &'static [RoleField] {
        match self {
            PolicyKind::EdgeRouterPolicy => &[RoleField::IdentityRoles, RoleField::EdgeRouterRoles],
            PolicyKind::ServicePolicy => &[
                RoleField::IdentityRoles,
                RoleField::ServiceRoles,
                RoleField::PostureCheckRoles,
            ],
            PolicyKind::ServiceEdgeRouterPolicy => {
                &[RoleField::ServiceRoles, RoleField::EdgeRouterRoles]
            }
        }
    }

    pub fn has_field(&self, field: RoleField) -> bool {
        self.role_fields().contains(&field)
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named role set on a policy. Each field governs exactly one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoleField {
    IdentityRoles,
    ServiceRoles,
    EdgeRouterRoles,
    PostureCheckRoles,
}

impl RoleField {
    pub const ALL: [RoleField; 4] = [
        RoleField::IdentityRoles,
        RoleField::ServiceRoles,
        RoleField::EdgeRouterRoles,
        RoleField::PostureCheckRoles,
    ];

    /// Field name as used in validation errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleField::IdentityRoles => "identityRoles",
            RoleField::ServiceRoles => "serviceRoles",
            RoleField::EdgeRouterRoles => "edgeRouterRoles",
            RoleField::PostureCheckRoles => "postureCheckRoles",
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            RoleField::IdentityRoles => EntityKind::Identity,
            RoleField::ServiceRoles => EntityKind::Service,
            RoleField::EdgeRouterRoles => EntityKind::EdgeRouter,
            RoleField::PostureCheckRoles => EntityKind::PostureCheck,
        }
    }
}

impl fmt::Display for RoleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An identity, service, edge router or posture check, reduced to what
/// policy matching needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernedEntity {
    pub id: String,
    pub kind: EntityKind,
    pub name: String,
    /// Unordered; stored sorted and de-duplicated.
    pub role_attributes: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub kind: PolicyKind,
    pub name: String,
    pub semantic: Semantic,
    pub policy_type: Option<PolicyType>,
    pub identity_roles: Vec<String>,
    pub service_roles: Vec<String>,
    pub edge_router_roles: Vec<String>,
    pub posture_check_roles: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Policy {
    pub fn roles(&self, field: RoleField) -> &[String] {
        match field {
            RoleField::IdentityRoles => &self.identity_roles,
            RoleField::ServiceRoles => &self.service_roles,
            RoleField::EdgeRouterRoles => &self.edge_router_roles,
            RoleField::PostureCheckRoles => &self.posture_check_roles,
        }
    }

    pub fn roles_mut(&mut self, field: RoleField) -> &mut Vec<String> {
        match field {
            RoleField::IdentityRoles => &mut self.identity_roles,
            RoleField::ServiceRoles => &mut self.service_roles,
            RoleField::EdgeRouterRoles => &mut self.edge_router_roles,
            RoleField::PostureCheckRoles => &mut self.posture_check_roles,
        }
    }
}

/// Input for creating a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPolicy {
    pub kind: PolicyKind,
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub semantic: Semantic,
    #[serde(default)]
    pub policy_type: Option<PolicyType>,
    #[serde(default)]
    pub identity_roles: Vec<String>,
    #[serde(default)]
    pub service_roles: Vec<String>,
    #[serde(default)]
    pub edge_router_roles: Vec<String>,
    #[serde(default)]
    pub posture_check_roles: Vec<String>,
}

impl NewPolicy {
    pub fn new(kind: PolicyKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            id: None,
            semantic: Semantic::default(),
            policy_type: None,
            identity_roles: Vec::new(),
            service_roles: Vec::new(),
            edge_router_roles: Vec::new(),
            posture_check_roles: Vec::new(),
        }
    }
}

/// Partial update of a policy; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyPatch {
    pub name: Option<String>,
    pub semantic: Option<Semantic>,
    pub policy_type: Option<PolicyType>,
    pub identity_roles: Option<Vec<String>>,
    pub service_roles: Option<Vec<String>>,
    pub edge_router_roles: Option<Vec<String>>,
    pub posture_check_roles: Option<Vec<String>>,
}

impl PolicyPatch {
    pub fn roles(&self, field: RoleField) -> Option<&Vec<String>> {
        match field {
            RoleField::IdentityRoles => self.identity_roles.as_ref(),
            RoleField::ServiceRoles => self.service_roles.as_ref(),
            RoleField::EdgeRouterRoles => self.edge_router_roles.as_ref(),
            RoleField::PostureCheckRoles => self.posture_check_roles.as_ref(),
        }
    }

    pub fn with_roles(mut self, field: RoleField, roles: Vec<String>) -> Self {
        match field {
            RoleField::IdentityRoles => self.identity_roles = Some(roles),
            RoleField::ServiceRoles => self.service_roles = Some(roles),
            RoleField::EdgeRouterRoles => self.edge_router_roles = Some(roles),
            RoleField::PostureCheckRoles => self.posture_check_roles = Some(roles),
        }
        self
    }
}

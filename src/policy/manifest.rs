use kdl::{KdlDocument, KdlNode};

use crate::errors::PerimeterError;
use crate::policy::types::{EntityKind, NewPolicy, PolicyKind, PolicyType, RoleField, Semantic};

/// An entity declared in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDecl {
    pub kind: EntityKind,
    pub name: String,
    pub id: Option<String>,
    pub role_attributes: Vec<String>,
}

/// The declarations of one or more manifest files.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub entities: Vec<EntityDecl>,
    pub policies: Vec<NewPolicy>,
}

impl Manifest {
    pub fn extend(&mut self, other: Manifest) {
        self.entities.extend(other.entities);
        self.policies.extend(other.policies);
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.policies.is_empty()
    }
}

fn role_field_for_child(name: &str) -> Option<RoleField> {
    match name {
        "identity-roles" => Some(RoleField::IdentityRoles),
        "service-roles" => Some(RoleField::ServiceRoles),
        "edge-router-roles" => Some(RoleField::EdgeRouterRoles),
        "posture-check-roles" => Some(RoleField::PostureCheckRoles),
        _ => None,
    }
}

/// Parse a KDL manifest into entity and policy declarations.
pub fn parse_manifest(source: &str) -> Result<Manifest, PerimeterError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| PerimeterError::KdlParse(e.to_string()))?;

    let mut manifest = Manifest::default();

    for node in doc.nodes() {
        let node_name = node.name().value();

        if let Some(kind) = EntityKind::parse(node_name) {
            manifest.entities.push(parse_entity(node, kind)?);
        } else if let Some(kind) = PolicyKind::parse(node_name) {
            manifest.policies.push(parse_policy(node, kind)?);
        } else {
            tracing::warn!("ignoring unknown top-level KDL node `{node_name}`");
        }
    }

    Ok(manifest)
}

fn parse_entity(node: &KdlNode, kind: EntityKind) -> Result<EntityDecl, PerimeterError> {
    let name = first_string_arg(node).ok_or_else(|| {
        PerimeterError::InvalidManifest(format!(
            "{kind} node requires a name argument (e.g. {kind} \"name\")"
        ))
    })?;

    let mut role_attributes = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "roles" => role_attributes = dash_list(child),
                other => {
                    return Err(PerimeterError::InvalidManifest(format!(
                        "unexpected child `{other}` in {kind} `{name}` (expected `roles`)"
                    )));
                }
            }
        }
    }

    Ok(EntityDecl {
        kind,
        name,
        id: string_prop(node, "id"),
        role_attributes,
    })
}

fn parse_policy(node: &KdlNode, kind: PolicyKind) -> Result<NewPolicy, PerimeterError> {
    let name = first_string_arg(node).ok_or_else(|| {
        PerimeterError::InvalidManifest(format!(
            "{kind} node requires a name argument (e.g. {kind} \"name\")"
        ))
    })?;

    let mut policy = NewPolicy::new(kind, name.clone());
    policy.id = string_prop(node, "id");

    if let Some(semantic) = string_prop(node, "semantic") {
        policy.semantic = semantic
            .parse::<Semantic>()
            .map_err(|e| PerimeterError::InvalidManifest(format!("{kind} `{name}`: {e}")))?;
    }
    if let Some(policy_type) = string_prop(node, "type") {
        policy.policy_type = Some(
            policy_type
                .parse::<PolicyType>()
                .map_err(|e| PerimeterError::InvalidManifest(format!("{kind} `{name}`: {e}")))?,
        );
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let child_name = child.name().value();
            match role_field_for_child(child_name) {
                Some(field) if kind.has_field(field) => {
                    *roles_of(&mut policy, field) = dash_list(child);
                }
                _ => {
                    return Err(PerimeterError::InvalidManifest(format!(
                        "unexpected child `{child_name}` in {kind} `{name}`"
                    )));
                }
            }
        }
    }

    Ok(policy)
}

fn roles_of(policy: &mut NewPolicy, field: RoleField) -> &mut Vec<String> {
    match field {
        RoleField::IdentityRoles => &mut policy.identity_roles,
        RoleField::ServiceRoles => &mut policy.service_roles,
        RoleField::EdgeRouterRoles => &mut policy.edge_router_roles,
        RoleField::PostureCheckRoles => &mut policy.posture_check_roles,
    }
}

fn string_prop(node: &KdlNode, key: &str) -> Option<String> {
    node.get(key)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Extract dash-list children: nodes named "-" whose first argument is a string.
fn dash_list(node: &KdlNode) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}

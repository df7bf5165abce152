//! Second-order link maintenance.
//!
//! Every policy kind (and, for service policies, every policy type) has one
//! [`PolicyConfig`]: the first-order collection behind each role field plus
//! the denormalizations fed from pairs of those collections.

use crate::errors::PerimeterError;
use crate::links::{self, CountChange, LinkCollection, RefCountedLinkCollection};
use crate::policy::events::{ServiceEvent, ServiceEventType};
use crate::policy::types::{PolicyKind, PolicyType, RoleField};
use crate::storage::WriteTx;

/// What to do when a denormalized link appears or disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeHandler {
    Silent,
    /// identity -> service access of the given type
    ServiceAccess(PolicyType),
    /// service -> posture check requirements of the given type
    PostureChecks(PolicyType),
}

/// `source` and `target` are first-order collections of the same policy;
/// every (source entity, target entity) pair under one policy contributes one
/// reference to `denorm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denormalization {
    pub source: LinkCollection,
    pub target: LinkCollection,
    pub denorm: RefCountedLinkCollection,
    pub on_change: ChangeHandler,
}

#[derive(Debug)]
pub struct PolicyConfig {
    pub kind: PolicyKind,
    pub policy_type: Option<PolicyType>,
    pub fields: &'static [(RoleField, LinkCollection)],
    pub denormalizations: &'static [Denormalization],
}

impl PolicyConfig {
    /// First-order collection for `field`. Panics if the kind has no such
    /// field, which is a wiring defect rather than bad input.
    pub fn links(&self, field: RoleField) -> LinkCollection {
        self.fields
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, links)| *links)
            .unwrap_or_else(|| panic!("no {field} collection configured for {}", self.kind))
    }
}

static EDGE_ROUTER_POLICY: PolicyConfig = PolicyConfig {
    kind: PolicyKind::EdgeRouterPolicy,
    policy_type: None,
    fields: &[
        (RoleField::IdentityRoles, links::EDGE_ROUTER_POLICY_IDENTITIES),
        (RoleField::EdgeRouterRoles, links::EDGE_ROUTER_POLICY_EDGE_ROUTERS),
    ],
    denormalizations: &[Denormalization {
        source: links::EDGE_ROUTER_POLICY_IDENTITIES,
        target: links::EDGE_ROUTER_POLICY_EDGE_ROUTERS,
        denorm: links::IDENTITY_EDGE_ROUTERS,
        on_change: ChangeHandler::Silent,
    }],
};

static DIAL_SERVICE_POLICY: PolicyConfig = PolicyConfig {
    kind: PolicyKind::ServicePolicy,
    policy_type: Some(PolicyType::Dial),
    fields: &[
        (RoleField::IdentityRoles, links::SERVICE_POLICY_IDENTITIES),
        (RoleField::ServiceRoles, links::SERVICE_POLICY_SERVICES),
        (RoleField::PostureCheckRoles, links::SERVICE_POLICY_POSTURE_CHECKS),
    ],
    denormalizations: &[
        Denormalization {
            source: links::SERVICE_POLICY_IDENTITIES,
            target: links::SERVICE_POLICY_SERVICES,
            denorm: links::IDENTITY_DIAL_SERVICES,
            on_change: ChangeHandler::ServiceAccess(PolicyType::Dial),
        },
        Denormalization {
            source: links::SERVICE_POLICY_SERVICES,
            target: links::SERVICE_POLICY_POSTURE_CHECKS,
            denorm: links::SERVICE_DIAL_POSTURE_CHECKS,
            on_change: ChangeHandler::PostureChecks(PolicyType::Dial),
        },
    ],
};

static BIND_SERVICE_POLICY: PolicyConfig = PolicyConfig {
    kind: PolicyKind::ServicePolicy,
    policy_type: Some(PolicyType::Bind),
    fields: &[
        (RoleField::IdentityRoles, links::SERVICE_POLICY_IDENTITIES),
        (RoleField::ServiceRoles, links::SERVICE_POLICY_SERVICES),
        (RoleField::PostureCheckRoles, links::SERVICE_POLICY_POSTURE_CHECKS),
    ],
    denormalizations: &[
        Denormalization {
            source: links::SERVICE_POLICY_IDENTITIES,
            target: links::SERVICE_POLICY_SERVICES,
            denorm: links::IDENTITY_BIND_SERVICES,
            on_change: ChangeHandler::ServiceAccess(PolicyType::Bind),
        },
        Denormalization {
            source: links::SERVICE_POLICY_SERVICES,
            target: links::SERVICE_POLICY_POSTURE_CHECKS,
            denorm: links::SERVICE_BIND_POSTURE_CHECKS,
            on_change: ChangeHandler::PostureChecks(PolicyType::Bind),
        },
    ],
};

static SERVICE_EDGE_ROUTER_POLICY: PolicyConfig = PolicyConfig {
    kind: PolicyKind::ServiceEdgeRouterPolicy,
    policy_type: None,
    fields: &[
        (RoleField::ServiceRoles, links::SERVICE_EDGE_ROUTER_POLICY_SERVICES),
        (RoleField::EdgeRouterRoles, links::SERVICE_EDGE_ROUTER_POLICY_EDGE_ROUTERS),
    ],
    denormalizations: &[Denormalization {
        source: links::SERVICE_EDGE_ROUTER_POLICY_SERVICES,
        target: links::SERVICE_EDGE_ROUTER_POLICY_EDGE_ROUTERS,
        denorm: links::SERVICE_EDGE_ROUTERS,
        on_change: ChangeHandler::Silent,
    }],
};

pub static ALL_CONFIGS: [&PolicyConfig; 4] = [
    &EDGE_ROUTER_POLICY,
    &DIAL_SERVICE_POLICY,
    &BIND_SERVICE_POLICY,
    &SERVICE_EDGE_ROUTER_POLICY,
];

/// Look up the config for a policy kind and type. Validation guarantees only
/// service policies carry a type; any other combination panics.
pub fn config_for(kind: PolicyKind, policy_type: Option<PolicyType>) -> &'static PolicyConfig {
    match (kind, policy_type) {
        (PolicyKind::EdgeRouterPolicy, None) => &EDGE_ROUTER_POLICY,
        (PolicyKind::ServicePolicy, Some(PolicyType::Dial)) => &DIAL_SERVICE_POLICY,
        (PolicyKind::ServicePolicy, Some(PolicyType::Bind)) => &BIND_SERVICE_POLICY,
        (PolicyKind::ServiceEdgeRouterPolicy, None) => &SERVICE_EDGE_ROUTER_POLICY,
        (kind, policy_type) => {
            panic!("no denormalization configured for {kind} with policy type {policy_type:?}")
        }
    }
}

/// First-order collection behind `field` of a policy kind. Dial and bind
/// service policies share theirs.
pub fn links_for(kind: PolicyKind, field: RoleField) -> LinkCollection {
    ALL_CONFIGS
        .iter()
        .find(|config| config.kind == kind)
        .map(|config| config.links(field))
        .unwrap_or_else(|| panic!("no config for {kind}"))
}

/// The identity -> service collection for a policy type.
pub fn service_access(policy_type: PolicyType) -> RefCountedLinkCollection {
    match policy_type {
        PolicyType::Dial => links::IDENTITY_DIAL_SERVICES,
        PolicyType::Bind => links::IDENTITY_BIND_SERVICES,
    }
}

/// `entity_id` was just linked to `policy_id` through `field`.
pub async fn link_added(
    tx: &mut WriteTx<'_>,
    config: &PolicyConfig,
    field: RoleField,
    policy_id: &str,
    entity_id: &str,
) -> Result<(), PerimeterError> {
    propagate(tx, config, field, policy_id, entity_id, true).await
}

/// `entity_id` was just unlinked from `policy_id` through `field`.
pub async fn link_removed(
    tx: &mut WriteTx<'_>,
    config: &PolicyConfig,
    field: RoleField,
    policy_id: &str,
    entity_id: &str,
) -> Result<(), PerimeterError> {
    propagate(tx, config, field, policy_id, entity_id, false).await
}

async fn propagate(
    tx: &mut WriteTx<'_>,
    config: &PolicyConfig,
    field: RoleField,
    policy_id: &str,
    entity_id: &str,
    added: bool,
) -> Result<(), PerimeterError> {
    let changed = config.links(field);

    for denorm in config.denormalizations {
        if denorm.source == changed {
            for target in denorm.target.iterate(tx.conn(), policy_id).await? {
                apply(tx, denorm, entity_id, &target, added).await?;
            }
        } else if denorm.target == changed {
            for source in denorm.source.iterate(tx.conn(), policy_id).await? {
                apply(tx, denorm, &source, entity_id, added).await?;
            }
        }
    }
    Ok(())
}

async fn apply(
    tx: &mut WriteTx<'_>,
    denorm: &Denormalization,
    source_id: &str,
    target_id: &str,
    added: bool,
) -> Result<(), PerimeterError> {
    let change = if added {
        denorm.denorm.increment(tx.conn(), source_id, target_id).await?
    } else {
        denorm.denorm.decrement(tx.conn(), source_id, target_id).await?
    };

    match change {
        CountChange::Gained => fire(tx, denorm.on_change, source_id, target_id, true).await,
        CountChange::Lost => fire(tx, denorm.on_change, source_id, target_id, false).await,
        CountChange::Changed(_) => Ok(()),
        CountChange::Missing => {
            tracing::warn!(
                collection = denorm.denorm.name(),
                source_id,
                target_id,
                "decrement of missing denormalized link ignored"
            );
            Ok(())
        }
    }
}

async fn fire(
    tx: &mut WriteTx<'_>,
    handler: ChangeHandler,
    from_id: &str,
    to_id: &str,
    added: bool,
) -> Result<(), PerimeterError> {
    match handler {
        ChangeHandler::Silent => {}
        ChangeHandler::ServiceAccess(policy_type) => tx.emit(ServiceEvent {
            event_type: ServiceEventType::access(policy_type, added),
            identity_id: from_id.to_string(),
            service_id: to_id.to_string(),
            policy_type,
        }),
        ChangeHandler::PostureChecks(policy_type) => {
            let identities = service_access(policy_type)
                .iterate_reverse(tx.conn(), from_id)
                .await?;
            for identity_id in identities {
                tx.emit(ServiceEvent {
                    event_type: ServiceEventType::Updated,
                    identity_id,
                    service_id: from_id.to_string(),
                    policy_type,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_lookup() {
        let dial = config_for(PolicyKind::ServicePolicy, Some(PolicyType::Dial));
        assert_eq!(dial.links(RoleField::IdentityRoles), links::SERVICE_POLICY_IDENTITIES);
        assert_eq!(dial.denormalizations[0].denorm, links::IDENTITY_DIAL_SERVICES);

        let bind = config_for(PolicyKind::ServicePolicy, Some(PolicyType::Bind));
        assert_eq!(bind.denormalizations[0].denorm, links::IDENTITY_BIND_SERVICES);
        // Dial and bind share first-order collections
        assert_eq!(
            dial.links(RoleField::ServiceRoles),
            bind.links(RoleField::ServiceRoles)
        );
    }

    #[test]
    fn test_every_config_covers_its_kind() {
        for config in ALL_CONFIGS {
            for field in config.kind.role_fields() {
                let links = config.links(*field);
                assert!(links.name().starts_with(config.kind.as_str()));
            }
            for d in config.denormalizations {
                assert!(config.fields.iter().any(|(_, l)| *l == d.source));
                assert!(config.fields.iter().any(|(_, l)| *l == d.target));
            }
        }
    }

    #[test]
    #[should_panic(expected = "no denormalization configured")]
    fn test_service_policy_without_type_panics() {
        config_for(PolicyKind::ServicePolicy, None);
    }

    #[test]
    #[should_panic(expected = "no identityRoles collection configured")]
    fn test_missing_field_panics() {
        config_for(PolicyKind::ServiceEdgeRouterPolicy, None).links(RoleField::IdentityRoles);
    }
}

use std::collections::BTreeSet;

use async_trait::async_trait;
use sea_orm::ConnectionTrait;

use crate::errors::{FieldError, PerimeterError};
use crate::policy::denorm;
use crate::policy::matcher;
use crate::policy::roles::split_roles;
use crate::policy::types::{GovernedEntity, Policy, PolicyKind, RoleField};
use crate::storage::{self, FieldChange, FieldChangeListener, WriteTx};

/// Keeps policy links and their denormalizations in step with role sets and
/// role attributes. Registered on the store's field-change hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyEvaluator;

#[async_trait]
impl FieldChangeListener for PolicyEvaluator {
    async fn field_changed(
        &self,
        tx: &mut WriteTx<'_>,
        change: &FieldChange,
    ) -> Result<(), PerimeterError> {
        match change {
            FieldChange::RoleAttributes { entity } => {
                evaluate_entity(tx, entity).await?;
            }
            FieldChange::PolicyRoles { policy, field } => {
                evaluate_policy(tx, policy, *field).await?;
            }
        }
        Ok(())
    }
}

/// Number of first-order links created and deleted by one evaluation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationDelta {
    pub added: usize,
    pub removed: usize,
}

impl EvaluationDelta {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

impl std::ops::AddAssign for EvaluationDelta {
    fn add_assign(&mut self, other: Self) {
        self.added += other.added;
        self.removed += other.removed;
    }
}

/// Resolve which entities a policy's role set for `field` currently governs.
///
/// Every `@` reference must resolve to an existing entity (by id, then by
/// name); otherwise the whole evaluation fails.
pub async fn matching_entities<C: ConnectionTrait>(
    db: &C,
    policy: &Policy,
    field: RoleField,
) -> Result<BTreeSet<String>, PerimeterError> {
    let kind = field.entity_kind();
    let roles = split_roles(policy.roles(field))?;
    let mut matched = BTreeSet::new();
    if roles.is_empty() {
        return Ok(matched);
    }

    let mut unresolved = Vec::new();
    for reference in &roles.entity_refs {
        match storage::find_entity_by_id_or_name(db, kind, reference).await? {
            Some(entity) => {
                matched.insert(entity.id);
            }
            None => unresolved.push(format!("@{reference}")),
        }
    }
    if !unresolved.is_empty() {
        return Err(FieldError::new(
            format!("no {kind} found with the given ids or names"),
            field.as_str(),
            &unresolved,
        )
        .into());
    }

    // Attribute and wildcard matches need a scan; pure id lists do not.
    if roles.all || !roles.attributes.is_empty() {
        for entity in storage::list_entities(db, kind).await? {
            if matcher::matches(policy.semantic, &roles, &entity) {
                matched.insert(entity.id);
            }
        }
    }

    Ok(matched)
}

/// Policy-side evaluation: diff the governed set for one role field against
/// the current links and apply the difference.
pub async fn evaluate_policy(
    tx: &mut WriteTx<'_>,
    policy: &Policy,
    field: RoleField,
) -> Result<EvaluationDelta, PerimeterError> {
    let config = denorm::config_for(policy.kind, policy.policy_type);
    let links = config.links(field);

    let matched = matching_entities(tx.conn(), policy, field).await?;
    let current: BTreeSet<String> = links
        .iterate(tx.conn(), &policy.id)
        .await?
        .into_iter()
        .collect();

    let mut delta = EvaluationDelta::default();

    for entity_id in matched.difference(&current) {
        links.add(tx.conn(), &policy.id, entity_id).await?;
        denorm::link_added(tx, config, field, &policy.id, entity_id).await?;
        delta.added += 1;
    }

    for entity_id in current.difference(&matched) {
        links.remove(tx.conn(), &policy.id, entity_id).await?;
        denorm::link_removed(tx, config, field, &policy.id, entity_id).await?;
        delta.removed += 1;
    }

    if !delta.is_empty() {
        tracing::debug!(
            policy_id = %policy.id,
            kind = %policy.kind,
            field = %field,
            added = delta.added,
            removed = delta.removed,
            "evaluated policy role set"
        );
    }

    Ok(delta)
}

/// Entity-side evaluation: re-test one entity against every policy that can
/// govern its kind.
pub async fn evaluate_entity(
    tx: &mut WriteTx<'_>,
    entity: &GovernedEntity,
) -> Result<EvaluationDelta, PerimeterError> {
    let mut delta = EvaluationDelta::default();

    for kind in PolicyKind::ALL {
        for &field in kind.role_fields() {
            if field.entity_kind() != entity.kind {
                continue;
            }

            let links = denorm::links_for(kind, field);
            let linked: BTreeSet<String> = links
                .iterate_reverse(tx.conn(), &entity.id)
                .await?
                .into_iter()
                .collect();

            for policy in storage::list_policies(tx.conn(), kind).await? {
                let roles = split_roles(policy.roles(field))?;
                let matched = matcher::matches(policy.semantic, &roles, entity);
                let is_linked = linked.contains(&policy.id);
                let config = denorm::config_for(policy.kind, policy.policy_type);

                if matched && !is_linked {
                    links.add(tx.conn(), &policy.id, &entity.id).await?;
                    denorm::link_added(tx, config, field, &policy.id, &entity.id).await?;
                    delta.added += 1;
                } else if !matched && is_linked {
                    links.remove(tx.conn(), &policy.id, &entity.id).await?;
                    denorm::link_removed(tx, config, field, &policy.id, &entity.id).await?;
                    delta.removed += 1;
                }
            }
        }
    }

    if !delta.is_empty() {
        tracing::debug!(
            entity_id = %entity.id,
            kind = %entity.kind,
            added = delta.added,
            removed = delta.removed,
            "evaluated entity role attributes"
        );
    }

    Ok(delta)
}

/// Remove every link that references `entity`, running the denormalizer
/// remove path for each. Used before the entity row is deleted.
pub async fn detach_entity(
    tx: &mut WriteTx<'_>,
    entity: &GovernedEntity,
) -> Result<EvaluationDelta, PerimeterError> {
    let mut delta = EvaluationDelta::default();

    for kind in PolicyKind::ALL {
        for &field in kind.role_fields() {
            if field.entity_kind() != entity.kind {
                continue;
            }

            let links = denorm::links_for(kind, field);
            for policy_id in links.iterate_reverse(tx.conn(), &entity.id).await? {
                links.remove(tx.conn(), &policy_id, &entity.id).await?;
                delta.removed += 1;

                match storage::get_policy(tx.conn(), &policy_id).await? {
                    Some(policy) => {
                        let config = denorm::config_for(policy.kind, policy.policy_type);
                        denorm::link_removed(tx, config, field, &policy.id, &entity.id).await?;
                    }
                    None => tracing::warn!(
                        policy_id = %policy_id,
                        entity_id = %entity.id,
                        collection = links.name(),
                        "removed link to missing policy"
                    ),
                }
            }
        }
    }

    Ok(delta)
}

use std::sync::Arc;

use async_trait::async_trait;
use base64ct::Encoding;
use chrono::Utc;
use rand::RngCore;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection,
    DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::entities;
use crate::errors::{FieldError, PerimeterError};
use crate::links::{self, RefCountedLinkCollection};
use crate::policy::denorm;
use crate::policy::evaluator::{self, PolicyEvaluator};
use crate::policy::events::{EventRegistry, ServiceEvent};
use crate::policy::integrity::{self, IntegrityViolation};
use crate::policy::roles::{references_entity, validate_roles};
use crate::policy::types::{
    EntityKind, GovernedEntity, NewPolicy, Policy, PolicyKind, PolicyPatch, PolicyType, RoleField,
    Semantic,
};
use crate::settings::Database as DbCfg;

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, PerimeterError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

/// The fields whose changes drive policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    RoleAttributes,
    PolicyRoles,
}

#[derive(Debug, Clone)]
pub enum FieldChange {
    /// An entity was created or its role attributes changed.
    RoleAttributes { entity: GovernedEntity },
    /// One role set of a policy must be (re-)evaluated.
    PolicyRoles { policy: Policy, field: RoleField },
}

impl FieldChange {
    pub fn symbol(&self) -> Symbol {
        match self {
            FieldChange::RoleAttributes { .. } => Symbol::RoleAttributes,
            FieldChange::PolicyRoles { .. } => Symbol::PolicyRoles,
        }
    }
}

/// Called in-line from the write path, inside the writing transaction.
#[async_trait]
pub trait FieldChangeListener: Send + Sync {
    async fn field_changed(
        &self,
        tx: &mut WriteTx<'_>,
        change: &FieldChange,
    ) -> Result<(), PerimeterError>;
}

/// Database handle plus the single-writer lock, the change event registry
/// and the field-change listeners.
#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
    writer: Arc<Mutex<()>>,
    events: Arc<EventRegistry>,
    listeners: Vec<(Symbol, Arc<dyn FieldChangeListener>)>,
}

impl Store {
    pub fn new(db: DatabaseConnection) -> Self {
        let mut store = Self {
            db,
            writer: Arc::new(Mutex::new(())),
            events: Arc::new(EventRegistry::new()),
            listeners: Vec::new(),
        };
        let evaluator: Arc<dyn FieldChangeListener> = Arc::new(PolicyEvaluator);
        store.on_field_set_changed(Symbol::RoleAttributes, evaluator.clone());
        store.on_field_set_changed(Symbol::PolicyRoles, evaluator);
        store
    }

    pub fn on_field_set_changed(&mut self, symbol: Symbol, listener: Arc<dyn FieldChangeListener>) {
        self.listeners.push((symbol, listener));
    }

    /// Read-only access outside any write transaction.
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    /// Open the single write transaction, waiting for any open one to finish.
    pub async fn begin(&self) -> Result<WriteTx<'_>, PerimeterError> {
        let writer = self.writer.clone().lock_owned().await;
        let txn = self.db.begin().await?;
        Ok(WriteTx {
            store: self,
            txn,
            pending: Vec::new(),
            writer,
        })
    }

    /// Run the integrity checker. Repairs are committed only when `repair`
    /// is set; otherwise the transaction is rolled back.
    pub async fn check_integrity<F>(&self, repair: bool, sink: F) -> Result<(), PerimeterError>
    where
        F: FnMut(IntegrityViolation, bool) + Send,
    {
        let tx = self.begin().await?;
        integrity::check_integrity(tx.conn(), repair, sink).await?;
        if repair {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(())
    }
}

/// An open write transaction. Events emitted through it are dispatched only
/// after a successful commit.
pub struct WriteTx<'a> {
    store: &'a Store,
    txn: DatabaseTransaction,
    pending: Vec<ServiceEvent>,
    writer: OwnedMutexGuard<()>,
}

impl<'a> WriteTx<'a> {
    pub fn conn(&self) -> &DatabaseTransaction {
        &self.txn
    }

    pub fn emit(&mut self, event: ServiceEvent) {
        self.pending.push(event);
    }

    pub fn pending_events(&self) -> &[ServiceEvent] {
        &self.pending
    }

    /// Notify the listeners registered for the change's symbol, in
    /// registration order.
    pub async fn fire(&mut self, change: FieldChange) -> Result<(), PerimeterError> {
        let store = self.store;
        let symbol = change.symbol();
        for (registered, listener) in &store.listeners {
            if *registered == symbol {
                listener.field_changed(self, &change).await?;
            }
        }
        Ok(())
    }

    pub async fn commit(self) -> Result<Committed, PerimeterError> {
        let WriteTx {
            store,
            txn,
            pending,
            writer,
        } = self;

        txn.commit().await?;
        drop(writer);

        let events = pending.len();
        let dispatch = if pending.is_empty() {
            None
        } else {
            Some(store.events.dispatch(pending))
        };
        Ok(Committed { events, dispatch })
    }

    /// Discard the writes and any buffered events.
    pub async fn rollback(self) -> Result<(), PerimeterError> {
        self.txn.rollback().await?;
        Ok(())
    }
}

/// Result of a commit. Dispatch of its events may still be in flight.
#[derive(Debug)]
pub struct Committed {
    pub events: usize,
    dispatch: Option<JoinHandle<()>>,
}

impl Committed {
    /// Wait until every subscriber has seen this commit's events.
    pub async fn dispatched(self) {
        if let Some(handle) = self.dispatch {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "event dispatch task failed");
            }
        }
    }
}

fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

fn normalize_attributes(mut attributes: Vec<String>) -> Vec<String> {
    attributes.sort();
    attributes.dedup();
    attributes
}

// ============================================================================
// Governed entities
// ============================================================================

fn entity_from_model(
    model: entities::governed_entity::Model,
) -> Result<GovernedEntity, PerimeterError> {
    let kind = EntityKind::parse(&model.kind)
        .ok_or_else(|| PerimeterError::Other(format!("unknown entity kind `{}`", model.kind)))?;
    let role_attributes: Vec<String> = serde_json::from_str(&model.role_attributes)?;
    Ok(GovernedEntity {
        id: model.id,
        kind,
        name: model.name,
        role_attributes,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

pub async fn create_entity(
    tx: &mut WriteTx<'_>,
    kind: EntityKind,
    name: &str,
    id: Option<String>,
    role_attributes: Vec<String>,
) -> Result<GovernedEntity, PerimeterError> {
    if name.trim().is_empty() {
        return Err(FieldError::new("name is required", "name", &[name.to_string()]).into());
    }
    if find_entity_by_name(tx.conn(), kind, name).await?.is_some() {
        return Err(PerimeterError::Conflict {
            kind: kind.as_str(),
            name: name.to_string(),
        });
    }

    // `@` references resolve by id first, then by name. Keeping ids and
    // names disjoint within a kind makes every reference unambiguous.
    if get_entity(tx.conn(), kind, name).await?.is_some() {
        return Err(FieldError::new(
            format!("name is already the id of another {kind}"),
            "name",
            &[name.to_string()],
        )
        .into());
    }

    let id = match id {
        Some(id) => {
            if entity_id_in_use(tx.conn(), &id).await? {
                return Err(FieldError::new("id is already in use", "id", &[id]).into());
            }
            if find_entity_by_name(tx.conn(), kind, &id).await?.is_some() {
                return Err(FieldError::new(
                    format!("id is already the name of another {kind}"),
                    "id",
                    &[id],
                )
                .into());
            }
            id
        }
        None => loop {
            let id = random_id();
            if !entity_id_in_use(tx.conn(), &id).await?
                && find_entity_by_name(tx.conn(), kind, &id).await?.is_none()
            {
                break id;
            }
        },
    };

    let now = Utc::now().timestamp();
    let entity = GovernedEntity {
        id,
        kind,
        name: name.to_string(),
        role_attributes: normalize_attributes(role_attributes),
        created_at: now,
        updated_at: now,
    };

    let model = entities::governed_entity::ActiveModel {
        id: Set(entity.id.clone()),
        kind: Set(kind.as_str().to_string()),
        name: Set(entity.name.clone()),
        role_attributes: Set(serde_json::to_string(&entity.role_attributes)?),
        created_at: Set(now),
        updated_at: Set(now),
    };
    model.insert(tx.conn()).await?;

    tracing::debug!(entity_id = %entity.id, kind = %kind, name = %entity.name, "created entity");

    tx.fire(FieldChange::RoleAttributes {
        entity: entity.clone(),
    })
    .await?;
    Ok(entity)
}

async fn entity_id_in_use<C: ConnectionTrait>(db: &C, id: &str) -> Result<bool, PerimeterError> {
    Ok(entities::governed_entity::Entity::find_by_id(id.to_string())
        .one(db)
        .await?
        .is_some())
}

/// Replace an entity's role attributes. Evaluation only runs when the
/// normalised set changed.
pub async fn update_role_attributes(
    tx: &mut WriteTx<'_>,
    kind: EntityKind,
    id: &str,
    role_attributes: Vec<String>,
) -> Result<GovernedEntity, PerimeterError> {
    let mut entity = get_entity(tx.conn(), kind, id)
        .await?
        .ok_or_else(|| PerimeterError::NotFound {
            kind: kind.as_str(),
            id: id.to_string(),
        })?;

    let role_attributes = normalize_attributes(role_attributes);
    if role_attributes == entity.role_attributes {
        return Ok(entity);
    }

    entity.role_attributes = role_attributes;
    entity.updated_at = Utc::now().timestamp();

    let model = entities::governed_entity::ActiveModel {
        id: Set(entity.id.clone()),
        role_attributes: Set(serde_json::to_string(&entity.role_attributes)?),
        updated_at: Set(entity.updated_at),
        ..Default::default()
    };
    model.update(tx.conn()).await?;

    tx.fire(FieldChange::RoleAttributes {
        entity: entity.clone(),
    })
    .await?;
    Ok(entity)
}

/// Delete an entity: strip direct references to it from policy role sets,
/// remove its remaining links, then delete the row.
pub async fn delete_entity(
    tx: &mut WriteTx<'_>,
    kind: EntityKind,
    id: &str,
) -> Result<(), PerimeterError> {
    let entity = get_entity(tx.conn(), kind, id)
        .await?
        .ok_or_else(|| PerimeterError::NotFound {
            kind: kind.as_str(),
            id: id.to_string(),
        })?;

    for policy_kind in PolicyKind::ALL {
        for &field in policy_kind.role_fields() {
            if field.entity_kind() != kind {
                continue;
            }
            for policy in list_policies(tx.conn(), policy_kind).await? {
                let roles = policy.roles(field);
                if !references_entity(roles, &entity.id, &entity.name) {
                    continue;
                }
                // Only strip references that resolve to this entity
                let mut stripped = Vec::with_capacity(roles.len());
                for role in roles {
                    let resolves_here = match role.strip_prefix('@') {
                        Some(r) if r == entity.id || r == entity.name => {
                            find_entity_by_id_or_name(tx.conn(), kind, r)
                                .await?
                                .is_some_and(|e| e.id == entity.id)
                        }
                        _ => false,
                    };
                    if !resolves_here {
                        stripped.push(role.clone());
                    }
                }
                if stripped.len() == roles.len() {
                    continue;
                }
                let patch = PolicyPatch::default().with_roles(field, stripped);
                update_policy(tx, &policy.id, patch).await?;
            }
        }
    }

    evaluator::detach_entity(tx, &entity).await?;

    entities::governed_entity::Entity::delete_by_id(entity.id.clone())
        .exec(tx.conn())
        .await?;

    tracing::debug!(entity_id = %entity.id, kind = %kind, "deleted entity");
    Ok(())
}

pub async fn get_entity<C: ConnectionTrait>(
    db: &C,
    kind: EntityKind,
    id: &str,
) -> Result<Option<GovernedEntity>, PerimeterError> {
    use entities::governed_entity::{Column, Entity};

    Entity::find()
        .filter(Column::Id.eq(id))
        .filter(Column::Kind.eq(kind.as_str()))
        .one(db)
        .await?
        .map(entity_from_model)
        .transpose()
}

pub async fn find_entity_by_name<C: ConnectionTrait>(
    db: &C,
    kind: EntityKind,
    name: &str,
) -> Result<Option<GovernedEntity>, PerimeterError> {
    use entities::governed_entity::{Column, Entity};

    Entity::find()
        .filter(Column::Kind.eq(kind.as_str()))
        .filter(Column::Name.eq(name))
        .one(db)
        .await?
        .map(entity_from_model)
        .transpose()
}

/// Resolve an `@` reference: id first, then name within the kind.
pub async fn find_entity_by_id_or_name<C: ConnectionTrait>(
    db: &C,
    kind: EntityKind,
    reference: &str,
) -> Result<Option<GovernedEntity>, PerimeterError> {
    if let Some(entity) = get_entity(db, kind, reference).await? {
        return Ok(Some(entity));
    }
    find_entity_by_name(db, kind, reference).await
}

pub async fn list_entities<C: ConnectionTrait>(
    db: &C,
    kind: EntityKind,
) -> Result<Vec<GovernedEntity>, PerimeterError> {
    use entities::governed_entity::{Column, Entity};

    Entity::find()
        .filter(Column::Kind.eq(kind.as_str()))
        .order_by_asc(Column::Name)
        .all(db)
        .await?
        .into_iter()
        .map(entity_from_model)
        .collect()
}

// ============================================================================
// Policies
// ============================================================================

fn policy_from_model(model: entities::policy::Model) -> Result<Policy, PerimeterError> {
    let kind = PolicyKind::parse(&model.kind)
        .ok_or_else(|| PerimeterError::Other(format!("unknown policy kind `{}`", model.kind)))?;
    let semantic: Semantic = model.semantic.parse()?;
    let policy_type = model
        .policy_type
        .as_deref()
        .map(str::parse::<PolicyType>)
        .transpose()?;

    Ok(Policy {
        id: model.id,
        kind,
        name: model.name,
        semantic,
        policy_type,
        identity_roles: serde_json::from_str(&model.identity_roles)?,
        service_roles: serde_json::from_str(&model.service_roles)?,
        edge_router_roles: serde_json::from_str(&model.edge_router_roles)?,
        posture_check_roles: serde_json::from_str(&model.posture_check_roles)?,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

fn policy_to_active_model(
    policy: &Policy,
) -> Result<entities::policy::ActiveModel, PerimeterError> {
    Ok(entities::policy::ActiveModel {
        id: Set(policy.id.clone()),
        kind: Set(policy.kind.as_str().to_string()),
        name: Set(policy.name.clone()),
        semantic: Set(policy.semantic.as_str().to_string()),
        policy_type: Set(policy.policy_type.map(|t| t.as_str().to_string())),
        identity_roles: Set(serde_json::to_string(&policy.identity_roles)?),
        service_roles: Set(serde_json::to_string(&policy.service_roles)?),
        edge_router_roles: Set(serde_json::to_string(&policy.edge_router_roles)?),
        posture_check_roles: Set(serde_json::to_string(&policy.posture_check_roles)?),
        created_at: Set(policy.created_at),
        updated_at: Set(policy.updated_at),
    })
}

/// Structural checks that run before anything is written.
pub fn validate_policy(policy: &Policy) -> Result<(), FieldError> {
    if policy.name.trim().is_empty() {
        return Err(FieldError::new("name is required", "name", &[policy.name.clone()]));
    }

    match (policy.kind, policy.policy_type) {
        (PolicyKind::ServicePolicy, None) => {
            return Err(FieldError::new(
                "service policies require a type of Dial or Bind",
                "type",
                &[],
            ));
        }
        (PolicyKind::ServicePolicy, Some(_)) => {}
        (kind, Some(policy_type)) => {
            return Err(FieldError::new(
                format!("type is not supported for {kind}"),
                "type",
                &[policy_type.to_string()],
            ));
        }
        (_, None) => {}
    }

    for field in RoleField::ALL {
        let values = policy.roles(field);
        if policy.kind.has_field(field) {
            validate_roles(field.as_str(), values)?;
        } else if !values.is_empty() {
            return Err(FieldError::new(
                format!("{field} is not supported for {}", policy.kind),
                field.as_str(),
                values,
            ));
        }
    }
    Ok(())
}

async fn ensure_policy_name_free<C: ConnectionTrait>(
    db: &C,
    kind: PolicyKind,
    name: &str,
) -> Result<(), PerimeterError> {
    if find_policy_by_name(db, kind, name).await?.is_some() {
        return Err(PerimeterError::Conflict {
            kind: kind.as_str(),
            name: name.to_string(),
        });
    }
    Ok(())
}

async fn evaluate_fields(
    tx: &mut WriteTx<'_>,
    policy: &Policy,
    fields: &[RoleField],
) -> Result<(), PerimeterError> {
    for &field in fields {
        tx.fire(FieldChange::PolicyRoles {
            policy: policy.clone(),
            field,
        })
        .await?;
    }
    Ok(())
}

pub async fn create_policy(
    tx: &mut WriteTx<'_>,
    input: NewPolicy,
) -> Result<Policy, PerimeterError> {
    let now = Utc::now().timestamp();
    let policy = Policy {
        id: input.id.unwrap_or_else(random_id),
        kind: input.kind,
        name: input.name,
        semantic: input.semantic,
        policy_type: input.policy_type,
        identity_roles: input.identity_roles,
        service_roles: input.service_roles,
        edge_router_roles: input.edge_router_roles,
        posture_check_roles: input.posture_check_roles,
        created_at: now,
        updated_at: now,
    };

    validate_policy(&policy)?;
    ensure_policy_name_free(tx.conn(), policy.kind, &policy.name).await?;
    if entities::policy::Entity::find_by_id(policy.id.clone())
        .one(tx.conn())
        .await?
        .is_some()
    {
        return Err(FieldError::new("id is already in use", "id", &[policy.id.clone()]).into());
    }

    policy_to_active_model(&policy)?.insert(tx.conn()).await?;
    tracing::debug!(
        policy_id = %policy.id,
        kind = %policy.kind,
        name = %policy.name,
        "created policy"
    );

    evaluate_fields(tx, &policy, policy.kind.role_fields()).await?;
    Ok(policy)
}

/// Apply a partial update. A type change clears the policy under its old
/// type before evaluating it under the new one.
pub async fn update_policy(
    tx: &mut WriteTx<'_>,
    id: &str,
    patch: PolicyPatch,
) -> Result<Policy, PerimeterError> {
    let current = get_policy(tx.conn(), id)
        .await?
        .ok_or_else(|| PerimeterError::NotFound {
            kind: "policy",
            id: id.to_string(),
        })?;

    let mut next = current.clone();
    if let Some(name) = &patch.name {
        next.name = name.clone();
    }
    if let Some(semantic) = patch.semantic {
        next.semantic = semantic;
    }
    if let Some(policy_type) = patch.policy_type {
        next.policy_type = Some(policy_type);
    }
    for field in RoleField::ALL {
        if let Some(roles) = patch.roles(field) {
            *next.roles_mut(field) = roles.clone();
        }
    }

    validate_policy(&next)?;
    if next.name != current.name {
        ensure_policy_name_free(tx.conn(), next.kind, &next.name).await?;
    }

    let type_changed = next.policy_type != current.policy_type;
    if type_changed {
        clear_policy(tx, &current).await?;
    }

    next.updated_at = Utc::now().timestamp();
    policy_to_active_model(&next)?.update(tx.conn()).await?;

    let reevaluate_all = type_changed || next.semantic != current.semantic;
    let fields: Vec<RoleField> = next
        .kind
        .role_fields()
        .iter()
        .copied()
        .filter(|&f| reevaluate_all || next.roles(f) != current.roles(f))
        .collect();
    evaluate_fields(tx, &next, &fields).await?;

    Ok(next)
}

/// Persist empty role sets and evaluate them, which removes every link of
/// the policy through the regular remove path.
async fn clear_policy(tx: &mut WriteTx<'_>, policy: &Policy) -> Result<(), PerimeterError> {
    let mut cleared = policy.clone();
    for &field in policy.kind.role_fields() {
        cleared.roles_mut(field).clear();
    }
    policy_to_active_model(&cleared)?.update(tx.conn()).await?;
    evaluate_fields(tx, &cleared, cleared.kind.role_fields()).await
}

pub async fn delete_policy(tx: &mut WriteTx<'_>, id: &str) -> Result<(), PerimeterError> {
    let policy = get_policy(tx.conn(), id)
        .await?
        .ok_or_else(|| PerimeterError::NotFound {
            kind: "policy",
            id: id.to_string(),
        })?;

    clear_policy(tx, &policy).await?;
    entities::policy::Entity::delete_by_id(policy.id.clone())
        .exec(tx.conn())
        .await?;

    tracing::debug!(policy_id = %policy.id, kind = %policy.kind, "deleted policy");
    Ok(())
}

/// Re-run evaluation for every role field. A no-op when links are current.
pub async fn reevaluate_policy(tx: &mut WriteTx<'_>, id: &str) -> Result<Policy, PerimeterError> {
    let policy = get_policy(tx.conn(), id)
        .await?
        .ok_or_else(|| PerimeterError::NotFound {
            kind: "policy",
            id: id.to_string(),
        })?;
    evaluate_fields(tx, &policy, policy.kind.role_fields()).await?;
    Ok(policy)
}

pub async fn get_policy<C: ConnectionTrait>(
    db: &C,
    id: &str,
) -> Result<Option<Policy>, PerimeterError> {
    entities::policy::Entity::find_by_id(id.to_string())
        .one(db)
        .await?
        .map(policy_from_model)
        .transpose()
}

pub async fn find_policy_by_name<C: ConnectionTrait>(
    db: &C,
    kind: PolicyKind,
    name: &str,
) -> Result<Option<Policy>, PerimeterError> {
    use entities::policy::{Column, Entity};

    Entity::find()
        .filter(Column::Kind.eq(kind.as_str()))
        .filter(Column::Name.eq(name))
        .one(db)
        .await?
        .map(policy_from_model)
        .transpose()
}

pub async fn list_policies<C: ConnectionTrait>(
    db: &C,
    kind: PolicyKind,
) -> Result<Vec<Policy>, PerimeterError> {
    use entities::policy::{Column, Entity};

    Entity::find()
        .filter(Column::Kind.eq(kind.as_str()))
        .order_by_asc(Column::Name)
        .all(db)
        .await?
        .into_iter()
        .map(policy_from_model)
        .collect()
}

/// Current first-order link membership of one role field.
pub async fn get_related_entities_id_list<C: ConnectionTrait>(
    db: &C,
    kind: PolicyKind,
    policy_id: &str,
    field: RoleField,
) -> Result<Vec<String>, PerimeterError> {
    if !kind.has_field(field) {
        return Err(FieldError::new(
            format!("{field} is not supported for {kind}"),
            field.as_str(),
            &[],
        )
        .into());
    }
    denorm::links_for(kind, field).iterate(db, policy_id).await
}

// ============================================================================
// Access lookups
// ============================================================================

pub async fn has_access<C: ConnectionTrait>(
    db: &C,
    collection: RefCountedLinkCollection,
    source_id: &str,
    target_id: &str,
) -> Result<bool, PerimeterError> {
    Ok(collection.get_count(db, source_id, target_id).await?.is_some())
}

pub async fn can_dial<C: ConnectionTrait>(
    db: &C,
    identity_id: &str,
    service_id: &str,
) -> Result<bool, PerimeterError> {
    has_access(db, links::IDENTITY_DIAL_SERVICES, identity_id, service_id).await
}

pub async fn can_bind<C: ConnectionTrait>(
    db: &C,
    identity_id: &str,
    service_id: &str,
) -> Result<bool, PerimeterError> {
    has_access(db, links::IDENTITY_BIND_SERVICES, identity_id, service_id).await
}

pub async fn can_use_edge_router<C: ConnectionTrait>(
    db: &C,
    identity_id: &str,
    edge_router_id: &str,
) -> Result<bool, PerimeterError> {
    has_access(db, links::IDENTITY_EDGE_ROUTERS, identity_id, edge_router_id).await
}

pub async fn service_on_edge_router<C: ConnectionTrait>(
    db: &C,
    service_id: &str,
    edge_router_id: &str,
) -> Result<bool, PerimeterError> {
    has_access(db, links::SERVICE_EDGE_ROUTERS, service_id, edge_router_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm_migration::MigratorTrait;
    use tempfile::NamedTempFile;

    /// Test database helper that keeps temp file alive
    struct TestDb {
        store: Store,
        _temp_file: NamedTempFile,
    }

    impl TestDb {
        async fn new() -> Self {
            let temp_file = NamedTempFile::new().expect("Failed to create temp file");
            let db_path = temp_file.path().to_str().expect("Invalid temp file path");
            let db_url = format!("sqlite://{}?mode=rwc", db_path);

            let connection = Database::connect(&db_url)
                .await
                .expect("Failed to connect to test database");

            migration::Migrator::up(&connection, None)
                .await
                .expect("Failed to run migrations");

            Self {
                store: Store::new(connection),
                _temp_file: temp_file,
            }
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    // ============================================================================
    // Entity Tests
    // ============================================================================

    #[tokio::test]
    async fn test_create_and_get_entity() {
        let db = TestDb::new().await;
        let mut tx = db.store.begin().await.unwrap();
        let entity = create_entity(
            &mut tx,
            EntityKind::Identity,
            "alice",
            None,
            strings(&["ops", "eng", "ops"]),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(entity.role_attributes, strings(&["eng", "ops"]));
        assert!(!entity.id.is_empty());

        let conn = db.store.connection();
        let found = get_entity(conn, EntityKind::Identity, &entity.id).await.unwrap();
        assert_eq!(found, Some(entity.clone()));
        // Wrong kind does not match
        assert!(get_entity(conn, EntityKind::Service, &entity.id).await.unwrap().is_none());
        let by_name = find_entity_by_id_or_name(conn, EntityKind::Identity, "alice")
            .await
            .unwrap();
        assert_eq!(by_name.map(|e| e.id), Some(entity.id));
    }

    #[tokio::test]
    async fn test_entity_name_conflict() {
        let db = TestDb::new().await;
        let mut tx = db.store.begin().await.unwrap();
        create_entity(&mut tx, EntityKind::Service, "billing", None, vec![])
            .await
            .unwrap();
        let err = create_entity(&mut tx, EntityKind::Service, "billing", None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, PerimeterError::Conflict { kind: "service", .. }));

        // Same name under another kind is fine
        create_entity(&mut tx, EntityKind::EdgeRouter, "billing", None, vec![])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_explicit_entity_id() {
        let db = TestDb::new().await;
        let mut tx = db.store.begin().await.unwrap();
        let entity = create_entity(&mut tx, EntityKind::Identity, "a", Some("i-1".into()), vec![])
            .await
            .unwrap();
        assert_eq!(entity.id, "i-1");

        let err = create_entity(&mut tx, EntityKind::Service, "b", Some("i-1".into()), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, PerimeterError::Field(ref f) if f.field == "id"));
    }

    #[tokio::test]
    async fn test_update_role_attributes_unchanged_is_noop() {
        let db = TestDb::new().await;
        let mut tx = db.store.begin().await.unwrap();
        let entity = create_entity(&mut tx, EntityKind::Identity, "a", None, strings(&["x", "y"]))
            .await
            .unwrap();
        let same = update_role_attributes(
            &mut tx,
            EntityKind::Identity,
            &entity.id,
            strings(&["y", "x"]),
        )
        .await
        .unwrap();
        assert_eq!(same.updated_at, entity.updated_at);

        let err = update_role_attributes(&mut tx, EntityKind::Identity, "missing", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, PerimeterError::NotFound { .. }));
    }

    // ============================================================================
    // Policy Tests
    // ============================================================================

    #[tokio::test]
    async fn test_create_policy_validation() {
        let db = TestDb::new().await;
        let mut tx = db.store.begin().await.unwrap();

        let err = create_policy(&mut tx, NewPolicy::new(PolicyKind::ServicePolicy, "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, PerimeterError::Field(ref f) if f.field == "type"));

        let mut input = NewPolicy::new(PolicyKind::EdgeRouterPolicy, "p");
        input.policy_type = Some(PolicyType::Dial);
        let err = create_policy(&mut tx, input).await.unwrap_err();
        assert!(matches!(err, PerimeterError::Field(ref f) if f.field == "type"));

        let mut input = NewPolicy::new(PolicyKind::ServiceEdgeRouterPolicy, "p");
        input.identity_roles = strings(&["#all"]);
        let err = create_policy(&mut tx, input).await.unwrap_err();
        assert!(matches!(err, PerimeterError::Field(ref f) if f.field == "identityRoles"));

        let mut input = NewPolicy::new(PolicyKind::EdgeRouterPolicy, "p");
        input.identity_roles = strings(&["#all", "#eng"]);
        let err = create_policy(&mut tx, input).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "the value '[#all #eng]' for 'identityRoles' is invalid: if using #all, it should be the only role specified"
        );
    }

    #[tokio::test]
    async fn test_unresolved_reference_fails() {
        let db = TestDb::new().await;
        let mut tx = db.store.begin().await.unwrap();

        let mut input = NewPolicy::new(PolicyKind::EdgeRouterPolicy, "p");
        input.identity_roles = strings(&["@ghost", "#eng"]);
        let err = create_policy(&mut tx, input).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "the value '[@ghost]' for 'identityRoles' is invalid: no identity found with the given ids or names"
        );
    }

    #[tokio::test]
    async fn test_policy_name_conflict_and_lookup() {
        let db = TestDb::new().await;
        let mut tx = db.store.begin().await.unwrap();
        let policy = create_policy(&mut tx, NewPolicy::new(PolicyKind::EdgeRouterPolicy, "p"))
            .await
            .unwrap();
        let err = create_policy(&mut tx, NewPolicy::new(PolicyKind::EdgeRouterPolicy, "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, PerimeterError::Conflict { .. }));
        tx.commit().await.unwrap();

        let conn = db.store.connection();
        let found = find_policy_by_name(conn, PolicyKind::EdgeRouterPolicy, "p")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, policy.id);
        assert_eq!(found.semantic, Semantic::AllOf);
        assert!(find_policy_by_name(conn, PolicyKind::ServicePolicy, "p")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_related_entities_follow_role_sets() {
        let db = TestDb::new().await;
        let mut tx = db.store.begin().await.unwrap();
        let alice = create_entity(
            &mut tx,
            EntityKind::Identity,
            "alice",
            Some("i-a".into()),
            strings(&["eng"]),
        )
        .await
        .unwrap();
        create_entity(&mut tx, EntityKind::Identity, "bob", Some("i-b".into()), strings(&["ops"]))
            .await
            .unwrap();

        let mut input = NewPolicy::new(PolicyKind::EdgeRouterPolicy, "p");
        input.identity_roles = strings(&["#eng"]);
        let policy = create_policy(&mut tx, input).await.unwrap();

        let linked = get_related_entities_id_list(
            tx.conn(),
            PolicyKind::EdgeRouterPolicy,
            &policy.id,
            RoleField::IdentityRoles,
        )
        .await
        .unwrap();
        assert_eq!(linked, vec![alice.id.clone()]);

        update_policy(
            &mut tx,
            &policy.id,
            PolicyPatch::default().with_roles(RoleField::IdentityRoles, strings(&["#all"])),
        )
        .await
        .unwrap();
        let linked = get_related_entities_id_list(
            tx.conn(),
            PolicyKind::EdgeRouterPolicy,
            &policy.id,
            RoleField::IdentityRoles,
        )
        .await
        .unwrap();
        assert_eq!(linked, strings(&["i-a", "i-b"]));

        delete_policy(&mut tx, &policy.id).await.unwrap();
        assert!(links::EDGE_ROUTER_POLICY_IDENTITIES
            .iterate(tx.conn(), &policy.id)
            .await
            .unwrap()
            .is_empty());
        assert!(get_policy(tx.conn(), &policy.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_discards_writes_and_events() {
        let db = TestDb::new().await;
        let mut tx = db.store.begin().await.unwrap();
        create_entity(&mut tx, EntityKind::Identity, "alice", None, vec![])
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(list_entities(db.store.connection(), EntityKind::Identity)
            .await
            .unwrap()
            .is_empty());
        // The writer lock was released
        let tx = db.store.begin().await.unwrap();
        assert!(tx.pending_events().is_empty());
    }
}

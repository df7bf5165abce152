//! Persistent link collections.
//!
//! A [`LinkCollection`] holds first-order `(policy, entity)` facts. A
//! [`RefCountedLinkCollection`] holds denormalized `(source, target)` facts
//! together with the number of policies currently producing them. Both are
//! rows in a shared table keyed by collection name; the composite primary key
//! serves forward lookups and a secondary index serves reverse lookups.

use std::fmt;

use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set};

use crate::entities::{denorm_link, policy_link};
use crate::errors::PerimeterError;

// First-order collections, one per (policy kind, role field)
pub const EDGE_ROUTER_POLICY_IDENTITIES: LinkCollection =
    LinkCollection::new("edge-router-policy.identities");
pub const EDGE_ROUTER_POLICY_EDGE_ROUTERS: LinkCollection =
    LinkCollection::new("edge-router-policy.edge-routers");
pub const SERVICE_POLICY_IDENTITIES: LinkCollection =
    LinkCollection::new("service-policy.identities");
pub const SERVICE_POLICY_SERVICES: LinkCollection = LinkCollection::new("service-policy.services");
pub const SERVICE_POLICY_POSTURE_CHECKS: LinkCollection =
    LinkCollection::new("service-policy.posture-checks");
pub const SERVICE_EDGE_ROUTER_POLICY_SERVICES: LinkCollection =
    LinkCollection::new("service-edge-router-policy.services");
pub const SERVICE_EDGE_ROUTER_POLICY_EDGE_ROUTERS: LinkCollection =
    LinkCollection::new("service-edge-router-policy.edge-routers");

// Denormalized collections
pub const IDENTITY_EDGE_ROUTERS: RefCountedLinkCollection =
    RefCountedLinkCollection::new("identity.edge-routers");
pub const IDENTITY_DIAL_SERVICES: RefCountedLinkCollection =
    RefCountedLinkCollection::new("identity.dial-services");
pub const IDENTITY_BIND_SERVICES: RefCountedLinkCollection =
    RefCountedLinkCollection::new("identity.bind-services");
pub const SERVICE_EDGE_ROUTERS: RefCountedLinkCollection =
    RefCountedLinkCollection::new("service.edge-routers");
pub const SERVICE_DIAL_POSTURE_CHECKS: RefCountedLinkCollection =
    RefCountedLinkCollection::new("service.dial-posture-checks");
pub const SERVICE_BIND_POSTURE_CHECKS: RefCountedLinkCollection =
    RefCountedLinkCollection::new("service.bind-posture-checks");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkCollection {
    name: &'static str,
}

impl LinkCollection {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns false if the link already existed.
    pub async fn add<C: ConnectionTrait>(
        &self,
        db: &C,
        policy_id: &str,
        entity_id: &str,
    ) -> Result<bool, PerimeterError> {
        if self.is_linked(db, policy_id, entity_id).await? {
            return Ok(false);
        }

        let link = policy_link::ActiveModel {
            collection: Set(self.name.to_string()),
            policy_id: Set(policy_id.to_string()),
            entity_id: Set(entity_id.to_string()),
        };
        policy_link::Entity::insert(link)
            .exec_without_returning(db)
            .await?;
        Ok(true)
    }

    /// Returns false if there was no such link.
    pub async fn remove<C: ConnectionTrait>(
        &self,
        db: &C,
        policy_id: &str,
        entity_id: &str,
    ) -> Result<bool, PerimeterError> {
        use policy_link::{Column, Entity};

        let result = Entity::delete_many()
            .filter(Column::Collection.eq(self.name))
            .filter(Column::PolicyId.eq(policy_id))
            .filter(Column::EntityId.eq(entity_id))
            .exec(db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Entities linked to `policy_id`.
    pub async fn iterate<C: ConnectionTrait>(
        &self,
        db: &C,
        policy_id: &str,
    ) -> Result<Vec<String>, PerimeterError> {
        use policy_link::{Column, Entity};

        let rows = Entity::find()
            .filter(Column::Collection.eq(self.name))
            .filter(Column::PolicyId.eq(policy_id))
            .order_by_asc(Column::EntityId)
            .all(db)
            .await?;
        Ok(rows.into_iter().map(|r| r.entity_id).collect())
    }

    /// Policies linked to `entity_id`.
    pub async fn iterate_reverse<C: ConnectionTrait>(
        &self,
        db: &C,
        entity_id: &str,
    ) -> Result<Vec<String>, PerimeterError> {
        use policy_link::{Column, Entity};

        let rows = Entity::find()
            .filter(Column::Collection.eq(self.name))
            .filter(Column::EntityId.eq(entity_id))
            .order_by_asc(Column::PolicyId)
            .all(db)
            .await?;
        Ok(rows.into_iter().map(|r| r.policy_id).collect())
    }

    pub async fn is_linked<C: ConnectionTrait>(
        &self,
        db: &C,
        policy_id: &str,
        entity_id: &str,
    ) -> Result<bool, PerimeterError> {
        use policy_link::{Column, Entity};

        Ok(Entity::find()
            .filter(Column::Collection.eq(self.name))
            .filter(Column::PolicyId.eq(policy_id))
            .filter(Column::EntityId.eq(entity_id))
            .one(db)
            .await?
            .is_some())
    }

    /// Every `(policy, entity)` pair in the collection.
    pub async fn all<C: ConnectionTrait>(
        &self,
        db: &C,
    ) -> Result<Vec<(String, String)>, PerimeterError> {
        use policy_link::{Column, Entity};

        let rows = Entity::find()
            .filter(Column::Collection.eq(self.name))
            .order_by_asc(Column::PolicyId)
            .order_by_asc(Column::EntityId)
            .all(db)
            .await?;
        Ok(rows.into_iter().map(|r| (r.policy_id, r.entity_id)).collect())
    }
}

impl fmt::Display for LinkCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Outcome of incrementing or decrementing a reference-counted link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountChange {
    /// 0 -> 1: the link was created
    Gained,
    /// 1 -> 0: the link was deleted
    Lost,
    /// Any other transition; carries the new count
    Changed(i32),
    /// Decrement of a link that does not exist
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefCountedLinkCollection {
    name: &'static str,
}

impl RefCountedLinkCollection {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `None` means there is no link.
    pub async fn get_count<C: ConnectionTrait>(
        &self,
        db: &C,
        source_id: &str,
        target_id: &str,
    ) -> Result<Option<i32>, PerimeterError> {
        use denorm_link::{Column, Entity};

        Ok(Entity::find()
            .filter(Column::Collection.eq(self.name))
            .filter(Column::SourceId.eq(source_id))
            .filter(Column::TargetId.eq(target_id))
            .one(db)
            .await?
            .map(|m| m.link_count))
    }

    pub async fn increment<C: ConnectionTrait>(
        &self,
        db: &C,
        source_id: &str,
        target_id: &str,
    ) -> Result<CountChange, PerimeterError> {
        match self.get_count(db, source_id, target_id).await? {
            None => {
                self.set_count(db, source_id, target_id, 1).await?;
                Ok(CountChange::Gained)
            }
            Some(count) => {
                self.set_count(db, source_id, target_id, count + 1).await?;
                Ok(CountChange::Changed(count + 1))
            }
        }
    }

    pub async fn decrement<C: ConnectionTrait>(
        &self,
        db: &C,
        source_id: &str,
        target_id: &str,
    ) -> Result<CountChange, PerimeterError> {
        match self.get_count(db, source_id, target_id).await? {
            None => Ok(CountChange::Missing),
            Some(count) if count <= 1 => {
                self.set_count(db, source_id, target_id, 0).await?;
                Ok(CountChange::Lost)
            }
            Some(count) => {
                self.set_count(db, source_id, target_id, count - 1).await?;
                Ok(CountChange::Changed(count - 1))
            }
        }
    }

    /// Overwrite the count; zero or less removes the link.
    pub async fn set_count<C: ConnectionTrait>(
        &self,
        db: &C,
        source_id: &str,
        target_id: &str,
        count: i32,
    ) -> Result<(), PerimeterError> {
        use denorm_link::{Column, Entity};

        if count <= 0 {
            Entity::delete_many()
                .filter(Column::Collection.eq(self.name))
                .filter(Column::SourceId.eq(source_id))
                .filter(Column::TargetId.eq(target_id))
                .exec(db)
                .await?;
            return Ok(());
        }

        let updated = Entity::update_many()
            .col_expr(Column::LinkCount, Expr::value(count))
            .filter(Column::Collection.eq(self.name))
            .filter(Column::SourceId.eq(source_id))
            .filter(Column::TargetId.eq(target_id))
            .exec(db)
            .await?;

        if updated.rows_affected == 0 {
            let link = denorm_link::ActiveModel {
                collection: Set(self.name.to_string()),
                source_id: Set(source_id.to_string()),
                target_id: Set(target_id.to_string()),
                link_count: Set(count),
            };
            Entity::insert(link).exec_without_returning(db).await?;
        }
        Ok(())
    }

    /// Targets linked from `source_id`.
    pub async fn iterate<C: ConnectionTrait>(
        &self,
        db: &C,
        source_id: &str,
    ) -> Result<Vec<String>, PerimeterError> {
        use denorm_link::{Column, Entity};

        let rows = Entity::find()
            .filter(Column::Collection.eq(self.name))
            .filter(Column::SourceId.eq(source_id))
            .order_by_asc(Column::TargetId)
            .all(db)
            .await?;
        Ok(rows.into_iter().map(|r| r.target_id).collect())
    }

    /// Sources linked to `target_id`.
    pub async fn iterate_reverse<C: ConnectionTrait>(
        &self,
        db: &C,
        target_id: &str,
    ) -> Result<Vec<String>, PerimeterError> {
        use denorm_link::{Column, Entity};

        let rows = Entity::find()
            .filter(Column::Collection.eq(self.name))
            .filter(Column::TargetId.eq(target_id))
            .order_by_asc(Column::SourceId)
            .all(db)
            .await?;
        Ok(rows.into_iter().map(|r| r.source_id).collect())
    }

    /// Every `(source, target, count)` row in the collection.
    pub async fn all<C: ConnectionTrait>(
        &self,
        db: &C,
    ) -> Result<Vec<(String, String, i32)>, PerimeterError> {
        use denorm_link::{Column, Entity};

        let rows = Entity::find()
            .filter(Column::Collection.eq(self.name))
            .order_by_asc(Column::SourceId)
            .order_by_asc(Column::TargetId)
            .all(db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.source_id, r.target_id, r.link_count))
            .collect())
    }
}

impl fmt::Display for RefCountedLinkCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{Database, DatabaseConnection};
    use sea_orm_migration::MigratorTrait;
    use tempfile::NamedTempFile;

    struct TestDb {
        connection: DatabaseConnection,
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
                connection,
                _temp_file: temp_file,
            }
        }
    }

    const LINKS: LinkCollection = LinkCollection::new("test.links");
    const OTHER: LinkCollection = LinkCollection::new("test.other");
    const COUNTED: RefCountedLinkCollection = RefCountedLinkCollection::new("test.counted");

    #[tokio::test]
    async fn test_link_both_directions() {
        let test_db = TestDb::new().await;
        let db = &test_db.connection;

        assert!(LINKS.add(db, "p1", "e1").await.unwrap());
        assert!(LINKS.add(db, "p1", "e2").await.unwrap());
        assert!(LINKS.add(db, "p2", "e1").await.unwrap());
        assert!(!LINKS.add(db, "p1", "e1").await.unwrap());

        assert_eq!(LINKS.iterate(db, "p1").await.unwrap(), vec!["e1", "e2"]);
        assert_eq!(LINKS.iterate_reverse(db, "e1").await.unwrap(), vec!["p1", "p2"]);
        assert!(LINKS.is_linked(db, "p2", "e1").await.unwrap());
        assert!(!LINKS.is_linked(db, "p2", "e2").await.unwrap());
    }

    #[tokio::test]
    async fn test_link_remove_and_isolation() {
        let test_db = TestDb::new().await;
        let db = &test_db.connection;

        LINKS.add(db, "p1", "e1").await.unwrap();
        OTHER.add(db, "p1", "e1").await.unwrap();

        assert!(LINKS.remove(db, "p1", "e1").await.unwrap());
        assert!(!LINKS.remove(db, "p1", "e1").await.unwrap());
        assert!(LINKS.iterate(db, "p1").await.unwrap().is_empty());
        assert!(LINKS.iterate_reverse(db, "e1").await.unwrap().is_empty());
        // Same pair in another collection is untouched
        assert!(OTHER.is_linked(db, "p1", "e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_ref_count_transitions() {
        let test_db = TestDb::new().await;
        let db = &test_db.connection;

        assert_eq!(COUNTED.get_count(db, "a", "b").await.unwrap(), None);
        assert_eq!(COUNTED.increment(db, "a", "b").await.unwrap(), CountChange::Gained);
        assert_eq!(
            COUNTED.increment(db, "a", "b").await.unwrap(),
            CountChange::Changed(2)
        );
        assert_eq!(COUNTED.get_count(db, "a", "b").await.unwrap(), Some(2));

        assert_eq!(
            COUNTED.decrement(db, "a", "b").await.unwrap(),
            CountChange::Changed(1)
        );
        assert_eq!(COUNTED.decrement(db, "a", "b").await.unwrap(), CountChange::Lost);
        assert_eq!(COUNTED.get_count(db, "a", "b").await.unwrap(), None);
        assert_eq!(COUNTED.decrement(db, "a", "b").await.unwrap(), CountChange::Missing);
    }

    #[tokio::test]
    async fn test_ref_count_iteration() {
        let test_db = TestDb::new().await;
        let db = &test_db.connection;

        COUNTED.increment(db, "a", "x").await.unwrap();
        COUNTED.increment(db, "a", "y").await.unwrap();
        COUNTED.increment(db, "b", "x").await.unwrap();
        COUNTED.set_count(db, "b", "x", 5).await.unwrap();

        assert_eq!(COUNTED.iterate(db, "a").await.unwrap(), vec!["x", "y"]);
        assert_eq!(COUNTED.iterate_reverse(db, "x").await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            COUNTED.all(db).await.unwrap(),
            vec![
                ("a".to_string(), "x".to_string(), 1),
                ("a".to_string(), "y".to_string(), 1),
                ("b".to_string(), "x".to_string(), 5),
            ]
        );

        COUNTED.set_count(db, "b", "x", 0).await.unwrap();
        assert_eq!(COUNTED.get_count(db, "b", "x").await.unwrap(), None);
    }
}

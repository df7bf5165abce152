use perimeter::storage::{Store, WriteTx};
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    store: Store,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        // Connect to database
        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        // Run migrations
        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            store: Store::new(connection),
            _temp_file: temp_file,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        self.store.connection()
    }

    pub async fn begin(&self) -> WriteTx<'_> {
        self.store.begin().await.expect("Failed to open write transaction")
    }
}

/// Commit and wait until subscribers have seen the commit's events.
pub async fn commit(tx: WriteTx<'_>) -> usize {
    let committed = tx.commit().await.expect("Failed to commit");
    let events = committed.events;
    committed.dispatched().await;
    events
}

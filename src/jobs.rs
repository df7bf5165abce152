use crate::entities;
use crate::errors::PerimeterError;
use crate::settings::Integrity as IntegrityCfg;
use crate::storage::Store;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, NotSet,
    QueryFilter, Set,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub const CHECK_INTEGRITY: &str = "check_integrity";
pub const REPAIR_INTEGRITY: &str = "repair_integrity";

/// Outcome of one integrity run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityRun {
    pub found: usize,
    pub fixed: usize,
}

impl IntegrityRun {
    pub fn unfixed(&self) -> usize {
        self.found - self.fixed
    }
}

/// Run the integrity checker once, logging every discrepancy.
pub async fn run_integrity_check(
    store: &Store,
    repair: bool,
) -> Result<IntegrityRun, PerimeterError> {
    let mut run = IntegrityRun::default();
    store
        .check_integrity(repair, |violation, fixed| {
            run.found += 1;
            if fixed {
                run.fixed += 1;
            }
            warn!(fixed, "integrity discrepancy: {violation}");
        })
        .await?;
    Ok(run)
}

/// Initialize and start the job scheduler with the integrity check
pub async fn init_scheduler(
    store: Store,
    cfg: &IntegrityCfg,
) -> Result<JobScheduler, PerimeterError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| PerimeterError::Other(format!("Failed to create job scheduler: {}", e)))?;

    let job_name = if cfg.repair { REPAIR_INTEGRITY } else { CHECK_INTEGRITY };
    let repair = cfg.repair;

    let integrity_job = Job::new_async(cfg.schedule.as_str(), move |_uuid, _l| {
        let store = store.clone();
        Box::pin(async move {
            info!("Running {} job", job_name);
            execute_recorded(&store, job_name, repair).await;
        })
    })
    .map_err(|e| PerimeterError::Other(format!("Failed to create integrity job: {}", e)))?;

    sched
        .add(integrity_job)
        .await
        .map_err(|e| PerimeterError::Other(format!("Failed to add integrity job: {}", e)))?;

    // Start the scheduler
    sched
        .start()
        .await
        .map_err(|e| PerimeterError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!(schedule = %cfg.schedule, job = job_name, "Job scheduler started");

    Ok(sched)
}

/// Run an integrity check and record it in `job_executions`. Failures are
/// logged, not returned.
async fn execute_recorded(store: &Store, job_name: &str, repair: bool) {
    let db = store.connection();
    let execution_id = start_job_execution(db, job_name).await.ok();

    match run_integrity_check(store, repair).await {
        Ok(run) => {
            info!(
                found = run.found,
                fixed = run.fixed,
                "{} job completed", job_name
            );
            if let Some(id) = execution_id {
                let _ = complete_job_execution(db, id, true, None, Some(run.found as i64)).await;
            }
        }
        Err(e) => {
            error!("{} job failed: {}", job_name, e);
            if let Some(id) = execution_id {
                let _ = complete_job_execution(db, id, false, Some(e.to_string()), None).await;
            }
        }
    }
}

/// Record the start of a job execution
pub async fn start_job_execution(
    db: &DatabaseConnection,
    job_name: &str,
) -> Result<i64, PerimeterError> {
    use entities::job_execution;

    let now = Utc::now().timestamp();

    let execution = job_execution::ActiveModel {
        id: NotSet,
        job_name: Set(job_name.to_string()),
        started_at: Set(now),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        records_processed: Set(None),
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

/// Record the completion of a job execution
pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<(), PerimeterError> {
    use entities::job_execution::{Column, Entity};

    let now = Utc::now().timestamp();

    if let Some(execution) = Entity::find()
        .filter(Column::Id.eq(execution_id))
        .one(db)
        .await?
    {
        let mut active: entities::job_execution::ActiveModel = execution.into_active_model();
        active.completed_at = Set(Some(now));
        active.success = Set(Some(if success { 1 } else { 0 }));
        active.error_message = Set(error_message);
        active.records_processed = Set(records_processed);
        active.update(db).await?;
    }

    Ok(())
}

/// Manually trigger a job by name (useful for admin tooling)
pub async fn trigger_job_manually(
    store: &Store,
    job_name: &str,
) -> Result<IntegrityRun, PerimeterError> {
    let repair = match job_name {
        CHECK_INTEGRITY => false,
        REPAIR_INTEGRITY => true,
        _ => {
            return Err(PerimeterError::Other(format!("Unknown job name: {}", job_name)));
        }
    };

    info!("Manually triggering job: {}", job_name);
    let db = store.connection();
    let execution_id = start_job_execution(db, job_name).await?;

    match run_integrity_check(store, repair).await {
        Ok(run) => {
            info!(
                found = run.found,
                fixed = run.fixed,
                "Manually triggered job {} completed", job_name
            );
            complete_job_execution(db, execution_id, true, None, Some(run.found as i64)).await?;
            Ok(run)
        }
        Err(e) => {
            error!("Manually triggered job {} failed: {}", job_name, e);
            complete_job_execution(db, execution_id, false, Some(e.to_string()), None).await?;
            Err(e)
        }
    }
}

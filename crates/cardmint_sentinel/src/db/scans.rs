//! Scan job persistence and the state-machine engine.
//!
//! Every mutation is durable and edge-checked: a transition writes the new
//! status, updated_at and any derived fields in one statement guarded by
//! `WHERE status = expected`, or not at all. The processor lease is a CAS
//! over (processor_id, locked_at) and is the only at-most-once mechanism
//! under concurrent workers.

use cardmint_protocol::error::ErrorCode;
use cardmint_protocol::fields::{Candidate, ExtractedFields, TruthCore};
use cardmint_protocol::ids::{JobId, ProcessorId};
use cardmint_protocol::status::JobStatus;
use cardmint_protocol::timings::{InferencePath, StageTimings};
use sqlx::{FromRow, Pool, Sqlite};
use thiserror::Error;
use tracing::{info, warn};

use super::now_ms;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("INVALID_TRANSITION: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("LEASE_LOST: scan {0}")]
    LeaseLost(JobId),
    #[error("scan {0} not found")]
    NotFound(JobId),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Stable error code for persistence and session events.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            StoreError::InvalidTransition { .. } => Some(ErrorCode::InvalidTransition),
            StoreError::LeaseLost(_) => Some(ErrorCode::LeaseLost),
            _ => None,
        }
    }
}

/// The scan-job aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanJob {
    pub id: JobId,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: JobStatus,
    pub raw_image: Option<String>,
    pub processed_image: Option<String>,
    pub master_image: Option<String>,
    pub extracted_fields: Option<ExtractedFields>,
    pub candidates: Vec<Candidate>,
    pub timings: StageTimings,
    pub retry_count: i64,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub operator: Option<String>,
    pub processor_id: Option<ProcessorId>,
    pub locked_at: Option<i64>,
    pub inference_path: Option<InferencePath>,
    pub truth_core: Option<TruthCore>,
}

/// Raw row shape; JSON columns decode in the conversion.
#[derive(Debug, FromRow)]
struct ScanRow {
    id: String,
    created_at: i64,
    updated_at: i64,
    status: String,
    raw_image: Option<String>,
    processed_image: Option<String>,
    master_image: Option<String>,
    extracted_fields: Option<String>,
    candidates: Option<String>,
    timings: Option<String>,
    retry_count: i64,
    error_code: Option<String>,
    error_message: Option<String>,
    operator: Option<String>,
    processor_id: Option<String>,
    locked_at: Option<i64>,
    inference_path: Option<String>,
    accepted_name: Option<String>,
    accepted_hp: Option<i64>,
    accepted_collector_no: Option<String>,
    accepted_set_name: Option<String>,
    accepted_set_size: Option<i64>,
    accepted_variant_tags: Option<String>,
}

impl TryFrom<ScanRow> for ScanJob {
    type Error = StoreError;

    fn try_from(row: ScanRow) -> Result<ScanJob, StoreError> {
        let id = JobId::parse(&row.id)
            .map_err(|_| StoreError::Db(sqlx::Error::Decode("bad job id".into())))?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Db(sqlx::Error::Decode("bad status".into())))?;
        let truth_core = match row.accepted_name {
            Some(accepted_name) => Some(TruthCore {
                accepted_name,
                accepted_hp: row.accepted_hp.map(|v| v as u16),
                accepted_collector_no: row.accepted_collector_no,
                accepted_set_name: row.accepted_set_name,
                accepted_set_size: row.accepted_set_size.map(|v| v as u32),
                accepted_variant_tags: row
                    .accepted_variant_tags
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?
                    .unwrap_or_default(),
            }),
            None => None,
        };
        Ok(ScanJob {
            id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            status,
            raw_image: row.raw_image,
            processed_image: row.processed_image,
            master_image: row.master_image,
            extracted_fields: row
                .extracted_fields
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            candidates: row
                .candidates
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or_default(),
            timings: row
                .timings
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or_default(),
            retry_count: row.retry_count,
            error_code: row.error_code.as_deref().and_then(ErrorCode::parse),
            error_message: row.error_message,
            operator: row.operator,
            processor_id: row
                .processor_id
                .as_deref()
                .and_then(|p| ProcessorId::parse(p).ok()),
            locked_at: row.locked_at,
            inference_path: match row.inference_path.as_deref() {
                Some("primary") => Some(InferencePath::Primary),
                Some("fallback") => Some(InferencePath::Fallback),
                _ => None,
            },
            truth_core,
        })
    }
}

/// Field updates applied atomically with a transition. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct ScanPatch {
    pub raw_image: Option<String>,
    pub processed_image: Option<String>,
    pub master_image: Option<String>,
    pub extracted_fields: Option<ExtractedFields>,
    pub candidates: Option<Vec<Candidate>>,
    pub timings: Option<StageTimings>,
    pub error: Option<(ErrorCode, String)>,
    pub operator: Option<String>,
    pub inference_path: Option<InferencePath>,
    pub truth_core: Option<TruthCore>,
    pub retry_increment: i64,
}

#[derive(Clone)]
pub struct ScanStore {
    pool: Pool<Sqlite>,
}

impl ScanStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Create a QUEUED scan for a detected capture.
    pub async fn create(&self, raw_image: &str) -> Result<JobId, StoreError> {
        let id = JobId::new();
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO scans (id, created_at, updated_at, status, raw_image)
            VALUES (?, ?, ?, 'QUEUED', ?)
            "#,
        )
        .bind(id.as_str())
        .bind(now)
        .bind(now)
        .bind(raw_image)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get(&self, id: &JobId) -> Result<ScanJob, StoreError> {
        let row: Option<ScanRow> = sqlx::query_as("SELECT * FROM scans WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| StoreError::NotFound(id.clone()))?
            .try_into()
    }

    /// CAS lease acquisition: succeeds iff unowned or the previous lease
    /// expired.
    pub async fn acquire_lease(
        &self,
        id: &JobId,
        processor: &ProcessorId,
        expiry_secs: i64,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        let cutoff = now - expiry_secs * 1000;
        let rows_affected = sqlx::query(
            r#"
            UPDATE scans
            SET processor_id = ?, locked_at = ?
            WHERE id = ?
              AND (processor_id IS NULL OR processor_id = ? OR locked_at < ?)
            "#,
        )
        .bind(processor.as_str())
        .bind(now)
        .bind(id.as_str())
        .bind(processor.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::LeaseLost(id.clone()));
        }
        Ok(())
    }

    /// Explicit unlock without a terminal transition.
    pub async fn release_lease(&self, id: &JobId, processor: &ProcessorId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scans
            SET processor_id = NULL, locked_at = NULL
            WHERE id = ? AND processor_id = ?
            "#,
        )
        .bind(id.as_str())
        .bind(processor.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Edge-checked, atomic status transition. The lease is released
    /// automatically on terminal transitions.
    pub async fn transition(
        &self,
        id: &JobId,
        expected: JobStatus,
        next: JobStatus,
        patch: ScanPatch,
    ) -> Result<(), StoreError> {
        if !expected.can_transition_to(next) {
            warn!("Rejected transition {expected} -> {next} for scan {id}");
            return Err(StoreError::InvalidTransition {
                from: expected,
                to: next,
            });
        }

        let (error_code, error_message) = match &patch.error {
            Some((code, message)) => (Some(code.as_str()), Some(message.clone())),
            None => (None, None),
        };
        let truth = patch.truth_core.as_ref();
        let clear_lease = next.is_terminal();

        let rows_affected = sqlx::query(
            r#"
            UPDATE scans SET
                status = ?,
                updated_at = ?,
                raw_image = COALESCE(?, raw_image),
                processed_image = COALESCE(?, processed_image),
                master_image = COALESCE(?, master_image),
                extracted_fields = COALESCE(?, extracted_fields),
                candidates = COALESCE(?, candidates),
                timings = COALESCE(?, timings),
                error_code = COALESCE(?, error_code),
                error_message = COALESCE(?, error_message),
                operator = COALESCE(?, operator),
                inference_path = COALESCE(?, inference_path),
                accepted_name = COALESCE(?, accepted_name),
                accepted_hp = COALESCE(?, accepted_hp),
                accepted_collector_no = COALESCE(?, accepted_collector_no),
                accepted_set_name = COALESCE(?, accepted_set_name),
                accepted_set_size = COALESCE(?, accepted_set_size),
                accepted_variant_tags = COALESCE(?, accepted_variant_tags),
                retry_count = retry_count + ?,
                processor_id = CASE WHEN ? THEN NULL ELSE processor_id END,
                locked_at = CASE WHEN ? THEN NULL ELSE locked_at END
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(next.as_str())
        .bind(now_ms())
        .bind(&patch.raw_image)
        .bind(&patch.processed_image)
        .bind(&patch.master_image)
        .bind(
            patch
                .extracted_fields
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(
            patch
                .candidates
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(patch.timings.as_ref().map(serde_json::to_string).transpose()?)
        .bind(error_code)
        .bind(error_message)
        .bind(&patch.operator)
        .bind(patch.inference_path.map(|p| p.as_str()))
        .bind(truth.map(|t| t.accepted_name.clone()))
        .bind(truth.and_then(|t| t.accepted_hp.map(i64::from)))
        .bind(truth.and_then(|t| t.accepted_collector_no.clone()))
        .bind(truth.and_then(|t| t.accepted_set_name.clone()))
        .bind(truth.and_then(|t| t.accepted_set_size.map(i64::from)))
        .bind(
            truth
                .map(|t| serde_json::to_string(&t.accepted_variant_tags))
                .transpose()?,
        )
        .bind(patch.retry_increment)
        .bind(clear_lease)
        .bind(clear_lease)
        .bind(id.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // The row moved out from under us; surface as an illegal edge.
            let current = self.get(id).await?.status;
            warn!("Transition {expected} -> {next} raced; scan {id} is {current}");
            return Err(StoreError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        info!("Scan {id}: {expected} -> {next}");
        Ok(())
    }

    /// Idempotent ingest: a capture path maps to at most one scan.
    pub async fn find_by_raw_image(&self, raw_image: &str) -> Result<Option<JobId>, StoreError> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT id FROM scans WHERE raw_image = ? LIMIT 1")
                .bind(raw_image)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.and_then(|raw| JobId::parse(&raw).ok()))
    }

    /// Apply field updates without a status change (operator edit surface).
    pub async fn apply_patch(&self, id: &JobId, patch: ScanPatch) -> Result<(), StoreError> {
        let (error_code, error_message) = match &patch.error {
            Some((code, message)) => (Some(code.as_str()), Some(message.clone())),
            None => (None, None),
        };
        let rows_affected = sqlx::query(
            r#"
            UPDATE scans SET
                updated_at = ?,
                processed_image = COALESCE(?, processed_image),
                master_image = COALESCE(?, master_image),
                extracted_fields = COALESCE(?, extracted_fields),
                candidates = COALESCE(?, candidates),
                timings = COALESCE(?, timings),
                error_code = COALESCE(?, error_code),
                error_message = COALESCE(?, error_message),
                operator = COALESCE(?, operator)
            WHERE id = ?
            "#,
        )
        .bind(now_ms())
        .bind(&patch.processed_image)
        .bind(&patch.master_image)
        .bind(
            patch
                .extracted_fields
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(
            patch
                .candidates
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(patch.timings.as_ref().map(serde_json::to_string).transpose()?)
        .bind(error_code)
        .bind(error_message)
        .bind(&patch.operator)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    /// Scans in a given status, oldest first.
    pub async fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<ScanJob>, StoreError> {
        let rows: Vec<ScanRow> = sqlx::query_as(
            "SELECT * FROM scans WHERE status = ? ORDER BY created_at ASC LIMIT ?",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn count_by_status(&self, status: JobStatus) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scans WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Startup recovery: clear leases that outlived their holder.
    pub async fn reclaim_stale_leases(&self, expiry_secs: i64) -> Result<u64, StoreError> {
        let cutoff = now_ms() - expiry_secs * 1000;
        let reclaimed = sqlx::query(
            r#"
            UPDATE scans
            SET processor_id = NULL, locked_at = NULL
            WHERE processor_id IS NOT NULL AND locked_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if reclaimed > 0 {
            info!("Reclaimed {reclaimed} stale scan leases");
        }
        Ok(reclaimed)
    }
}

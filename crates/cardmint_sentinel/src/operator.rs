//! Operator command surface.
//!
//! Accept, flag, review, re-scan and the constrained manual edit surface.
//! Accept is idempotent; edits are validated against hard field limits and
//! produce a before/after diff that is persisted and replayed as a session
//! event.

use crate::db::queue::{JobQueue, Lane};
use crate::db::scans::{ScanJob, ScanPatch, ScanStore, StoreError};
use crate::db::sessions::{EventLevel, EventSource, SessionStore};
use crate::worker::{ProcessPayload, JOB_TYPE_PROCESS};
use cardmint_protocol::fields::{ExtractedFields, HoloType, TruthCore, VariantHint};
use cardmint_protocol::ids::{JobId, SessionId};
use cardmint_protocol::status::JobStatus;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("invalid edit: {0}")]
    InvalidEdit(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] crate::db::sessions::SessionError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Constrained manual override. All fields optional; present fields must
/// pass validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverrideEdit {
    pub card_name: Option<String>,
    pub set_name: Option<String>,
    pub set_number: Option<String>,
    pub hp_value: Option<u16>,
    pub variant_hint: Option<String>,
}

/// One changed field in an override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub before: Option<String>,
    pub after: String,
}

fn set_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,3}(/\d{1,3})?$").expect("static regex"))
}

impl OverrideEdit {
    /// Validate every present field against the edit surface limits.
    pub fn validate(&self) -> Result<(), OperatorError> {
        for (label, value) in [("card_name", &self.card_name), ("set_name", &self.set_name)] {
            if let Some(value) = value {
                let chars = value.chars().count();
                if !(3..=80).contains(&chars) {
                    return Err(OperatorError::InvalidEdit(format!(
                        "{label} must be 3-80 characters, got {chars}"
                    )));
                }
            }
        }
        if let Some(number) = &self.set_number {
            if !set_number_re().is_match(number) {
                return Err(OperatorError::InvalidEdit(format!(
                    "set_number {number:?} does not match NNN or NNN/TTT"
                )));
            }
        }
        if let Some(hp) = self.hp_value {
            if hp > 400 {
                return Err(OperatorError::InvalidEdit(format!(
                    "hp_value {hp} exceeds the 0-400 range"
                )));
            }
        }
        if let Some(hint) = &self.variant_hint {
            if VariantHint::parse(hint).is_none() {
                return Err(OperatorError::InvalidEdit(format!(
                    "variant_hint {hint:?} is not in the allowed set"
                )));
            }
        }
        Ok(())
    }

    /// Apply to extracted fields, collecting the diff of changed fields.
    fn apply(&self, fields: &mut ExtractedFields) -> Vec<FieldDiff> {
        let mut diffs = Vec::new();
        if let Some(name) = &self.card_name {
            if fields.name.as_deref() != Some(name) {
                diffs.push(FieldDiff {
                    field: "card_name".into(),
                    before: fields.name.clone(),
                    after: name.clone(),
                });
                fields.name = Some(name.clone());
            }
        }
        if let Some(set_name) = &self.set_name {
            if fields.set_name.as_deref() != Some(set_name) {
                diffs.push(FieldDiff {
                    field: "set_name".into(),
                    before: fields.set_name.clone(),
                    after: set_name.clone(),
                });
                fields.set_name = Some(set_name.clone());
            }
        }
        if let Some(number) = &self.set_number {
            if fields.set_number.as_deref() != Some(number) {
                diffs.push(FieldDiff {
                    field: "set_number".into(),
                    before: fields.set_number.clone(),
                    after: number.clone(),
                });
                fields.set_number = Some(number.clone());
            }
        }
        if let Some(hp) = self.hp_value {
            if fields.hp != Some(hp) {
                diffs.push(FieldDiff {
                    field: "hp_value".into(),
                    before: fields.hp.map(|v| v.to_string()),
                    after: hp.to_string(),
                });
                fields.hp = Some(hp);
            }
        }
        if let Some(hint) = self.variant_hint.as_deref().and_then(VariantHint::parse) {
            let before = fields.variant_tags().join(",");
            match hint {
                VariantHint::FirstEdition => fields.first_edition_stamp = true,
                VariantHint::Unlimited => fields.first_edition_stamp = false,
                VariantHint::Shadowless => fields.shadowless = true,
                VariantHint::Holo => fields.holo_type = HoloType::Holo,
                VariantHint::ReverseHolo => fields.holo_type = HoloType::ReverseHolo,
                VariantHint::NonHolo => fields.holo_type = HoloType::NonHolo,
            }
            let after = fields.variant_tags().join(",");
            if before != after {
                diffs.push(FieldDiff {
                    field: "variant_hint".into(),
                    before: (!before.is_empty()).then_some(before),
                    after,
                });
            }
        }
        diffs
    }
}

pub struct OperatorCommands {
    pub store: ScanStore,
    pub sessions: SessionStore,
    pub queue: JobQueue,
    pub max_attempts: u32,
}

impl OperatorCommands {
    /// Lock the truth core. Applying accept to an already-ACCEPTED scan is
    /// a no-op.
    pub async fn accept(
        &self,
        scan_id: &JobId,
        operator: &str,
        truth: TruthCore,
    ) -> Result<ScanJob, OperatorError> {
        let scan = self.store.get(scan_id).await?;
        if scan.status == JobStatus::Accepted {
            info!("Scan {scan_id} already accepted; accept is a no-op");
            return Ok(scan);
        }

        self.store
            .transition(
                scan_id,
                scan.status,
                JobStatus::Accepted,
                ScanPatch {
                    operator: Some(operator.to_string()),
                    truth_core: Some(truth),
                    ..Default::default()
                },
            )
            .await?;
        Ok(self.store.get(scan_id).await?)
    }

    pub async fn flag(&self, scan_id: &JobId, operator: &str) -> Result<(), OperatorError> {
        let scan = self.store.get(scan_id).await?;
        self.store
            .transition(
                scan_id,
                scan.status,
                JobStatus::Flagged,
                ScanPatch {
                    operator: Some(operator.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn needs_review(&self, scan_id: &JobId, operator: &str) -> Result<(), OperatorError> {
        let scan = self.store.get(scan_id).await?;
        self.store
            .transition(
                scan_id,
                scan.status,
                JobStatus::NeedsReview,
                ScanPatch {
                    operator: Some(operator.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Explicit re-scan command: back to INFERENCING and a fresh processing
    /// job.
    pub async fn rescan(&self, scan_id: &JobId, operator: &str) -> Result<(), OperatorError> {
        self.store
            .transition(
                scan_id,
                JobStatus::OperatorPending,
                JobStatus::Inferencing,
                ScanPatch {
                    operator: Some(operator.to_string()),
                    retry_increment: 1,
                    ..Default::default()
                },
            )
            .await?;
        let payload = ProcessPayload {
            scan_id: scan_id.to_string(),
        };
        self.queue
            .push(
                Lane::Processing,
                JOB_TYPE_PROCESS,
                &serde_json::to_string(&payload)?,
                // Re-scans jump the line: the operator is waiting on them.
                10,
                self.max_attempts,
            )
            .await?;
        info!("Scan {scan_id}: re-scan requested by {operator}");
        Ok(())
    }

    /// Two-stage flow: hold the scan until the back side arrives.
    pub async fn request_back_image(&self, scan_id: &JobId) -> Result<(), OperatorError> {
        self.store
            .transition(
                scan_id,
                JobStatus::Captured,
                JobStatus::BackImage,
                ScanPatch::default(),
            )
            .await?;
        Ok(())
    }

    /// Attach the back-side capture and resume the pipeline.
    pub async fn attach_back_image(
        &self,
        scan_id: &JobId,
        master_image: &str,
    ) -> Result<(), OperatorError> {
        self.store
            .transition(
                scan_id,
                JobStatus::BackImage,
                JobStatus::Preprocessing,
                ScanPatch {
                    master_image: Some(master_image.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        let payload = ProcessPayload {
            scan_id: scan_id.to_string(),
        };
        self.queue
            .push(
                Lane::Processing,
                JOB_TYPE_PROCESS,
                &serde_json::to_string(&payload)?,
                10,
                self.max_attempts,
            )
            .await?;
        Ok(())
    }

    /// Apply a validated manual override. The per-field diff is persisted
    /// as a session event for replay.
    pub async fn apply_override(
        &self,
        scan_id: &JobId,
        session_id: &SessionId,
        operator: &str,
        edit: OverrideEdit,
    ) -> Result<Vec<FieldDiff>, OperatorError> {
        edit.validate()?;

        let scan = self.store.get(scan_id).await?;
        let mut fields = scan.extracted_fields.unwrap_or_default();
        let diffs = edit.apply(&mut fields);
        if diffs.is_empty() {
            return Ok(diffs);
        }

        self.store
            .apply_patch(
                scan_id,
                ScanPatch {
                    extracted_fields: Some(fields),
                    operator: Some(operator.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let payload = serde_json::json!({
            "scan_id": scan_id.to_string(),
            "operator": operator,
            "diffs": diffs,
            "variant_hint": edit.variant_hint,
        });
        self.sessions
            .append_event(
                session_id,
                EventLevel::Info,
                EventSource::OperatorEdit,
                &format!("manual override on scan {scan_id} ({} fields)", diffs.len()),
                Some(&payload),
            )
            .await?;
        Ok(diffs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;
    use cardmint_protocol::error::ErrorCode;

    async fn commands() -> OperatorCommands {
        let pool = test_pool().await;
        OperatorCommands {
            store: ScanStore::new(pool.clone()),
            sessions: SessionStore::new(pool.clone()),
            queue: JobQueue::new(pool, 1000),
            max_attempts: 3,
        }
    }

    async fn scan_at_operator_pending(commands: &OperatorCommands) -> JobId {
        let id = commands.store.create("/drop/DSC00001.JPG").await.unwrap();
        for (from, to) in [
            (JobStatus::Queued, JobStatus::Captured),
            (JobStatus::Captured, JobStatus::Preprocessing),
            (JobStatus::Preprocessing, JobStatus::Inferencing),
            (JobStatus::Inferencing, JobStatus::CandidatesReady),
            (JobStatus::CandidatesReady, JobStatus::OperatorPending),
        ] {
            commands
                .store
                .transition(&id, from, to, ScanPatch::default())
                .await
                .unwrap();
        }
        id
    }

    fn truth() -> TruthCore {
        TruthCore {
            accepted_name: "Pikachu".into(),
            accepted_hp: Some(60),
            accepted_collector_no: Some("58/102".into()),
            accepted_set_name: Some("Base Set".into()),
            accepted_set_size: Some(102),
            accepted_variant_tags: vec![],
        }
    }

    #[tokio::test]
    async fn accept_is_idempotent() {
        let commands = commands().await;
        let id = scan_at_operator_pending(&commands).await;

        let first = commands.accept(&id, "kat", truth()).await.unwrap();
        assert_eq!(first.status, JobStatus::Accepted);
        let updated_at = first.updated_at;

        // Second accept: no error, no change.
        let second = commands.accept(&id, "kat", truth()).await.unwrap();
        assert_eq!(second.status, JobStatus::Accepted);
        assert_eq!(second.updated_at, updated_at);
    }

    #[tokio::test]
    async fn accept_from_queued_is_rejected() {
        let commands = commands().await;
        let id = commands.store.create("/drop/DSC00002.JPG").await.unwrap();
        let err = commands.accept(&id, "kat", truth()).await.unwrap_err();
        match err {
            OperatorError::Store(store_err) => {
                assert_eq!(store_err.code(), Some(ErrorCode::InvalidTransition));
            }
            other => panic!("expected store error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rescan_requeues_with_priority() {
        let commands = commands().await;
        let id = scan_at_operator_pending(&commands).await;

        commands.rescan(&id, "kat").await.unwrap();

        let scan = commands.store.get(&id).await.unwrap();
        assert_eq!(scan.status, JobStatus::Inferencing);
        assert_eq!(scan.retry_count, 1);

        let job = commands.queue.pop(Lane::Processing).await.unwrap().unwrap();
        assert_eq!(job.priority, 10);
    }

    #[tokio::test]
    async fn back_image_flow_round_trips() {
        let commands = commands().await;
        let id = commands.store.create("/drop/DSC00003.JPG").await.unwrap();
        commands
            .store
            .transition(&id, JobStatus::Queued, JobStatus::Captured, ScanPatch::default())
            .await
            .unwrap();

        commands.request_back_image(&id).await.unwrap();
        assert_eq!(
            commands.store.get(&id).await.unwrap().status,
            JobStatus::BackImage
        );

        commands
            .attach_back_image(&id, "/drop/DSC00003-back.JPG")
            .await
            .unwrap();
        let scan = commands.store.get(&id).await.unwrap();
        assert_eq!(scan.status, JobStatus::Preprocessing);
        assert_eq!(scan.master_image.as_deref(), Some("/drop/DSC00003-back.JPG"));
    }

    #[tokio::test]
    async fn override_validation_rejects_out_of_range() {
        let cases = [
            OverrideEdit {
                card_name: Some("ab".into()),
                ..Default::default()
            },
            OverrideEdit {
                set_name: Some("x".repeat(81)),
                ..Default::default()
            },
            OverrideEdit {
                set_number: Some("12345".into()),
                ..Default::default()
            },
            OverrideEdit {
                set_number: Some("58/".into()),
                ..Default::default()
            },
            OverrideEdit {
                hp_value: Some(500),
                ..Default::default()
            },
            OverrideEdit {
                variant_hint: Some("sparkly".into()),
                ..Default::default()
            },
        ];
        for edit in cases {
            assert!(edit.validate().is_err(), "{edit:?} should fail");
        }

        OverrideEdit {
            card_name: Some("Pikachu".into()),
            set_number: Some("58/102".into()),
            hp_value: Some(400),
            variant_hint: Some("shadowless".into()),
            ..Default::default()
        }
        .validate()
        .unwrap();
    }

    #[tokio::test]
    async fn override_produces_diff_and_session_event() {
        let commands = commands().await;
        let id = scan_at_operator_pending(&commands).await;
        let session = commands.sessions.create(false).await.unwrap();

        let diffs = commands
            .apply_override(
                &id,
                &session,
                "kat",
                OverrideEdit {
                    card_name: Some("Pikachu".into()),
                    hp_value: Some(60),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].field, "card_name");
        assert_eq!(diffs[0].before, None);
        assert_eq!(diffs[0].after, "Pikachu");

        let scan = commands.store.get(&id).await.unwrap();
        let fields = scan.extracted_fields.unwrap();
        assert_eq!(fields.name.as_deref(), Some("Pikachu"));
        assert_eq!(fields.hp, Some(60));

        let events = commands.sessions.events_since(&session, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "operator_edit");
        assert!(events[0].payload.as_deref().unwrap().contains("card_name"));

        // Re-applying the same override changes nothing and logs nothing.
        let diffs = commands
            .apply_override(
                &id,
                &session,
                "kat",
                OverrideEdit {
                    card_name: Some("Pikachu".into()),
                    hp_value: Some(60),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(diffs.is_empty());
        assert_eq!(
            commands.sessions.events_since(&session, 0).await.unwrap().len(),
            1
        );
    }
}

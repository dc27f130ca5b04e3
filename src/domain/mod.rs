pub mod types;

mod checkpoints;
mod remediations;
mod skills;

pub use checkpoints::{
    CheckpointFilter, CheckpointService, ContextHit, ResumedCheckpoint, SaveCheckpoint,
};
pub use remediations::{
    RecordRemediation, RemediationHit, RemediationSearch, RemediationService,
};
pub use skills::{CreateSkill, SkillHit, SkillService, UpdateSkill};

use crate::bus::{Event, EventBus, EventPayload};
use crate::collections::{CollectionManager, Tenant};
use crate::embeddings::EmbeddingGateway;
use crate::error::{Error, Result};
use crate::scrub::{Finding, Scrubber};
use crate::vectorstore::Point;

/// Scrubs every text field of a record being ingested and accumulates the
/// findings into one audit. Secrets in user-supplied content are redacted
/// and annotated, never rejected.
pub(crate) struct FieldScrub<'a> {
    scrubber: &'a Scrubber,
    findings: Vec<Finding>,
}

impl<'a> FieldScrub<'a> {
    pub fn new(scrubber: &'a Scrubber) -> Self {
        Self {
            scrubber,
            findings: Vec::new(),
        }
    }

    pub fn scrub(&mut self, text: &str) -> Result<String> {
        let (redacted, audit) = self.scrubber.scrub(text)?;
        self.findings.extend(audit.findings);
        Ok(redacted)
    }

    pub fn scrub_opt(&mut self, text: Option<String>) -> Result<Option<String>> {
        text.map(|t| self.scrub(&t)).transpose()
    }

    pub fn scrub_all(&mut self, items: Vec<String>) -> Result<Vec<String>> {
        items.into_iter().map(|t| self.scrub(&t)).collect()
    }

    pub fn findings(self) -> Vec<Finding> {
        self.findings
    }
}

/// The embed-at-ingest tail all three domain services share: embed the
/// scrubbed projection, upsert the full payload into its one collection.
pub(crate) async fn embed_and_upsert(
    cm: &CollectionManager,
    gateway: &EmbeddingGateway,
    collection: &str,
    id: &str,
    projection: &str,
    payload: types::Payload,
) -> Result<()> {
    let vector = gateway.embed(projection).await?;
    cm.upsert(
        collection,
        Point {
            id: id.to_string(),
            vector: vector.as_ref().clone(),
            payload,
        },
    )
    .await
}

/// Publish `secrets.detected` when an ingest scan found anything.
pub(crate) fn emit_secrets_detected(
    bus: &EventBus,
    tenant: &Tenant,
    session_id: &str,
    stage: &str,
    findings: &[Finding],
) {
    if findings.is_empty() {
        return;
    }
    bus.publish(Event::new(
        &tenant.owner_id,
        &tenant.project_hash,
        session_id,
        None,
        EventPayload::SecretsDetected {
            stage: stage.to_string(),
            findings: findings.to_vec(),
        },
    ));
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid_argument(format!("{field} must be non-empty")));
    }
    Ok(())
}

pub(crate) fn require_max_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(Error::invalid_argument(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}

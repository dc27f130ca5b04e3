use super::types::{Payload, Skill};
use super::{embed_and_upsert, emit_secrets_detected, require_max_len, require_non_empty, FieldScrub};
use crate::bus::{Event, EventBus, EventPayload};
use crate::collections::{CollectionManager, SearchLayer, Tenant};
use crate::embeddings::EmbeddingGateway;
use crate::error::{Error, Result};
use crate::fingerprint::SharedKind;
use crate::scrub::ScrubberCache;
use crate::util::{now_ts_secs, prefixed_id};
use crate::vectorstore::{Filter, Point};
use std::path::Path;
use std::sync::Arc;

const NAME_MAX: usize = 120;
const DESCRIPTION_MAX: usize = 2_000;
const CONTENT_MAX: usize = 100_000;

#[derive(Debug, Clone)]
pub struct CreateSkill {
    pub session_id: String,
    pub name: String,
    pub description: String,
    pub content: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub prerequisites: Vec<String>,
    pub expected_outcome: Option<String>,
}

/// Partial update; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct UpdateSkill {
    pub name: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub prerequisites: Option<Vec<String>>,
    pub expected_outcome: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SkillHit {
    pub skill: Skill,
    pub score: f32,
}

/// Reusable workflow templates in the owner's shared skills pool.
pub struct SkillService {
    cm: Arc<CollectionManager>,
    gateway: Arc<EmbeddingGateway>,
    bus: Arc<EventBus>,
    scrubbers: Arc<ScrubberCache>,
}

impl SkillService {
    pub fn new(
        cm: Arc<CollectionManager>,
        gateway: Arc<EmbeddingGateway>,
        bus: Arc<EventBus>,
        scrubbers: Arc<ScrubberCache>,
    ) -> Self {
        Self {
            cm,
            gateway,
            bus,
            scrubbers,
        }
    }

    fn collection(&self, tenant: &Tenant) -> String {
        self.cm.shared_collection(tenant, SharedKind::Skills)
    }

    fn projection(skill: &Skill) -> String {
        format!("{}\n{}\n{}", skill.name, skill.description, skill.content)
    }

    pub async fn create(&self, tenant: &Tenant, req: CreateSkill) -> Result<Skill> {
        require_non_empty("name", &req.name)?;
        require_non_empty("description", &req.description)?;
        require_non_empty("content", &req.content)?;
        require_max_len("name", &req.name, NAME_MAX)?;
        require_max_len("description", &req.description, DESCRIPTION_MAX)?;
        require_max_len("content", &req.content, CONTENT_MAX)?;

        let scrubber = self
            .scrubbers
            .for_project(&tenant.project_hash, Path::new(&tenant.project_path))?;
        let mut scrub = FieldScrub::new(&scrubber);
        let now = now_ts_secs();
        let mut skill = Skill {
            id: prefixed_id("skl"),
            name: scrub.scrub(&req.name)?,
            description: scrub.scrub(&req.description)?,
            content: scrub.scrub(&req.content)?,
            version: 1,
            category: req.category,
            tags: req.tags,
            prerequisites: req.prerequisites,
            expected_outcome: scrub.scrub_opt(req.expected_outcome)?,
            usage_count: 0,
            success_count: 0,
            confidence: 0.5,
            created_at: now,
            updated_at: now,
        };
        skill.recompute_confidence();
        let findings = scrub.findings();

        embed_and_upsert(
            &self.cm,
            &self.gateway,
            &self.collection(tenant),
            &skill.id,
            &Self::projection(&skill),
            Payload::Skill(skill.clone()),
        )
        .await?;
        emit_secrets_detected(&self.bus, tenant, &req.session_id, "skill", &findings);
        Ok(skill)
    }

    pub async fn search(
        &self,
        tenant: &Tenant,
        query: &str,
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<SkillHit>> {
        require_non_empty("query", query)?;
        let scrubber = self
            .scrubbers
            .for_project(&tenant.project_hash, Path::new(&tenant.project_path))?;
        let (query, _) = scrubber.scrub(query)?;
        let vector = self.gateway.embed(&query).await?;

        let mut filter = Filter::none().eq("kind", "skill");
        if let Some(cat) = category {
            filter = filter.eq("category", cat);
        }
        let layers = vec![SearchLayer {
            collection: self.collection(tenant),
            filter,
            origin: "shared",
        }];
        let hits = self
            .cm
            .layered_search(&layers, &vector, limit.clamp(1, 100))
            .await?;
        Ok(hits
            .into_iter()
            .filter_map(|h| match h.hit.payload {
                Payload::Skill(skill) => Some(SkillHit {
                    skill,
                    score: h.hit.score,
                }),
                _ => None,
            })
            .collect())
    }

    pub async fn get(&self, tenant: &Tenant, id: &str) -> Result<Skill> {
        let point = self
            .cm
            .store()
            .get(&self.collection(tenant), id)
            .await?
            .ok_or_else(|| Error::not_found(format!("skill {id}")))?;
        match point.payload {
            Payload::Skill(skill) => Ok(skill),
            _ => Err(Error::not_found(format!("skill {id} (record is not a skill)"))),
        }
    }

    /// Bumps the version and re-embeds when any indexed field changed.
    pub async fn update(&self, tenant: &Tenant, id: &str, req: UpdateSkill) -> Result<Skill> {
        let mut skill = self.get(tenant, id).await?;
        let scrubber = self
            .scrubbers
            .for_project(&tenant.project_hash, Path::new(&tenant.project_path))?;
        let mut scrub = FieldScrub::new(&scrubber);

        if let Some(name) = req.name {
            require_non_empty("name", &name)?;
            require_max_len("name", &name, NAME_MAX)?;
            skill.name = scrub.scrub(&name)?;
        }
        if let Some(description) = req.description {
            require_non_empty("description", &description)?;
            require_max_len("description", &description, DESCRIPTION_MAX)?;
            skill.description = scrub.scrub(&description)?;
        }
        if let Some(content) = req.content {
            require_non_empty("content", &content)?;
            require_max_len("content", &content, CONTENT_MAX)?;
            skill.content = scrub.scrub(&content)?;
        }
        if let Some(category) = req.category {
            skill.category = Some(category);
        }
        if let Some(tags) = req.tags {
            skill.tags = tags;
        }
        if let Some(prerequisites) = req.prerequisites {
            skill.prerequisites = prerequisites;
        }
        if let Some(expected) = req.expected_outcome {
            skill.expected_outcome = Some(scrub.scrub(&expected)?);
        }
        skill.version += 1;
        skill.updated_at = now_ts_secs();
        let findings = scrub.findings();

        embed_and_upsert(
            &self.cm,
            &self.gateway,
            &self.collection(tenant),
            &skill.id,
            &Self::projection(&skill),
            Payload::Skill(skill.clone()),
        )
        .await?;
        emit_secrets_detected(&self.bus, tenant, "", "skill", &findings);
        Ok(skill)
    }

    pub async fn delete(&self, tenant: &Tenant, id: &str) -> Result<bool> {
        self.cm.store().delete(&self.collection(tenant), id).await
    }

    /// Usage is a 0.2-weight signal; a successful outcome adds 0.3 to α,
    /// a failed one 0.3 to β.
    pub async fn record_usage(
        &self,
        tenant: &Tenant,
        session_id: &str,
        id: &str,
        succeeded: bool,
    ) -> Result<Skill> {
        let collection = self.collection(tenant);
        let point = self
            .cm
            .store()
            .get(&collection, id)
            .await?
            .ok_or_else(|| Error::not_found(format!("skill {id}")))?;
        let Payload::Skill(mut skill) = point.payload else {
            return Err(Error::not_found(format!("skill {id} (record is not a skill)")));
        };
        skill.usage_count += 1;
        if succeeded {
            skill.success_count += 1;
        }
        skill.updated_at = now_ts_secs();
        skill.recompute_confidence();

        self.cm
            .upsert(
                &collection,
                Point {
                    id: skill.id.clone(),
                    vector: point.vector,
                    payload: Payload::Skill(skill.clone()),
                },
            )
            .await?;
        self.bus.publish(Event::new(
            &tenant.owner_id,
            &tenant.project_hash,
            session_id,
            None,
            EventPayload::SkillUsed {
                id: skill.id.clone(),
                succeeded,
            },
        ));
        Ok(skill)
    }
}

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Signal weights for the Beta-posterior confidence model, shared by
/// remediations and skills. Prior is Beta(1, 1).
pub const WEIGHT_EXPLICIT: f64 = 0.5;
pub const WEIGHT_USAGE: f64 = 0.2;
pub const WEIGHT_OUTCOME: f64 = 0.3;

/// Everything a searchable collection can hold. A closed tagged union per
/// collection kind — never an open map; only `metadata` fields pass
/// through uninterpreted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Checkpoint(Checkpoint),
    Remediation(Remediation),
    Skill(Skill),
    Fold(FoldRecord),
    BranchArchive(BranchArchive),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Checkpoint(_) => "checkpoint",
            Payload::Remediation(_) => "remediation",
            Payload::Skill(_) => "skill",
            Payload::Fold(_) => "fold",
            Payload::BranchArchive(_) => "branch_archive",
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub project_path: String,
    pub name: String,
    /// Short; must be non-empty.
    pub summary: String,
    /// Medium-sized working context.
    #[serde(default)]
    pub context: String,
    /// Large, optional full state.
    #[serde(default)]
    pub full_state: Option<String>,
    pub token_count: usize,
    #[serde(default)]
    pub threshold_at_save: Option<f64>,
    #[serde(default)]
    pub auto_created: bool,
    pub created_at: u64,
    /// Uninterpreted passthrough.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeLevel {
    Summary,
    Context,
    Full,
}

impl ResumeLevel {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "summary" => Ok(ResumeLevel::Summary),
            "context" => Ok(ResumeLevel::Context),
            "full" => Ok(ResumeLevel::Full),
            other => Err(Error::invalid_argument(format!(
                "unknown resume_level {other:?} (expected summary, context or full)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Remediations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationCategory {
    Compile,
    Runtime,
    Test,
    Lint,
    Security,
    Performance,
    Other,
}

impl RemediationCategory {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "compile" => Ok(Self::Compile),
            "runtime" => Ok(Self::Runtime),
            "test" => Ok(Self::Test),
            "lint" => Ok(Self::Lint),
            "security" => Ok(Self::Security),
            "performance" => Ok(Self::Performance),
            "other" => Ok(Self::Other),
            other => Err(Error::invalid_argument(format!(
                "unknown category {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Runtime => "runtime",
            Self::Test => "test",
            Self::Lint => "lint",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Other => "other",
        }
    }
}

/// Write scope of a shared-capable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Project,
    Team,
    Org,
}

impl Scope {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(Scope::Project),
            "team" => Ok(Scope::Team),
            "org" => Ok(Scope::Org),
            other => Err(Error::invalid_argument(format!("unknown scope {other:?}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Project => "project",
            Scope::Team => "team",
            Scope::Org => "org",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Remediation {
    pub id: String,
    pub title: String,
    pub problem: String,
    #[serde(default)]
    pub symptoms: Vec<String>,
    #[serde(default)]
    pub root_cause: String,
    pub solution: String,
    #[serde(default)]
    pub code_diff: Option<String>,
    pub category: RemediationCategory,
    pub scope: Scope,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Project the record was authored in; always stamped.
    pub project_hash: String,
    /// Stamped whenever the caller supplied one, regardless of scope, so
    /// team-level reads can surface project records of sibling projects.
    #[serde(default)]
    pub team_id: Option<String>,
    /// Beta posterior mean over the weighted signal history.
    pub confidence: f64,
    #[serde(default)]
    pub helpful_count: u32,
    #[serde(default)]
    pub not_helpful_count: u32,
    #[serde(default)]
    pub outdated_count: u32,
    #[serde(default)]
    pub usage_count: u32,
    #[serde(default)]
    pub outcome_success_count: u32,
    #[serde(default)]
    pub outcome_failure_count: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Remediation {
    /// α = 1 + Σ weights of positive signals, β = 1 + Σ weights of
    /// negative signals; confidence is the posterior mean α/(α+β).
    pub fn recompute_confidence(&mut self) {
        let alpha = 1.0
            + WEIGHT_EXPLICIT * f64::from(self.helpful_count)
            + WEIGHT_USAGE * f64::from(self.usage_count)
            + WEIGHT_OUTCOME * f64::from(self.outcome_success_count);
        let beta = 1.0
            + WEIGHT_EXPLICIT * f64::from(self.not_helpful_count + self.outdated_count)
            + WEIGHT_OUTCOME * f64::from(self.outcome_failure_count);
        self.confidence = alpha / (alpha + beta);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackRating {
    Helpful,
    NotHelpful,
    Outdated,
}

impl FeedbackRating {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "helpful" => Ok(Self::Helpful),
            "not_helpful" => Ok(Self::NotHelpful),
            "outdated" => Ok(Self::Outdated),
            other => Err(Error::invalid_argument(format!(
                "unknown rating {other:?} (expected helpful, not_helpful or outdated)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Skills
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Markdown body of the workflow template.
    pub content: String,
    pub version: u32,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub expected_outcome: Option<String>,
    #[serde(default)]
    pub usage_count: u32,
    #[serde(default)]
    pub success_count: u32,
    /// Same Beta model as remediations: usage signals vs failed outcomes.
    pub confidence: f64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Skill {
    pub fn recompute_confidence(&mut self) {
        let failures = self.usage_count.saturating_sub(self.success_count);
        let alpha = 1.0
            + WEIGHT_USAGE * f64::from(self.usage_count)
            + WEIGHT_OUTCOME * f64::from(self.success_count);
        let beta = 1.0 + WEIGHT_OUTCOME * f64::from(failures);
        self.confidence = alpha / (alpha + beta);
    }
}

// ---------------------------------------------------------------------------
// Folded branches and archives
// ---------------------------------------------------------------------------

/// Context a fold carries about the branch it collapsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchContext {
    pub branch_id: String,
    #[serde(default)]
    pub parent_branch_id: Option<String>,
    pub depth: usize,
    pub tokens_folded: usize,
    pub operations_count: usize,
    pub secrets_scrubbed: usize,
}

/// The searchable record a fold writes to the main collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FoldRecord {
    pub branch_id: String,
    pub session_id: String,
    pub description: String,
    /// Scrubbed agent-authored summary.
    pub summary: String,
    pub branch_context: BranchContext,
    pub created_at: u64,
}

/// One archived operation; `content_redacted` is the only text that ever
/// reaches a searchable index, the encrypted body is archive-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedOperation {
    pub sequence: u64,
    pub op_type: String,
    pub content_redacted: String,
    #[serde(default)]
    pub content_encrypted_full: Option<String>,
    pub token_count: usize,
    #[serde(default)]
    pub scope_similarity: Option<f32>,
    pub succeeded: bool,
}

/// Full per-branch operation log, written to the archive collection on
/// fold and on rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchArchive {
    pub branch_id: String,
    pub session_id: String,
    /// "folded" | "discarded"
    pub status: String,
    pub operations: Vec<ArchivedOperation>,
    pub created_at: u64,
}

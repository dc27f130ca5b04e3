use crate::scrub::Finding;
use serde::Serialize;
use tokio::sync::broadcast;

/// In-process pub/sub on hierarchical subjects:
/// `{kind}.{event}.{owner_id}.{project_hash}.{session_id}[.{branch_id}]`.
///
/// Delivery is at-most-once — lagging subscribers drop messages — and the
/// bus holds no durable state. Authoritative state lives in the session
/// registry and the vector store; `[bus] ttl_seconds` only documents the
/// retention contract for external subject-based backends.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Event {
    pub subject: String,
    pub owner_id: String,
    pub project_hash: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    pub ts: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    BranchCreated {
        branch_id: String,
        parent_branch_id: Option<String>,
        depth: usize,
        description: String,
    },
    BranchFolded {
        branch_id: String,
        tokens_folded: usize,
        tokens_saved: usize,
        operations_count: usize,
        secrets_scrubbed: usize,
    },
    BranchDiscarded {
        branch_id: String,
        tokens_recovered: usize,
    },
    /// Carries rule ids and positions only — never the secret.
    SecretsDetected {
        stage: String,
        findings: Vec<Finding>,
    },
    SessionStarted,
    SessionEnded {
        total_tokens: usize,
        folded_tokens: usize,
    },
    SessionThresholdCrossed {
        threshold: String,
        usage: f64,
    },
    RemediationSaved {
        id: String,
        scope: String,
        category: String,
    },
    SkillUsed {
        id: String,
        succeeded: bool,
    },
    StrategyAnalyzeScheduled,
}

impl EventPayload {
    /// (kind, event) pair for the subject grammar.
    pub fn kind_event(&self) -> (&'static str, &'static str) {
        match self {
            EventPayload::BranchCreated { .. } => ("branch", "created"),
            EventPayload::BranchFolded { .. } => ("branch", "folded"),
            EventPayload::BranchDiscarded { .. } => ("branch", "discarded"),
            EventPayload::SecretsDetected { .. } => ("secrets", "detected"),
            EventPayload::SessionStarted => ("session", "started"),
            EventPayload::SessionEnded { .. } => ("session", "ended"),
            EventPayload::SessionThresholdCrossed { .. } => ("session", "threshold_crossed"),
            EventPayload::RemediationSaved { .. } => ("remediation", "saved"),
            EventPayload::SkillUsed { .. } => ("skill", "used"),
            EventPayload::StrategyAnalyzeScheduled => ("strategy", "analyze.scheduled"),
        }
    }
}

impl Event {
    pub fn new(
        owner_id: &str,
        project_hash: &str,
        session_id: &str,
        branch_id: Option<&str>,
        payload: EventPayload,
    ) -> Self {
        let (kind, event) = payload.kind_event();
        let mut subject = format!("{kind}.{event}.{owner_id}.{project_hash}.{session_id}");
        if let Some(branch) = branch_id {
            subject.push('.');
            subject.push_str(branch);
        }
        Self {
            subject,
            owner_id: owner_id.to_string(),
            project_hash: project_hash.to_string(),
            session_id: session_id.to_string(),
            branch_id: branch_id.map(str::to_string),
            ts: crate::util::now_ts_secs(),
            payload,
        }
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// At-most-once: if nobody is listening the event is dropped.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

/// NATS-style subject match: `*` matches exactly one token, a trailing
/// `>` matches the rest of the subject.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_grammar() {
        let e = Event::new(
            "o16",
            "p16",
            "sess-1",
            Some("br-1"),
            EventPayload::BranchCreated {
                branch_id: "br-1".into(),
                parent_branch_id: None,
                depth: 1,
                description: "fix".into(),
            },
        );
        assert_eq!(e.subject, "branch.created.o16.p16.sess-1.br-1");

        let e = Event::new("o16", "p16", "sess-1", None, EventPayload::SessionStarted);
        assert_eq!(e.subject, "session.started.o16.p16.sess-1");

        let e = Event::new(
            "o16",
            "p16",
            "sess-1",
            None,
            EventPayload::SessionThresholdCrossed {
                threshold: "70_percent".into(),
                usage: 0.7,
            },
        );
        assert_eq!(e.subject, "session.threshold_crossed.o16.p16.sess-1");
    }

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches(
            "branch.created.o.p.s.b",
            "branch.created.o.p.s.b"
        ));
        assert!(subject_matches("branch.*.o.p.s.b", "branch.folded.o.p.s.b"));
        assert!(subject_matches("branch.>", "branch.created.o.p.s.b"));
        assert!(subject_matches(">", "session.started.o.p.s"));
        assert!(!subject_matches("branch.created.o.p.s", "branch.created.o.p.s.b"));
        assert!(!subject_matches("secrets.>", "branch.created.o.p.s.b"));
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(Event::new(
            "o",
            "p",
            "s",
            None,
            EventPayload::SessionStarted,
        ));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.subject, "session.started.o.p.s");
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(16);
        // Must not error or block.
        bus.publish(Event::new("o", "p", "s", None, EventPayload::SessionStarted));
    }

    #[test]
    fn test_event_serializes_without_secret_material() {
        let e = Event::new(
            "o",
            "p",
            "s",
            None,
            EventPayload::SecretsDetected {
                stage: "fold".into(),
                findings: vec![crate::scrub::Finding {
                    rule_id: "github-pat".into(),
                    rule_description: "GitHub personal access token".into(),
                    line: 1,
                    column: 8,
                    original_length: 42,
                    preview: "ghp_".into(),
                }],
            },
        );
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"event\":\"secrets_detected\""));
        assert!(json.contains("ghp_"));
        assert!(!json.contains("ghp_A")); // only the 4-char preview
    }
}

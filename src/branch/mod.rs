mod engine;

pub use engine::{
    BranchEngine, BranchInfo, BranchSummary, BranchTokens, ContextHealth, ContextState,
    FoldReport, FoldSummary, OperationReport, RollbackReport, SessionStatus, TokenBreakdown,
};

use crate::domain::types::ArchivedOperation;
use crate::error::{Error, Result};
use crate::util::now_ts_secs;
use serde::Serialize;
use std::collections::HashMap;

/// Session-scoped sub-trajectory. Branches form a tree: each has at most
/// one active descendant, so the active set is always a stack.
#[derive(Debug, Clone, Serialize)]
pub struct Branch {
    pub branch_id: String,
    pub session_id: String,
    pub parent_branch_id: Option<String>,
    pub description: String,
    /// The assignment the branch was opened with.
    pub prompt: String,
    pub status: BranchStatus,
    pub created_at: u64,
    pub folded_at: Option<u64>,
    /// Cumulative token cost of the operations inside this branch.
    pub tokens: usize,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Active,
    Folded,
    Discarded,
}

/// One unit of work inside a branch. `content_redacted` is the only text
/// that ever reaches a searchable index.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub sequence: u64,
    pub op_type: String,
    pub content_redacted: String,
    #[serde(skip_serializing)]
    pub content_encrypted_full: Option<String>,
    pub token_count: usize,
    pub scope_similarity: Option<f32>,
    pub succeeded: bool,
}

impl Operation {
    pub fn archived(&self) -> ArchivedOperation {
        ArchivedOperation {
            sequence: self.sequence,
            op_type: self.op_type.clone(),
            content_redacted: self.content_redacted.clone(),
            content_encrypted_full: self.content_encrypted_full.clone(),
            token_count: self.token_count,
            scope_similarity: self.scope_similarity,
            succeeded: self.succeeded,
        }
    }
}

/// Per-session working-memory ledger. All mutation goes through the
/// per-session lock in the registry; these methods assume it is held.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: String,
    pub owner_id: String,
    pub project_hash: String,
    pub project_path: String,
    pub started_at: u64,
    pub last_activity: u64,
    /// Main-thread tokens, including every folded summary's cost.
    pub main_tokens: usize,
    /// Active branch ids, bottom of the tree first; top is current.
    stack: Vec<String>,
    branches: HashMap<String, Branch>,
    pub thresholds_crossed: Vec<f64>,
    pub sealed: bool,
    pub pending_auto_checkpoint: Option<f64>,
    op_seq: u64,
}

impl SessionState {
    pub fn new(session_id: &str, owner_id: &str, project_hash: &str, project_path: &str) -> Self {
        let now = now_ts_secs();
        Self {
            session_id: session_id.to_string(),
            owner_id: owner_id.to_string(),
            project_hash: project_hash.to_string(),
            project_path: project_path.to_string(),
            started_at: now,
            last_activity: now,
            main_tokens: 0,
            stack: Vec::new(),
            branches: HashMap::new(),
            thresholds_crossed: Vec::new(),
            sealed: false,
            pending_auto_checkpoint: None,
            op_seq: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn active_branch_id(&self) -> Option<&str> {
        self.stack.last().map(String::as_str)
    }

    pub fn branch_path(&self) -> &[String] {
        &self.stack
    }

    pub fn branch(&self, branch_id: &str) -> Result<&Branch> {
        self.branches
            .get(branch_id)
            .ok_or_else(|| Error::not_found(format!("branch {branch_id}")))
    }

    pub(crate) fn branch_mut(&mut self, branch_id: &str) -> Result<&mut Branch> {
        self.branches
            .get_mut(branch_id)
            .ok_or_else(|| Error::not_found(format!("branch {branch_id}")))
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    /// Working-set cost: main thread plus every still-active branch.
    pub fn total_tokens(&self) -> usize {
        self.main_tokens
            + self
                .stack
                .iter()
                .filter_map(|id| self.branches.get(id))
                .map(|b| b.tokens)
                .sum::<usize>()
    }

    /// Tokens collapsed away so far: the cost of every folded branch.
    pub fn folded_tokens(&self) -> usize {
        self.branches
            .values()
            .filter(|b| b.status == BranchStatus::Folded)
            .map(|b| b.tokens)
            .sum()
    }

    pub fn usage(&self, context_limit: usize) -> f64 {
        if context_limit == 0 {
            return 0.0;
        }
        self.total_tokens() as f64 / context_limit as f64
    }

    fn ensure_open(&self) -> Result<()> {
        if self.sealed {
            return Err(Error::InvalidState(format!(
                "session {} is sealed",
                self.session_id
            )));
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity = now_ts_secs();
    }

    /// Open a branch under the current top (or the main thread).
    pub fn push_branch(
        &mut self,
        branch_id: &str,
        description: &str,
        prompt: &str,
    ) -> Result<&Branch> {
        self.ensure_open()?;
        if self.branches.contains_key(branch_id) {
            return Err(Error::InvalidState(format!(
                "branch {branch_id} already exists"
            )));
        }
        let parent = self.active_branch_id().map(str::to_string);
        let branch = Branch {
            branch_id: branch_id.to_string(),
            session_id: self.session_id.clone(),
            parent_branch_id: parent,
            description: description.to_string(),
            prompt: prompt.to_string(),
            status: BranchStatus::Active,
            created_at: now_ts_secs(),
            folded_at: None,
            tokens: 0,
            operations: Vec::new(),
        };
        self.branches.insert(branch_id.to_string(), branch);
        self.stack.push(branch_id.to_string());
        self.touch();
        Ok(&self.branches[branch_id])
    }

    /// Append a unit of work to the active branch. Sequences are totally
    /// ordered within the session, so intra-branch order is total too.
    pub fn append_operation(
        &mut self,
        op_type: &str,
        content_redacted: String,
        content_encrypted_full: Option<String>,
        token_count: usize,
        succeeded: bool,
    ) -> Result<&Operation> {
        self.ensure_open()?;
        let Some(active) = self.active_branch_id().map(str::to_string) else {
            return Err(Error::InvalidState(
                "no active branch to record the operation in".into(),
            ));
        };
        self.op_seq += 1;
        let sequence = self.op_seq;
        self.touch();
        let branch = self
            .branches
            .get_mut(&active)
            .ok_or_else(|| Error::not_found(format!("branch {active}")))?;
        branch.tokens += token_count;
        branch.operations.push(Operation {
            sequence,
            op_type: op_type.to_string(),
            content_redacted,
            content_encrypted_full,
            token_count,
            scope_similarity: None,
            succeeded,
        });
        Ok(branch
            .operations
            .last()
            .expect("operation was just pushed"))
    }

    /// Pop the active branch for folding. Only the top of the stack can
    /// fold; anything else is an invalid state, not a missing branch.
    pub fn pop_for_fold(&mut self) -> Result<String> {
        self.ensure_open()?;
        self.stack.pop().ok_or_else(|| {
            Error::InvalidState("context_return with no active branch".into())
        })
    }

    pub fn restore_active(&mut self, branch_id: String) {
        self.stack.push(branch_id);
    }

    /// Commit a fold: the branch is marked folded and the summary's token
    /// cost lands on the main thread.
    pub fn commit_fold(&mut self, branch_id: &str, summary_tokens: usize) -> Result<()> {
        let branch = self
            .branches
            .get_mut(branch_id)
            .ok_or_else(|| Error::not_found(format!("branch {branch_id}")))?;
        branch.status = BranchStatus::Folded;
        branch.folded_at = Some(now_ts_secs());
        self.main_tokens += summary_tokens;
        self.touch();
        Ok(())
    }

    /// Discard every branch above `target`, leaving `target` active. With
    /// `restore_state` the target itself is also rewound to its state at
    /// creation. Returns the discarded branches (plus the target's dropped
    /// operation count in tokens) for archiving.
    pub fn rollback_to(
        &mut self,
        target: &str,
        restore_state: bool,
    ) -> Result<(Vec<Branch>, usize)> {
        self.ensure_open()?;
        let Some(pos) = self.stack.iter().position(|id| id == target) else {
            return match self.branches.get(target) {
                Some(_) => Err(Error::InvalidState(format!(
                    "branch {target} is not active"
                ))),
                None => Err(Error::not_found(format!("branch {target}"))),
            };
        };
        let dropped_ids: Vec<String> = self.stack.split_off(pos + 1);
        let mut discarded = Vec::new();
        let mut tokens_recovered = 0;
        for id in dropped_ids {
            if let Some(branch) = self.branches.get_mut(&id) {
                branch.status = BranchStatus::Discarded;
                tokens_recovered += branch.tokens;
                discarded.push(branch.clone());
            }
        }
        if restore_state {
            if let Some(branch) = self.branches.get_mut(target) {
                tokens_recovered += branch.tokens;
                branch.tokens = 0;
                branch.operations.clear();
            }
        }
        self.touch();
        Ok((discarded, tokens_recovered))
    }

    /// Edge-triggered threshold crossings: each configured fraction fires
    /// at most once per session, on the first transition to `usage >= t`.
    pub fn cross_thresholds(&mut self, context_limit: usize, thresholds: &[f64]) -> Vec<f64> {
        let usage = self.usage(context_limit);
        let mut newly = Vec::new();
        for &t in thresholds {
            if usage >= t && !self.thresholds_crossed.iter().any(|&c| c == t) {
                self.thresholds_crossed.push(t);
                newly.push(t);
            }
        }
        newly
    }

    pub fn seal(&mut self) {
        self.sealed = true;
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionState {
        SessionState::new("sess-1", "o16", "p16", "/w/a")
    }

    #[test]
    fn test_branch_stack_depth_invariant() {
        let mut s = session();
        assert_eq!(s.depth(), 0);
        s.push_branch("b1", "outer", "fix the bug").unwrap();
        assert_eq!(s.depth(), 1);
        s.push_branch("b2", "inner", "investigate").unwrap();
        assert_eq!(s.depth(), 2);
        assert_eq!(s.active_branch_id(), Some("b2"));
        assert_eq!(
            s.branch("b2").unwrap().parent_branch_id.as_deref(),
            Some("b1")
        );

        // Fold-then-branch restores the same depth as before the branch.
        let popped = s.pop_for_fold().unwrap();
        s.commit_fold(&popped, 10).unwrap();
        assert_eq!(s.depth(), 1);
        s.push_branch("b3", "again", "more").unwrap();
        assert_eq!(s.depth(), 2);
    }

    #[test]
    fn test_operations_are_totally_ordered() {
        let mut s = session();
        s.push_branch("b1", "d", "p").unwrap();
        s.append_operation("read", "one".into(), None, 10, true)
            .unwrap();
        s.append_operation("write", "two".into(), None, 20, true)
            .unwrap();
        let b = s.branch("b1").unwrap();
        let seqs: Vec<u64> = b.operations.iter().map(|o| o.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(b.tokens, 30);
    }

    #[test]
    fn test_operation_without_branch_is_invalid_state() {
        let mut s = session();
        let err = s
            .append_operation("read", "x".into(), None, 1, true)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_fold_at_depth_zero_is_invalid_state() {
        let mut s = session();
        assert!(matches!(
            s.pop_for_fold().unwrap_err(),
            Error::InvalidState(_)
        ));
    }

    #[test]
    fn test_token_ledger_nested_folds() {
        // Scenario: main 5000, branch A 8000, nested B 4000; fold B with a
        // 100-token summary, fold A with 150. Main ends at 5250 and the
        // combined savings are 11750.
        let mut s = session();
        s.main_tokens = 5000;
        s.push_branch("a", "A", "pa").unwrap();
        s.append_operation("work", "a-ops".into(), None, 8000, true)
            .unwrap();
        s.push_branch("b", "B", "pb").unwrap();
        s.append_operation("work", "b-ops".into(), None, 4000, true)
            .unwrap();
        assert_eq!(s.total_tokens(), 5000 + 8000 + 4000);

        let b = s.pop_for_fold().unwrap();
        let b_tokens = s.branch(&b).unwrap().tokens;
        s.commit_fold(&b, 100).unwrap();
        let saved_b = b_tokens - 100;
        assert_eq!(saved_b, 3900);
        assert_eq!(s.total_tokens(), 5100 + 8000);

        let a = s.pop_for_fold().unwrap();
        let a_tokens = s.branch(&a).unwrap().tokens;
        s.commit_fold(&a, 150).unwrap();
        let saved_a = a_tokens - 150;
        assert_eq!(saved_a, 7850);

        assert_eq!(s.main_tokens, 5250);
        assert_eq!(s.total_tokens(), 5250);
        assert_eq!(saved_a + saved_b, 11_750);
        assert_eq!(s.folded_tokens(), 12_000);
    }

    #[test]
    fn test_rollback_discards_above_target() {
        let mut s = session();
        s.push_branch("a", "A", "p").unwrap();
        s.append_operation("w", "x".into(), None, 100, true).unwrap();
        s.push_branch("b", "B", "p").unwrap();
        s.append_operation("w", "y".into(), None, 200, true).unwrap();
        s.push_branch("c", "C", "p").unwrap();
        s.append_operation("w", "z".into(), None, 300, true).unwrap();

        let (discarded, recovered) = s.rollback_to("a", false).unwrap();
        assert_eq!(discarded.len(), 2);
        assert_eq!(recovered, 500);
        assert_eq!(s.active_branch_id(), Some("a"));
        assert_eq!(s.depth(), 1);
        assert_eq!(s.branch("b").unwrap().status, BranchStatus::Discarded);
        assert_eq!(s.branch("c").unwrap().status, BranchStatus::Discarded);
        // The target keeps its own operations without restore_state.
        assert_eq!(s.branch("a").unwrap().tokens, 100);
    }

    #[test]
    fn test_rollback_restore_state_rewinds_target() {
        let mut s = session();
        s.push_branch("a", "A", "p").unwrap();
        s.append_operation("w", "x".into(), None, 100, true).unwrap();
        s.push_branch("b", "B", "p").unwrap();
        s.append_operation("w", "y".into(), None, 50, true).unwrap();

        let (_, recovered) = s.rollback_to("a", true).unwrap();
        assert_eq!(recovered, 150);
        assert_eq!(s.branch("a").unwrap().tokens, 0);
        assert!(s.branch("a").unwrap().operations.is_empty());
    }

    #[test]
    fn test_rollback_errors() {
        let mut s = session();
        s.push_branch("a", "A", "p").unwrap();
        assert!(matches!(
            s.rollback_to("ghost", false).unwrap_err(),
            Error::NotFound(_)
        ));
        let popped = s.pop_for_fold().unwrap();
        s.commit_fold(&popped, 0).unwrap();
        assert!(matches!(
            s.rollback_to("a", false).unwrap_err(),
            Error::InvalidState(_)
        ));
    }

    #[test]
    fn test_thresholds_edge_triggered() {
        let mut s = session();
        let thresholds = [0.25, 0.5, 0.7];
        s.main_tokens = 699;
        assert!(s.cross_thresholds(1000, &thresholds).is_empty() == false);
        // 0.699 crosses 0.25 and 0.5, not 0.7.
        assert_eq!(s.thresholds_crossed, vec![0.25, 0.5]);

        // 0.6999 → 0.7000 fires exactly one 70% crossing.
        s.main_tokens = 700;
        let newly = s.cross_thresholds(1000, &thresholds);
        assert_eq!(newly, vec![0.7]);

        // Dropping below and re-crossing does not re-emit.
        s.main_tokens = 100;
        assert!(s.cross_thresholds(1000, &thresholds).is_empty());
        s.main_tokens = 800;
        assert!(s.cross_thresholds(1000, &thresholds).is_empty());
    }

    #[test]
    fn test_sealed_session_rejects_mutation() {
        let mut s = session();
        s.seal();
        assert!(matches!(
            s.push_branch("a", "A", "p").unwrap_err(),
            Error::InvalidState(_)
        ));
    }
}

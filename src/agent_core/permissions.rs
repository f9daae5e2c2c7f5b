//! Confirmation policy resolution and remembered decisions.
//!
//! A tool that requires confirmation is resolved to `allow`, `deny` or `ask`
//! by walking four layers, first match wins:
//!
//! 1. per-tool override
//! 2. remembered decision for (tool, category), only if `remember_choices`
//! 3. per-category override
//! 4. global default
//!
//! Remembered decisions come from "always approve" / "always deny" answers.
//! They can optionally be persisted to a JSON file (atomic temp + rename)
//! and reloaded on the next start.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

// ─── Types ──────────────────────────────────────────────────────────────────

/// Outcome of resolving a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    Allow,
    Deny,
    Ask,
}

/// What kind of side effect a tool has, for policy purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationCategory {
    FileWrite,
    FileDelete,
    FileModify,
    SystemCommand,
    NetworkRequest,
    General,
}

impl ConfirmationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileWrite => "file_write",
            Self::FileDelete => "file_delete",
            Self::FileModify => "file_modify",
            Self::SystemCommand => "system_command",
            Self::NetworkRequest => "network_request",
            Self::General => "general",
        }
    }
}

impl fmt::Display for ConfirmationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user's answer to a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserDecision {
    ApproveOnce,
    DenyOnce,
    AlwaysApprove,
    AlwaysDeny,
}

impl UserDecision {
    pub fn is_approval(&self) -> bool {
        matches!(self, Self::ApproveOnce | Self::AlwaysApprove)
    }

    /// Parse a typed answer: `y`/`yes`, `n`/`no`, `a`/`always`,
    /// `d`/`deny_always`, or the snake_case names.
    pub fn parse_answer(answer: &str) -> Option<Self> {
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "approve_once" => Some(Self::ApproveOnce),
            "n" | "no" | "deny_once" => Some(Self::DenyOnce),
            "a" | "always" | "always_approve" => Some(Self::AlwaysApprove),
            "d" | "deny_always" | "always_deny" => Some(Self::AlwaysDeny),
            _ => None,
        }
    }

    /// The decision to remember, for the "always" answers.
    pub fn remembered(&self) -> Option<PolicyDecision> {
        match self {
            Self::AlwaysApprove => Some(PolicyDecision::Allow),
            Self::AlwaysDeny => Some(PolicyDecision::Deny),
            Self::ApproveOnce | Self::DenyOnce => None,
        }
    }
}

/// Policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationPolicy {
    pub default_policy: PolicyDecision,
    pub tool_policies: HashMap<String, PolicyDecision>,
    pub category_policies: HashMap<ConfirmationCategory, PolicyDecision>,
    pub remember_choices: bool,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        let category_policies = HashMap::from([
            (ConfirmationCategory::FileWrite, PolicyDecision::Ask),
            (ConfirmationCategory::FileDelete, PolicyDecision::Ask),
            (ConfirmationCategory::FileModify, PolicyDecision::Ask),
            (ConfirmationCategory::SystemCommand, PolicyDecision::Ask),
            (ConfirmationCategory::NetworkRequest, PolicyDecision::Allow),
        ]);
        Self {
            default_policy: PolicyDecision::Ask,
            tool_policies: HashMap::new(),
            category_policies,
            remember_choices: true,
        }
    }
}

/// Key of a remembered decision.
pub type DecisionKey = (String, ConfirmationCategory);

/// A decision remembered from an "always" answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberedDecision {
    pub tool_name: String,
    pub category: ConfirmationCategory,
    pub decision: PolicyDecision,
    /// RFC 3339 timestamp of the answer.
    pub decided_at: String,
}

/// Read-only view for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicySnapshot {
    pub policy: ConfirmationPolicy,
    pub remembered: Vec<RememberedDecision>,
}

/// Resolve a policy. Pure: no locks, no I/O.
pub fn resolve_policy(
    policy: &ConfirmationPolicy,
    remembered: &HashMap<DecisionKey, RememberedDecision>,
    tool_name: &str,
    category: ConfirmationCategory,
) -> PolicyDecision {
    if let Some(decision) = policy.tool_policies.get(tool_name) {
        return *decision;
    }
    if policy.remember_choices {
        if let Some(r) = remembered.get(&(tool_name.to_string(), category)) {
            return r.decision;
        }
    }
    if let Some(decision) = policy.category_policies.get(&category) {
        return *decision;
    }
    policy.default_policy
}

// ─── Persistent Format ──────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedDecisions {
    version: u32,
    decisions: Vec<RememberedDecision>,
}

// ─── PolicyStore ────────────────────────────────────────────────────────────

/// Shared policy state. Reads take a read lock; only remembered-decision
/// updates and administrative changes take the write lock.
pub struct PolicyStore {
    policy: RwLock<ConfirmationPolicy>,
    /// Policy restored by [`PolicyStore::reset`].
    initial: ConfirmationPolicy,
    remembered: RwLock<HashMap<DecisionKey, RememberedDecision>>,
    persist_path: Option<PathBuf>,
    /// Serializes snapshot, temp write and rename of the decisions file.
    persist_lock: Mutex<()>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(ConfirmationPolicy::default())
    }
}

impl PolicyStore {
    /// In-memory store; remembered decisions last for the process lifetime.
    pub fn new(policy: ConfirmationPolicy) -> Self {
        Self {
            initial: policy.clone(),
            policy: RwLock::new(policy),
            remembered: RwLock::new(HashMap::new()),
            persist_path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Store backed by a JSON file; existing decisions are loaded now.
    pub fn with_persistence(policy: ConfirmationPolicy, path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new(policy);
        let path = path.into();
        let loaded = load_from_disk(&path);
        store.remembered = RwLock::new(loaded);
        store.persist_path = Some(path);
        store
    }

    /// Resolve the policy for a tool in the given category.
    pub fn resolve(&self, tool_name: &str, category: ConfirmationCategory) -> PolicyDecision {
        let policy = self.policy.read().unwrap_or_else(PoisonError::into_inner);
        let remembered = self.remembered.read().unwrap_or_else(PoisonError::into_inner);
        resolve_policy(&policy, &remembered, tool_name, category)
    }

    /// Record a user answer. Returns `true` when it was remembered.
    pub fn record_decision(
        &self,
        tool_name: &str,
        category: ConfirmationCategory,
        decision: UserDecision,
    ) -> bool {
        let Some(remember) = decision.remembered() else {
            return false;
        };
        if !self.remember_choices() {
            return false;
        }

        let entry = RememberedDecision {
            tool_name: tool_name.to_string(),
            category,
            decision: remember,
            decided_at: chrono::Utc::now().to_rfc3339(),
        };
        {
            let mut map = self.remembered.write().unwrap_or_else(PoisonError::into_inner);
            map.insert((tool_name.to_string(), category), entry);
        }
        self.save_to_disk();

        tracing::info!(
            tool = tool_name,
            category = %category,
            decision = ?remember,
            "confirmation decision remembered"
        );
        true
    }

    pub fn remember_choices(&self) -> bool {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .remember_choices
    }

    // ─── Administration ─────────────────────────────────────────────────

    pub fn set_default_policy(&self, decision: PolicyDecision) {
        self.update_policy(|p| p.default_policy = decision);
    }

    /// Set or (with `None`) remove a per-tool override.
    pub fn set_tool_policy(&self, tool_name: &str, decision: Option<PolicyDecision>) {
        self.update_policy(|p| match decision {
            Some(d) => {
                p.tool_policies.insert(tool_name.to_string(), d);
            }
            None => {
                p.tool_policies.remove(tool_name);
            }
        });
    }

    /// Set or (with `None`) remove a per-category override.
    pub fn set_category_policy(&self, category: ConfirmationCategory, decision: Option<PolicyDecision>) {
        self.update_policy(|p| match decision {
            Some(d) => {
                p.category_policies.insert(category, d);
            }
            None => {
                p.category_policies.remove(&category);
            }
        });
    }

    pub fn set_remember_choices(&self, enabled: bool) {
        self.update_policy(|p| p.remember_choices = enabled);
    }

    /// Forget one remembered decision.
    pub fn forget(&self, tool_name: &str, category: ConfirmationCategory) -> bool {
        let removed = self
            .remembered
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(tool_name.to_string(), category))
            .is_some();
        if removed {
            self.save_to_disk();
            tracing::info!(tool = tool_name, category = %category, "remembered decision forgotten");
        }
        removed
    }

    /// Forget every remembered decision. Returns how many were cleared.
    pub fn clear_remembered(&self) -> usize {
        let count = {
            let mut map = self.remembered.write().unwrap_or_else(PoisonError::into_inner);
            let count = map.len();
            map.clear();
            count
        };
        if count > 0 {
            self.save_to_disk();
            tracing::info!(cleared = count, "remembered decisions cleared");
        }
        count
    }

    /// Restore the initial policy and forget all remembered decisions.
    pub fn reset(&self) {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = self.initial.clone();
        self.clear_remembered();
    }

    /// Remembered decisions, sorted by tool then category.
    pub fn remembered(&self) -> Vec<RememberedDecision> {
        let mut list: Vec<RememberedDecision> = self
            .remembered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| (&a.tool_name, a.category).cmp(&(&b.tool_name, b.category)));
        list
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            policy: self.policy.read().unwrap_or_else(PoisonError::into_inner).clone(),
            remembered: self.remembered(),
        }
    }

    fn update_policy(&self, f: impl FnOnce(&mut ConfirmationPolicy)) {
        let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut policy);
        tracing::debug!(default = ?policy.default_policy, "confirmation policy updated");
    }

    // ─── Persistence ────────────────────────────────────────────────────

    /// Write remembered decisions to disk (atomic write). No-op in memory.
    fn save_to_disk(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let persisted = PersistedDecisions {
            version: 1,
            decisions: self.remembered(),
        };
        let content = match serde_json::to_string_pretty(&persisted) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize remembered decisions");
                return;
            }
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!(error = %e, path = %parent.display(), "failed to create decisions directory");
                return;
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp_path, &content) {
            tracing::error!(error = %e, path = %tmp_path.display(), "failed to write decisions temp file");
            return;
        }
        if let Err(e) = std::fs::rename(&tmp_path, path) {
            tracing::error!(error = %e, path = %path.display(), "failed to rename decisions file");
            return;
        }
        tracing::debug!(count = persisted.decisions.len(), "saved remembered decisions");
    }
}

fn load_from_disk(path: &Path) -> HashMap<DecisionKey, RememberedDecision> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to read decisions file");
            return HashMap::new();
        }
    };

    match serde_json::from_str::<PersistedDecisions>(&content) {
        Ok(persisted) => {
            tracing::info!(
                count = persisted.decisions.len(),
                path = %path.display(),
                "loaded remembered decisions"
            );
            persisted
                .decisions
                .into_iter()
                .map(|d| ((d.tool_name.clone(), d.category), d))
                .collect()
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "failed to parse decisions file, starting fresh"
            );
            HashMap::new()
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DECISIONS: [PolicyDecision; 3] =
        [PolicyDecision::Allow, PolicyDecision::Deny, PolicyDecision::Ask];

    fn bare_policy(default: PolicyDecision) -> ConfirmationPolicy {
        ConfirmationPolicy {
            default_policy: default,
            tool_policies: HashMap::new(),
            category_policies: HashMap::new(),
            remember_choices: true,
        }
    }

    #[test]
    fn test_default_policy_matches_documented_defaults() {
        let store = PolicyStore::default();
        assert_eq!(store.resolve("rm", ConfirmationCategory::FileDelete), PolicyDecision::Ask);
        assert_eq!(store.resolve("fetch", ConfirmationCategory::NetworkRequest), PolicyDecision::Allow);
        assert_eq!(store.resolve("misc", ConfirmationCategory::General), PolicyDecision::Ask);
        assert!(store.remember_choices());
    }

    #[test]
    fn test_tool_override_beats_category_and_default() {
        for tool in DECISIONS {
            for category in DECISIONS {
                for default in DECISIONS {
                    let mut policy = bare_policy(default);
                    policy.tool_policies.insert("t".into(), tool);
                    policy.category_policies.insert(ConfirmationCategory::FileWrite, category);
                    let store = PolicyStore::new(policy);
                    assert_eq!(
                        store.resolve("t", ConfirmationCategory::FileWrite),
                        tool,
                        "tool={tool:?} category={category:?} default={default:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_precedence_over_every_layer_combination() {
        let options: Vec<Option<PolicyDecision>> =
            std::iter::once(None).chain(DECISIONS.into_iter().map(Some)).collect();

        for &tool in &options {
            for &remembered in &options {
                for &category in &options {
                    for default in DECISIONS {
                        for remember_choices in [true, false] {
                            let mut policy = bare_policy(default);
                            policy.remember_choices = remember_choices;
                            if let Some(d) = tool {
                                policy.tool_policies.insert("t".into(), d);
                            }
                            if let Some(d) = category {
                                policy.category_policies.insert(ConfirmationCategory::SystemCommand, d);
                            }
                            let mut memory = HashMap::new();
                            if let Some(d) = remembered {
                                memory.insert(
                                    ("t".to_string(), ConfirmationCategory::SystemCommand),
                                    RememberedDecision {
                                        tool_name: "t".into(),
                                        category: ConfirmationCategory::SystemCommand,
                                        decision: d,
                                        decided_at: String::new(),
                                    },
                                );
                            }

                            let expected = tool
                                .or(if remember_choices { remembered } else { None })
                                .or(category)
                                .unwrap_or(default);
                            assert_eq!(
                                resolve_policy(&policy, &memory, "t", ConfirmationCategory::SystemCommand),
                                expected
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_always_answers_are_remembered() {
        let store = PolicyStore::default();
        assert!(store.record_decision("write_note", ConfirmationCategory::FileWrite, UserDecision::AlwaysApprove));
        assert_eq!(store.resolve("write_note", ConfirmationCategory::FileWrite), PolicyDecision::Allow);

        assert!(store.record_decision("rm", ConfirmationCategory::FileDelete, UserDecision::AlwaysDeny));
        assert_eq!(store.resolve("rm", ConfirmationCategory::FileDelete), PolicyDecision::Deny);

        // Keyed by category too.
        assert_eq!(store.resolve("write_note", ConfirmationCategory::FileModify), PolicyDecision::Ask);
    }

    #[test]
    fn test_once_answers_are_not_remembered() {
        let store = PolicyStore::default();
        assert!(!store.record_decision("rm", ConfirmationCategory::FileDelete, UserDecision::ApproveOnce));
        assert!(!store.record_decision("rm", ConfirmationCategory::FileDelete, UserDecision::DenyOnce));
        assert!(store.remembered().is_empty());
    }

    #[test]
    fn test_remember_disabled_ignores_answers() {
        let store = PolicyStore::default();
        store.set_remember_choices(false);
        assert!(!store.record_decision("rm", ConfirmationCategory::FileDelete, UserDecision::AlwaysApprove));
        assert_eq!(store.resolve("rm", ConfirmationCategory::FileDelete), PolicyDecision::Ask);
    }

    #[test]
    fn test_administrative_updates() {
        let store = PolicyStore::default();
        store.set_default_policy(PolicyDecision::Deny);
        assert_eq!(store.resolve("x", ConfirmationCategory::General), PolicyDecision::Deny);

        store.set_category_policy(ConfirmationCategory::General, Some(PolicyDecision::Allow));
        assert_eq!(store.resolve("x", ConfirmationCategory::General), PolicyDecision::Allow);

        store.set_tool_policy("x", Some(PolicyDecision::Ask));
        assert_eq!(store.resolve("x", ConfirmationCategory::General), PolicyDecision::Ask);

        store.set_tool_policy("x", None);
        store.set_category_policy(ConfirmationCategory::General, None);
        assert_eq!(store.resolve("x", ConfirmationCategory::General), PolicyDecision::Deny);
    }

    #[test]
    fn test_forget_clear_and_reset() {
        let store = PolicyStore::default();
        store.record_decision("a", ConfirmationCategory::FileWrite, UserDecision::AlwaysApprove);
        store.record_decision("b", ConfirmationCategory::FileWrite, UserDecision::AlwaysApprove);

        assert!(store.forget("a", ConfirmationCategory::FileWrite));
        assert!(!store.forget("a", ConfirmationCategory::FileWrite));
        assert_eq!(store.clear_remembered(), 1);

        store.set_default_policy(PolicyDecision::Allow);
        store.record_decision("c", ConfirmationCategory::General, UserDecision::AlwaysDeny);
        store.reset();
        assert_eq!(store.snapshot().policy, ConfirmationPolicy::default());
        assert!(store.remembered().is_empty());
    }

    #[test]
    fn test_remembered_sorted() {
        let store = PolicyStore::default();
        store.record_decision("zzz", ConfirmationCategory::General, UserDecision::AlwaysApprove);
        store.record_decision("aaa", ConfirmationCategory::FileDelete, UserDecision::AlwaysDeny);
        store.record_decision("aaa", ConfirmationCategory::FileWrite, UserDecision::AlwaysApprove);

        let list = store.remembered();
        let keys: Vec<(&str, ConfirmationCategory)> =
            list.iter().map(|d| (d.tool_name.as_str(), d.category)).collect();
        assert_eq!(
            keys,
            vec![
                ("aaa", ConfirmationCategory::FileWrite),
                ("aaa", ConfirmationCategory::FileDelete),
                ("zzz", ConfirmationCategory::General),
            ]
        );
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/decisions.json");

        {
            let store = PolicyStore::with_persistence(ConfirmationPolicy::default(), &path);
            store.record_decision("rm", ConfirmationCategory::FileDelete, UserDecision::AlwaysDeny);
        }
        assert!(path.exists());

        let reloaded = PolicyStore::with_persistence(ConfirmationPolicy::default(), &path);
        assert_eq!(reloaded.resolve("rm", ConfirmationCategory::FileDelete), PolicyDecision::Deny);

        reloaded.clear_remembered();
        let again = PolicyStore::with_persistence(ConfirmationPolicy::default(), &path);
        assert!(again.remembered().is_empty());
    }

    #[test]
    fn test_corrupt_persistence_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = PolicyStore::with_persistence(ConfirmationPolicy::default(), &path);
        assert!(store.remembered().is_empty());
    }

    #[test]
    fn test_concurrent_decisions_all_reach_disk() {
        for run in 0..10 {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("decisions.json");
            let store = std::sync::Arc::new(PolicyStore::with_persistence(ConfirmationPolicy::default(), &path));

            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let store = std::sync::Arc::clone(&store);
                    std::thread::spawn(move || {
                        store.record_decision(
                            &format!("t{i}"),
                            ConfirmationCategory::FileWrite,
                            UserDecision::AlwaysApprove,
                        )
                    })
                })
                .collect();
            for handle in handles {
                assert!(handle.join().unwrap());
            }

            let reloaded = PolicyStore::with_persistence(ConfirmationPolicy::default(), &path);
            assert_eq!(reloaded.remembered().len(), 16, "run {run} lost decisions");
            assert!(!path.with_extension("json.tmp").exists());
        }
    }

    #[test]
    fn test_unwritable_directory_keeps_decision_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, "file").unwrap();
        let path = blocker.join("decisions.json");

        let store = PolicyStore::with_persistence(ConfirmationPolicy::default(), &path);
        assert!(store.record_decision("rm", ConfirmationCategory::FileDelete, UserDecision::AlwaysDeny));
        assert_eq!(store.resolve("rm", ConfirmationCategory::FileDelete), PolicyDecision::Deny);
        assert!(!path.exists());
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(UserDecision::parse_answer(" Y "), Some(UserDecision::ApproveOnce));
        assert_eq!(UserDecision::parse_answer("no"), Some(UserDecision::DenyOnce));
        assert_eq!(UserDecision::parse_answer("always"), Some(UserDecision::AlwaysApprove));
        assert_eq!(UserDecision::parse_answer("d"), Some(UserDecision::AlwaysDeny));
        assert_eq!(UserDecision::parse_answer("maybe"), None);
    }

    #[test]
    fn test_serialization_names() {
        assert_eq!(serde_json::to_string(&PolicyDecision::Ask).unwrap(), "\"ask\"");
        assert_eq!(
            serde_json::to_string(&ConfirmationCategory::NetworkRequest).unwrap(),
            "\"network_request\""
        );
        assert_eq!(
            serde_json::to_string(&UserDecision::AlwaysApprove).unwrap(),
            "\"always_approve\""
        );
    }
}

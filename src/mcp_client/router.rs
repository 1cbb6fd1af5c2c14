//! Semantic router — picks a scope of a routing-capable server from free text.
//!
//! A code-intelligence server pointed at a whole repository indexes everything
//! it can see. When the caller describes what it is after ("the billing API
//! handlers"), the router narrows the server to the declared scope whose
//! keywords, path and description best overlap that description.
//!
//! Routing never fails a call: an empty context, a server without scopes, a
//! zero score or a broken scope table all resolve to the whole tree.

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use super::registry::ServerRegistry;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Scope path used when no workspace root is configured.
pub const WHOLE_TREE: &str = ".";

const KEYWORD_WEIGHT: u32 = 3;
const PATH_SEGMENT_WEIGHT: u32 = 2;
const DESCRIPTION_WEIGHT: u32 = 1;

/// Description words shorter than this are too common to count.
const MIN_DESCRIPTION_WORD_LEN: usize = 4;

// ─── Scope Types ─────────────────────────────────────────────────────────────

/// One declared sub-scope of a server's workspace.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScopeDefinition {
    /// Path relative to the workspace root.
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl ScopeDefinition {
    pub fn new(path: &str, description: &str, keywords: &[&str]) -> Self {
        Self {
            path: path.to_string(),
            description: description.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Ordered scope table of one server. Declaration order breaks ties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ScopeRegistry {
    /// Absolute workspace root. When set, scope paths are resolved against it
    /// and must exist on disk.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub workspace_root: Option<String>,
    #[serde(default)]
    pub entries: Vec<ScopeDefinition>,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.trim().is_empty()))
}

impl ScopeRegistry {
    pub fn new(entries: Vec<ScopeDefinition>) -> Self {
        Self {
            workspace_root: None,
            entries,
        }
    }

    pub fn with_workspace_root(mut self, root: &str) -> Self {
        self.workspace_root = Some(root.to_string()).filter(|r| !r.trim().is_empty());
        self
    }

    /// Path handed to the server when no scope is selected.
    pub fn whole_tree_path(&self) -> String {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| WHOLE_TREE.to_string())
    }

    /// Path handed to the server for a selected scope.
    fn scope_path(&self, scope: &ScopeDefinition) -> String {
        match &self.workspace_root {
            Some(root) => Path::new(root).join(&scope.path).display().to_string(),
            None => scope.path.clone(),
        }
    }

    /// Reject tables that cannot be routed against.
    fn check(&self) -> Result<(), RoutingError> {
        let mut seen = std::collections::HashSet::new();
        for (index, scope) in self.entries.iter().enumerate() {
            let path = scope.path.trim();
            if path.is_empty() {
                return Err(RoutingError::EmptyScopePath { index });
            }
            if !seen.insert(path) {
                return Err(RoutingError::DuplicateScope {
                    path: path.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Outcome of routing one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    pub selected_scope_path: String,
    pub description: String,
    /// False when the whole tree was chosen.
    pub was_routed: bool,
}

impl RoutingDecision {
    fn whole_tree(path: String, reason: &str) -> Self {
        Self {
            selected_scope_path: path,
            description: format!("whole tree ({reason})"),
            was_routed: false,
        }
    }
}

/// Reasons a scope table cannot be scored.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("scope #{index} has an empty path")]
    EmptyScopePath { index: usize },

    #[error("scope '{path}' is declared twice")]
    DuplicateScope { path: String },

    #[error("scope root '{path}' does not exist")]
    MissingScopeRoot { path: String },
}

// ─── Scoring ─────────────────────────────────────────────────────────────────

/// Lowercase alphanumeric words of a text.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Overlap score of one scope against the tokenized context.
fn score_scope(scope: &ScopeDefinition, context_words: &[String], context_text: &str) -> u32 {
    let has_word = |w: &str| context_words.iter().any(|c| c == w);
    let mut score = 0;

    for keyword in &scope.keywords {
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() {
            continue;
        }
        let keyword_words = tokenize(&keyword);
        let matched = if keyword_words.len() > 1 {
            // Multi-word keywords match as a phrase.
            context_text.contains(&keyword_words.join(" "))
        } else {
            has_word(&keyword)
        };
        if matched {
            score += KEYWORD_WEIGHT;
        }
    }

    let mut path_words = tokenize(&scope.path);
    path_words.dedup();
    score += path_words
        .iter()
        .filter(|w| w.len() > 1 && has_word(w))
        .count() as u32
        * PATH_SEGMENT_WEIGHT;

    let mut description_words: Vec<String> = tokenize(&scope.description)
        .into_iter()
        .filter(|w| w.len() >= MIN_DESCRIPTION_WORD_LEN)
        .collect();
    description_words.sort();
    description_words.dedup();
    score += description_words.iter().filter(|w| has_word(w)).count() as u32 * DESCRIPTION_WEIGHT;

    score
}

/// Pick the best scope for `context`.
///
/// Returns `Ok(None)` when nothing overlaps. Ties go to the scope declared
/// first.
pub fn select_scope<'a>(
    registry: &'a ScopeRegistry,
    context: &str,
) -> Result<Option<(&'a ScopeDefinition, u32)>, RoutingError> {
    registry.check()?;

    let context_words = tokenize(context);
    let context_text = context_words.join(" ");

    let mut best: Option<(&ScopeDefinition, u32)> = None;
    for scope in &registry.entries {
        let score = score_scope(scope, &context_words, &context_text);
        if score > best.map_or(0, |(_, s)| s) {
            best = Some((scope, score));
        }
    }

    if let (Some(root), Some((scope, _))) = (&registry.workspace_root, best) {
        let full = Path::new(root).join(&scope.path);
        if !full.is_dir() {
            return Err(RoutingError::MissingScopeRoot {
                path: full.display().to_string(),
            });
        }
    }

    Ok(best)
}

/// Route against a scope table. Pure function of its inputs.
pub fn route_with(registry: &ScopeRegistry, context: &str) -> RoutingDecision {
    if context.trim().is_empty() {
        return RoutingDecision::whole_tree(registry.whole_tree_path(), "no context");
    }

    match select_scope(registry, context) {
        Ok(Some((scope, score))) => {
            tracing::debug!(scope = %scope.path, score, "routed to scope");
            RoutingDecision {
                selected_scope_path: registry.scope_path(scope),
                description: if scope.description.is_empty() {
                    scope.path.clone()
                } else {
                    scope.description.clone()
                },
                was_routed: true,
            }
        }
        Ok(None) => RoutingDecision::whole_tree(registry.whole_tree_path(), "no matching scope"),
        Err(e) => {
            tracing::warn!(error = %e, "scope routing failed, using whole tree");
            RoutingDecision::whole_tree(registry.whole_tree_path(), "routing failed")
        }
    }
}

// ─── SemanticRouter ──────────────────────────────────────────────────────────

/// Routes calls against the scope tables in the server registry and keeps
/// the most recent decision for inspection.
#[derive(Debug)]
pub struct SemanticRouter {
    registry: Arc<ServerRegistry>,
    last: Mutex<Option<RoutingDecision>>,
}

impl SemanticRouter {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            registry,
            last: Mutex::new(None),
        }
    }

    /// Select a scope of `server_id` for the given context.
    pub fn route(&self, server_id: &str, context: &str) -> RoutingDecision {
        let decision = match self.registry.resolve(server_id) {
            Ok(descriptor) => match &descriptor.scopes {
                Some(scopes) => route_with(scopes, context),
                None => RoutingDecision::whole_tree(WHOLE_TREE.to_string(), "server has no scopes"),
            },
            Err(_) => RoutingDecision::whole_tree(WHOLE_TREE.to_string(), "unknown server"),
        };

        if let Ok(mut last) = self.last.lock() {
            *last = Some(decision.clone());
        }
        decision
    }

    /// The decision made by the most recent `route` call.
    pub fn last_decision(&self) -> Option<RoutingDecision> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

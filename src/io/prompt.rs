//! Prompt pack builder for deterministic agent input.
//!
//! The prompt embeds the task objective, a fixed protocol of required
//! behaviors, a profile of the working repository, the previous attempt's
//! summary/error for continuation, and a digest of recent cross-lane work.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::task::Task;

const OBJECTIVE_TEMPLATE: &str = include_str!("prompts/objective.md");

/// Cap on directory entries visited while profiling a repository.
const PROFILE_ENTRY_BUDGET: usize = 5000;
const PROFILE_MAX_DEPTH: usize = 6;

/// Selected task context for template rendering.
#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    id: String,
    owner: String,
    priority: i64,
    title: String,
    description: String,
    acceptance: Vec<String>,
}

impl TaskContext {
    fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            owner: task.owner.to_string(),
            priority: task.priority,
            title: task.title.clone(),
            description: task.description.clone(),
            acceptance: task.acceptance.clone(),
        }
    }
}

/// All inputs needed to render one prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub repo_profile: String,
    pub merge_hint: Option<String>,
    pub prev_summary: String,
    pub prev_error: String,
    pub handoff: String,
    pub scope: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptBuilder {
    env: Environment<'static>,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptBuilder {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("objective", OBJECTIVE_TEMPLATE)
            .expect("objective template should be valid");
        Self { env }
    }

    pub fn render(&self, task: &Task, inputs: &PromptInputs) -> Result<String> {
        let template = self.env.get_template("objective")?;
        let rendered = template.render(context! {
            task => TaskContext::from_task(task),
            scope => non_empty(&inputs.scope),
            repo_profile => inputs.repo_profile.trim(),
            merge_hint => inputs.merge_hint.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            prev_summary => non_empty(&inputs.prev_summary),
            prev_error => non_empty(&inputs.prev_error),
            handoff => non_empty(&inputs.handoff),
        })?;
        debug!(bytes = rendered.len(), task = %task.id, "prompt rendered");
        Ok(rendered)
    }
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Summarize a repository as a file-type histogram, e.g.
/// `412 files: .rs ×301, .toml ×8, .md ×5, …`.
pub fn repo_profile(repo: &Path) -> String {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total = 0usize;
    let mut budget = PROFILE_ENTRY_BUDGET;
    walk_counts(repo, 0, &mut counts, &mut total, &mut budget);

    if total == 0 {
        return "empty or unreadable repository".to_string();
    }

    let mut ranked: Vec<(&String, &usize)> = counts.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    let shown: Vec<String> = ranked
        .iter()
        .take(8)
        .map(|(ext, count)| format!("{ext} ×{count}"))
        .collect();
    format!("{total} files: {}", shown.join(", "))
}

fn walk_counts(
    dir: &Path,
    depth: usize,
    counts: &mut BTreeMap<String, usize>,
    total: &mut usize,
    budget: &mut usize,
) {
    if depth > PROFILE_MAX_DEPTH || *budget == 0 {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if *budget == 0 {
            return;
        }
        *budget -= 1;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == "target" || name == "node_modules" {
            continue;
        }
        if path.is_dir() {
            walk_counts(&path, depth + 1, counts, total, budget);
        } else {
            *total += 1;
            let ext = path
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
                .unwrap_or_else(|| "(none)".to_string());
            *counts.entry(ext).or_insert(0) += 1;
        }
    }
}

/// Detect an in-progress merge or rebase in the repository.
pub fn merge_hint(repo: &Path) -> Option<String> {
    let git_dir = repo.join(".git");
    if git_dir.join("MERGE_HEAD").exists() {
        return Some("a merge is in progress in this repository; resolve it first".to_string());
    }
    if git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists() {
        return Some("a rebase is in progress in this repository; resolve it first".to_string());
    }
    None
}

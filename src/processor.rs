use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use rayon::prelude::*;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::db::{self, PostRow};
use crate::parser;
use crate::reconcile::{reconcile_with_policy, CategoryDiff, CategorySet, MappingTable, RemovalPolicy};

const REVISION_POST_TYPE: &str = "revision";

/// Mapping table and removal policy, read once and shared by every post of a run.
#[derive(Debug, Clone, Default)]
pub struct Rules {
    pub mappings: MappingTable,
    pub policy: RemovalPolicy,
}

impl Rules {
    pub fn load(conn: &Connection) -> Result<Self> {
        let mappings = db::load_mappings(conn)?;
        let settings = db::load_settings(conn)?;
        Ok(Rules {
            mappings,
            policy: settings.removal_policy(),
        })
    }
}

/// The categories one post has now and should have after reconciliation.
#[derive(Debug, Clone)]
pub struct CategoryPlan {
    pub post_id: i64,
    pub block_names: Vec<String>,
    pub current: CategorySet,
    pub next: CategorySet,
}

impl CategoryPlan {
    pub fn changed(&self) -> bool {
        self.current != self.next
    }

    pub fn diff(&self) -> CategoryDiff {
        CategoryDiff::between(&self.current, &self.next)
    }
}

/// Pure: parse the post, extract its blocks, reconcile against `current`.
pub fn plan_post(post: &PostRow, current: CategorySet, rules: &Rules) -> CategoryPlan {
    let block_names = parser::block_names_in(&post.content);
    let next = reconcile_with_policy(&block_names, &rules.mappings, &current, rules.policy);
    CategoryPlan {
        post_id: post.id,
        block_names,
        current,
        next,
    }
}

/// Reconcile one post and write its categories if they changed.
pub fn process_post(conn: &Connection, post: &PostRow, rules: &Rules) -> Result<CategoryPlan> {
    let current = db::post_categories(conn, post.id)?;
    let plan = plan_post(post, current, rules);
    if plan.changed() {
        db::save_post_categories(conn, &[(plan.post_id, plan.next.clone())])?;
        let diff = plan.diff();
        debug!(post = plan.post_id, added = ?diff.added, removed = ?diff.removed, "Categories updated");
    }
    Ok(plan)
}

// ── Save hook ──

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveContext {
    pub autosave: bool,
    pub revision: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Autosave,
    Revision,
    PostType(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Skipped(SkipReason),
    Unchanged,
    Updated(CategoryDiff),
}

fn skip_reason(post: &PostRow, ctx: SaveContext, config: &AppConfig) -> Option<SkipReason> {
    if ctx.autosave {
        return Some(SkipReason::Autosave);
    }
    if ctx.revision || post.post_type == REVISION_POST_TYPE {
        return Some(SkipReason::Revision);
    }
    if !config.processes(&post.post_type) {
        return Some(SkipReason::PostType(post.post_type.clone()));
    }
    None
}

/// Run after a post is saved: recompute its categories from its blocks.
pub fn on_post_save(
    conn: &Connection,
    post_id: i64,
    ctx: SaveContext,
    config: &AppConfig,
) -> Result<SaveOutcome> {
    let post = db::fetch_post(conn, post_id)?.ok_or_else(|| anyhow!("Post {} not found", post_id))?;

    if let Some(reason) = skip_reason(&post, ctx, config) {
        debug!(post = post_id, ?reason, "Skipping save hook");
        return Ok(SaveOutcome::Skipped(reason));
    }

    let rules = Rules::load(conn)?;
    let plan = process_post(conn, &post, &rules)?;
    Ok(if plan.changed() {
        SaveOutcome::Updated(plan.diff())
    } else {
        SaveOutcome::Unchanged
    })
}

// ── Batch migration ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub processed: usize,
    pub updated: usize,
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
    #[serde(rename = "continue")]
    pub continue_processing: bool,
    pub message: String,
}

/// Reconcile one page of published posts starting at `offset`.
///
/// Plans are computed in parallel, then changed assignments are written in one
/// transaction. The caller resumes with `completed` as the next offset.
pub fn process_batch(
    conn: &Connection,
    offset: usize,
    batch_size: usize,
    config: &AppConfig,
) -> Result<BatchProgress> {
    let rules = Rules::load(conn)?;
    let posts = db::fetch_published_batch(conn, &config.post_types, offset, batch_size)?;

    let mut current = Vec::with_capacity(posts.len());
    for post in &posts {
        current.push(db::post_categories(conn, post.id)?);
    }

    let plans: Vec<CategoryPlan> = posts
        .par_iter()
        .zip(current.into_par_iter())
        .map(|(post, current)| plan_post(post, current, &rules))
        .collect();

    let changed: Vec<(i64, CategorySet)> = plans
        .iter()
        .filter(|p| p.changed())
        .map(|p| (p.post_id, p.next.clone()))
        .collect();
    db::save_post_categories(conn, &changed)?;

    let processed = plans.len();
    let total = db::count_published(conn, &config.post_types)?;
    let completed = offset + processed;
    let remaining = total.saturating_sub(completed);

    info!(
        offset,
        processed,
        updated = changed.len(),
        total,
        "Processed batch"
    );

    Ok(BatchProgress {
        processed,
        updated: changed.len(),
        total,
        completed,
        remaining,
        continue_processing: remaining > 0 && processed > 0,
        message: format!("Processed {} of {} posts...", completed, total),
    })
}

/// Every distinct block identifier found in stored content, sorted.
pub fn seen_block_names(conn: &Connection) -> Result<Vec<String>> {
    let contents = db::fetch_all_content(conn)?;
    let names: BTreeSet<String> = contents
        .par_iter()
        .flat_map_iter(|content| parser::block_names_in(content))
        .collect();
    Ok(names.into_iter().collect())
}

//! Context assembly: selection, ranking, budget packing and compression.
//!
//! For one workspace and goal the assembler:
//!
//! 1. gathers candidates: pinned items, the top semantic facts, the top
//!    procedural workflows matching the goal signature, a recency window of
//!    episodic records, and caller-supplied external items;
//! 2. scores every unpinned candidate as
//!    `w_recency * recency + w_relevance * relevance + w_priority * priority`;
//! 3. lets pinned items consume budget first, unconditionally;
//! 4. packs the rest greedily by descending score, compressing an item once
//!    when it does not fit whole and dropping it if what remains is too small
//!    to be useful.
//!
//! # Determinism
//!
//! Ties are broken by earlier sequence number, then creation time, then id.
//! One clock reading is taken per call, so identical memory and inputs give
//! identical packs.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use waymark_config::ContextConfig;
use waymark_core::context::{AssemblyMetadata, ContextItem, ContextPack, DropInfo, Tier};
use waymark_core::error::{ContextError, Error, MemoryError};
use waymark_core::memory::{
    Correction, CorrectionSource, EpisodicRecord, ProceduralWorkflow, SemanticFact,
};
use waymark_core::signature::goal_signature;
use waymark_core::workspace::WorkspaceId;
use waymark_memory::{MemorySnapshot, MemoryStore, blended_score, recency, text_similarity};
use waymark_workspace::WorkspaceManager;

use crate::context::pins::PinBoard;
use crate::context::token::{estimate_tokens, truncate_to_tokens};

// ── Item construction ─────────────────────────────────────────────────────

pub(crate) fn fact_item(fact: &SemanticFact) -> ContextItem {
    ContextItem {
        id: format!("semantic:{}", fact.id),
        workspace_id: fact.workspace_id.clone(),
        tier: Tier::Semantic,
        token_count: estimate_tokens(&fact.statement),
        content: fact.statement.clone(),
        priority_score: fact.confidence.clamp(0.0, 1.0),
        pinned: false,
        source_ref: Some(fact.id.clone()),
        compressed: false,
        sequence_no: None,
        created_at: fact.created_at,
    }
}

pub(crate) fn workflow_item(workflow: &ProceduralWorkflow) -> ContextItem {
    let content = workflow.render();
    ContextItem {
        id: format!("procedural:{}", workflow.id),
        workspace_id: workflow.workspace_id.clone(),
        tier: Tier::Procedural,
        token_count: estimate_tokens(&content),
        content,
        priority_score: workflow.success_rate(),
        pinned: false,
        source_ref: Some(workflow.id.clone()),
        compressed: false,
        sequence_no: None,
        created_at: workflow.created_at,
    }
}

pub(crate) fn episode_item(record: &EpisodicRecord) -> ContextItem {
    let content = record.summary();
    ContextItem {
        id: format!("episodic:{}", record.sequence_no),
        workspace_id: record.workspace_id.clone(),
        tier: Tier::Episodic,
        token_count: estimate_tokens(&content),
        content,
        priority_score: record.outcome.weight(),
        pinned: false,
        source_ref: Some(record.sequence_no.to_string()),
        compressed: false,
        sequence_no: Some(record.sequence_no),
        created_at: record.timestamp,
    }
}

/// A scored, not yet packed item.
struct Candidate {
    item: ContextItem,
    score: f32,
}

// ── Assembler ─────────────────────────────────────────────────────────────

pub struct ContextAssembler {
    memory: MemoryStore,
    workspaces: Arc<WorkspaceManager>,
    pins: Arc<PinBoard>,
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(
        memory: MemoryStore,
        workspaces: Arc<WorkspaceManager>,
        pins: Arc<PinBoard>,
        config: ContextConfig,
    ) -> Self {
        Self {
            memory,
            workspaces,
            pins,
            config,
        }
    }

    pub fn pins(&self) -> &Arc<PinBoard> {
        &self.pins
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Assemble a budgeted context pack for `goal`.
    ///
    /// `extra` items must belong to `workspace_id`; those marked pinned are
    /// forced in alongside the pin board, the rest compete as external
    /// context.
    pub async fn assemble(
        &self,
        workspace_id: &WorkspaceId,
        goal: &str,
        extra: Vec<ContextItem>,
    ) -> Result<ContextPack, Error> {
        let workspace = self.workspaces.get(workspace_id).await?;
        for item in &extra {
            ensure_owned(workspace_id, item)?;
        }

        let available = workspace
            .context_token_budget
            .saturating_sub(self.config.reserved_overhead);
        let now = Utc::now();

        // ── Pinned: forced include ──
        let mut pinned = self.pins.pinned(workspace_id).await;
        let (extra_pinned, extra_loose): (Vec<_>, Vec<_>) =
            extra.into_iter().partition(|i| i.pinned);
        for item in extra_pinned {
            if !pinned.iter().any(|p| p.id == item.id) {
                pinned.push(item);
            }
        }
        for item in &mut pinned {
            ensure_owned(workspace_id, item)?;
            item.pinned = true;
            item.token_count = estimate_tokens(&item.content);
        }
        let pinned_tokens: usize = pinned.iter().map(|i| i.token_count).sum();
        if pinned_tokens > available {
            return Err(ContextError::BudgetExceeded {
                pinned_tokens,
                pinned_items: pinned.len(),
                budget: available,
            }
            .into());
        }

        // ── Candidates ──
        let snapshot = self.memory.snapshot(workspace_id).await?;
        let pinned_ids: HashSet<&str> = pinned.iter().map(|i| i.id.as_str()).collect();
        let mut candidates = Vec::new();
        for (item, seen_at) in self
            .memory_candidates(&snapshot, goal, now)
            .into_iter()
            .chain(extra_loose.into_iter().map(|mut i| {
                i.tier = Tier::External;
                let seen = i.created_at;
                (i, seen)
            }))
        {
            ensure_owned(workspace_id, &item)?;
            if pinned_ids.contains(item.id.as_str()) {
                continue;
            }
            let score = self.score(&item, goal, seen_at, now);
            candidates.push(Candidate { item, score });
        }
        let candidate_count = candidates.len() + pinned.len();

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| tie_key(&a.item).cmp(&tie_key(&b.item)))
                .then_with(|| a.item.created_at.cmp(&b.item.created_at))
                .then_with(|| a.item.id.cmp(&b.item.id))
        });

        // ── Pack ──
        let mut remaining = available - pinned_tokens;
        let mut packed: Vec<ContextItem> = Vec::new();
        let mut dropped: Vec<DropInfo> = Vec::new();
        let mut compressed = 0;

        for Candidate { mut item, .. } in candidates {
            let tokens = estimate_tokens(&item.content);
            if tokens <= remaining {
                item.token_count = tokens;
                remaining -= tokens;
                packed.push(item);
                continue;
            }
            if remaining < self.config.min_useful_tokens {
                dropped.push(drop_info(&item, tokens, "budget exhausted"));
                continue;
            }

            // One compression attempt.
            let shortened = truncate_to_tokens(&item.content, remaining);
            let short_tokens = estimate_tokens(&shortened);
            if short_tokens < self.config.min_useful_tokens || short_tokens > remaining {
                dropped.push(drop_info(
                    &item,
                    tokens,
                    "below minimum useful size after compression",
                ));
                continue;
            }
            item.content = shortened;
            item.token_count = short_tokens;
            item.compressed = true;
            remaining -= short_tokens;
            compressed += 1;
            packed.push(item);
        }

        let pinned_count = pinned.len();
        let mut items = pinned;
        items.extend(packed);
        let total_tokens: usize = items.iter().map(|i| i.token_count).sum();

        let utilization_pct = if available == 0 {
            0.0
        } else {
            (total_tokens as f32 / available as f32) * 100.0
        };

        debug!(
            workspace_id = %workspace_id,
            candidates = candidate_count,
            included = items.len(),
            dropped = dropped.len(),
            compressed,
            total_tokens,
            available,
            "Context assembled"
        );

        self.pins.remember_pack(workspace_id, &items).await;

        Ok(ContextPack {
            workspace_id: workspace_id.clone(),
            items,
            total_tokens,
            budget: workspace.context_token_budget,
            metadata: AssemblyMetadata {
                candidates: candidate_count,
                pinned: pinned_count,
                compressed,
                dropped,
                available_tokens: available,
                utilization_pct,
            },
        })
    }

    /// Top semantic facts, matching workflows and recent episodes, each with
    /// the time used for its recency score.
    fn memory_candidates(
        &self,
        snapshot: &MemorySnapshot,
        goal: &str,
        now: DateTime<Utc>,
    ) -> Vec<(ContextItem, DateTime<Utc>)> {
        let settings = self.memory.settings();
        let half_life = settings.recency_half_life;
        let mix = settings.recency_mix;
        let mut out = Vec::new();

        let mut facts: Vec<(f32, &SemanticFact)> = snapshot
            .semantic
            .iter()
            .map(|f| {
                let score = blended_score(
                    text_similarity(goal, &f.statement),
                    recency(f.last_accessed_at, now, half_life),
                    mix,
                );
                (score, f)
            })
            .collect();
        facts.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(b.1.confidence.total_cmp(&a.1.confidence))
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        out.extend(
            facts
                .into_iter()
                .take(self.config.semantic_limit)
                .map(|(_, f)| (fact_item(f), f.last_accessed_at)),
        );

        let signature = goal_signature(goal);
        let mut workflows: Vec<(f32, &ProceduralWorkflow)> = snapshot
            .procedural
            .iter()
            .filter(|w| !w.retired)
            .map(|w| (text_similarity(&signature, &w.goal_signature), w))
            .filter(|(similarity, _)| signature.is_empty() || *similarity > 0.0)
            .collect();
        workflows.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(b.1.success_rate().total_cmp(&a.1.success_rate()))
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        out.extend(
            workflows
                .into_iter()
                .take(self.config.procedural_limit)
                .map(|(_, w)| (workflow_item(w), w.last_used_at.unwrap_or(w.created_at))),
        );

        out.extend(
            snapshot
                .episodic
                .iter()
                .rev()
                .take(self.config.episodic_window)
                .map(|r| (episode_item(r), r.timestamp)),
        );
        out
    }

    fn score(&self, item: &ContextItem, goal: &str, seen_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
        let half_life = self.memory.settings().recency_half_life;
        self.config.weight_recency * recency(seen_at, now, half_life)
            + self.config.weight_relevance * text_similarity(goal, &item.content)
            + self.config.weight_priority * item.priority_score.clamp(0.0, 1.0)
    }

    // ── Editing ──

    pub async fn pin(&self, workspace_id: &WorkspaceId, item_id: &str) -> Result<ContextItem, Error> {
        self.workspaces.get(workspace_id).await?;
        Ok(self.pins.pin(workspace_id, item_id).await?)
    }

    pub async fn unpin(
        &self,
        workspace_id: &WorkspaceId,
        item_id: &str,
    ) -> Result<ContextItem, Error> {
        self.workspaces.get(workspace_id).await?;
        Ok(self.pins.unpin(workspace_id, item_id).await?)
    }

    /// Replace an item's content.
    ///
    /// Semantic items are corrected at the source through
    /// [`MemoryStore::record_feedback`]. Episodic and procedural items are
    /// derived from history and cannot be edited.
    pub async fn edit(
        &self,
        workspace_id: &WorkspaceId,
        item_id: &str,
        new_content: &str,
    ) -> Result<ContextItem, Error> {
        self.workspaces.get(workspace_id).await?;
        if new_content.trim().is_empty() {
            return Err(ContextError::NotEditable(
                item_id.to_string(),
                "content must not be empty".into(),
            )
            .into());
        }
        let item = self
            .pins
            .find(workspace_id, item_id)
            .await
            .ok_or_else(|| ContextError::ItemNotFound(item_id.to_string()))?;

        match item.tier {
            Tier::Semantic => {
                let fact_id = item.source_ref.as_deref().ok_or_else(|| {
                    ContextError::NotEditable(item_id.to_string(), "no source fact".into())
                })?;
                let correction = Correction {
                    statement: Some(new_content.to_string()),
                    note: Some("edited in context".into()),
                    source: CorrectionSource::User,
                    ..Correction::default()
                };
                self.memory
                    .record_feedback(workspace_id, fact_id, correction)
                    .await?;
            }
            Tier::Episodic => {
                return Err(ContextError::NotEditable(
                    item_id.to_string(),
                    "episodic history is append-only".into(),
                )
                .into());
            }
            Tier::Procedural => {
                return Err(ContextError::NotEditable(
                    item_id.to_string(),
                    "workflows are induced from history".into(),
                )
                .into());
            }
            Tier::External => {}
        }

        let updated = self
            .pins
            .replace_content(workspace_id, item_id, new_content)
            .await?;
        info!(workspace_id = %workspace_id, item_id, tier = ?updated.tier, "Context item edited");
        Ok(updated)
    }
}

fn ensure_owned(workspace_id: &WorkspaceId, item: &ContextItem) -> Result<(), MemoryError> {
    if &item.workspace_id != workspace_id {
        return Err(MemoryError::isolation(
            "assemble",
            workspace_id,
            &item.workspace_id,
        ));
    }
    Ok(())
}

/// Items without a sequence number sort after those with one.
fn tie_key(item: &ContextItem) -> u64 {
    item.sequence_no.unwrap_or(u64::MAX)
}

fn drop_info(item: &ContextItem, tokens: usize, reason: &str) -> DropInfo {
    DropInfo {
        item_id: item.id.clone(),
        tier: item.tier,
        tokens,
        reason: reason.to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

//! The workspace-partitioned memory store.
//!
//! Each workspace owns one [`Partition`] holding its three tiers. Partitions
//! never share state, and every public operation takes the target workspace
//! explicitly, so a read can only ever see its own partition.
//!
//! Locking, per partition:
//! - `append_lock` serializes appends, which keeps sequence numbers
//!   strictly increasing with no gaps. Rewriting the persisted log for an
//!   eviction takes it too.
//! - `state` is read-mostly; writers hold it across the persistence call
//!   for the data they changed, so saves land in the order they happened.
//! - `promotion_lock` allows one promotion pass at a time. Background
//!   triggers skip if a pass is already running.
//!
//! The partition map itself is write-locked while a partition is loaded
//! from the backend and while one is purged.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use waymark_config::MemoryConfig;
use waymark_core::error::{Error, MemoryError};
use waymark_core::event::{DomainEvent, EventBus};
use waymark_core::memory::{
    Correction, EpisodeWindow, EpisodicRecord, MemoryPersistence, NewEpisode, PersistedPartition,
    ProceduralWorkflow, PromotionState, SemanticFact,
};
use waymark_core::provider::LanguageModel;
use waymark_core::workspace::{WorkspaceCascade, WorkspaceId};
use waymark_providers::StructuredGenerator;

use crate::promotion::{
    PromotionReport, PromotionSettings, induce_workflows, merge_facts, summarize,
};
use crate::ranking::{blended_score, recency, text_similarity};

/// Runtime settings, usually built from [`MemoryConfig`].
#[derive(Debug, Clone)]
pub struct MemorySettings {
    pub episodic_cap: usize,
    pub promote_every: usize,
    pub promote_interval: Duration,
    pub recency_half_life: Duration,
    pub recency_mix: f32,
    pub summarize: bool,
    /// Run promotion in the background when a trigger fires.
    pub auto_promote: bool,
    pub promotion: PromotionSettings,
}

impl MemorySettings {
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            episodic_cap: config.episodic_cap,
            promote_every: config.promote_every,
            promote_interval: Duration::from_secs(config.promote_interval_secs),
            recency_half_life: Duration::from_secs(config.recency_half_life_secs),
            recency_mix: config.recency_mix,
            summarize: config.summarize,
            auto_promote: true,
            promotion: PromotionSettings {
                workflow_min_runs: config.workflow_min_runs,
                dedup_threshold: config.dedup_threshold,
                retire_min_samples: config.retire_min_samples,
                retire_success_floor: config.retire_success_floor,
            },
        }
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default())
    }
}

/// Point-in-time copy of one workspace's memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub workspace_id: WorkspaceId,
    pub episodic: Vec<EpisodicRecord>,
    pub semantic: Vec<SemanticFact>,
    pub procedural: Vec<ProceduralWorkflow>,
    pub promotion: PromotionState,
    pub next_sequence_no: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub workspace_id: WorkspaceId,
    pub episodic_records: usize,
    pub semantic_facts: usize,
    pub active_workflows: usize,
    pub retired_workflows: usize,
    pub next_sequence_no: u64,
    pub summarized_through: u64,
    pub considered_through: u64,
}

// ── Partition ─────────────────────────────────────────────────────────────

struct PartitionState {
    episodic: VecDeque<EpisodicRecord>,
    semantic: Vec<SemanticFact>,
    procedural: Vec<ProceduralWorkflow>,
    promotion: PromotionState,
    next_sequence: u64,
    appended_since_promotion: usize,
    last_promotion: Instant,
}

impl PartitionState {
    fn from_persisted(persisted: PersistedPartition) -> Self {
        let last_seq = persisted
            .episodic
            .last()
            .map(|r| r.sequence_no)
            .unwrap_or(0)
            .max(persisted.promotion.considered_through)
            .max(persisted.promotion.summarized_through);
        Self {
            appended_since_promotion: persisted
                .episodic
                .iter()
                .filter(|r| r.sequence_no > persisted.promotion.considered_through)
                .count(),
            episodic: persisted.episodic.into(),
            semantic: persisted.semantic,
            procedural: persisted.procedural,
            promotion: persisted.promotion,
            next_sequence: last_seq + 1,
            last_promotion: Instant::now(),
        }
    }

    /// Drop the oldest records beyond `cap`, but never one that promotion
    /// still needs: unseen by any pass, or, when `summarizing`, not yet
    /// condensed into facts. Returns the highest evicted sequence number.
    fn evict_over_cap(&mut self, cap: usize, summarizing: bool) -> Option<u64> {
        let floor = if summarizing {
            self.promotion
                .considered_through
                .min(self.promotion.summarized_through)
        } else {
            self.promotion.considered_through
        };
        let mut evicted = None;
        while self.episodic.len() > cap {
            match self.episodic.front() {
                Some(front) if front.sequence_no <= floor => {
                    evicted = Some(front.sequence_no);
                    self.episodic.pop_front();
                }
                _ => break,
            }
        }
        evicted
    }
}

struct Partition {
    workspace_id: WorkspaceId,
    state: RwLock<PartitionState>,
    append_lock: Mutex<()>,
    promotion_lock: Mutex<()>,
    purged: AtomicBool,
}

// ── Store ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryStore {
    partitions: Arc<RwLock<HashMap<WorkspaceId, Arc<Partition>>>>,
    persistence: Arc<dyn MemoryPersistence>,
    summarizer: Option<Arc<StructuredGenerator>>,
    settings: MemorySettings,
    events: Option<Arc<EventBus>>,
}

impl MemoryStore {
    pub fn new(persistence: Arc<dyn MemoryPersistence>, settings: MemorySettings) -> Self {
        Self {
            partitions: Arc::new(RwLock::new(HashMap::new())),
            persistence,
            summarizer: None,
            settings,
            events: None,
        }
    }

    /// Use `model` to condense episodes into semantic facts.
    pub fn with_summarizer(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.summarizer = Some(Arc::new(StructuredGenerator::new(model)));
        self
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    pub fn persistence_name(&self) -> &str {
        self.persistence.name()
    }

    /// Load every persisted workspace. Returns how many were found.
    pub async fn hydrate(&self) -> Result<usize, MemoryError> {
        let ids = self.persistence.workspaces().await?;
        for id in &ids {
            self.partition(id).await?;
        }
        info!(workspaces = ids.len(), backend = self.persistence.name(), "Memory hydrated");
        Ok(ids.len())
    }

    async fn partition(&self, workspace_id: &WorkspaceId) -> Result<Arc<Partition>, MemoryError> {
        if let Some(partition) = self.partitions.read().await.get(workspace_id) {
            return Ok(partition.clone());
        }

        // Loading under the write lock keeps a load from racing a purge and
        // reinserting data that is about to be deleted.
        let mut partitions = self.partitions.write().await;
        if let Some(partition) = partitions.get(workspace_id) {
            return Ok(partition.clone());
        }
        let persisted = self.persistence.load(workspace_id).await?;
        let partition = Arc::new(Partition {
            workspace_id: workspace_id.clone(),
            state: RwLock::new(PartitionState::from_persisted(persisted)),
            append_lock: Mutex::new(()),
            promotion_lock: Mutex::new(()),
            purged: AtomicBool::new(false),
        });
        partitions.insert(workspace_id.clone(), partition.clone());
        Ok(partition)
    }

    // ── Episodic ──

    /// Durably append an episode and return it with its sequence number.
    ///
    /// The record is persisted before it becomes visible; if persistence
    /// fails nothing changes and the sequence number is not consumed.
    pub async fn append_episodic(
        &self,
        workspace_id: &WorkspaceId,
        episode: NewEpisode,
    ) -> Result<EpisodicRecord, MemoryError> {
        if &episode.workspace_id != workspace_id {
            return Err(MemoryError::isolation(
                "append_episodic",
                workspace_id,
                &episode.workspace_id,
            ));
        }

        let partition = self.partition(workspace_id).await?;
        let _append = partition.append_lock.lock().await;
        if partition.purged.load(Ordering::Acquire) {
            return Err(MemoryError::Storage(format!(
                "memory for workspace {workspace_id} was purged"
            )));
        }

        let sequence_no = partition.state.read().await.next_sequence;
        let record = episode.into_record(sequence_no, Utc::now());
        self.persistence.append_episodic(&record).await?;

        let cap = self.settings.episodic_cap;
        let (trigger, evicted) = {
            let mut state = partition.state.write().await;
            state.episodic.push_back(record.clone());
            state.next_sequence = sequence_no + 1;
            state.appended_since_promotion += 1;
            let evicted = state.evict_over_cap(cap, self.summarizing());
            let trigger = (self.settings.promote_every > 0
                && state.appended_since_promotion >= self.settings.promote_every)
                || state.last_promotion.elapsed() >= self.settings.promote_interval
                || state.episodic.len() > cap;
            (trigger, evicted)
        };
        if let Some(through) = evicted {
            self.persist_eviction(workspace_id, through).await;
        }

        debug!(
            workspace_id = %workspace_id,
            sequence_no,
            outcome = ?record.outcome,
            "Episode recorded"
        );
        self.publish(DomainEvent::EpisodeRecorded {
            workspace_id: workspace_id.to_string(),
            sequence_no,
            outcome: record.outcome,
            timestamp: record.timestamp,
        });

        if trigger && self.settings.auto_promote {
            self.spawn_promotion(workspace_id.clone());
        }
        Ok(record)
    }

    fn summarizing(&self) -> bool {
        self.summarizer.is_some() && self.settings.summarize
    }

    async fn persist_eviction(&self, workspace_id: &WorkspaceId, through: u64) {
        if let Err(e) = self.persistence.evict_episodic(workspace_id, through).await {
            warn!(workspace_id = %workspace_id, through, error = %e, "Failed to persist eviction");
        }
    }

    /// Episodic records in `window`: relevance-ranked when it carries a
    /// query, newest first otherwise.
    pub async fn query_episodic(
        &self,
        workspace_id: &WorkspaceId,
        window: &EpisodeWindow,
    ) -> Result<Vec<EpisodicRecord>, MemoryError> {
        let partition = self.partition(workspace_id).await?;
        let state = partition.state.read().await;
        let in_window = state
            .episodic
            .iter()
            .filter(|r| window.after.is_none_or(|after| r.sequence_no > after));

        let mut records: Vec<EpisodicRecord> = match window.query.as_deref().map(str::trim) {
            Some(query) if !query.is_empty() => {
                let now = Utc::now();
                let mut scored: Vec<(f32, &EpisodicRecord)> = in_window
                    .map(|r| {
                        let score = blended_score(
                            text_similarity(query, &r.summary()),
                            recency(r.timestamp, now, self.settings.recency_half_life),
                            self.settings.recency_mix,
                        );
                        (score, r)
                    })
                    .collect();
                scored.sort_by(|a, b| {
                    b.0.total_cmp(&a.0)
                        .then(b.1.sequence_no.cmp(&a.1.sequence_no))
                });
                scored.into_iter().map(|(_, r)| r.clone()).collect()
            }
            _ => in_window.rev().cloned().collect(),
        };
        if window.limit > 0 {
            records.truncate(window.limit);
        }
        Ok(records)
    }

    // ── Semantic ──

    /// Facts ranked by relevance to `query` blended with recency of use.
    /// Returned facts count as accessed. `limit == 0` means no limit.
    pub async fn query_semantic(
        &self,
        workspace_id: &WorkspaceId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SemanticFact>, MemoryError> {
        let partition = self.partition(workspace_id).await?;
        let mut state = partition.state.write().await;
        let now = Utc::now();

        let mut ranked: Vec<(f32, usize)> = state
            .semantic
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let score = blended_score(
                    text_similarity(query, &f.statement),
                    recency(f.last_accessed_at, now, self.settings.recency_half_life),
                    self.settings.recency_mix,
                );
                (score, i)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(state.semantic[b.1].confidence.total_cmp(&state.semantic[a.1].confidence))
        });
        if limit > 0 {
            ranked.truncate(limit);
        }

        Ok(ranked
            .into_iter()
            .map(|(_, i)| {
                let fact = &mut state.semantic[i];
                fact.last_accessed_at = now;
                fact.clone()
            })
            .collect())
    }

    /// Apply a user or orchestrator correction to a fact.
    pub async fn record_feedback(
        &self,
        workspace_id: &WorkspaceId,
        fact_id: &str,
        correction: Correction,
    ) -> Result<SemanticFact, MemoryError> {
        let partition = self.partition(workspace_id).await?;
        let mut state = partition.state.write().await;
        let position = state.semantic.iter().position(|f| f.id == fact_id);
        let Some(index) = position else {
            drop(state);
            let owner = self
                .find_owner(workspace_id, |s| s.semantic.iter().any(|f| f.id == fact_id))
                .await;
            return Err(match owner {
                Some(owner) => MemoryError::isolation("record_feedback", workspace_id, owner),
                None => MemoryError::FactNotFound(fact_id.to_string()),
            });
        };

        let source = correction.source;
        state.semantic[index].apply_correction(correction, Utc::now());
        let updated = state.semantic[index].clone();
        self.persistence
            .save_semantic(workspace_id, &state.semantic)
            .await?;
        info!(
            workspace_id = %workspace_id,
            fact_id,
            source = ?source,
            confidence = updated.confidence,
            "Fact corrected"
        );
        Ok(updated)
    }

    // ── Procedural ──

    /// Active workflows whose goal signature matches `signature`, best first.
    pub async fn query_procedural(
        &self,
        workspace_id: &WorkspaceId,
        signature: &str,
        limit: usize,
    ) -> Result<Vec<ProceduralWorkflow>, MemoryError> {
        let partition = self.partition(workspace_id).await?;
        let state = partition.state.read().await;
        let now = Utc::now();
        let match_all = signature.trim().is_empty();

        let mut ranked: Vec<(f32, &ProceduralWorkflow)> = state
            .procedural
            .iter()
            .filter(|w| !w.retired)
            .filter_map(|w| {
                let relevance = text_similarity(signature, &w.goal_signature);
                if relevance <= 0.0 && !match_all {
                    return None;
                }
                let used = w.last_used_at.unwrap_or(w.created_at);
                let score = blended_score(
                    relevance,
                    recency(used, now, self.settings.recency_half_life),
                    self.settings.recency_mix,
                );
                Some((score, w))
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(b.1.success_rate().total_cmp(&a.1.success_rate()))
        });
        if limit > 0 {
            ranked.truncate(limit);
        }
        Ok(ranked.into_iter().map(|(_, w)| w.clone()).collect())
    }

    /// Record that a plan followed `workflow_id` and how it ended.
    ///
    /// With a `plan_id`, that plan's run is marked counted so induction does
    /// not count it a second time.
    pub async fn record_workflow_use(
        &self,
        workspace_id: &WorkspaceId,
        workflow_id: &str,
        success: bool,
        plan_id: Option<&str>,
    ) -> Result<ProceduralWorkflow, MemoryError> {
        let partition = self.partition(workspace_id).await?;
        let mut state = partition.state.write().await;
        let position = state.procedural.iter().position(|w| w.id == workflow_id);
        let Some(index) = position else {
            drop(state);
            let owner = self
                .find_owner(workspace_id, |s| {
                    s.procedural.iter().any(|w| w.id == workflow_id)
                })
                .await;
            return Err(match owner {
                Some(owner) => MemoryError::isolation("record_workflow_use", workspace_id, owner),
                None => MemoryError::WorkflowNotFound(workflow_id.to_string()),
            });
        };

        let state = &mut *state;
        let workflow = &mut state.procedural[index];
        if success {
            workflow.success_count += 1;
        } else {
            workflow.failure_count += 1;
        }
        workflow.last_used_at = Some(Utc::now());
        if let Some(plan_id) = plan_id {
            workflow.source_plan_ids.insert(plan_id.to_string());
            state.promotion.counted_runs.insert(plan_id.to_string());
        }
        let retired = workflow.apply_retirement(
            self.settings.promotion.retire_min_samples,
            self.settings.promotion.retire_success_floor,
        );
        let updated = workflow.clone();

        self.persistence
            .save_procedural(workspace_id, &state.procedural)
            .await?;
        if plan_id.is_some() {
            self.persistence
                .save_promotion_state(workspace_id, &state.promotion)
                .await?;
        }
        if retired {
            info!(workspace_id = %workspace_id, workflow_id, "Workflow retired");
        }
        Ok(updated)
    }

    // ── Promotion ──

    /// Run a promotion pass now, waiting for any pass already in flight.
    pub async fn promote(&self, workspace_id: &WorkspaceId) -> Result<PromotionReport, MemoryError> {
        let partition = self.partition(workspace_id).await?;
        let _guard = partition.promotion_lock.lock().await;
        self.promote_locked(&partition).await
    }

    fn spawn_promotion(&self, workspace_id: WorkspaceId) {
        let store = self.clone();
        tokio::spawn(async move {
            let partition = match store.partition(&workspace_id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(workspace_id = %workspace_id, error = %e, "Promotion skipped");
                    return;
                }
            };
            let Ok(_guard) = partition.promotion_lock.try_lock() else {
                debug!(workspace_id = %workspace_id, "Promotion already running");
                return;
            };
            if let Err(e) = store.promote_locked(&partition).await {
                warn!(workspace_id = %workspace_id, error = %e, "Background promotion failed");
                store.publish(DomainEvent::ErrorOccurred {
                    context: format!("promotion:{workspace_id}"),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        });
    }

    async fn promote_locked(&self, partition: &Partition) -> Result<PromotionReport, MemoryError> {
        let workspace_id = &partition.workspace_id;
        let (window, high) = {
            let state = partition.state.read().await;
            let high = state
                .episodic
                .back()
                .map(|r| r.sequence_no)
                .unwrap_or(0)
                .max(state.promotion.considered_through);
            let window: Vec<EpisodicRecord> = state
                .episodic
                .iter()
                .filter(|r| r.sequence_no > state.promotion.summarized_through)
                .cloned()
                .collect();
            (window, high)
        };

        let mut report = PromotionReport {
            considered_through: high,
            ..PromotionReport::default()
        };

        // The model call runs without holding the state lock.
        let candidates = match &self.summarizer {
            Some(generator) if self.settings.summarize && !window.is_empty() => {
                match summarize(generator, &window).await {
                    Ok(candidates) => Some(candidates),
                    Err(e) => {
                        warn!(
                            workspace_id = %workspace_id,
                            error = %e,
                            "Summarization failed, cursor not advanced"
                        );
                        report.summarization_failed = true;
                        None
                    }
                }
            }
            _ => Some(Vec::new()),
        };

        let mut guard = partition.state.write().await;
        if partition.purged.load(Ordering::Acquire) {
            return Ok(report);
        }
        let state = &mut *guard;
        let now = Utc::now();

        if let Some(candidates) = candidates {
            let (created, merged) = merge_facts(
                &mut state.semantic,
                candidates,
                workspace_id,
                self.settings.promotion.dedup_threshold,
                now,
            );
            report.facts_created = created;
            report.facts_merged = merged;
            state.promotion.summarized_through = state.promotion.summarized_through.max(high);
        }

        let induction = induce_workflows(
            state.episodic.make_contiguous(),
            &mut state.procedural,
            &mut state.promotion,
            workspace_id,
            &self.settings.promotion,
            now,
        );
        report.workflows_created = induction.created;
        report.workflows_reinforced = induction.reinforced;
        report.workflows_demoted = induction.demoted;
        report.workflows_retired = induction.retired;

        state.promotion.considered_through = state.promotion.considered_through.max(high);
        state.appended_since_promotion = state
            .episodic
            .iter()
            .filter(|r| r.sequence_no > high)
            .count();
        state.last_promotion = Instant::now();
        let evicted = state.evict_over_cap(self.settings.episodic_cap, self.summarizing());

        if report.facts_created + report.facts_merged > 0 {
            self.persistence
                .save_semantic(workspace_id, &state.semantic)
                .await?;
        }
        if induction.created + induction.reinforced + induction.demoted > 0 {
            self.persistence
                .save_procedural(workspace_id, &state.procedural)
                .await?;
        }
        self.persistence
            .save_promotion_state(workspace_id, &state.promotion)
            .await?;
        drop(guard);

        if let Some(through) = evicted {
            // The backend rewrites the log, so appends must wait.
            let _append = partition.append_lock.lock().await;
            if !partition.purged.load(Ordering::Acquire) {
                self.persist_eviction(workspace_id, through).await;
            }
        }

        info!(
            workspace_id = %workspace_id,
            through = high,
            facts_created = report.facts_created,
            facts_merged = report.facts_merged,
            workflows_created = report.workflows_created,
            workflows_reinforced = report.workflows_reinforced,
            workflows_demoted = report.workflows_demoted,
            "Promotion complete"
        );
        self.publish(DomainEvent::PromotionCompleted {
            workspace_id: workspace_id.to_string(),
            facts_created: report.facts_created,
            facts_merged: report.facts_merged,
            workflows_created: report.workflows_created,
            workflows_updated: report.workflows_reinforced + report.workflows_demoted,
            timestamp: now,
        });
        Ok(report)
    }

    // ── Whole partition ──

    pub async fn snapshot(&self, workspace_id: &WorkspaceId) -> Result<MemorySnapshot, MemoryError> {
        let partition = self.partition(workspace_id).await?;
        let state = partition.state.read().await;
        Ok(MemorySnapshot {
            workspace_id: workspace_id.clone(),
            episodic: state.episodic.iter().cloned().collect(),
            semantic: state.semantic.clone(),
            procedural: state.procedural.clone(),
            promotion: state.promotion.clone(),
            next_sequence_no: state.next_sequence,
        })
    }

    pub async fn stats(&self, workspace_id: &WorkspaceId) -> Result<MemoryStats, MemoryError> {
        let partition = self.partition(workspace_id).await?;
        let state = partition.state.read().await;
        let retired = state.procedural.iter().filter(|w| w.retired).count();
        Ok(MemoryStats {
            workspace_id: workspace_id.clone(),
            episodic_records: state.episodic.len(),
            semantic_facts: state.semantic.len(),
            active_workflows: state.procedural.len() - retired,
            retired_workflows: retired,
            next_sequence_no: state.next_sequence,
            summarized_through: state.promotion.summarized_through,
            considered_through: state.promotion.considered_through,
        })
    }

    /// Remove every tier of a workspace, in memory and on disk.
    ///
    /// The partition map stays write-locked until the backend has deleted
    /// the data, so no reader can load it back in the meantime.
    pub async fn purge(&self, workspace_id: &WorkspaceId) -> Result<(), MemoryError> {
        let mut partitions = self.partitions.write().await;
        if let Some(partition) = partitions.remove(workspace_id) {
            let _append = partition.append_lock.lock().await;
            let mut state = partition.state.write().await;
            partition.purged.store(true, Ordering::Release);
            state.episodic.clear();
            state.semantic.clear();
            state.procedural.clear();
        }
        self.persistence.purge(workspace_id).await?;
        drop(partitions);
        info!(workspace_id = %workspace_id, "Memory purged");
        Ok(())
    }

    /// Which other loaded workspace holds an entity matching `owns`.
    async fn find_owner(
        &self,
        workspace_id: &WorkspaceId,
        owns: impl Fn(&PartitionState) -> bool,
    ) -> Option<WorkspaceId> {
        let others: Vec<Arc<Partition>> = self
            .partitions
            .read()
            .await
            .iter()
            .filter(|(id, _)| *id != workspace_id)
            .map(|(_, p)| p.clone())
            .collect();
        for partition in others {
            if owns(&*partition.state.read().await) {
                return Some(partition.workspace_id.clone());
            }
        }
        None
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

#[async_trait]
impl WorkspaceCascade for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn purge(&self, workspace_id: &WorkspaceId) -> Result<(), Error> {
        MemoryStore::purge(self, workspace_id)
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonl::JsonlPersistence;
    use crate::persistence::NoopPersistence;
    use waymark_core::error::CapabilityError;
    use waymark_core::memory::{CorrectionSource, Outcome};
    use waymark_core::plan::{ActionKind, BrowserAction};
    use waymark_core::provider::{GenerateRequest, GenerateResponse, ModelKind};

    fn manual() -> MemorySettings {
        MemorySettings {
            auto_promote: false,
            ..MemorySettings::default()
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(NoopPersistence), manual())
    }

    fn ws(id: &str) -> WorkspaceId {
        WorkspaceId::from(id)
    }

    fn episode(workspace: &str, plan: &str, kind: ActionKind, outcome: Outcome) -> NewEpisode {
        NewEpisode::new(ws(workspace), plan, "check order status", BrowserAction::new(kind), outcome)
    }

    /// Fails appends while `failing` is set.
    struct FlakyPersistence {
        failing: AtomicBool,
    }

    #[async_trait]
    impl MemoryPersistence for FlakyPersistence {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn append_episodic(&self, _record: &EpisodicRecord) -> Result<(), MemoryError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(MemoryError::Storage("disk full".into()));
            }
            Ok(())
        }
        async fn evict_episodic(&self, _: &WorkspaceId, _: u64) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn save_semantic(&self, _: &WorkspaceId, _: &[SemanticFact]) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn save_procedural(
            &self,
            _: &WorkspaceId,
            _: &[ProceduralWorkflow],
        ) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn save_promotion_state(
            &self,
            _: &WorkspaceId,
            _: &PromotionState,
        ) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn load(&self, _: &WorkspaceId) -> Result<PersistedPartition, MemoryError> {
            Ok(PersistedPartition::default())
        }
        async fn workspaces(&self) -> Result<Vec<WorkspaceId>, MemoryError> {
            Ok(Vec::new())
        }
        async fn purge(&self, _: &WorkspaceId) -> Result<(), MemoryError> {
            Ok(())
        }
    }

    /// Replies with a fixed fact list, or fails.
    struct FactModel {
        reply: Option<String>,
    }

    #[async_trait]
    impl LanguageModel for FactModel {
        fn name(&self) -> &str {
            "facts"
        }
        fn kind(&self) -> ModelKind {
            ModelKind::OnDevice
        }
        async fn generate(
            &self,
            _request: GenerateRequest,
        ) -> Result<GenerateResponse, CapabilityError> {
            match &self.reply {
                Some(text) => Ok(GenerateResponse {
                    text: text.clone(),
                    model: "facts".into(),
                    usage: None,
                }),
                None => Err(CapabilityError::Unavailable("model offline".into())),
            }
        }
    }

    #[tokio::test]
    async fn sequence_numbers_increase_per_workspace() {
        let store = store();
        for expected in 1..=3 {
            let r = store
                .append_episodic(&ws("a"), episode("a", "p", ActionKind::Click, Outcome::Success))
                .await
                .unwrap();
            assert_eq!(r.sequence_no, expected);
        }
        let b = store
            .append_episodic(&ws("b"), episode("b", "p", ActionKind::Click, Outcome::Success))
            .await
            .unwrap();
        assert_eq!(b.sequence_no, 1);
    }

    #[tokio::test]
    async fn concurrent_appends_get_unique_contiguous_numbers() {
        let store = store();
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_episodic(
                        &ws("a"),
                        episode("a", &format!("p{i}"), ActionKind::Click, Outcome::Success),
                    )
                    .await
                    .unwrap()
                    .sequence_no
            }));
        }
        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort();
        assert_eq!(seqs, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn append_to_wrong_workspace_is_isolation_violation() {
        let store = store();
        let err = store
            .append_episodic(&ws("a"), episode("b", "p", ActionKind::Click, Outcome::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::IsolationViolation { .. }));
        assert!(store.snapshot(&ws("a")).await.unwrap().episodic.is_empty());
        assert!(store.snapshot(&ws("b")).await.unwrap().episodic.is_empty());
    }

    #[tokio::test]
    async fn failed_persist_leaves_no_gap() {
        let persistence = Arc::new(FlakyPersistence {
            failing: AtomicBool::new(false),
        });
        let store = MemoryStore::new(persistence.clone(), manual());
        let a = ws("a");
        store
            .append_episodic(&a, episode("a", "p", ActionKind::Click, Outcome::Success))
            .await
            .unwrap();

        persistence.failing.store(true, Ordering::SeqCst);
        assert!(
            store
                .append_episodic(&a, episode("a", "p", ActionKind::Click, Outcome::Success))
                .await
                .is_err()
        );
        assert_eq!(store.snapshot(&a).await.unwrap().episodic.len(), 1);

        persistence.failing.store(false, Ordering::SeqCst);
        let r = store
            .append_episodic(&a, episode("a", "p", ActionKind::Click, Outcome::Success))
            .await
            .unwrap();
        assert_eq!(r.sequence_no, 2);
    }

    #[tokio::test]
    async fn cap_only_evicts_promoted_records() {
        let settings = MemorySettings {
            episodic_cap: 3,
            ..manual()
        };
        let store = MemoryStore::new(Arc::new(NoopPersistence), settings);
        let a = ws("a");
        for i in 0..5 {
            store
                .append_episodic(&a, episode("a", &format!("p{i}"), ActionKind::Click, Outcome::Success))
                .await
                .unwrap();
        }
        // Nothing promoted yet, so nothing may be dropped.
        assert_eq!(store.stats(&a).await.unwrap().episodic_records, 5);

        store.promote(&a).await.unwrap();
        let snapshot = store.snapshot(&a).await.unwrap();
        let seqs: Vec<u64> = snapshot.episodic.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(snapshot.promotion.considered_through, 5);
    }

    #[tokio::test]
    async fn promotion_builds_workflow_from_three_runs() {
        let store = store();
        let a = ws("a");
        for plan in ["p1", "p2", "p3"] {
            for (i, kind) in [ActionKind::Navigate, ActionKind::Click, ActionKind::Extract]
                .into_iter()
                .enumerate()
            {
                store
                    .append_episodic(
                        &a,
                        episode("a", plan, kind, Outcome::Success).at_step(i, 3),
                    )
                    .await
                    .unwrap();
            }
        }
        let report = store.promote(&a).await.unwrap();
        assert_eq!(report.workflows_created, 1);

        let found = store
            .query_procedural(&a, "check order status", 3)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].success_count, 3);

        // A second pass over the same log changes nothing.
        let again = store.promote(&a).await.unwrap();
        assert_eq!(again.workflows_created + again.workflows_reinforced, 0);
        assert!(store.query_procedural(&ws("b"), "check order status", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summarizer_failure_keeps_cursor() {
        let a = ws("a");
        let failing = MemoryStore::new(Arc::new(NoopPersistence), manual())
            .with_summarizer(Arc::new(FactModel { reply: None }));
        failing
            .append_episodic(&a, episode("a", "p", ActionKind::Click, Outcome::Success))
            .await
            .unwrap();
        let report = failing.promote(&a).await.unwrap();
        assert!(report.summarization_failed);
        let stats = failing.stats(&a).await.unwrap();
        assert_eq!(stats.summarized_through, 0);
        assert_eq!(stats.considered_through, 1);
        assert_eq!(stats.semantic_facts, 0);
    }

    #[tokio::test]
    async fn summarizer_creates_and_merges_facts() {
        let a = ws("a");
        let store = MemoryStore::new(Arc::new(NoopPersistence), manual()).with_summarizer(
            Arc::new(FactModel {
                reply: Some(
                    r#"{"facts":[{"statement":"Orders page requires login","confidence":0.6}]}"#
                        .into(),
                ),
            }),
        );
        store
            .append_episodic(&a, episode("a", "p1", ActionKind::Click, Outcome::Success))
            .await
            .unwrap();
        let first = store.promote(&a).await.unwrap();
        assert_eq!(first.facts_created, 1);

        store
            .append_episodic(&a, episode("a", "p2", ActionKind::Click, Outcome::Success))
            .await
            .unwrap();
        let second = store.promote(&a).await.unwrap();
        assert_eq!(second.facts_merged, 1);

        let facts = store.query_semantic(&a, "login", 5).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert!((facts[0].confidence - 0.84).abs() < 1e-4);
        assert_eq!(facts[0].source_record_ids.len(), 2);
        assert_eq!(store.stats(&a).await.unwrap().summarized_through, 2);
    }

    #[tokio::test]
    async fn feedback_is_workspace_scoped() {
        let a = ws("a");
        let store = MemoryStore::new(Arc::new(NoopPersistence), manual()).with_summarizer(
            Arc::new(FactModel {
                reply: Some(r#"{"facts":[{"statement":"Cart expires after 1 hour","confidence":0.9}]}"#.into()),
            }),
        );
        store
            .append_episodic(&a, episode("a", "p", ActionKind::Click, Outcome::Success))
            .await
            .unwrap();
        store.promote(&a).await.unwrap();
        let fact = store.query_semantic(&a, "", 1).await.unwrap().remove(0);

        let corrected = store
            .record_feedback(
                &a,
                &fact.id,
                Correction {
                    statement: Some("Cart expires after 30 minutes".into()),
                    confidence: Some(0.95),
                    note: None,
                    source: CorrectionSource::User,
                },
            )
            .await
            .unwrap();
        assert_eq!(corrected.statement, "Cart expires after 30 minutes");
        assert_eq!(corrected.corrections.len(), 1);

        let b = ws("b");
        store.stats(&b).await.unwrap();
        let err = store
            .record_feedback(&b, &fact.id, Correction::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::IsolationViolation { .. }));
        let err = store
            .record_feedback(&a, "missing", Correction::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::FactNotFound(_)));
    }

    #[tokio::test]
    async fn episodic_query_orders() {
        let store = store();
        let a = ws("a");
        store
            .append_episodic(
                &a,
                episode("a", "p", ActionKind::Navigate, Outcome::Success)
                    .with_description("open the orders page"),
            )
            .await
            .unwrap();
        store
            .append_episodic(
                &a,
                episode("a", "p", ActionKind::Click, Outcome::Success)
                    .with_description("click newsletter banner"),
            )
            .await
            .unwrap();

        let latest = store.query_episodic(&a, &EpisodeWindow::latest(10)).await.unwrap();
        assert_eq!(latest[0].sequence_no, 2);

        let window = EpisodeWindow {
            after: None,
            limit: 1,
            query: Some("orders page".into()),
        };
        let ranked = store.query_episodic(&a, &window).await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].sequence_no, 1);

        let window = EpisodeWindow {
            after: Some(1),
            limit: 0,
            query: None,
        };
        assert_eq!(store.query_episodic(&a, &window).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn workflow_use_retires_poor_workflows() {
        let store = store();
        let a = ws("a");
        for plan in ["p1", "p2", "p3"] {
            store
                .append_episodic(&a, episode("a", plan, ActionKind::Click, Outcome::Success))
                .await
                .unwrap();
        }
        store.promote(&a).await.unwrap();
        let workflow = store.query_procedural(&a, "", 1).await.unwrap().remove(0);

        for _ in 0..3 {
            store
                .record_workflow_use(&a, &workflow.id, false, None)
                .await
                .unwrap();
        }
        // 3 ok / 3 failed: 0.5 is above the floor.
        assert!(!store.query_procedural(&a, "", 1).await.unwrap().is_empty());

        for _ in 0..2 {
            store
                .record_workflow_use(&a, &workflow.id, false, Some("p9"))
                .await
                .unwrap();
        }
        assert!(store.query_procedural(&a, "", 1).await.unwrap().is_empty());
        assert_eq!(store.stats(&a).await.unwrap().retired_workflows, 1);
        assert!(matches!(
            store.record_workflow_use(&a, "nope", true, None).await,
            Err(MemoryError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn purge_removes_partition() {
        let store = store();
        let a = ws("a");
        store
            .append_episodic(&a, episode("a", "p", ActionKind::Click, Outcome::Success))
            .await
            .unwrap();
        WorkspaceCascade::purge(&store, &a).await.unwrap();
        let stats = store.stats(&a).await.unwrap();
        assert_eq!(stats.episodic_records, 0);
        assert_eq!(stats.next_sequence_no, 1);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let a = ws("a");
        {
            let store = MemoryStore::new(
                Arc::new(JsonlPersistence::new(dir.path().to_path_buf())),
                manual(),
            );
            for plan in ["p1", "p2", "p3"] {
                store
                    .append_episodic(&a, episode("a", plan, ActionKind::Click, Outcome::Success))
                    .await
                    .unwrap();
            }
            store.promote(&a).await.unwrap();
        }

        let store = MemoryStore::new(
            Arc::new(JsonlPersistence::new(dir.path().to_path_buf())),
            manual(),
        );
        assert_eq!(store.hydrate().await.unwrap(), 1);
        let stats = store.stats(&a).await.unwrap();
        assert_eq!(stats.episodic_records, 3);
        assert_eq!(stats.active_workflows, 1);
        assert_eq!(stats.considered_through, 3);

        let next = store
            .append_episodic(&a, episode("a", "p4", ActionKind::Click, Outcome::Success))
            .await
            .unwrap();
        assert_eq!(next.sequence_no, 4);
        let again = store.promote(&a).await.unwrap();
        assert_eq!(again.workflows_created, 0);
        assert_eq!(again.workflows_reinforced, 1);
    }

    #[tokio::test]
    async fn background_promotion_fires_on_count() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let settings = MemorySettings {
            promote_every: 2,
            ..MemorySettings::default()
        };
        let store = MemoryStore::new(Arc::new(NoopPersistence), settings).with_events(bus);
        let a = ws("a");
        for plan in ["p1", "p2"] {
            store
                .append_episodic(&a, episode("a", plan, ActionKind::Click, Outcome::Success))
                .await
                .unwrap();
        }

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if let DomainEvent::PromotionCompleted { workspace_id, .. } = event.as_ref() {
                    return workspace_id.clone();
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(completed, "a");
        assert_eq!(store.stats(&a).await.unwrap().considered_through, 2);
    }

    /// Keeps appended records in memory and takes a while to delete them.
    #[derive(Default)]
    struct SlowPurge {
        records: std::sync::Mutex<Vec<EpisodicRecord>>,
    }

    #[async_trait]
    impl MemoryPersistence for SlowPurge {
        fn name(&self) -> &str {
            "slow-purge"
        }
        async fn append_episodic(&self, record: &EpisodicRecord) -> Result<(), MemoryError> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
        async fn evict_episodic(&self, _: &WorkspaceId, _: u64) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn save_semantic(&self, _: &WorkspaceId, _: &[SemanticFact]) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn save_procedural(
            &self,
            _: &WorkspaceId,
            _: &[ProceduralWorkflow],
        ) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn save_promotion_state(
            &self,
            _: &WorkspaceId,
            _: &PromotionState,
        ) -> Result<(), MemoryError> {
            Ok(())
        }
        async fn load(&self, workspace_id: &WorkspaceId) -> Result<PersistedPartition, MemoryError> {
            let episodic = self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| &r.workspace_id == workspace_id)
                .cloned()
                .collect();
            Ok(PersistedPartition {
                episodic,
                ..PersistedPartition::default()
            })
        }
        async fn workspaces(&self) -> Result<Vec<WorkspaceId>, MemoryError> {
            Ok(Vec::new())
        }
        async fn purge(&self, workspace_id: &WorkspaceId) -> Result<(), MemoryError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.records
                .lock()
                .unwrap()
                .retain(|r| &r.workspace_id != workspace_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn reads_during_purge_do_not_resurrect_memory() {
        let store = MemoryStore::new(Arc::new(SlowPurge::default()), manual());
        let a = ws("a");
        for plan in ["p1", "p2", "p3"] {
            store
                .append_episodic(&a, episode("a", plan, ActionKind::Click, Outcome::Success))
                .await
                .unwrap();
        }

        let purging = {
            let store = store.clone();
            let a = a.clone();
            tokio::spawn(async move { store.purge(&a).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let during = store.snapshot(&a).await.unwrap();
        assert!(during.episodic.is_empty());
        purging.await.unwrap().unwrap();

        let after = store.snapshot(&a).await.unwrap();
        assert!(after.episodic.is_empty());
        assert_eq!(after.next_sequence_no, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn eviction_never_loses_acknowledged_appends() {
        let dir = tempfile::tempdir().unwrap();
        let settings = MemorySettings {
            episodic_cap: 5,
            ..manual()
        };
        let store = MemoryStore::new(
            Arc::new(JsonlPersistence::new(dir.path().to_path_buf())),
            settings,
        );
        let a = ws("a");

        for round in 0..50 {
            let writer = {
                let store = store.clone();
                let a = a.clone();
                tokio::spawn(async move {
                    for i in 0..5 {
                        store
                            .append_episodic(
                                &a,
                                episode("a", &format!("r{round}-{i}"), ActionKind::Click, Outcome::Success),
                            )
                            .await
                            .unwrap();
                    }
                })
            };
            store.promote(&a).await.unwrap();
            writer.await.unwrap();
            store.promote(&a).await.unwrap();

            let in_memory: Vec<u64> = store
                .snapshot(&a)
                .await
                .unwrap()
                .episodic
                .iter()
                .map(|r| r.sequence_no)
                .collect();
            let on_disk: Vec<u64> = JsonlPersistence::new(dir.path().to_path_buf())
                .load(&a)
                .await
                .unwrap()
                .episodic
                .iter()
                .map(|r| r.sequence_no)
                .collect();
            assert_eq!(in_memory, on_disk, "round {round}");
        }
    }

    #[tokio::test]
    async fn unsummarized_records_survive_the_cap() {
        let settings = MemorySettings {
            episodic_cap: 3,
            ..manual()
        };
        let a = ws("a");
        let store = MemoryStore::new(Arc::new(NoopPersistence), settings)
            .with_summarizer(Arc::new(FactModel { reply: None }));
        for i in 0..5 {
            store
                .append_episodic(&a, episode("a", &format!("p{i}"), ActionKind::Click, Outcome::Success))
                .await
                .unwrap();
        }

        let report = store.promote(&a).await.unwrap();
        assert!(report.summarization_failed);
        let snapshot = store.snapshot(&a).await.unwrap();
        let seqs: Vec<u64> = snapshot.episodic.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(snapshot.promotion.summarized_through, 0);
        assert_eq!(snapshot.promotion.considered_through, 5);
    }

    #[tokio::test]
    async fn repeated_promotion_leaves_facts_unchanged() {
        let a = ws("a");
        let store = MemoryStore::new(Arc::new(NoopPersistence), manual()).with_summarizer(
            Arc::new(FactModel {
                reply: Some(
                    r#"{"facts":[{"statement":"Checkout needs a saved address","confidence":0.7}]}"#
                        .into(),
                ),
            }),
        );
        for plan in ["p1", "p2"] {
            store
                .append_episodic(&a, episode("a", plan, ActionKind::Click, Outcome::Success))
                .await
                .unwrap();
        }
        let first = store.promote(&a).await.unwrap();
        assert_eq!(first.facts_created, 1);
        let before = store.snapshot(&a).await.unwrap().semantic;

        let second = store.promote(&a).await.unwrap();
        assert_eq!(second.facts_created, 0);
        assert_eq!(second.facts_merged, 0);

        let after = store.snapshot(&a).await.unwrap().semantic;
        assert_eq!(after.len(), before.len());
        assert_eq!(after[0].id, before[0].id);
        assert_eq!(after[0].source_record_ids, before[0].source_record_ids);
        assert_eq!(after[0].confidence, before[0].confidence);
    }
}

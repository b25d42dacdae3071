//! Context items ("pills") and assembled context packs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workspace::WorkspaceId;

/// Which memory tier (or outside source) an item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Procedural,
    Semantic,
    Episodic,
    External,
}

impl Tier {
    pub fn heading(self) -> &'static str {
        match self {
            Self::Procedural => "[Known Workflows]",
            Self::Semantic => "[Known Facts]",
            Self::Episodic => "[Recent Actions]",
            Self::External => "[Additional Context]",
        }
    }
}

/// One unit of context the assembler may include in a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub workspace_id: WorkspaceId,
    pub tier: Tier,
    pub content: String,
    pub token_count: usize,
    /// Intrinsic importance in `[0, 1]` (fact confidence, workflow success
    /// rate, outcome weight, or caller supplied).
    pub priority_score: f32,
    #[serde(default)]
    pub pinned: bool,
    /// Id of the entity the item was built from (fact id, workflow id,
    /// episodic sequence number).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    /// Set when the assembler truncated the content to fit.
    #[serde(default)]
    pub compressed: bool,
    /// Episodic sequence number, used as the first tie breaker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_no: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Why an item did not make it into a pack unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropInfo {
    pub item_id: String,
    pub tier: Tier,
    pub tokens: usize,
    pub reason: String,
}

/// Assembly statistics returned alongside a pack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    pub candidates: usize,
    pub pinned: usize,
    pub compressed: usize,
    pub dropped: Vec<DropInfo>,
    /// Tokens available for items after reserved overhead.
    pub available_tokens: usize,
    pub utilization_pct: f32,
}

/// A budgeted, ordered selection of context items for one prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPack {
    pub workspace_id: WorkspaceId,
    /// Pinned items first, then packed items by descending score.
    pub items: Vec<ContextItem>,
    pub total_tokens: usize,
    /// The workspace's context token budget.
    pub budget: usize,
    pub metadata: AssemblyMetadata,
}

impl ContextPack {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Render as prompt text, one section per tier. Pinned items are
    /// listed ahead of the others within their section.
    pub fn render(&self) -> String {
        let mut sections = Vec::new();
        for tier in [Tier::Procedural, Tier::Semantic, Tier::Episodic, Tier::External] {
            let lines: Vec<String> = self
                .items
                .iter()
                .filter(|i| i.tier == tier)
                .map(|i| {
                    if i.pinned {
                        format!("- (pinned) {}", i.content)
                    } else {
                        format!("- {}", i.content)
                    }
                })
                .collect();
            if !lines.is_empty() {
                sections.push(format!("{}\n{}", tier.heading(), lines.join("\n")));
            }
        }
        sections.join("\n\n")
    }
}

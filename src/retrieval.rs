//! Search ranking over a memory slice

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::embedding::{self, Embedder};
use crate::error::Result;
use crate::memory::MemoryRecord;
use crate::sharing::SharingRuleEngine;
use crate::slice::MemorySliceStore;

/// Why a shadow copy is visible to the searching agent
#[derive(Debug, Clone, Serialize)]
pub struct SharingContext {
    pub source_agent_id: String,
    pub origin_key: Option<String>,
    /// Rule name, or "explicit share request"
    pub reason: String,
}

/// A memory with its relevance score
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f32,
    pub is_shared: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharing_context: Option<SharingContext>,
}

/// Ranked search results
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResults {
    pub memories: Vec<ScoredMemory>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn memory_ids(&self) -> Vec<String> {
        self.memories
            .iter()
            .map(|m| m.record.memory_id.clone())
            .collect()
    }

    /// Format the results for injection into a prompt
    pub fn format_for_prompt(&self) -> String {
        if self.memories.is_empty() {
            return String::new();
        }

        let mut parts = vec!["## Relevant Memories\n".to_string()];
        for memory in &self.memories {
            match &memory.sharing_context {
                Some(ctx) => parts.push(format!(
                    "- [{}] {} (shared by {})\n",
                    memory.record.memory_type, memory.record.content, ctx.source_agent_id
                )),
                None => parts.push(format!(
                    "- [{}] {}\n",
                    memory.record.memory_type, memory.record.content
                )),
            }
        }
        parts.join("")
    }
}

/// Ranks candidate records against a query
pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    max_results: usize,
    min_similarity: f32,
}

impl RetrievalEngine {
    pub fn new(embedder: Arc<dyn Embedder>, max_results: usize, min_similarity: f32) -> Self {
        Self {
            embedder,
            max_results,
            min_similarity,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Score `records` against `query`, best first.
    ///
    /// Records without a cached embedding are embedded in one batch and the
    /// vectors cached on the store.
    pub async fn rank(
        &self,
        query: &str,
        records: Vec<MemoryRecord>,
        store: &MemorySliceStore,
        sharing: &SharingRuleEngine,
    ) -> Result<SearchResults> {
        if records.is_empty() {
            return Ok(SearchResults::default());
        }

        let query_embedding = self.embedder.embed(query).await?;

        let missing: Vec<String> = records
            .iter()
            .filter(|r| r.embedding.is_none())
            .map(|r| r.content.clone())
            .collect();
        let mut fresh = self.embedder.embed_batch(&missing).await?.into_iter();

        let mut memories = Vec::with_capacity(records.len());
        for mut record in records {
            if record.embedding.is_none() {
                if let Some(vector) = fresh.next() {
                    store.cache_embedding(&record.memory_id, vector.clone());
                    record.embedding = Some(vector);
                }
            }

            let score = record
                .embedding
                .as_deref()
                .map(|v| embedding::similarity(&query_embedding, v))
                .unwrap_or(0.0);
            // A zero threshold disables the cutoff
            if self.min_similarity > 0.0 && score < self.min_similarity {
                continue;
            }

            let sharing_context = record
                .source_agent_id
                .as_ref()
                .map(|source| sharing_context(&record, source, sharing));
            memories.push(ScoredMemory {
                is_shared: sharing_context.is_some(),
                sharing_context,
                score,
                record,
            });
        }

        memories.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.record.importance.total_cmp(&a.record.importance))
                .then_with(|| a.record.memory_id.cmp(&b.record.memory_id))
        });
        memories.truncate(self.max_results);

        Ok(SearchResults { memories })
    }
}

fn sharing_context(shadow: &MemoryRecord, source: &str, sharing: &SharingRuleEngine) -> SharingContext {
    // Evaluate the rules from the source's point of view
    let mut as_origin = shadow.clone();
    as_origin.owner_agent_id = source.to_string();
    as_origin.source_agent_id = None;

    let reason = sharing
        .explain(&as_origin, &BTreeSet::new())
        .remove(&shadow.owner_agent_id)
        .unwrap_or_else(|| "explicit share request".to_string());

    SharingContext {
        source_agent_id: source.to_string(),
        origin_key: shadow.origin_key.as_ref().map(|k| k.to_string()),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::embedding::HashingEmbedder;
    use crate::lock::LockManager;
    use crate::sharing::SharingRule;
    use crate::storage::{InMemoryKv, KvStore};

    #[tokio::test]
    async fn ranks_by_similarity_and_explains_shares() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let locks = Arc::new(LockManager::new(Duration::from_secs(60), Duration::from_secs(1)));
        let store = MemorySliceStore::open(kv, locks).unwrap();
        let sharing = SharingRuleEngine::new(vec![SharingRule::global_allow(
            "user-preferences",
            "preference",
            ["alice"],
        )])
        .unwrap();

        let origin = store
            .insert(MemoryRecord::new("alden", "u1", "prefers dark mode").with_category("preference"))
            .unwrap();
        let shadow = store.insert_shadow(origin.shadow_for("alice")).unwrap();
        let own = store
            .insert(MemoryRecord::new("alice", "u1", "quarterly tax filing"))
            .unwrap();

        let engine = RetrievalEngine::new(Arc::new(HashingEmbedder::new(1024)), 10, 0.0);
        let results = engine
            .rank(
                "dark mode",
                vec![own.clone(), shadow.clone()],
                &store,
                &sharing,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results.memories[0].record.memory_id, shadow.memory_id);
        let ctx = results.memories[0].sharing_context.as_ref().unwrap();
        assert_eq!(ctx.source_agent_id, "alden");
        assert_eq!(ctx.reason, "user-preferences");
        assert!(!results.memories[1].is_shared);
        assert!(results.format_for_prompt().contains("(shared by alden)"));
        assert!(store.get(&own.memory_id).is_ok());
    }

    #[tokio::test]
    async fn threshold_and_limit_apply() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let locks = Arc::new(LockManager::new(Duration::from_secs(60), Duration::from_secs(1)));
        let store = MemorySliceStore::open(kv, locks).unwrap();
        let sharing = SharingRuleEngine::new(Vec::new()).unwrap();

        let records: Vec<MemoryRecord> = (0..5)
            .map(|i| {
                store
                    .insert(MemoryRecord::new("alden", "u1", format!("coffee order {}", i)))
                    .unwrap()
            })
            .collect();

        let engine = RetrievalEngine::new(Arc::new(HashingEmbedder::new(128)), 3, 0.1);
        let results = engine.rank("coffee", records, &store, &sharing).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.memories.iter().all(|m| m.score >= 0.1));

        let none = engine
            .rank("coffee", Vec::new(), &store, &sharing)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}

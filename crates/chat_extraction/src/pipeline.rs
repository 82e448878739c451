//! The memory extraction pipeline: reads a user's unextracted messages, derives discrete
//! facts, reconciles them against existing memories via an LLM, and applies the resulting
//! mutations transactionally.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use chat_core::llm::LlmGatewayError;
use chat_core::store::{ExtractionTxStats, MemoryAction, StoreError};
use chat_core::{LlmGateway, Memory, Message, Store};

use crate::parsing::{self, ActionEvent, RawAction};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmGatewayError),
}

/// Tunables for one pipeline run, mirroring the `MEMORY_EXTRACTION_*` environment
/// variables.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Retrieval threshold; converted internally to `d_max = 1 - threshold`.
    pub threshold: f32,
    pub top_k: i64,
    pub max_retries: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig {
            threshold: 0.7,
            top_k: 5,
            max_retries: 3,
        }
    }
}

pub struct ExtractionPipeline {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmGateway>,
    config: ExtractionConfig,
}

/// One candidate in the reconciliation pool shown to the LLM, addressed by a short temp id
/// rather than its real database id.
struct Candidate {
    temp_id: String,
    real_id: i64,
    text: String,
}

impl ExtractionPipeline {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmGateway>, config: ExtractionConfig) -> Self {
        ExtractionPipeline { store, llm, config }
    }

    pub async fn run(&self, user_id: &str) -> Result<ExtractionTxStats, ExtractionError> {
        // Stage 1: snapshot pending messages.
        let pending = self.store.list_pending_messages(user_id).await?;
        if pending.is_empty() {
            return Ok(ExtractionTxStats::default());
        }

        let snapshot_ids: Vec<i64> = pending.iter().map(|m| m.id).collect();

        // Stage 2: fact extraction.
        let facts = self.extract_facts(&pending).await?;
        if facts.is_empty() {
            self.store
                .mark_messages_extracted(&snapshot_ids, OffsetDateTime::now_utc())
                .await?;
            return Ok(ExtractionTxStats::default());
        }

        // Stage 3: embed facts.
        let fact_embeddings = self.llm.embed(&facts).await?;
        let fact_to_embedding: HashMap<&str, &Vec<f32>> = facts
            .iter()
            .map(|f| f.as_str())
            .zip(fact_embeddings.iter())
            .collect();

        // Stage 4: find nearby memories, unioned by real memory id.
        let d_max = 1.0 - self.config.threshold;
        let mut pool: HashMap<i64, Memory> = HashMap::new();
        for embedding in &fact_embeddings {
            let nearby = self
                .store
                .find_nearby_memories(user_id, embedding, d_max, self.config.top_k)
                .await?;
            for entry in nearby {
                pool.entry(entry.memory.id).or_insert(entry.memory);
            }
        }

        // Stage 5: assign temp ids.
        let mut candidates: Vec<Candidate> = pool
            .into_iter()
            .enumerate()
            .map(|(i, (real_id, memory))| Candidate {
                temp_id: i.to_string(),
                real_id,
                text: memory.content,
            })
            .collect();
        let mut temp_to_real: HashMap<String, i64> = candidates
            .iter()
            .map(|c| (c.temp_id.clone(), c.real_id))
            .collect();

        // Stage 6/7: ask for actions, repairing and retrying on unresolved references.
        let mut actions = self.reconcile(&candidates, &facts).await?;
        for _ in 0..self.config.max_retries {
            let unresolved = repair_actions(&mut actions, &temp_to_real);
            if unresolved == 0 {
                break;
            }
            actions = self.reconcile(&candidates, &facts).await?;
        }
        repair_actions(&mut actions, &temp_to_real);

        // Stage 8: backfill facts that didn't make it into any final memory text.
        let mut next_temp_id = candidates.len();
        backfill_missing_adds(&facts, &actions, &candidates, &mut next_temp_id)
            .into_iter()
            .for_each(|action| actions.push(action));

        // Stage 9: apply transactionally.
        let mut store_actions = Vec::new();
        for action in actions {
            match action.event {
                ActionEvent::None => continue,
                ActionEvent::Delete => {
                    if let Some(&real_id) = temp_to_real.get(&action.id) {
                        store_actions.push(MemoryAction::Delete { id: real_id });
                    } else {
                        warn!(temp_id = %action.id, "dropping delete action with unknown id");
                    }
                }
                ActionEvent::Update => {
                    if let Some(&real_id) = temp_to_real.get(&action.id) {
                        let embedding = resolve_embedding(&action.text, &fact_to_embedding);
                        let embedding = match embedding {
                            Some(v) => v,
                            None => self.llm.embed(&[action.text.clone()]).await?.remove(0),
                        };
                        store_actions.push(MemoryAction::Update {
                            id: real_id,
                            content: action.text,
                            embedding,
                        });
                    } else {
                        warn!(temp_id = %action.id, "dropping update action with unknown id");
                    }
                }
                ActionEvent::Add => {
                    let embedding = match resolve_embedding(&action.text, &fact_to_embedding) {
                        Some(v) => v,
                        None => self.llm.embed(&[action.text.clone()]).await?.remove(0),
                    };
                    store_actions.push(MemoryAction::Add {
                        content: action.text,
                        embedding,
                    });
                }
            }
        }

        let stats = self
            .store
            .apply_memory_actions(user_id, store_actions)
            .await?;

        // Stage 10: mark messages extracted only after the memory transaction commits.
        self.store
            .mark_messages_extracted(&snapshot_ids, OffsetDateTime::now_utc())
            .await?;

        info!(
            user_id,
            added = stats.added,
            updated = stats.updated,
            deleted = stats.deleted,
            "extraction run completed"
        );

        Ok(stats)
    }

    async fn extract_facts(&self, pending: &[Message]) -> Result<Vec<String>, ExtractionError> {
        let transcript = pending
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Extract discrete, atomic facts about the user from the following conversation.\n\
             Output either a JSON object {{\"facts\": [\"...\"]}} or one `FACT: <fact>` line per \
             fact. If there are no durable facts, output the single word NONE.\n\n{transcript}"
        );

        let response = self.llm.generate_structured(&prompt).await?;
        Ok(parsing::parse_facts(&response))
    }

    async fn reconcile(
        &self,
        candidates: &[Candidate],
        facts: &[String],
    ) -> Result<Vec<RawAction>, ExtractionError> {
        let existing = candidates
            .iter()
            .map(|c| format!("{{\"id\": \"{}\", \"text\": {:?}}}", c.temp_id, c.text))
            .collect::<Vec<_>>()
            .join(", ");
        let facts_json = facts
            .iter()
            .map(|f| format!("{f:?}"))
            .collect::<Vec<_>>()
            .join(", ");

        let prompt = format!(
            "Existing memories: [{existing}]\nNew facts: [{facts_json}]\n\n\
             For each new fact, decide one action: ADD a new memory, UPDATE an existing one \
             (by id), DELETE an existing one made obsolete by this fact, or NONE if the fact is \
             already captured. Respond with JSON {{\"memory\": [{{\"id\": \"...\", \"text\": \
             \"...\", \"event\": \"ADD|UPDATE|DELETE|NONE\", \"old_memory\": \"...\"}}]}} or the \
             pipe-delimited form `EVENT|ID|TEXT|OLD_MEMORY`."
        );

        let response = self.llm.generate_structured(&prompt).await?;
        Ok(parsing::parse_actions(&response))
    }
}

fn resolve_embedding(text: &str, fact_to_embedding: &HashMap<&str, &Vec<f32>>) -> Option<Vec<f32>> {
    fact_to_embedding.get(text).map(|v| (*v).clone())
}

/// Reattaches UPDATE/DELETE actions whose temp id isn't known, by matching a NONE action's
/// text against the invalid action's `old_memory`. Returns the number of actions still
/// unresolved after repair.
fn repair_actions(actions: &mut Vec<RawAction>, temp_to_real: &HashMap<String, i64>) -> usize {
    let mut repaired = Vec::new();
    let mut remaining: Vec<RawAction> = Vec::new();

    for action in actions.drain(..) {
        let needs_real_id = matches!(action.event, ActionEvent::Update | ActionEvent::Delete);
        if !needs_real_id || temp_to_real.contains_key(&action.id) {
            remaining.push(action);
            continue;
        }

        if let Some(pos) = remaining.iter().position(|a| {
            a.event == ActionEvent::None && Some(a.text.as_str()) == action.old_memory.as_deref()
        }) {
            let none_action = remaining.remove(pos);
            repaired.push(RawAction {
                id: none_action.id,
                text: if action.event == ActionEvent::Update {
                    action.text
                } else {
                    none_action.text
                },
                event: action.event,
                old_memory: action.old_memory,
            });
        }
        // Unrepairable actions are simply dropped; they count toward the unresolved total
        // via the post-repair scan below.
    }

    remaining.extend(repaired);
    let unresolved = remaining
        .iter()
        .filter(|a| {
            matches!(a.event, ActionEvent::Update | ActionEvent::Delete)
                && !temp_to_real.contains_key(&a.id)
        })
        .count();

    *actions = remaining;
    unresolved
}

/// Simulates the reconciled actions to compute each candidate's final text, then adds a
/// fresh `ADD` action for any fact whose normalized form doesn't appear in (or contain) any
/// final text.
fn backfill_missing_adds(
    facts: &[String],
    actions: &[RawAction],
    candidates: &[Candidate],
    next_temp_id: &mut usize,
) -> Vec<RawAction> {
    let mut final_texts: HashMap<String, String> = candidates
        .iter()
        .map(|c| (c.temp_id.clone(), c.text.clone()))
        .collect();

    for action in actions {
        match action.event {
            ActionEvent::Update => {
                final_texts.insert(action.id.clone(), action.text.clone());
            }
            ActionEvent::Delete => {
                final_texts.remove(&action.id);
            }
            ActionEvent::Add => {
                final_texts.insert(action.id.clone(), action.text.clone());
            }
            ActionEvent::None => {}
        }
    }

    let normalized_texts: Vec<String> = final_texts.values().map(|t| parsing::normalize(t)).collect();

    let mut backfilled = Vec::new();
    for fact in facts {
        let normalized_fact = parsing::normalize(fact);
        let covered = normalized_texts
            .iter()
            .any(|t| t.contains(&normalized_fact) || normalized_fact.contains(t.as_str()));

        if !covered {
            backfilled.push(RawAction {
                id: next_temp_id.to_string(),
                text: fact.clone(),
                event: ActionEvent::Add,
                old_memory: None,
            });
            *next_temp_id += 1;
        }
    }

    backfilled
}

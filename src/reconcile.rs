//! LLM-mediated fact reconciliation.
//!
//! Each candidate fact is embedded, its nearest stored neighbours are
//! fetched, and the completion model picks exactly one of four registered
//! tools: `ADD`, `UPDATE`, `DELETE`, or `NONE`. Neighbours are presented
//! under short temp-ids ("0", "1", ...) so real store ids never reach the
//! model; the temp-id table lives only for the duration of one decision.
//!
//! The engine always makes forward progress: model silence, an unknown tool
//! name, unparseable arguments, or a reference to a temp-id that was never
//! presented all degrade to adding the candidate as a new fact. A
//! well-formed `UPDATE`/`DELETE`/`NONE` referencing a known temp-id is
//! executed as-is.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::error::MemoryError;
use crate::fact::{KIND_FACT, META_KIND, META_SUBJECT, MemoryFact};
use crate::providers::{Completer, Completion, Embedder, ToolCall, ToolSpec};
use crate::store::{DocumentFilter, VectorStore};

pub(crate) const RECONCILE_SYSTEM_PROMPT: &str = "\
You maintain a long-term memory store of facts about a user.

You are given one candidate fact and a numbered table of existing memories \
that are semantically close to it. Decide what the candidate means for the \
store by calling exactly one tool:

- ADD: the candidate is new information not covered by any listed memory.
- UPDATE: the candidate supersedes or refines one listed memory. Pass that \
memory's id and the full updated sentence.
- DELETE: the candidate invalidates one listed memory outright.
- NONE: the candidate adds nothing (duplicate or already covered).

Rules:
1. Call exactly one tool. Never answer in prose.
2. Only reference ids that appear in the memory table.
3. For UPDATE, the updated sentence must be standalone and complete.";

/// Decoded reconciliation decision, keyed by tool name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolDecision {
    Add {
        reason: Option<String>,
    },
    Update {
        id: String,
        updated_content: String,
        reason: Option<String>,
    },
    Delete {
        id: String,
        reason: Option<String>,
    },
    None {
        reason: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct AddArgs {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateArgs {
    id: String,
    updated_content: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteArgs {
    id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NoneArgs {
    #[serde(default)]
    reason: Option<String>,
}

/// Decodes a raw tool call into a [`ToolDecision`].
///
/// # Errors
///
/// [`MemoryError::MalformedModelOutput`] for unknown tool names or argument
/// payloads that do not match the tool's schema.
pub(crate) fn decode_tool_call(call: &ToolCall) -> Result<ToolDecision, MemoryError> {
    let arguments = if call.arguments.trim().is_empty() {
        "{}"
    } else {
        call.arguments.as_str()
    };
    let malformed = |err: serde_json::Error| {
        MemoryError::malformed(format!("bad arguments for tool {}: {err}", call.name))
    };
    match call.name.as_str() {
        "ADD" => {
            let args: AddArgs = serde_json::from_str(arguments).map_err(malformed)?;
            Ok(ToolDecision::Add { reason: args.reason })
        }
        "UPDATE" => {
            let args: UpdateArgs = serde_json::from_str(arguments).map_err(malformed)?;
            Ok(ToolDecision::Update {
                id: args.id,
                updated_content: args.updated_content,
                reason: args.reason,
            })
        }
        "DELETE" => {
            let args: DeleteArgs = serde_json::from_str(arguments).map_err(malformed)?;
            Ok(ToolDecision::Delete {
                id: args.id,
                reason: args.reason,
            })
        }
        "NONE" => {
            let args: NoneArgs = serde_json::from_str(arguments).map_err(malformed)?;
            Ok(ToolDecision::None { reason: args.reason })
        }
        other => Err(MemoryError::malformed(format!("unknown tool {other:?}"))),
    }
}

fn tool_specs() -> Vec<ToolSpec> {
    let reason = json!({"type": "string", "description": "Short justification."});
    vec![
        ToolSpec::new(
            "ADD",
            "Store the candidate as a new memory.",
            json!({
                "type": "object",
                "properties": {"reason": reason},
                "required": []
            }),
        ),
        ToolSpec::new(
            "UPDATE",
            "Replace one existing memory with an updated sentence.",
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string", "description": "Id from the memory table."},
                    "updated_content": {"type": "string", "description": "Full replacement sentence."},
                    "reason": reason
                },
                "required": ["id", "updated_content"]
            }),
        ),
        ToolSpec::new(
            "DELETE",
            "Remove one existing memory the candidate invalidates.",
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string", "description": "Id from the memory table."},
                    "reason": reason
                },
                "required": ["id"]
            }),
        ),
        ToolSpec::new(
            "NONE",
            "Make no change to the store.",
            json!({
                "type": "object",
                "properties": {"reason": reason},
                "required": []
            }),
        ),
    ]
}

/// Result of reconciling one candidate fact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The candidate was stored under a new id.
    Added { id: String },
    /// An existing fact was rewritten in place.
    Updated { id: String },
    /// An existing fact was removed.
    Deleted { id: String },
    /// No store change.
    Unchanged,
}

/// Reconciles candidate facts against the store.
pub struct Reconciler {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    completer: Arc<dyn Completer>,
    neighbour_k: usize,
    filter_by_subject: bool,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        completer: Arc<dyn Completer>,
        neighbour_k: usize,
        filter_by_subject: bool,
    ) -> Self {
        Self {
            store,
            embedder,
            completer,
            neighbour_k: neighbour_k.max(1),
            filter_by_subject,
        }
    }

    /// Runs one reconciliation decision for `candidate`.
    pub async fn reconcile(&self, candidate: &MemoryFact) -> Result<ReconcileOutcome, MemoryError> {
        let vector = self.embedder.embed(&candidate.content).await?;

        let mut filter = DocumentFilter::new().with_metadata(META_KIND, KIND_FACT);
        if self.filter_by_subject {
            filter = filter.with_metadata(META_SUBJECT, candidate.subject.as_str());
        }
        let neighbours = self
            .store
            .query_by_vector(&vector, self.neighbour_k, Some(&filter))
            .await?;

        // Temp-id table: index in neighbour order is the id the model sees.
        let real_ids: Vec<String> = neighbours
            .iter()
            .map(|n| n.document.id.clone())
            .collect();
        let table: Vec<serde_json::Value> = neighbours
            .iter()
            .enumerate()
            .map(|(i, n)| json!({"id": i.to_string(), "text": n.document.content}))
            .collect();

        let user_prompt = format!(
            "Candidate fact:\n{candidate}\n\nMemory table:\n{table}",
            candidate = candidate.content,
            table = serde_json::to_string_pretty(&table)?,
        );

        let completion = self
            .completer
            .complete(RECONCILE_SYSTEM_PROMPT, &user_prompt, &tool_specs())
            .await;

        let decision = match completion {
            Ok(completion) => self.choose_decision(candidate, completion),
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, fact = %candidate.content, "completer failed, defaulting to ADD");
                ToolDecision::Add { reason: None }
            }
        };

        self.apply(candidate, vector, &real_ids, decision).await
    }

    /// Maps a completion onto a decision, degrading malformed output to the
    /// default ADD.
    fn choose_decision(&self, candidate: &MemoryFact, completion: Completion) -> ToolDecision {
        let Some(call) = completion.tool_calls.first() else {
            tracing::debug!(fact = %candidate.content, "no tool call returned, defaulting to ADD");
            return ToolDecision::Add { reason: None };
        };
        if completion.tool_calls.len() > 1 {
            tracing::warn!(
                calls = completion.tool_calls.len(),
                "model returned multiple tool calls, using the first"
            );
        }
        match decode_tool_call(call) {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(error = %err, fact = %candidate.content, "malformed tool call, defaulting to ADD");
                ToolDecision::Add { reason: None }
            }
        }
    }

    async fn apply(
        &self,
        candidate: &MemoryFact,
        vector: Vec<f32>,
        real_ids: &[String],
        decision: ToolDecision,
    ) -> Result<ReconcileOutcome, MemoryError> {
        match decision {
            ToolDecision::Add { .. } => self.add_candidate(candidate, vector).await,
            ToolDecision::Update {
                id,
                updated_content,
                reason,
            } => {
                let Some(real_id) = resolve_temp_id(&id, real_ids) else {
                    tracing::warn!(temp_id = %id, "UPDATE references unknown temp-id, adding candidate instead");
                    return self.add_candidate(candidate, vector).await;
                };
                let updated_vector = self.embedder.embed(&updated_content).await?;
                match self
                    .store
                    .update(&real_id, updated_content, updated_vector, None)
                    .await
                {
                    Ok(()) => {
                        tracing::debug!(id = %real_id, reason = ?reason, "fact updated");
                        Ok(ReconcileOutcome::Updated { id: real_id })
                    }
                    Err(MemoryError::NotFound { .. }) => {
                        // The neighbour vanished between the query and the
                        // write; keep the candidate instead of losing it.
                        tracing::warn!(id = %real_id, "update target disappeared, adding candidate");
                        self.add_candidate(candidate, vector).await
                    }
                    Err(err) => Err(err),
                }
            }
            ToolDecision::Delete { id, reason } => {
                let Some(real_id) = resolve_temp_id(&id, real_ids) else {
                    tracing::warn!(temp_id = %id, "DELETE references unknown temp-id, adding candidate instead");
                    return self.add_candidate(candidate, vector).await;
                };
                self.store.delete(&real_id).await?;
                tracing::debug!(id = %real_id, reason = ?reason, "fact deleted");
                Ok(ReconcileOutcome::Deleted { id: real_id })
            }
            ToolDecision::None { reason } => {
                tracing::debug!(fact = %candidate.content, reason = ?reason, "no-op decision");
                Ok(ReconcileOutcome::Unchanged)
            }
        }
    }

    async fn add_candidate(
        &self,
        candidate: &MemoryFact,
        vector: Vec<f32>,
    ) -> Result<ReconcileOutcome, MemoryError> {
        let mut stored = candidate.to_stored();
        stored.vector = vector;
        let report = self.store.upsert(vec![stored], None).await?;
        let id = report
            .statuses
            .first()
            .map(|s| s.id.clone())
            .unwrap_or_default();
        tracing::debug!(id = %id, fact = %candidate.content, "fact added");
        Ok(ReconcileOutcome::Added { id })
    }
}

/// Resolves a temp-id back to the real store id it masked, if it was
/// actually presented to the model.
fn resolve_temp_id(temp_id: &str, real_ids: &[String]) -> Option<String> {
    temp_id
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|index| real_ids.get(index))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::{MockEmbedder, ScriptedCompleter};
    use crate::store::memory::MemoryVectorStore;

    const DIM: usize = 32;

    fn candidate(content: &str) -> MemoryFact {
        MemoryFact::candidate(content, "primaryUser", "doc-1", "misc")
    }

    struct Fixture {
        store: Arc<MemoryVectorStore>,
        embedder: Arc<MockEmbedder>,
        completer: Arc<ScriptedCompleter>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryVectorStore::new(DIM));
        let embedder = Arc::new(MockEmbedder::new(DIM));
        let completer = Arc::new(ScriptedCompleter::new());
        let reconciler = Reconciler::new(
            store.clone(),
            embedder.clone(),
            completer.clone(),
            5,
            true,
        );
        Fixture {
            store,
            embedder,
            completer,
            reconciler,
        }
    }

    async fn seed(fixture: &Fixture, content: &str) -> String {
        let vector = fixture.embedder.embed(content).await.unwrap();
        let stored = candidate(content).with_embedding(vector).to_stored();
        let report = fixture.store.upsert(vec![stored], None).await.unwrap();
        report.statuses[0].id.clone()
    }

    #[tokio::test]
    async fn silence_defaults_to_add() {
        let fixture = fixture();
        let outcome = fixture
            .reconciler
            .reconcile(&candidate("primaryUser lives in Berlin."))
            .await
            .unwrap();
        let ReconcileOutcome::Added { id } = outcome else {
            panic!("expected Added, got {outcome:?}");
        };
        let stored = fixture.store.get(&id).await.unwrap();
        assert_eq!(stored.content, "primaryUser lives in Berlin.");
        assert_eq!(stored.vector.len(), DIM);
    }

    #[tokio::test]
    async fn update_rewrites_in_place() {
        let fixture = fixture();
        let seeded = seed(&fixture, "primaryUser works as a Software Engineer").await;

        fixture.completer.push(Completion::tool(ToolCall::new(
            "UPDATE",
            r#"{"id": "0", "updated_content": "primaryUser works as a Senior Software Engineer", "reason": "promotion"}"#,
        )));
        let outcome = fixture
            .reconciler
            .reconcile(&candidate("primaryUser is now a Senior Software Engineer"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated { id: seeded.clone() });

        let stored = fixture.store.get(&seeded).await.unwrap();
        assert_eq!(
            stored.content,
            "primaryUser works as a Senior Software Engineer"
        );
        assert_eq!(fixture.store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_removes_target() {
        let fixture = fixture();
        let seeded = seed(&fixture, "primaryUser lives in Munich").await;

        fixture.completer.push(Completion::tool(ToolCall::new(
            "DELETE",
            r#"{"id": "0", "reason": "moved away"}"#,
        )));
        let outcome = fixture
            .reconciler
            .reconcile(&candidate("primaryUser no longer lives in Munich"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Deleted { id: seeded.clone() });
        assert!(matches!(
            fixture.store.get(&seeded).await,
            Err(MemoryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn none_makes_no_change() {
        let fixture = fixture();
        seed(&fixture, "primaryUser likes jazz").await;

        fixture.completer.push(Completion::tool(ToolCall::new(
            "NONE",
            r#"{"reason": "duplicate"}"#,
        )));
        let outcome = fixture
            .reconciler
            .reconcile(&candidate("primaryUser still likes jazz"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert_eq!(fixture.store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_temp_id_adds_instead_of_mutating() {
        let fixture = fixture();
        let seeded = seed(&fixture, "primaryUser likes jazz").await;

        fixture.completer.push(Completion::tool(ToolCall::new(
            "UPDATE",
            r#"{"id": "42", "updated_content": "primaryUser likes metal"}"#,
        )));
        let outcome = fixture
            .reconciler
            .reconcile(&candidate("primaryUser likes blues"))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Added { .. }));

        // The seeded fact is untouched and the candidate was stored.
        let stored = fixture.store.get(&seeded).await.unwrap();
        assert_eq!(stored.content, "primaryUser likes jazz");
        assert_eq!(fixture.store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_tool_name_defaults_to_add() {
        let fixture = fixture();
        fixture
            .completer
            .push(Completion::tool(ToolCall::new("MERGE", "{}")));
        let outcome = fixture
            .reconciler
            .reconcile(&candidate("primaryUser has a dog."))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Added { .. }));
    }

    #[tokio::test]
    async fn prose_answer_defaults_to_add() {
        let fixture = fixture();
        fixture
            .completer
            .push(Completion::text("I think this should be added."));
        let outcome = fixture
            .reconciler
            .reconcile(&candidate("primaryUser has a cat."))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Added { .. }));
    }

    #[tokio::test]
    async fn neighbours_are_masked_behind_temp_ids() {
        let fixture = fixture();
        let seeded = seed(&fixture, "primaryUser likes jazz").await;

        fixture
            .completer
            .push(Completion::tool(ToolCall::new("NONE", "{}")));
        fixture
            .reconciler
            .reconcile(&candidate("primaryUser likes jazz a lot"))
            .await
            .unwrap();

        let prompts = fixture.completer.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(!prompts[0].user.contains(&seeded), "real ids must not leak");
        assert!(prompts[0].user.contains("\"id\": \"0\""));
        assert_eq!(prompts[0].tool_names, vec!["ADD", "UPDATE", "DELETE", "NONE"]);
    }

    #[tokio::test]
    async fn subject_filter_restricts_neighbours() {
        let fixture = fixture();
        // A fact about someone else with near-identical vocabulary.
        let vector = fixture
            .embedder
            .embed("likes jazz music every evening")
            .await
            .unwrap();
        let other = MemoryFact::candidate(
            "likes jazz music every evening",
            "bob@example.com",
            "doc-2",
            "misc",
        )
        .with_embedding(vector)
        .to_stored();
        fixture.store.upsert(vec![other], None).await.unwrap();

        fixture
            .completer
            .push(Completion::tool(ToolCall::new("NONE", "{}")));
        fixture
            .reconciler
            .reconcile(&candidate("likes jazz music every evening"))
            .await
            .unwrap();

        let prompts = fixture.completer.prompts();
        assert!(
            prompts[0].user.contains("Memory table:\n[]"),
            "bob's fact must not appear as a neighbour for primaryUser"
        );
    }

    #[test]
    fn decode_rejects_missing_required_fields() {
        let result = decode_tool_call(&ToolCall::new("UPDATE", r#"{"id": "0"}"#));
        assert!(matches!(
            result,
            Err(MemoryError::MalformedModelOutput { .. })
        ));
    }

    #[test]
    fn decode_accepts_empty_arguments() {
        let decision = decode_tool_call(&ToolCall::new("ADD", "")).unwrap();
        assert_eq!(decision, ToolDecision::Add { reason: None });
    }
}

//! LLM-driven fact extraction.
//!
//! One extraction call covers one normalised document and one speaker. The
//! model is asked for a JSON array of standalone fact sentences; a
//! newline-separated list is accepted as a fallback, anything else fails
//! with [`MemoryError::MalformedModelOutput`] and no facts are emitted.
//! Prompts are byte-stable for identical documents: the conversation JSON is
//! rendered with sorted keys and the date strings are passed verbatim.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::document::Document;
use crate::error::MemoryError;
use crate::providers::Completer;

pub(crate) const EXTRACTION_SYSTEM_PROMPT: &str = "\
You extract long-term memory facts from a document for a specific speaker.

Rules:
1. State each fact as one standalone sentence about \"primaryUser\" or a \
named third party. The sentence must be understandable with no other context.
2. Only extract durable facts: preferences, personal info, relationships, \
habits, plans, and significant events. Ignore transient states.
3. Exclude conversational filler, greetings, pleasantries, and opinions \
about the assistant itself.
4. Resolve relative time expressions (\"yesterday\", \"next week\") against \
the dates provided in the dates block.
5. Respond with a JSON array of strings, one fact per entry. Respond with \
[] when the document contains no durable facts.";

/// Extracts atomic fact sentences from documents.
pub struct FactExtractor {
    completer: Arc<dyn Completer>,
}

impl FactExtractor {
    pub fn new(completer: Arc<dyn Completer>) -> Self {
        Self { completer }
    }

    /// Runs one extraction for `speaker` over the document's normalised
    /// content.
    ///
    /// Returns the ordered, case-insensitively deduplicated fact list.
    ///
    /// # Errors
    ///
    /// [`MemoryError::MalformedModelOutput`] when the response is neither a
    /// JSON string array nor a newline-separated list; provider errors are
    /// passed through.
    pub async fn extract(
        &self,
        document: &Document,
        speaker: &str,
    ) -> Result<Vec<String>, MemoryError> {
        let user_prompt = build_user_prompt(document, speaker);
        let completion = self
            .completer
            .complete(EXTRACTION_SYSTEM_PROMPT, &user_prompt, &[])
            .await?;

        let content = completion
            .content
            .ok_or_else(|| MemoryError::malformed("extraction returned no content"))?;
        let facts = parse_facts(&content)?;
        let facts = dedup_case_insensitive(facts);

        tracing::debug!(
            document_id = %document.id(),
            speaker = %speaker,
            facts = facts.len(),
            "fact extraction complete"
        );
        Ok(facts)
    }
}

fn build_user_prompt(document: &Document, speaker: &str) -> String {
    let dates = document.date_strings();
    let dates_block = if dates.is_empty() {
        "No dates available.".to_string()
    } else {
        dates.join("\n")
    };
    format!(
        "Extract facts stated by or about the speaker {speaker:?}.\n\n\
         == Document ({source}) ==\n{content}\n\n\
         == Dates ==\n{dates_block}",
        source = document.source(),
        content = document.extraction_content(),
    )
}

/// Parses model output as a JSON string array, or as a newline-separated
/// list with common bullet prefixes stripped.
fn parse_facts(content: &str) -> Result<Vec<String>, MemoryError> {
    let trimmed = strip_code_fence(content.trim());
    if trimmed.is_empty() {
        return Err(MemoryError::malformed("extraction returned empty output"));
    }

    if trimmed.starts_with('[') {
        let facts: Vec<String> = serde_json::from_str(trimmed).map_err(|err| {
            MemoryError::malformed(format!("extraction output is not a string array: {err}"))
        })?;
        return Ok(facts
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect());
    }
    if trimmed.starts_with('{') {
        return Err(MemoryError::malformed(
            "extraction output is a JSON object, expected an array of strings",
        ));
    }

    Ok(trimmed
        .lines()
        .map(strip_bullet)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn strip_code_fence(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("```") else {
        return content;
    };
    // Drop the info string ("json") up to the first newline, and the
    // closing fence.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn strip_bullet(line: &str) -> &str {
    let line = line.trim();
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .unwrap_or(line);
    // "1. fact" / "12) fact"
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.trim();
        }
    }
    line
}

/// Removes duplicate facts, comparing case-insensitively and keeping the
/// first occurrence's casing and position.
fn dedup_case_insensitive(facts: Vec<String>) -> Vec<String> {
    let mut seen = FxHashSet::default();
    facts
        .into_iter()
        .filter(|fact| seen.insert(fact.to_lowercase()))
        .collect()
}

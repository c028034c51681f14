//! Canonical document model.
//!
//! Parsers for concrete sources (mbox, Slack exports, chat histories, ...)
//! are external collaborators; they all emit the two canonical shapes in
//! this module. [`TextDocument`] carries free-form text, while
//! [`ConversationDocument`] carries an ordered transcript with a known
//! primary user.
//!
//! The construction invariants are enforced here, once, so the rest of the
//! pipeline can rely on them:
//!
//! - `user` is non-empty, is never the literal `"primaryUser"` token, and is
//!   listed in `people`;
//! - `people` is non-empty;
//! - every message speaker is listed in `people` (unknown speakers are
//!   rewritten to the `"unknown"` sentinel, which is then added to
//!   `people`).
//!
//! [`ConversationDocument::normalised_content`] is the only representation
//! ever shown to the LLM: every occurrence of the raw `user` identifier is
//! rewritten to the literal `"primaryUser"`, so raw handles, emails, and
//! phone numbers never leak into prompts.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::chunking::content_hash;
use crate::error::MemoryError;

/// The literal token the LLM sees in place of the raw primary-user
/// identifier.
pub const PRIMARY_USER: &str = "primaryUser";

/// Sentinel speaker for message authors that are not listed as
/// participants.
pub const UNKNOWN_SPEAKER: &str = "unknown";

/// One message within a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub speaker: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            content: content.into(),
            time: None,
        }
    }

    /// Attaches a timestamp to this message.
    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }
}

/// A free-form text artifact (email body, note, exported post).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextDocument {
    /// Stable identifier. Derived as a hash of source+content when the
    /// caller does not supply one, so re-ingesting the same artifact yields
    /// the same id.
    pub id: String,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Source tag, e.g. `"gmail"`, `"chatgpt"`, `"misc"`.
    pub source: String,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
}

impl TextDocument {
    /// Creates a text document with a derived id.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidDocument`] when `content` is blank.
    pub fn new(source: impl Into<String>, content: impl Into<String>) -> Result<Self, MemoryError> {
        let source = source.into();
        let content = content.into();
        if content.trim().is_empty() {
            return Err(MemoryError::invalid_document("text content is empty"));
        }
        let id = content_hash(&[&source, &content]);
        Ok(Self {
            id,
            content,
            timestamp: None,
            source,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
        })
    }

    /// Overrides the derived id with a caller-supplied one.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A conversation transcript with a known primary user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationDocument {
    pub id: String,
    pub source: String,
    /// Identifier of the primary user within this conversation (email,
    /// handle, phone number). Never the literal `"primaryUser"` token.
    pub user: String,
    /// Ordered list of participant identifiers. Always contains `user`.
    pub people: Vec<String>,
    /// Messages in canonical order.
    pub conversation: Vec<Message>,
    pub timestamp: Option<DateTime<Utc>>,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ConversationDocument {
    /// Starts building a conversation document. The primary user is added
    /// to the participant list automatically.
    pub fn builder(source: impl Into<String>, user: impl Into<String>) -> ConversationBuilder {
        ConversationBuilder::new(source, user)
    }

    /// Creates a conversation document from explicit parts, treating the
    /// given message order as canonical.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidDocument`] when the construction
    /// invariants do not hold.
    pub fn new(
        source: impl Into<String>,
        user: impl Into<String>,
        people: Vec<String>,
        conversation: Vec<Message>,
    ) -> Result<Self, MemoryError> {
        let mut builder = ConversationBuilder::new(source, user);
        builder.people = people;
        builder.auto_add_user = false;
        builder.messages = conversation;
        builder.build()
    }

    /// Distinct message authors in first-appearance order, with the primary
    /// user rewritten to [`PRIMARY_USER`].
    ///
    /// This is the job list for per-speaker fact extraction.
    #[must_use]
    pub fn speakers(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut speakers = Vec::new();
        for message in &self.conversation {
            let speaker = if message.speaker == self.user {
                PRIMARY_USER.to_string()
            } else {
                message.speaker.clone()
            };
            if seen.insert(speaker.clone()) {
                speakers.push(speaker);
            }
        }
        speakers
    }

    /// Renders the normalised conversation as stable JSON with sorted keys.
    ///
    /// Every occurrence of the raw `user` identifier, in participant lists,
    /// speaker fields, and message bodies, is rewritten to the literal
    /// `"primaryUser"`. This is the only view of a conversation the LLM
    /// ever sees.
    #[must_use]
    pub fn normalised_content(&self) -> String {
        let rewrite = |text: &str| -> String {
            if text == self.user {
                PRIMARY_USER.to_string()
            } else {
                text.replace(&self.user, PRIMARY_USER)
            }
        };

        let people: Vec<String> = self.people.iter().map(|p| rewrite(p)).collect();
        let conversation: Vec<serde_json::Value> = self
            .conversation
            .iter()
            .map(|m| {
                let mut entry = json!({
                    "speaker": rewrite(&m.speaker),
                    "content": rewrite(&m.content),
                });
                if let Some(time) = m.time {
                    entry["time"] = json!(time.to_rfc3339());
                }
                entry
            })
            .collect();

        // serde_json maps are key-sorted by default, which keeps the prompt
        // byte-stable for identical documents.
        json!({
            "source": self.source,
            "user": PRIMARY_USER,
            "people": people,
            "conversation": conversation,
        })
        .to_string()
    }

    /// Raw message timestamps, rendered verbatim for the extraction prompt's
    /// dates context block.
    #[must_use]
    pub fn date_strings(&self) -> Vec<String> {
        let mut dates: Vec<String> = self
            .timestamp
            .iter()
            .map(|t| t.to_rfc3339())
            .collect();
        dates.extend(
            self.conversation
                .iter()
                .filter_map(|m| m.time.map(|t| t.to_rfc3339())),
        );
        dates
    }
}

/// Builder for [`ConversationDocument`], enforcing the construction
/// invariants at [`build`](ConversationBuilder::build) time.
#[derive(Debug)]
pub struct ConversationBuilder {
    source: String,
    user: String,
    id: Option<String>,
    people: Vec<String>,
    messages: Vec<Message>,
    timestamp: Option<DateTime<Utc>>,
    tags: BTreeSet<String>,
    metadata: BTreeMap<String, String>,
    sort_by_time: bool,
    auto_add_user: bool,
}

impl ConversationBuilder {
    fn new(source: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            user: user.into(),
            id: None,
            people: Vec::new(),
            messages: Vec::new(),
            timestamp: None,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            sort_by_time: false,
            auto_add_user: true,
        }
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn person(mut self, person: impl Into<String>) -> Self {
        self.people.push(person.into());
        self
    }

    #[must_use]
    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    #[must_use]
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Requests canonical ordering by message time (stable: ties keep
    /// insertion order). Use when the caller's order is not meaningful.
    #[must_use]
    pub fn sort_by_time(mut self) -> Self {
        self.sort_by_time = true;
        self
    }

    /// Validates the invariants and produces the document.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidDocument`] when the user is blank or a
    /// reserved token, or when an explicit participant list omits the user.
    pub fn build(self) -> Result<ConversationDocument, MemoryError> {
        let ConversationBuilder {
            source,
            user,
            id,
            mut people,
            mut messages,
            timestamp,
            tags,
            metadata,
            sort_by_time,
            auto_add_user,
        } = self;

        if user.trim().is_empty() {
            return Err(MemoryError::invalid_document("user identifier is empty"));
        }
        if user == PRIMARY_USER {
            return Err(MemoryError::invalid_document(
                "user must be a raw identifier, not the normalised primaryUser token",
            ));
        }
        if auto_add_user && !people.contains(&user) {
            people.push(user.clone());
        }
        if people.is_empty() {
            return Err(MemoryError::invalid_document("people is empty"));
        }
        if !people.contains(&user) {
            return Err(MemoryError::invalid_document(format!(
                "user {user:?} is not listed in people"
            )));
        }

        // Unknown speakers map to the sentinel, which itself becomes a
        // participant.
        let mut needs_unknown = false;
        for message in &mut messages {
            if !people.contains(&message.speaker) {
                message.speaker = UNKNOWN_SPEAKER.to_string();
                needs_unknown = true;
            }
        }
        if needs_unknown && !people.iter().any(|p| p == UNKNOWN_SPEAKER) {
            people.push(UNKNOWN_SPEAKER.to_string());
        }

        if sort_by_time {
            messages.sort_by_key(|m| m.time);
        }

        let id = id.unwrap_or_else(|| {
            let transcript: String = messages
                .iter()
                .map(|m| format!("{}:{}", m.speaker, m.content))
                .collect();
            content_hash(&[&source, &user, &transcript])
        });

        Ok(ConversationDocument {
            id,
            source,
            user,
            people,
            conversation: messages,
            timestamp,
            tags,
            metadata,
        })
    }
}

/// A canonical document, ready for ingestion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Document {
    Text(TextDocument),
    Conversation(ConversationDocument),
}

impl Document {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Document::Text(doc) => &doc.id,
            Document::Conversation(doc) => &doc.id,
        }
    }

    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Document::Text(doc) => &doc.source,
            Document::Conversation(doc) => &doc.source,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Document::Text(doc) => doc.timestamp,
            Document::Conversation(doc) => doc.timestamp,
        }
    }

    #[must_use]
    pub fn tags(&self) -> &BTreeSet<String> {
        match self {
            Document::Text(doc) => &doc.tags,
            Document::Conversation(doc) => &doc.tags,
        }
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        match self {
            Document::Text(doc) => &doc.metadata,
            Document::Conversation(doc) => &doc.metadata,
        }
    }

    /// The content shown to the LLM: normalised JSON for conversations, the
    /// raw text for text documents.
    #[must_use]
    pub fn extraction_content(&self) -> String {
        match self {
            Document::Text(doc) => doc.content.clone(),
            Document::Conversation(doc) => doc.normalised_content(),
        }
    }

    /// The content persisted to the vector store for retrieval.
    #[must_use]
    pub fn stored_content(&self) -> String {
        self.extraction_content()
    }

    /// Speakers to run fact extraction for.
    #[must_use]
    pub fn extraction_speakers(&self) -> Vec<String> {
        match self {
            Document::Text(_) => vec![PRIMARY_USER.to_string()],
            Document::Conversation(doc) => doc.speakers(),
        }
    }

    /// Date strings passed verbatim to the extraction prompt.
    #[must_use]
    pub fn date_strings(&self) -> Vec<String> {
        match self {
            Document::Text(doc) => doc.timestamp.iter().map(|t| t.to_rfc3339()).collect(),
            Document::Conversation(doc) => doc.date_strings(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_conversation() -> ConversationDocument {
        ConversationDocument::builder("whatsapp", "alice@example.com")
            .person("bob@example.com")
            .message(Message::new("alice@example.com", "I drink coffee at 7am."))
            .message(Message::new("bob@example.com", "Nice."))
            .build()
            .unwrap()
    }

    #[test]
    fn builder_adds_user_to_people() {
        let doc = sample_conversation();
        assert!(doc.people.contains(&"alice@example.com".to_string()));
        assert!(doc.people.contains(&"bob@example.com".to_string()));
    }

    #[test]
    fn empty_user_rejected() {
        let result = ConversationDocument::builder("slack", "").build();
        assert!(matches!(result, Err(MemoryError::InvalidDocument { .. })));
    }

    #[test]
    fn literal_primary_user_token_rejected() {
        let result = ConversationDocument::builder("slack", PRIMARY_USER).build();
        assert!(matches!(result, Err(MemoryError::InvalidDocument { .. })));
    }

    #[test]
    fn explicit_people_must_contain_user() {
        let result = ConversationDocument::new(
            "slack",
            "alice",
            vec!["bob".into()],
            vec![Message::new("bob", "hi")],
        );
        assert!(matches!(result, Err(MemoryError::InvalidDocument { .. })));
    }

    #[test]
    fn unknown_speakers_mapped_to_sentinel() {
        let doc = ConversationDocument::builder("imessage", "alice")
            .message(Message::new("alice", "hello"))
            .message(Message::new("stranger", "who dis"))
            .build()
            .unwrap();
        assert_eq!(doc.conversation[1].speaker, UNKNOWN_SPEAKER);
        assert!(doc.people.iter().any(|p| p == UNKNOWN_SPEAKER));
    }

    #[test]
    fn normalised_content_hides_raw_user() {
        let doc = sample_conversation();
        let normalised = doc.normalised_content();
        assert!(!normalised.contains("alice@example.com"));
        assert!(normalised.contains(PRIMARY_USER));
        assert!(normalised.contains("bob@example.com"));
    }

    #[test]
    fn normalised_content_rewrites_mentions_in_bodies() {
        let doc = ConversationDocument::builder("slack", "alice")
            .person("bob")
            .message(Message::new("bob", "alice said she likes jazz"))
            .build()
            .unwrap();
        let normalised = doc.normalised_content();
        assert!(!normalised.contains("\"alice\""));
        assert!(normalised.contains("primaryUser said she likes jazz"));
    }

    #[test]
    fn normalised_content_is_stable() {
        let doc = sample_conversation();
        assert_eq!(doc.normalised_content(), doc.normalised_content());
    }

    #[test]
    fn sort_by_time_orders_messages() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let doc = ConversationDocument::builder("slack", "alice")
            .message(Message::new("alice", "second").with_time(t1))
            .message(Message::new("alice", "first").with_time(t0))
            .sort_by_time()
            .build()
            .unwrap();
        assert_eq!(doc.conversation[0].content, "first");
        assert_eq!(doc.conversation[1].content, "second");
    }

    #[test]
    fn speakers_normalise_primary_user() {
        let doc = sample_conversation();
        assert_eq!(
            doc.speakers(),
            vec![PRIMARY_USER.to_string(), "bob@example.com".to_string()]
        );
    }

    #[test]
    fn text_document_id_is_stable() {
        let a = TextDocument::new("gmail", "hello world").unwrap();
        let b = TextDocument::new("gmail", "hello world").unwrap();
        let c = TextDocument::new("misc", "hello world").unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn blank_text_document_rejected() {
        assert!(matches!(
            TextDocument::new("gmail", "   "),
            Err(MemoryError::InvalidDocument { .. })
        ));
    }
}

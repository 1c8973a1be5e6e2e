//! Turn splitting and metadata stamping for ingestion.
//!
//! A turn becomes one user chunk followed by one or more response chunks.
//! Long responses are cut at markdown headings and paragraph breaks; short
//! fragments fold into the fragment before them.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::memory::{ChunkType, MemoryId, TurnId};

/// Responses shorter than this many words stay whole.
pub const SPLIT_THRESHOLD_WORDS: usize = 200;

/// Fragments shorter than this many words merge into their predecessor.
pub const MIN_FRAGMENT_WORDS: usize = 30;

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("Invalid regex"));

static HEADING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,3}\s").expect("Invalid regex"));

/// A conversation turn handed over by the orchestration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub user_message: String,
    pub agent_response: String,
    /// Agent that produced the response
    pub agent: String,
    /// User who asked
    pub user: String,
    pub tags: Vec<String>,
    /// Importance signals such as `decision` or `user_correction`
    pub signals: Vec<String>,
}

impl Turn {
    pub fn new(user_message: impl Into<String>, agent_response: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            agent_response: agent_response.into(),
            agent: "brain".to_string(),
            user: "user".to_string(),
            tags: Vec::new(),
            signals: Vec::new(),
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_signals(mut self, signals: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.signals = signals.into_iter().map(Into::into).collect();
        self
    }
}

/// Cross-references between the chunks of one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkLinks {
    /// On the user chunk: every response chunk
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_ids: Vec<MemoryId>,
    /// On a response chunk: the user chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<MemoryId>,
    /// On a response chunk: the other response chunks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub siblings: Vec<MemoryId>,
}

/// Metadata stamped on every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    pub timestamp: String,
    pub turn_id: TurnId,
    pub tags: Vec<String>,
    pub links: ChunkLinks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// `"index/total"`, 1-based, only when a response was split
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
}

impl ChunkMetadata {
    /// Flatten into the map stored alongside a record.
    pub fn to_map(&self) -> Result<HashMap<String, Value>> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }

    /// Read back from a stored map. Returns `None` for non-chunk metadata.
    pub fn from_map(map: &HashMap<String, Value>) -> Option<Self> {
        let value = serde_json::to_value(map).ok()?;
        serde_json::from_value(value).ok()
    }
}

/// An addressable unit produced from a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: MemoryId,
    pub content: String,
    pub chunk_type: ChunkType,
    pub turn_id: TurnId,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub metadata: Option<ChunkMetadata>,
}

/// Split a turn into chunks and stamp their metadata.
pub fn chunk_turn(turn: &Turn) -> Vec<Chunk> {
    let mut chunks = split_turn(&turn.user_message, &turn.agent_response, None);
    stamp_turn(&mut chunks, turn);
    chunks
}

/// Split a turn into one user chunk and one or more response chunks.
pub fn split_turn(user_message: &str, agent_response: &str, turn_id: Option<TurnId>) -> Vec<Chunk> {
    let turn_id = turn_id.unwrap_or_default();
    let responses = chunk_response(agent_response, SPLIT_THRESHOLD_WORDS);
    let total = responses.len() as u32;

    let mut chunks = Vec::with_capacity(responses.len() + 1);
    chunks.push(Chunk {
        id: MemoryId::new(),
        content: user_message.to_string(),
        chunk_type: ChunkType::UserQuery,
        turn_id: turn_id.clone(),
        chunk_index: 0,
        total_chunks: 1,
        metadata: None,
    });
    for (index, text) in responses.into_iter().enumerate() {
        chunks.push(Chunk {
            id: MemoryId::new(),
            content: text,
            chunk_type: ChunkType::AgentResponse,
            turn_id: turn_id.clone(),
            chunk_index: index as u32,
            total_chunks: total,
            metadata: None,
        });
    }
    chunks
}

/// Split a response at topic boundaries when it is at least `threshold` words.
pub fn chunk_response(response: &str, threshold: usize) -> Vec<String> {
    if word_count(response) < threshold {
        return vec![response.to_string()];
    }

    let mut merged: Vec<String> = Vec::new();
    for part in split_sections(response) {
        match merged.last_mut() {
            Some(prev) if word_count(&part) < MIN_FRAGMENT_WORDS => {
                prev.push_str("\n\n");
                prev.push_str(&part);
            }
            _ => merged.push(part),
        }
    }

    if merged.is_empty() {
        vec![response.to_string()]
    } else {
        merged
    }
}

/// Cut at blank lines and before heading lines; drop empty fragments.
fn split_sections(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    for block in PARAGRAPH_BREAK.split(text) {
        let mut current = String::new();
        for line in block.split('\n') {
            if HEADING_LINE.is_match(line) && !current.trim().is_empty() {
                sections.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
        sections.push(current);
    }
    sections
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Stamp timestamps, tags and cross-links on the chunks of one turn.
///
/// Expects the layout produced by [`split_turn`]: the user chunk first.
pub fn stamp_turn(chunks: &mut [Chunk], turn: &Turn) {
    let Some((user_chunk, responses)) = chunks.split_first_mut() else {
        return;
    };
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let response_ids: Vec<MemoryId> = responses.iter().map(|c| c.id.clone()).collect();

    user_chunk.metadata = Some(ChunkMetadata {
        chunk_type: user_chunk.chunk_type,
        timestamp: timestamp.clone(),
        turn_id: user_chunk.turn_id.clone(),
        tags: turn.tags.clone(),
        links: ChunkLinks {
            response_ids: response_ids.clone(),
            ..ChunkLinks::default()
        },
        user: Some(turn.user.clone()),
        agent: None,
        chunk: None,
    });

    let query_id = user_chunk.id.clone();
    for chunk in responses.iter_mut() {
        let siblings = response_ids
            .iter()
            .filter(|id| **id != chunk.id)
            .cloned()
            .collect();
        chunk.metadata = Some(ChunkMetadata {
            chunk_type: chunk.chunk_type,
            timestamp: timestamp.clone(),
            turn_id: chunk.turn_id.clone(),
            tags: turn.tags.clone(),
            links: ChunkLinks {
                response_ids: Vec::new(),
                query_id: Some(query_id.clone()),
                siblings,
            },
            user: None,
            agent: Some(turn.agent.clone()),
            chunk: (chunk.total_chunks > 1)
                .then(|| format!("{}/{}", chunk.chunk_index + 1, chunk.total_chunks)),
        });
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn words(n: usize, word: &str) -> String {
        vec![word; n].join(" ")
    }

    #[test]
    fn test_short_response_is_one_chunk() {
        let text = words(199, "short");
        assert_eq!(chunk_response(&text, SPLIT_THRESHOLD_WORDS), vec![text]);
    }

    #[test]
    fn test_long_response_splits_on_paragraphs() {
        let text = format!("{}\n\n{}\n\n{}", words(80, "alpha"), words(80, "beta"), words(80, "gamma"));
        let parts = chunk_response(&text, SPLIT_THRESHOLD_WORDS);
        assert_eq!(parts.len(), 3);
        assert!(parts[1].starts_with("beta"));
    }

    #[test]
    fn test_long_response_splits_before_headings() {
        let text = format!(
            "{}\n## Setup\n{}\n### Usage\n{}",
            words(70, "intro"),
            words(70, "setup"),
            words(70, "usage")
        );
        let parts = chunk_response(&text, SPLIT_THRESHOLD_WORDS);
        assert_eq!(parts.len(), 3);
        assert!(parts[1].starts_with("## Setup"));
        assert!(parts[2].starts_with("### Usage"));
    }

    #[test]
    fn test_deep_headings_do_not_split() {
        let text = format!("{}\n#### Detail\n{}", words(120, "a"), words(120, "b"));
        assert_eq!(chunk_response(&text, SPLIT_THRESHOLD_WORDS).len(), 1);
    }

    #[test]
    fn test_small_fragments_merge_backwards() {
        let text = format!(
            "{}\n\n{}\n\n{}\n\n{}",
            words(100, "first"),
            words(5, "tiny"),
            words(100, "second"),
            words(10, "tail")
        );
        let parts = chunk_response(&text, SPLIT_THRESHOLD_WORDS);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with(&words(5, "tiny")));
        assert!(parts[1].ends_with(&words(10, "tail")));
    }

    #[test]
    fn test_leading_small_fragment_never_merges_forward() {
        let text = format!("{}\n\n{}\n\n{}", words(3, "hi"), words(110, "body"), words(110, "more"));
        let parts = chunk_response(&text, SPLIT_THRESHOLD_WORDS);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], words(3, "hi"));
    }

    #[test]
    fn test_split_turn_layout() {
        let response = format!("{}\n\n{}", words(120, "one"), words(120, "two"));
        let chunks = split_turn("question?", &response, None);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chunk_type, ChunkType::UserQuery);
        assert_eq!(chunks[0].total_chunks, 1);
        assert!(chunks[1..].iter().all(|c| c.chunk_type == ChunkType::AgentResponse));
        assert_eq!(chunks[2].chunk_index, 1);
        assert_eq!(chunks[2].total_chunks, 2);
        assert!(chunks.iter().all(|c| c.turn_id == chunks[0].turn_id));
    }

    #[test]
    fn test_stamp_links_are_bidirectional() {
        let response = format!(
            "{}\n\n{}\n\n{}",
            words(90, "one"),
            words(90, "two"),
            words(90, "three")
        );
        let turn = Turn::new("question?", response)
            .with_agent("coder")
            .with_tags(["topic:test"]);
        let chunks = chunk_turn(&turn);
        assert_eq!(chunks.len(), 4);

        let user_meta = chunks[0].metadata.as_ref().unwrap();
        let response_ids: Vec<MemoryId> = chunks[1..].iter().map(|c| c.id.clone()).collect();
        assert_eq!(user_meta.links.response_ids, response_ids);
        assert_eq!(user_meta.user.as_deref(), Some("user"));
        assert_eq!(user_meta.tags, vec!["topic:test".to_string()]);

        for (i, chunk) in chunks[1..].iter().enumerate() {
            let meta = chunk.metadata.as_ref().unwrap();
            assert_eq!(meta.links.query_id.as_ref(), Some(&chunks[0].id));
            assert_eq!(meta.links.siblings.len(), 2);
            assert!(!meta.links.siblings.contains(&chunk.id));
            assert_eq!(meta.agent.as_deref(), Some("coder"));
            assert_eq!(meta.chunk, Some(format!("{}/3", i + 1)));
        }
    }

    #[test]
    fn test_single_response_has_no_position() {
        let chunks = chunk_turn(&Turn::new("hi", "hello there"));
        let meta = chunks[1].metadata.as_ref().unwrap();
        assert_eq!(meta.chunk, None);
        assert!(meta.links.siblings.is_empty());
    }

    #[test]
    fn test_metadata_map_roundtrip() {
        let chunks = chunk_turn(&Turn::new("hi", "hello there"));
        let meta = chunks[1].metadata.clone().unwrap();
        let map = meta.to_map().unwrap();
        assert_eq!(map.get("type"), Some(&Value::from("agent_response")));
        assert_eq!(ChunkMetadata::from_map(&map), Some(meta));
    }
}

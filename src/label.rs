// src/label.rs
//
// Text labels attached to transferred messages. A chunk label identifies one
// chunk independently of delivery order; the chunked marker goes on the parent
// record and says how many chunks make up the file.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;
use uuid::Uuid;

use crate::integrity::SHORT_HASH_LEN;

const CHUNK_PREFIX: &str = "[CHUNK]|";

static CHUNKED_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[CHUNKED:(\d+)(?:\|([^\]]*))?\]").expect("marker pattern is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("not a chunk label")]
    NotAChunkLabel,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// `[CHUNK]|fileId:<uuid>|chunk:<index>|total:<count>|name:<name>|hash:<16 hex>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLabel {
    pub file_id: Uuid,
    pub index: u32,
    pub total: u32,
    pub name: String,
    pub hash: String,
}

impl fmt::Display for ChunkLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CHUNK_PREFIX}fileId:{}|chunk:{}|total:{}|name:{}|hash:{}",
            self.file_id, self.index, self.total, self.name, self.hash
        )
    }
}

fn field<'a>(part: Option<&'a str>, name: &'static str) -> Result<&'a str, LabelError> {
    part.and_then(|p| p.strip_prefix(name))
        .and_then(|p| p.strip_prefix(':'))
        .ok_or(LabelError::MissingField(name))
}

fn number(value: &str, field: &'static str) -> Result<u32, LabelError> {
    value.parse().map_err(|_| LabelError::InvalidField {
        field,
        value: value.to_string(),
    })
}

impl ChunkLabel {
    /// Parses a label. The name may itself contain `|`; the hash is read from the end.
    pub fn parse(label: &str) -> Result<Self, LabelError> {
        let body = label
            .trim()
            .strip_prefix(CHUNK_PREFIX)
            .ok_or(LabelError::NotAChunkLabel)?;
        let (head, hash) = body
            .rsplit_once("|hash:")
            .ok_or(LabelError::MissingField("hash"))?;

        let mut parts = head.splitn(4, '|');
        let file_id = field(parts.next(), "fileId")?;
        let index = field(parts.next(), "chunk")?;
        let total = field(parts.next(), "total")?;
        let name = field(parts.next(), "name")?;

        let file_id = Uuid::parse_str(file_id).map_err(|_| LabelError::InvalidField {
            field: "fileId",
            value: file_id.to_string(),
        })?;
        let index = number(index, "chunk")?;
        let total = number(total, "total")?;
        if index >= total {
            return Err(LabelError::InvalidField {
                field: "chunk",
                value: index.to_string(),
            });
        }
        if hash.len() != SHORT_HASH_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LabelError::InvalidField {
                field: "hash",
                value: hash.to_string(),
            });
        }

        Ok(Self {
            file_id,
            index,
            total,
            name: name.to_string(),
            hash: hash.to_ascii_lowercase(),
        })
    }
}

/// `[CHUNKED:<count>|<ref>,<ref>,...]` or `[CHUNKED:<count>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedMarker {
    pub count: u32,
    pub refs: Vec<String>,
}

impl fmt::Display for ChunkedMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.refs.is_empty() {
            write!(f, "[CHUNKED:{}]", self.count)
        } else {
            write!(f, "[CHUNKED:{}|{}]", self.count, self.refs.join(","))
        }
    }
}

impl ChunkedMarker {
    /// Finds the marker anywhere in `text`.
    pub fn find(text: &str) -> Option<Self> {
        let caps = CHUNKED_MARKER.captures(text)?;
        let count = caps.get(1)?.as_str().parse().ok()?;
        let refs = caps
            .get(2)
            .map(|m| {
                m.as_str()
                    .split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self { count, refs })
    }

    pub fn is_chunked(text: &str) -> bool {
        CHUNKED_MARKER.is_match(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChunkLabel {
        ChunkLabel {
            file_id: Uuid::parse_str("6f1c2f5e-3b7a-4d7e-9a51-0c8f7e2d1b44").unwrap(),
            index: 2,
            total: 3,
            name: "holiday|2024.mp4".into(),
            hash: "0123456789abcdef".into(),
        }
    }

    #[test]
    fn label_wire_format() {
        assert_eq!(
            sample().to_string(),
            "[CHUNK]|fileId:6f1c2f5e-3b7a-4d7e-9a51-0c8f7e2d1b44|chunk:2|total:3|name:holiday|2024.mp4|hash:0123456789abcdef"
        );
    }

    #[test]
    fn label_parses_back_with_pipe_in_name() {
        let label = sample();
        assert_eq!(ChunkLabel::parse(&label.to_string()).unwrap(), label);
    }

    #[test]
    fn label_rejects_other_captions() {
        assert_eq!(ChunkLabel::parse("just a photo"), Err(LabelError::NotAChunkLabel));
    }

    #[test]
    fn label_rejects_index_past_total() {
        let mut label = sample();
        label.index = 3;
        assert!(matches!(
            ChunkLabel::parse(&label.to_string()),
            Err(LabelError::InvalidField { field: "chunk", .. })
        ));
    }

    #[test]
    fn label_rejects_short_hash() {
        let text = "[CHUNK]|fileId:6f1c2f5e-3b7a-4d7e-9a51-0c8f7e2d1b44|chunk:0|total:1|name:a|hash:abc";
        assert!(matches!(
            ChunkLabel::parse(text),
            Err(LabelError::InvalidField { field: "hash", .. })
        ));
    }

    #[test]
    fn marker_with_refs() {
        let marker = ChunkedMarker {
            count: 3,
            refs: vec!["r0".into(), "r1".into(), "r2".into()],
        };
        let text = format!("Trip video {marker}");
        assert_eq!(text, "Trip video [CHUNKED:3|r0,r1,r2]");
        assert_eq!(ChunkedMarker::find(&text), Some(marker));
    }

    #[test]
    fn marker_without_refs() {
        let marker = ChunkedMarker::find("[CHUNKED:12]").unwrap();
        assert_eq!(marker.count, 12);
        assert!(marker.refs.is_empty());
        assert_eq!(marker.to_string(), "[CHUNKED:12]");
    }

    #[test]
    fn plain_caption_is_not_chunked() {
        assert!(!ChunkedMarker::is_chunked("[CHUNK]|fileId:x"));
        assert!(ChunkedMarker::find("nothing here").is_none());
    }
}

//! Feedback ratings, kept as rows of a single CSV blob.
//!
//! Appending downloads the whole blob, adds one row and uploads it again.
//! There is no conditional write, so two concurrent appends can lose one row;
//! the service is expected to run as a single writer.

use fitmusic_storage::{BlobStore, StorageError};
use serde_json::Value;

use crate::biometrics::plain;
use crate::error::AppError;

pub const FEEDBACK_BLOB: &str = "user_feedback.csv";
pub const HEADER: &str = "input_text,music_prompt,score";

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackRecord {
    pub input_text: String,
    pub music_prompt: String,
    pub score: String,
}

impl FeedbackRecord {
    /// Pull the three fields out of a request body. Text fields are trimmed and
    /// must be non-empty; `score` may be any non-null JSON value.
    pub fn from_json(body: &Value) -> Result<Self, AppError> {
        let text = |key: &str| {
            body.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };

        let score = body
            .get("score")
            .filter(|v| !v.is_null())
            .map(plain)
            .filter(|s| !s.trim().is_empty());

        match (text("input_text"), text("music_prompt"), score) {
            (Some(input_text), Some(music_prompt), Some(score)) => Ok(Self {
                input_text,
                music_prompt,
                score,
            }),
            _ => Err(AppError::Validation("missing fields".to_string())),
        }
    }

    pub fn to_row(&self) -> String {
        format!(
            "\"{}\",\"{}\",{}",
            escape_field(&self.input_text),
            escape_field(&self.music_prompt),
            self.score
        )
    }
}

pub fn escape_field(s: &str) -> String {
    s.replace('"', "\"\"")
}

/// Inverse of [`FeedbackRecord::to_row`].
pub fn parse_row(line: &str) -> Option<FeedbackRecord> {
    let mut fields = Vec::with_capacity(3);
    let mut chars = line.chars().peekable();

    while fields.len() < 2 {
        if chars.next()? != '"' {
            return None;
        }
        let mut field = String::new();
        loop {
            match chars.next()? {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => break,
                c => field.push(c),
            }
        }
        if chars.next()? != ',' {
            return None;
        }
        fields.push(field);
    }

    let score: String = chars.collect();
    let music_prompt = fields.pop()?;
    let input_text = fields.pop()?;
    Some(FeedbackRecord {
        input_text,
        music_prompt,
        score,
    })
}

#[derive(Clone)]
pub struct FeedbackLog {
    store: BlobStore,
}

impl FeedbackLog {
    pub fn new(store: BlobStore) -> Self {
        Self { store }
    }

    /// Append one row, writing the header first if the log is absent or empty.
    pub async fn append(&self, record: &FeedbackRecord) -> Result<(), StorageError> {
        let existing = match self.store.get(FEEDBACK_BLOB).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => String::new(),
        };

        let mut lines: Vec<String> = existing.lines().map(String::from).collect();
        if lines.is_empty() {
            lines.push(HEADER.to_string());
        }
        lines.push(record.to_row());

        let mut body = lines.join("\n");
        body.push('\n');
        self.store.put(FEEDBACK_BLOB, body).await?;

        tracing::info!("feedback row {} recorded", lines.len() - 1);
        Ok(())
    }

    /// Every stored row, oldest first.
    pub async fn records(&self) -> Result<Vec<FeedbackRecord>, StorageError> {
        let Some(bytes) = self.store.get(FEEDBACK_BLOB).await? else {
            return Ok(Vec::new());
        };
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .skip(1)
            .filter_map(parse_row)
            .collect())
    }
}

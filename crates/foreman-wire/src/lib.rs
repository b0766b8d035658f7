//! Wire models for the worker's streaming protocol.
//!
//! The worker is a CLI coding agent that prints one JSON message per stdout
//! line. Four message kinds matter to the engine — `init`, `assistant`,
//! `user`, `result` — everything else must parse and be ignored rather than
//! error, since worker upgrades add message types freely.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Init(InitMessage),
    Assistant { message: AssistantMessage },
    User { message: UserMessage },
    Result(ResultMessage),
    #[serde(other)]
    Unknown,
}

/// Handshake message, first on the stream. `session_id` is the opaque
/// resume token handed back on a later run to continue the same worker
/// session.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InitMessage {
    pub session_id: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    pub cwd: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AssistantMessage {
    pub id: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UserMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

/// Tool results arrive either as a bare string or as an array of text
/// blocks, depending on the tool.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        ToolResultContent::Text(String::new())
    }
}

impl ToolResultContent {
    pub fn flatten(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Parse one stdout line. Non-JSON noise (progress spinners, stray prints
/// from shelled-out tools) is skipped, not treated as a protocol error.
pub fn parse_line(line: &str) -> Option<WorkerMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() || !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Concatenate the text blocks of an assistant message with a blank-line
/// separator, the form stored on the durable row.
pub fn collect_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ---------------------------------------------------------------------------
// Escaped-unicode decoding
// ---------------------------------------------------------------------------

/// Decode literal `\uXXXX` sequences (including surrogate pairs) embedded in
/// worker text to their real characters. Workers occasionally double-encode
/// non-ASCII output; storage and notifications always carry the decoded form.
/// Malformed sequences pass through unchanged.
pub fn decode_unicode_escapes(input: &str) -> String {
    if !input.contains("\\u") {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find("\\u") {
        out.push_str(&rest[..idx]);
        let candidate = &rest[idx..];
        match take_escape(candidate) {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = &candidate[consumed..];
            }
            None => {
                out.push_str("\\u");
                rest = &candidate[2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parse a `\uXXXX` (or surrogate pair) at the start of `input`, returning
/// the decoded char and the number of bytes consumed.
fn take_escape(input: &str) -> Option<(char, usize)> {
    let high = hex4(&input[2..])?;
    if (0xD800..=0xDBFF).contains(&high) {
        let tail = &input[6..];
        if !tail.starts_with("\\u") {
            return None;
        }
        let low = hex4(&tail[2..])?;
        if !(0xDC00..=0xDFFF).contains(&low) {
            return None;
        }
        let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
        return char::from_u32(code).map(|ch| (ch, 12));
    }
    if (0xDC00..=0xDFFF).contains(&high) {
        return None;
    }
    char::from_u32(high).map(|ch| (ch, 6))
}

fn hex4(input: &str) -> Option<u32> {
    let digits = input.get(..4)?;
    if !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

// ---------------------------------------------------------------------------
// Permission-denial detection
// ---------------------------------------------------------------------------

const PERMISSION_DENIAL_MARKERS: [&str; 3] = [
    "requested permissions to use",
    "haven't granted it",
    "permission denied",
];

/// True when a tool result reads as the worker refusing a tool for lack of
/// permission. The phrasing varies across worker versions, so this matches
/// a small set of stable markers case-insensitively.
pub fn is_permission_denial(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    PERMISSION_DENIAL_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

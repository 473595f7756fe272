//! The embedded state protocol.
//!
//! A response may open with a block carrying a JSON object of variable
//! updates, followed by the narrative:
//!
//! ```text
//! ###STATE
//! {"currency": 150, "condition": "Lightly wounded"}
//! ###END
//!
//! You fend off the masked cultivator...
//! ```
//!
//! Text arrives cumulatively, so every streamed chunk is stripped with
//! [`strip_for_display`] and the finished text is read with [`parse_final`].

use serde_json::{Map, Value};

pub const STATE_START: &str = "###STATE";
pub const STATE_END: &str = "###END";

/// A parsed state update: keys are meant to be variable names.
pub type StateUpdate = Map<String, Value>;

/// Outcome of parsing a finished response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedResponse {
    pub state_update: Option<StateUpdate>,
    pub narrative: String,
    /// A block was present but did not hold a JSON object.
    pub malformed_block: bool,
}

/// Byte range of the first complete block and the range of its inner text.
struct Span {
    start: usize,
    inner_start: usize,
    inner_end: usize,
    /// End of the block including trailing whitespace.
    end: usize,
}

fn find_span(text: &str, from: usize) -> Option<Span> {
    let start = from + text[from..].find(STATE_START)?;
    let inner_start = start + STATE_START.len();
    let inner_end = inner_start + text[inner_start..].find(STATE_END)?;
    let after_marker = inner_end + STATE_END.len();
    let trailing = text[after_marker..].len() - text[after_marker..].trim_start().len();

    Some(Span {
        start,
        inner_start,
        inner_end,
        end: after_marker + trailing,
    })
}

/// Remove every complete block, and the whitespace after it.
fn remove_spans(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(span) = find_span(text, cursor) {
        out.push_str(&text[cursor..span.start]);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Text safe to show while a response is still streaming.
///
/// Complete blocks are removed. A block that has started but not yet
/// ended is hidden up to the end of the text, and so is a response that so
/// far consists only of the beginning of the start marker.
pub fn strip_for_display(partial: &str) -> String {
    let mut display = remove_spans(partial);

    if let Some(open) = display.find(STATE_START) {
        display.truncate(open);
    }

    let head = display.trim_start();
    if !head.is_empty() && head.len() < STATE_START.len() && STATE_START.starts_with(head) {
        display.clear();
    }

    display
}

/// Parse a finished response.
///
/// The first complete block supplies the state update. All blocks are
/// removed from the narrative, which is then trimmed. Text without a
/// complete block is returned unchanged. A block whose content is not a JSON
/// object is logged and yields no update, but is still removed.
pub fn parse_final(full: &str) -> ParsedResponse {
    let Some(span) = find_span(full, 0) else {
        return ParsedResponse {
            state_update: None,
            narrative: full.to_string(),
            malformed_block: false,
        };
    };

    let inner = full[span.inner_start..span.inner_end].trim();
    let (state_update, malformed_block) = match serde_json::from_str::<Value>(inner) {
        Ok(Value::Object(map)) => (Some(map), false),
        Ok(other) => {
            tracing::warn!(kind = json_kind(&other), "State block is not a JSON object");
            (None, true)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse state block");
            (None, true)
        }
    };

    // Removing one layer can splice a new marker pair together; repeat
    // until nothing is left to remove.
    let mut narrative = remove_spans(full);
    while find_span(&narrative, 0).is_some() {
        narrative = remove_spans(&narrative);
    }

    ParsedResponse {
        state_update,
        narrative: narrative.trim().to_string(),
        malformed_block,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

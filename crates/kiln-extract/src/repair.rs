//! Best-effort repair of almost-valid generator documents
//!
//! Each [`RepairStage`] is a pure text transform aimed at one malformation
//! generators are known to produce. Stages run in [`REPAIR_PIPELINE`] order and
//! only after a strict parse has already failed.

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

use crate::ExtractError;

/// One named text transform
#[derive(Debug, Clone, Copy)]
pub struct RepairStage {
    pub name: &'static str,
    /// The malformation this stage rewrites
    pub targets: &'static str,
    pub apply: fn(&str) -> String,
}

/// Stages in application order.
///
/// Block-quoted values are converted before anything else touches their
/// bodies, and trailing-comma removal runs last so it sees the final text.
pub const REPAIR_PIPELINE: &[RepairStage] = &[
    RepairStage {
        name: "files_alias",
        targets: r#""code_files": used instead of "files":"#,
        apply: alias_files_key,
    },
    RepairStage {
        name: "block_quotes",
        targets: "values quoted with backticks instead of double quotes",
        apply: convert_block_quotes,
    },
    RepairStage {
        name: "raw_control_chars",
        targets: "literal newlines, carriage returns or tabs inside string values",
        apply: escape_raw_control_chars,
    },
    RepairStage {
        name: "trailing_commas",
        targets: "a comma directly before ] or }",
        apply: strip_trailing_commas,
    },
];

/// Run every stage of the pipeline over `text`
pub fn repair(text: &str) -> String {
    REPAIR_PIPELINE.iter().fold(text.to_string(), |acc, stage| {
        let next = (stage.apply)(&acc);
        if next != acc {
            debug!("repair stage '{}' rewrote document", stage.name);
        }
        next
    })
}

/// Parse a candidate document, repairing it only if the strict parse fails
pub fn parse_document(candidate: &str) -> Result<Value, ExtractError> {
    match serde_json::from_str(candidate) {
        Ok(value) => Ok(value),
        Err(first) => {
            debug!("strict parse failed ({}), attempting repair", first);
            serde_json::from_str(&repair(candidate)).map_err(|e| ExtractError::InvalidDocument {
                message: e.to_string(),
            })
        }
    }
}

// A stage whose pattern fails to build leaves the text unchanged
fn alias_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""code_files"(\s*):"#).ok())
        .as_ref()
}

fn block_quote_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""([^"]+)"\s*:\s*`([^`]*)`"#).ok())
        .as_ref()
}

fn trailing_comma_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([\]}])").ok())
        .as_ref()
}

/// `"code_files": [...]` becomes `"files": [...]`
fn alias_files_key(text: &str) -> String {
    match alias_re() {
        Some(re) => re.replace_all(text, "\"files\"$1:").into_owned(),
        None => text.to_string(),
    }
}

/// `"content": `...`` becomes `"content": "..."`.
///
/// Backslashes are escaped first so the escapes added for quotes and control
/// characters are not themselves doubled.
fn convert_block_quotes(text: &str) -> String {
    let Some(re) = block_quote_re() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &Captures| {
            let key = &caps[1];
            let value = caps[2]
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
                .replace('\r', "\\r")
                .replace('\t', "\\t");
            format!("\"{}\": \"{}\"", key, value)
        })
        .into_owned()
}

/// Escape raw control characters that appear inside double-quoted strings.
///
/// Walks the text tracking string state so structural whitespace between
/// tokens is left alone.
fn escape_raw_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(ch),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}

/// `[1, 2,]` becomes `[1, 2]`
fn strip_trailing_commas(text: &str) -> String {
    match trailing_comma_re() {
        Some(re) => re.replace_all(text, "$1").into_owned(),
        None => text.to_string(),
    }
}

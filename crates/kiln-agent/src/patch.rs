//! Plain-text patch envelope
//!
//! ```text
//! *** Begin Patch
//! *** Update File: generated_app/backend/main.py
//! +++ REPLACE ENTIRE FILE +++
//! <new file content>
//! *** End Patch
//! ```
//!
//! Sections are found by splitting on the update sentinel, so paths and
//! bodies never need delimiter matching. Parsing is lenient about the
//! envelope: the begin sentinel may be missing, an opening markdown fence is
//! skipped and its closing fence ends the patch when no end sentinel does.
//! A section body is one of:
//!
//! - everything after the full-replacement marker
//! - `@@` hunks of ` `/`-`/`+` lines
//! - anything else, taken as the whole new file once stray sentinel lines are removed

use crate::PatchError;

pub const BEGIN_PATCH: &str = "*** Begin Patch";
pub const END_PATCH: &str = "*** End Patch";
pub const UPDATE_FILE: &str = "*** Update File:";
pub const REPLACE_MARKER: &str = "+++ REPLACE ENTIRE FILE +++";

/// Also accepted as a section header; creation and update are the same operation
const ADD_FILE: &str = "*** Add File:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub directives: Vec<FileUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpdate {
    /// Path exactly as written on the sentinel line, trimmed
    pub target: String,
    pub body: UpdateBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateBody {
    /// Complete new content following the replacement marker
    Replace(String),
    Hunks(Vec<Hunk>),
    /// Unmarked body used as the complete new content
    Raw(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hunk {
    pub lines: Vec<HunkLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

impl Hunk {
    /// Lines the hunk expects to find (context and removals)
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines the hunk leaves behind (context and additions)
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }
}

/// Parse patch text into directives.
///
/// Fails with [`PatchError::NoSections`] if no section header is present and
/// with [`PatchError::MalformedPath`] if a header carries no path. Whether a
/// path stays inside the workspace is checked when the patch is applied.
pub fn parse_patch(text: &str) -> Result<Patch, PatchError> {
    let lines: Vec<&str> = text.lines().collect();
    let first = lines
        .iter()
        .position(|l| section_header(l.trim()).is_some())
        .ok_or(PatchError::NoSections)?;
    let end = envelope_end(&lines, first);

    let mut sections: Vec<(String, Vec<&str>)> = Vec::new();
    for &line in &lines[first..end] {
        if let Some(path) = section_header(line.trim()) {
            sections.push((path.to_string(), Vec::new()));
        } else if let Some((_, body)) = sections.last_mut() {
            body.push(line);
        }
    }

    sections
        .into_iter()
        .map(|(target, body)| {
            if target.is_empty() {
                return Err(PatchError::MalformedPath {
                    path: target,
                    reason: "no path after the update sentinel".to_string(),
                });
            }
            Ok(FileUpdate {
                target,
                body: parse_body(&body),
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|directives| Patch { directives })
}

/// Index of the line ending the envelope that starts at `first`.
///
/// The end sentinel wins. Without one, a fenced envelope ends at its last
/// fence, and an unfenced one at a fence followed only by blank or fence
/// lines. Fences anywhere else are file content.
fn envelope_end(lines: &[&str], first: usize) -> usize {
    if let Some(i) = lines[first..]
        .iter()
        .position(|l| eq_ignore_case(l.trim(), END_PATCH))
    {
        return first + i;
    }

    let fenced = lines[..first].iter().any(|l| is_fence(l));
    let closing = if fenced {
        lines[first..].iter().rposition(|l| is_fence(l))
    } else {
        (0..lines.len() - first).find(|&i| {
            is_fence(lines[first + i])
                && lines[first + i..]
                    .iter()
                    .all(|l| is_fence(l) || l.trim().is_empty())
        })
    };
    closing.map_or(lines.len(), |i| first + i)
}

fn is_fence(line: &str) -> bool {
    line.trim().starts_with("```")
}

/// Envelope bookkeeping lines such as `*** Begin Patch` or `*** Delete File: x`
fn is_sentinel(line: &str) -> bool {
    let Some(rest) = line.trim().strip_prefix("*** ") else {
        return false;
    };
    let word = rest.split_whitespace().next().unwrap_or("");
    ["begin", "end", "update", "add", "delete", "move"]
        .iter()
        .any(|w| word.eq_ignore_ascii_case(w))
}

fn section_header(line: &str) -> Option<&str> {
    [UPDATE_FILE, ADD_FILE].iter().find_map(|sentinel| {
        let head = line.get(..sentinel.len())?;
        if eq_ignore_case(head, sentinel) {
            Some(line[sentinel.len()..].trim())
        } else {
            None
        }
    })
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn parse_body(lines: &[&str]) -> UpdateBody {
    if let Some(idx) = lines.iter().position(|l| l.trim() == REPLACE_MARKER) {
        return UpdateBody::Replace(join_content(&lines[idx + 1..]));
    }

    if lines.iter().any(|l| l.starts_with("@@")) {
        return UpdateBody::Hunks(parse_hunks(lines));
    }

    let kept: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|l| !is_sentinel(l))
        .collect();
    UpdateBody::Raw(join_content(&kept))
}

fn parse_hunks(lines: &[&str]) -> Vec<Hunk> {
    let mut hunks: Vec<Hunk> = Vec::new();
    for line in lines {
        if line.starts_with("@@") {
            hunks.push(Hunk::default());
            continue;
        }
        // File headers and anything before the first hunk
        let Some(hunk) = hunks.last_mut() else {
            continue;
        };
        let parsed = if let Some(rest) = line.strip_prefix('+') {
            HunkLine::Add(rest.to_string())
        } else if let Some(rest) = line.strip_prefix('-') {
            HunkLine::Remove(rest.to_string())
        } else if let Some(rest) = line.strip_prefix(' ') {
            HunkLine::Context(rest.to_string())
        } else if is_sentinel(line) {
            continue;
        } else {
            HunkLine::Context(line.to_string())
        };
        hunk.lines.push(parsed);
    }
    hunks.retain(|h| !h.lines.is_empty());
    hunks
}

/// Join lines into file content with exactly one trailing newline.
/// Leading and trailing blank lines are dropped.
fn join_content(lines: &[&str]) -> String {
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    match (start, end) {
        (Some(start), Some(end)) => {
            let mut content = lines[start..=end].join("\n");
            content.push('\n');
            content
        }
        _ => String::new(),
    }
}

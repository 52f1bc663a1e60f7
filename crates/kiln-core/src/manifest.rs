//! Dependency manifest cleanup
//!
//! Generated manifests routinely pin versions that do not exist or conflict.
//! Kiln keeps bare package names only, both when files are first generated and
//! whenever a patch rewrites the manifest.

use regex::Regex;
use std::sync::OnceLock;

fn package_name_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9_.\-]+)").ok())
        .as_ref()
}

/// Whether `path` names a dependency manifest
pub fn is_manifest_path(path: &str) -> bool {
    path.rsplit(['/', '\\'])
        .next()
        .is_some_and(|name| name.eq_ignore_ascii_case("requirements.txt"))
}

/// Reduce every requirement line to its bare package name.
///
/// Blank lines and `#` comments are dropped. Output is newline-terminated
/// unless empty.
pub fn clean_manifest(content: &str) -> String {
    let names: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| package_name_re()?.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();

    let mut out = names.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Clean `content` and append any of `required` that are missing.
///
/// Names compare case-insensitively with `-` and `_` treated alike.
pub fn ensure_packages(content: &str, required: &[String]) -> String {
    let cleaned = clean_manifest(content);
    let canonical = |name: &str| name.to_ascii_lowercase().replace('_', "-");
    let present: Vec<String> = cleaned.lines().map(canonical).collect();

    let mut out = cleaned;
    for pkg in required {
        if !present.contains(&canonical(pkg)) {
            out.push_str(pkg);
            out.push('\n');
        }
    }
    out
}

//! INI-style template file parsing
//!
//! Template files contain `[section]` headers with `key: value` (or
//! `key = value`) pairs. A `[DEFAULT]` section supplies fallback pairs to
//! every other section. Values may reference sibling keys with `${key}` and
//! the defaults explicitly with `${DEFAULT:key}`; references are expanded
//! here, before placeholder resolution sees the pairs.

use std::collections::HashMap;

use crate::error::{ConfigError, Result};

/// Maximum nesting for `${...}` references
const MAX_INTERPOLATION_DEPTH: usize = 10;

/// Name of the fallback section
const DEFAULT_SECTION: &str = "DEFAULT";

/// One named section read from a template file: ordered key/value pairs,
/// defaults merged in, interpolation applied.
#[derive(Debug, Clone)]
pub struct ConfigSection {
    pub name: String,
    pub pairs: Vec<(String, String)>,
}

impl ConfigSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse `content` and return the fully interpolated pairs of `section`.
///
/// Pair order follows the file: defaults first (with section overrides
/// applied in place), then section-only keys. Keys are lowercased.
pub fn parse_section(content: &str, section: &str) -> Result<ConfigSection> {
    let raw = parse_raw(content)?;

    let section_pairs = raw
        .iter()
        .find(|(name, _)| name == section)
        .map(|(_, pairs)| pairs.clone())
        .ok_or_else(|| ConfigError::InvalidSection(section.to_string()))?;
    let default_pairs = raw
        .iter()
        .find(|(name, _)| name == DEFAULT_SECTION)
        .map(|(_, pairs)| pairs.clone())
        .unwrap_or_default();

    // Defaults first, overridden in place by the section's own value.
    let mut merged: Vec<(String, String)> = Vec::new();
    for (key, value) in &default_pairs {
        let value = section_pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| value.clone());
        merged.push((key.clone(), value));
    }
    for (key, value) in &section_pairs {
        if !merged.iter().any(|(k, _)| k == key) {
            merged.push((key.clone(), value.clone()));
        }
    }

    let scope: HashMap<String, String> = merged.iter().cloned().collect();
    let defaults: HashMap<String, String> = default_pairs.into_iter().collect();

    let mut pairs = Vec::with_capacity(merged.len());
    for (key, value) in merged {
        let expanded = expand(&value, &scope, &defaults, 0, &value)?;
        pairs.push((key, expanded));
    }

    Ok(ConfigSection {
        name: section.to_string(),
        pairs,
    })
}

/// Parse all sections into (name, pairs) preserving file order.
fn parse_raw(content: &str) -> Result<Vec<(String, Vec<(String, String)>)>> {
    let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest
                .strip_suffix(']')
                .ok_or_else(|| ConfigError::MalformedLine {
                    line: lineno + 1,
                    text: line.to_string(),
                })?;
            sections.push((name.trim().to_string(), Vec::new()));
            continue;
        }

        let delim = line
            .char_indices()
            .find(|(_, c)| *c == ':' || *c == '=')
            .map(|(i, _)| i)
            .ok_or_else(|| ConfigError::MalformedLine {
                line: lineno + 1,
                text: line.to_string(),
            })?;
        let key = line[..delim].trim().to_lowercase();
        let value = line[delim + 1..].trim().to_string();

        let (name, pairs) = sections
            .last_mut()
            .ok_or_else(|| ConfigError::MalformedLine {
                line: lineno + 1,
                text: line.to_string(),
            })?;
        if pairs.iter().any(|(k, _)| *k == key) {
            return Err(ConfigError::DuplicateKey {
                section: name.clone(),
                key,
            }
            .into());
        }
        pairs.push((key, value));
    }

    Ok(sections)
}

/// Expand `${key}` and `${DEFAULT:key}` references, recursively.
fn expand(
    value: &str,
    scope: &HashMap<String, String>,
    defaults: &HashMap<String, String>,
    depth: usize,
    raw: &str,
) -> Result<String> {
    if depth > MAX_INTERPOLATION_DEPTH {
        return Err(ConfigError::InterpolationDepth(raw.to_string()).into());
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or_else(|| ConfigError::BadInterpolation(raw.to_string()))?;
            let name = &body[..end];
            let referenced = lookup(name, scope, defaults)?;
            let expanded = expand(&referenced, scope, defaults, depth + 1, raw)?;
            out.push_str(&expanded);
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn lookup(
    name: &str,
    scope: &HashMap<String, String>,
    defaults: &HashMap<String, String>,
) -> Result<String> {
    let found = if let Some(key) = name.strip_prefix("DEFAULT:") {
        defaults.get(&key.to_lowercase())
    } else if name.contains(':') {
        None
    } else {
        scope.get(&name.to_lowercase())
    };
    found
        .cloned()
        .ok_or_else(|| ConfigError::UnknownReference(name.to_string()).into())
}

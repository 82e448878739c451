//! Lenient parsers for the two shapes the extraction LLM is asked to emit: a fenced or bare
//! JSON object, or a line-delimited text form. Different providers honor schema hints
//! inconsistently, so both are always accepted.

use serde::Deserialize;

/// One reconciliation action as decided by the LLM, before temp-id resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAction {
    pub id: String,
    pub text: String,
    pub event: ActionEvent,
    pub old_memory: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionEvent {
    Add,
    Update,
    Delete,
    None,
}

impl ActionEvent {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ADD" => Some(ActionEvent::Add),
            "UPDATE" => Some(ActionEvent::Update),
            "DELETE" => Some(ActionEvent::Delete),
            "NONE" => Some(ActionEvent::None),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct FactsJson {
    facts: Vec<String>,
}

#[derive(Deserialize)]
struct ActionsJson {
    memory: Vec<RawActionJson>,
}

#[derive(Deserialize)]
struct RawActionJson {
    id: String,
    text: String,
    event: String,
    #[serde(default)]
    old_memory: Option<String>,
}

/// Parses the fact-extraction response: either `{"facts": [...]}` or `FACT: ...` lines, or
/// the literal word `NONE` for an empty result. Dedupes while preserving first-seen order.
pub fn parse_facts(raw: &str) -> Vec<String> {
    let facts = if let Some(json) = extract_json_object(raw) {
        match serde_json::from_str::<FactsJson>(&json) {
            Ok(parsed) => parsed.facts,
            Err(_) => parse_facts_text(raw),
        }
    } else {
        parse_facts_text(raw)
    };

    dedupe_preserve_order(
        facts
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty()),
    )
}

fn parse_facts_text(raw: &str) -> Vec<String> {
    if raw.trim().eq_ignore_ascii_case("none") {
        return Vec::new();
    }

    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix("FACT:")
                .or_else(|| {
                    if line.to_ascii_uppercase().starts_with("FACT:") {
                        Some(&line[5..])
                    } else {
                        None
                    }
                })
                .map(|s| s.trim().to_string())
        })
        .collect()
}

/// Parses the reconciliation response: either `{"memory": [...]}` or pipe-delimited
/// `EVENT|ID|TEXT|OLD_MEMORY` lines. Unknown event tokens or rows missing an id/text are
/// dropped rather than failing the whole parse.
pub fn parse_actions(raw: &str) -> Vec<RawAction> {
    if let Some(json) = extract_json_object(raw) {
        if let Ok(parsed) = serde_json::from_str::<ActionsJson>(&json) {
            return parsed
                .memory
                .into_iter()
                .filter_map(|a| {
                    Some(RawAction {
                        id: a.id,
                        text: a.text,
                        event: ActionEvent::parse(&a.event)?,
                        old_memory: a.old_memory,
                    })
                })
                .collect();
        }
    }

    parse_actions_text(raw)
}

fn parse_actions_text(raw: &str) -> Vec<RawAction> {
    raw.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().splitn(4, '|').collect();
            if parts.len() < 3 {
                return None;
            }

            let event = ActionEvent::parse(parts[0])?;
            let id = parts[1].trim().to_string();
            let text = parts[2].trim().to_string();
            let old_memory = parts.get(3).map(|s| s.trim().to_string());

            Some(RawAction {
                id,
                text,
                event,
                old_memory,
            })
        })
        .collect()
}

/// Strips fenced code blocks and returns the first balanced `{...}` region, if any. A
/// "balanced" region respects string literals so braces inside quoted text don't confuse
/// the scanner.
fn extract_json_object(raw: &str) -> Option<String> {
    let stripped = strip_code_fences(raw);
    let bytes = stripped.as_bytes();

    let start = stripped.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        let c = b as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(stripped[start..=i].to_string());
                }
            }
            _ => {}
        }
    }

    None
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.trim_start_matches('\n');
        if let Some(end) = rest.rfind("```") {
            return rest[..end].to_string();
        }
        return rest.to_string();
    }
    trimmed.to_string()
}

fn dedupe_preserve_order(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

/// Normalizes `content` for substring comparisons: lowercase, non-alphanumeric characters
/// collapsed to spaces, whitespace collapsed. Idempotent.
pub fn normalize(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut last_was_space = false;

    for ch in content.chars() {
        if ch.is_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }

    out.trim().to_string()
}

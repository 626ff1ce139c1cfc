//! `{{path}}` interpolation for prompt templates.
//!
//! A placeholder is `{{` followed by a dotted path and `}}`. The path is walked
//! through the lookup source; anything that cannot be found renders as the
//! empty string. Text outside placeholders, including an unterminated `{{`,
//! is copied verbatim.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use super::context::PathLookup;

static RE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("placeholder pattern is valid"));

pub fn resolve<C>(template: &str, context: &C) -> String
where
    C: PathLookup + ?Sized,
{
    RE_PLACEHOLDER
        .replace_all(template, |captures: &Captures<'_>| {
            let path: Vec<&str> = captures[1].trim().split('.').collect();
            context.lookup(&path).map(render).unwrap_or_default()
        })
        .into_owned()
}

/// Node ids referenced by `{{<id>...}}` placeholders, in order of appearance.
pub fn references(template: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for captures in RE_PLACEHOLDER.captures_iter(template) {
        let path = captures[1].trim();
        let id = path.split('.').next().unwrap_or(path);
        if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Strings are inserted as-is; any other value, `null` included, as JSON text.
fn render(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

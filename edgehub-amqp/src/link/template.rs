//! URI path templates used to route link addresses

use std::collections::HashMap;

/// Name of the trailing variable that binds the remainder of a path
const CATCH_ALL: &str = "params";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),

    /// Trailing `{params}`, binds every remaining segment
    CatchAll(String),
}

/// A path template such as `/devices/{deviceId}/messages/events`.
///
/// Literal segments match case-insensitively, `{name}` binds exactly one non-empty segment and
/// a trailing `{params}` binds the remainder of the path (possibly empty). Segments are matched
/// as they appear in the address, no percent-decoding is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriPathTemplate {
    template: String,
    segments: Vec<Segment>,
}

impl UriPathTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into();
        let raw: Vec<&str> = split_path(&template).collect();
        let last = raw.len().saturating_sub(1);
        let segments = raw
            .iter()
            .enumerate()
            .map(|(i, s)| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) if i == last && name == CATCH_ALL => Segment::CatchAll(name.to_string()),
                Some(name) => Segment::Variable(name.to_string()),
                None => Segment::Literal(s.to_string()),
            })
            .collect();
        Self { template, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Matches `path` against the template and returns the bound variables
    pub fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = split_path(path).collect();
        let mut bindings = HashMap::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::CatchAll(name) => {
                    let rest = parts.get(i..).unwrap_or_default().join("/");
                    bindings.insert(name.clone(), rest);
                    return Some(bindings);
                }
                Segment::Literal(literal) => {
                    if !parts.get(i)?.eq_ignore_ascii_case(literal) {
                        return None;
                    }
                }
                Segment::Variable(name) => {
                    let value = parts.get(i)?;
                    if value.is_empty() {
                        return None;
                    }
                    bindings.insert(name.clone(), value.to_string());
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(bindings)
    }
}

impl std::fmt::Display for UriPathTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.template)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.trim_start_matches('/');
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    let empty = trimmed.is_empty();
    trimmed.split('/').filter(move |_| !empty)
}

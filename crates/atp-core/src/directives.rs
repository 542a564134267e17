use serde::{Deserialize, Serialize};
use std::path::Path;

/// A configured watch rule: which anomaly kinds an operator cares about and
/// the question the first escalation tier must answer about them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Directive {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub watches: Vec<String>,
    pub haiku_question: String,
}

impl Directive {
    /// Compiles the pattern strings once; match against the result rather
    /// than re-parsing per kind.
    pub fn compiled_watches(&self) -> Vec<WatchPattern> {
        self.watches
            .iter()
            .map(|raw| WatchPattern::compile(raw))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DirectiveDocument {
    #[serde(default)]
    pub directives: Vec<Directive>,
}

/// Compiled once from a directive's pattern string; three shapes only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchPattern {
    /// The literal `"*"`.
    Any,
    /// `prefix.*` or `prefix_*`: any kind sharing the literal prefix up to
    /// the wildcard.
    Prefix(String),
    Exact(String),
}

impl WatchPattern {
    pub fn compile(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" {
            return Self::Any;
        }
        if let Some(stem) = raw.strip_suffix('*') {
            if stem.ends_with('.') || stem.ends_with('_') {
                return Self::Prefix(stem.to_string());
            }
        }
        Self::Exact(raw.to_string())
    }

    pub fn matches(&self, kind: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => kind.starts_with(prefix.as_str()),
            Self::Exact(exact) => kind == exact,
        }
    }
}

/// A missing directives file is an empty list, not an error; so is a
/// malformed one.
pub fn load_directives(path: &Path) -> Vec<Directive> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    serde_json::from_str::<DirectiveDocument>(&raw)
        .map(|document| document.directives)
        .unwrap_or_default()
}

//! Rule documents: an ordered YAML mapping of category name to rule.
//!
//! ```yaml
//! blog:
//!   color: "#ff8800"
//!   dom: example.com
//!   include: ^/blog/
//!   exclude: [/tag/, /page/\d+]
//! products:
//!   include:
//!     - /shop/
//! ```
//!
//! Document order is priority order. A malformed rule block is skipped with a
//! warning and the rest of the document still loads.

use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_COLOR: &str = "#aaaaaa";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("rule document must be a mapping of category names to rules, got {0}")]
    NotAMapping(&'static str),

    #[error("category '{0}' is defined more than once")]
    DuplicateCategory(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRule {
    pub name: String,
    /// Host the rule is limited to, subdomains included. `None` matches any host.
    pub domain: Option<String>,
    pub color: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl CategoryRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: None,
            color: DEFAULT_COLOR.to_string(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// A rule block that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRule {
    pub name: String,
    pub reason: String,
}

/// Ordered rules; earlier rules win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<CategoryRule>,
    skipped: Vec<SkippedRule>,
}

/// A recognized field of a rule body.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RuleField {
    Color(String),
    Domain(Option<String>),
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl RuleSet {
    pub fn new(rules: Vec<CategoryRule>) -> Self {
        Self {
            rules,
            skipped: Vec::new(),
        }
    }

    /// Parse a rule document. An empty document is an empty rule set.
    pub fn parse(document: &str) -> Result<Self, RuleError> {
        let blank = document.lines().all(|line| {
            let line = line.trim();
            line.is_empty() || line.starts_with('#')
        });
        if blank {
            return Ok(Self::default());
        }

        let root: Value = serde_yaml::from_str(document)?;
        let entries = match root {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(entries) => entries,
            other => return Err(RuleError::NotAMapping(kind_of(&other))),
        };

        let mut set = Self::default();
        for (key, body) in entries {
            let Some(name) = scalar_string(&key) else {
                set.skip(format!("{:?}", key), "category name must be a scalar");
                continue;
            };
            match parse_rule(&name, body) {
                Ok(rule) => set.rules.push(rule),
                Err(reason) => set.skip(name, &reason),
            }
        }

        Ok(set)
    }

    fn skip(&mut self, name: String, reason: &str) {
        warn!(category = %name, reason, "skipping invalid categorization rule");
        self.skipped.push(SkippedRule {
            name,
            reason: reason.to_string(),
        });
    }

    pub fn rules(&self) -> &[CategoryRule] {
        &self.rules
    }

    pub fn skipped(&self) -> &[SkippedRule] {
        &self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Serialize back to a document that parses to the same rules, in order.
    ///
    /// A document cannot hold two categories with the same name, so a set
    /// built with duplicates is rejected rather than silently merged.
    pub fn to_yaml(&self) -> Result<String, RuleError> {
        let mut root = Mapping::new();
        for rule in &self.rules {
            let mut body = Mapping::new();
            body.insert("color".into(), Value::String(rule.color.clone()));
            if let Some(domain) = &rule.domain {
                body.insert("dom".into(), Value::String(domain.clone()));
            }
            body.insert("include".into(), string_sequence(&rule.include));
            body.insert("exclude".into(), string_sequence(&rule.exclude));
            let name = Value::String(rule.name.clone());
            if root.contains_key(&name) {
                return Err(RuleError::DuplicateCategory(rule.name.clone()));
            }
            root.insert(name, Value::Mapping(body));
        }

        Ok(serde_yaml::to_string(&Value::Mapping(root))?)
    }
}

fn parse_rule(name: &str, body: Value) -> Result<CategoryRule, String> {
    let mut rule = CategoryRule::new(name);

    let fields = match body {
        Value::Null => return Ok(rule),
        Value::Mapping(fields) => fields,
        other => return Err(format!("rule body must be a mapping, got {}", kind_of(&other))),
    };

    for (key, value) in fields {
        let Some(key) = key.as_str() else {
            return Err("field names must be strings".to_string());
        };
        match parse_field(key, value)? {
            Some(RuleField::Color(color)) => rule.color = color,
            Some(RuleField::Domain(domain)) => rule.domain = domain,
            Some(RuleField::Include(patterns)) => rule.include = patterns,
            Some(RuleField::Exclude(patterns)) => rule.exclude = patterns,
            None => debug!(category = %name, field = key, "ignoring unknown rule field"),
        }
    }

    Ok(rule)
}

fn parse_field(key: &str, value: Value) -> Result<Option<RuleField>, String> {
    let field = match key {
        "color" => {
            let color = match &value {
                Value::Null => DEFAULT_COLOR.to_string(),
                v => scalar_string(v).ok_or_else(|| "color must be a string".to_string())?,
            };
            let color = color.trim().trim_matches(|c| c == '"' || c == '\'').trim();
            RuleField::Color(if color.is_empty() {
                DEFAULT_COLOR.to_string()
            } else {
                color.to_string()
            })
        }
        "dom" => {
            let domain = match &value {
                Value::Null => None,
                v => Some(scalar_string(v).ok_or_else(|| "dom must be a string".to_string())?),
            };
            RuleField::Domain(domain.filter(|d| !d.trim().is_empty()))
        }
        "include" => RuleField::Include(pattern_list(key, value)?),
        "exclude" => RuleField::Exclude(pattern_list(key, value)?),
        _ => return Ok(None),
    };

    Ok(Some(field))
}

/// A single pattern or a list of patterns.
fn pattern_list(key: &str, value: Value) -> Result<Vec<String>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                scalar_string(item).ok_or_else(|| format!("{} entries must be strings", key))
            })
            .collect(),
        other => scalar_string(&other)
            .map(|pattern| vec![pattern])
            .ok_or_else(|| format!("{} must be a string or a list of strings", key)),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_sequence(items: &[String]) -> Value {
    Value::Sequence(items.iter().cloned().map(Value::String).collect())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

//! Compiled rule sets and URL classification.

use regex::{Regex, RegexBuilder};
use tracing::warn;
use url::Url;

use super::rules::RuleSet;

/// Reserved name for URLs no rule claims.
pub const UNCATEGORIZED: &str = "Uncategorized";

const PATTERN_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category<'a> {
    Rule(&'a str),
    Uncategorized,
}

impl<'a> Category<'a> {
    pub fn name(&self) -> &'a str {
        match *self {
            Category::Rule(name) => name,
            Category::Uncategorized => UNCATEGORIZED,
        }
    }

    pub fn rule_name(&self) -> Option<&'a str> {
        match *self {
            Category::Rule(name) => Some(name),
            Category::Uncategorized => None,
        }
    }
}

/// A pattern that failed to compile and was left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPattern {
    pub category: String,
    pub pattern: String,
    pub error: String,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    color: String,
    domain: Option<String>,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl CompiledRule {
    fn host_matches(&self, host: &str) -> bool {
        match &self.domain {
            None => true,
            Some(domain) => {
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
        }
    }

    fn matches(&self, host: &str, target: &str) -> bool {
        self.host_matches(host)
            && self.include.iter().any(|re| re.is_match(target))
            && !self.exclude.iter().any(|re| re.is_match(target))
    }
}

/// Classifies URLs against a rule set. Classification is a pure function of
/// the rules and the URL.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    rules: Vec<CompiledRule>,
    invalid: Vec<InvalidPattern>,
}

impl Matcher {
    /// Compile every pattern case-insensitively. Patterns that fail to
    /// compile are dropped and reported through [`Matcher::invalid_patterns`].
    pub fn compile(rules: &RuleSet) -> Self {
        let mut invalid = Vec::new();

        let compiled = rules
            .rules()
            .iter()
            .map(|rule| {
                let mut compile_all = |patterns: &[String]| -> Vec<Regex> {
                    patterns
                        .iter()
                        .filter(|p| !p.trim().is_empty())
                        .filter_map(|pattern| match compile_pattern(pattern) {
                            Ok(re) => Some(re),
                            Err(e) => {
                                warn!(
                                    category = %rule.name,
                                    pattern = %pattern,
                                    error = %e,
                                    "skipping invalid categorization pattern"
                                );
                                invalid.push(InvalidPattern {
                                    category: rule.name.clone(),
                                    pattern: pattern.clone(),
                                    error: e.to_string(),
                                });
                                None
                            }
                        })
                        .collect()
                };
                let include = compile_all(&rule.include);
                let exclude = compile_all(&rule.exclude);

                CompiledRule {
                    name: rule.name.clone(),
                    color: rule.color.clone(),
                    domain: rule.domain.as_deref().map(normalize_domain),
                    include,
                    exclude,
                }
            })
            .collect();

        Self {
            rules: compiled,
            invalid,
        }
    }

    pub fn invalid_patterns(&self) -> &[InvalidPattern] {
        &self.invalid
    }

    /// `(name, color)` of every rule, in priority order.
    pub fn categories(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rules
            .iter()
            .map(|rule| (rule.name.as_str(), rule.color.as_str()))
    }

    /// Category of `url`. URLs that cannot be parsed are uncategorized.
    pub fn classify(&self, url: &str) -> Category<'_> {
        match split_url(url) {
            Some((host, target)) => self.classify_parts(&host, &target),
            None => Category::Uncategorized,
        }
    }

    /// Category for an already split URL: lowercase `host`, and `target` as
    /// path plus `?query`.
    pub fn classify_parts(&self, host: &str, target: &str) -> Category<'_> {
        self.rules
            .iter()
            .find(|rule| rule.matches(host, target))
            .map(|rule| Category::Rule(&rule.name))
            .unwrap_or(Category::Uncategorized)
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
}

/// `https://Shop.Example.com/` -> `shop.example.com`
fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim().to_ascii_lowercase();
    let domain = domain
        .strip_prefix("https://")
        .or_else(|| domain.strip_prefix("http://"))
        .unwrap_or(&domain);
    domain.trim_end_matches('/').to_string()
}

/// Lowercase host and path-plus-query of `url`. Scheme-less URLs are read
/// as `http`.
fn split_url(url: &str) -> Option<(String, String)> {
    let url = url.trim();
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("http://{}", url)).ok()?
        }
        Err(_) => return None,
    };

    let host = parsed.host_str()?.to_ascii_lowercase();
    let mut target = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        target.push('?');
        target.push_str(query);
    }

    Some((host, target))
}

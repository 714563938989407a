//! Match-mutate rules and their precedence order.
//!
//! A rule pairs a pattern over `repository:tag` references with the
//! mutation applied to images it matches. Patterns are literal text with
//! two wildcards:
//!
//! - `*` matches any run of characters, including `/` and `:`
//! - `{name}` matches one path/tag component (no `/` or `:`) and captures it
//!
//! Captures can be substituted into the rule's `baseImage` template, e.g.
//! `app/{name}:{tag}` → `docker.io/library/{name}:{tag}`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;

use crate::config::ImageSpec;
use crate::error::{GatewayError, Result};

/// What to do to an image matched by a rule, rendered for one reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mutation {
    /// Upstream image the result is derived from
    pub base_image: String,
    /// Labels set on the image config
    pub labels: BTreeMap<String, String>,
    /// Annotations set on the manifest
    pub annotations: BTreeMap<String, String>,
    /// `KEY=VALUE` entries set in the image config environment
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Any,
    Capture(String),
}

/// An immutable, compiled match-mutate rule.
#[derive(Debug)]
pub struct Rule {
    spec: ImageSpec,
    regex: Regex,
    base_image: Vec<Token>,
    literal_len: usize,
    wildcards: usize,
}

impl Rule {
    /// Compile a rule from its configuration record.
    pub fn new(spec: &ImageSpec) -> Result<Self> {
        if spec.pattern.is_empty() {
            return Err(GatewayError::RuleError("empty match pattern".to_string()));
        }
        if spec.base_image.is_empty() {
            return Err(GatewayError::RuleError(format!(
                "rule '{}' has no baseImage",
                spec.pattern
            )));
        }
        if let Some(entry) = spec.env.iter().find(|e| !e.contains('=')) {
            return Err(GatewayError::RuleError(format!(
                "rule '{}': env entry '{}' is not KEY=VALUE",
                spec.pattern, entry
            )));
        }

        let tokens = tokenize(&spec.pattern, true)?;
        let mut source = String::from("^");
        let mut captures = Vec::new();
        let mut literal_len = 0;
        let mut wildcards = 0;
        for token in &tokens {
            match token {
                Token::Literal(text) => {
                    literal_len += text.chars().count();
                    source.push_str(&regex::escape(text));
                }
                Token::Any => {
                    wildcards += 1;
                    source.push_str(".*");
                }
                Token::Capture(name) => {
                    if captures.contains(name) {
                        return Err(GatewayError::RuleError(format!(
                            "rule '{}' captures '{}' twice",
                            spec.pattern, name
                        )));
                    }
                    wildcards += 1;
                    source.push_str(&format!("(?P<{}>[^/:]+)", name));
                    captures.push(name.clone());
                }
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| {
            GatewayError::RuleError(format!("rule '{}': {}", spec.pattern, e))
        })?;

        let base_image = tokenize(&spec.base_image, false)?;
        for token in &base_image {
            if let Token::Capture(name) = token {
                if !captures.contains(name) {
                    return Err(GatewayError::RuleError(format!(
                        "rule '{}': baseImage uses unknown capture '{}'",
                        spec.pattern, name
                    )));
                }
            }
        }

        Ok(Self {
            spec: spec.clone(),
            regex,
            base_image,
            literal_len,
            wildcards,
        })
    }

    /// The pattern this rule was compiled from.
    pub fn pattern(&self) -> &str {
        &self.spec.pattern
    }

    /// The configuration record this rule was compiled from.
    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    /// Total precedence order: more literal text first, then fewer wildcards.
    ///
    /// Rules that compare equal keep their input order under a stable sort.
    pub fn cmp_precedence(&self, other: &Rule) -> Ordering {
        other
            .literal_len
            .cmp(&self.literal_len)
            .then(self.wildcards.cmp(&other.wildcards))
    }

    /// Match a `repository:tag` reference, rendering the mutation on success.
    pub fn matches(&self, reference: &str) -> Option<Mutation> {
        let caps = self.regex.captures(reference)?;

        let mut base_image = String::new();
        for token in &self.base_image {
            match token {
                Token::Literal(text) => base_image.push_str(text),
                Token::Capture(name) => {
                    base_image.push_str(caps.name(name).map_or("", |m| m.as_str()))
                }
                Token::Any => {}
            }
        }

        Some(Mutation {
            base_image,
            labels: self.spec.labels.clone(),
            annotations: self.spec.annotations.clone(),
            env: self.spec.env.clone(),
        })
    }
}

/// Split a pattern or template into literal runs and wildcards.
///
/// With `star_is_wildcard` unset, `*` is kept as literal text.
fn tokenize(input: &str, star_is_wildcard: bool) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '*' if star_is_wildcard => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Any);
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(GatewayError::RuleError(format!(
                        "unterminated capture in '{}'",
                        input
                    )));
                }
                if !is_capture_name(&name) {
                    return Err(GatewayError::RuleError(format!(
                        "invalid capture name '{{{}}}' in '{}'",
                        name, input
                    )));
                }
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Capture(name));
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

fn is_capture_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// An ordered rule list resolved first-match-wins.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    /// Sort rules by precedence. Equal rules keep their input order.
    pub fn new(mut rules: Vec<Arc<Rule>>) -> Self {
        rules.sort_by(|a, b| a.cmp_precedence(b));
        Self { rules }
    }

    /// Compile configured specs, failing on the first invalid one.
    pub fn from_specs(specs: &[ImageSpec]) -> Result<Self> {
        let rules = specs
            .iter()
            .map(|spec| Rule::new(spec).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    /// Rules in precedence order.
    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Mutation of the first rule accepting `reference`.
    pub fn find(&self, reference: &str) -> Option<Mutation> {
        self.rules.iter().find_map(|rule| rule.matches(reference))
    }
}

//! Ordered URL rewriting.
//!
//! Every rule is a regular expression and a replacement template. Rules are
//! applied in order, each one to the output of the previous rule, and each
//! replaces only its first match.

use regex::Regex;
use std::{borrow::Cow, fmt, str::FromStr};

/// Error produced while parsing a rewrite rule.
#[derive(thiserror::Error, Debug)]
pub enum RuleError {
    #[error("invalid url_rewrite \"{0}\": rule must start and end with the same delimiter")]
    Delimiter(String),

    #[error("invalid url_rewrite \"{0}\": expected <d>pattern<d>replacement<d>")]
    Shape(String),

    #[error("invalid url_rewrite \"{rule}\": {source}")]
    Pattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// A single `(pattern, replacement)` pair.
#[derive(Clone)]
pub struct RewriteRule {
    pattern: Regex,
    replacement: String,
}

impl RewriteRule {
    pub fn new(pattern: Regex, replacement: impl Into<String>) -> Self {
        Self {
            pattern,
            replacement: replacement.into(),
        }
    }

    /// Replace the first match of the pattern, if any.
    ///
    /// The replacement is a template: `$1`, `${name}` and `$$` expand as in
    /// [`Regex::replace`].
    pub fn apply<'a>(&self, url: &'a str) -> Cow<'a, str> {
        self.pattern.replace(url, self.replacement.as_str())
    }
}

impl FromStr for RewriteRule {
    type Err = RuleError;

    /// Parses `<d>pattern<d>replacement<d>`, where `<d>` is any single
    /// character that opens and closes the rule.
    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        let mut chars = rule.chars();
        let (first, last) = match (chars.next(), chars.next_back()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(RuleError::Delimiter(rule.to_owned())),
        };
        if first != last {
            return Err(RuleError::Delimiter(rule.to_owned()));
        }

        let body = chars.as_str();
        let mut parts = body.split(first);
        let (pattern, replacement) = match (parts.next(), parts.next(), parts.next()) {
            (Some(pattern), Some(replacement), None) => (pattern, replacement),
            _ => return Err(RuleError::Shape(rule.to_owned())),
        };

        let pattern = Regex::new(pattern).map_err(|source| RuleError::Pattern {
            rule: rule.to_owned(),
            source,
        })?;

        Ok(RewriteRule::new(pattern, replacement))
    }
}

impl fmt::Debug for RewriteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewriteRule")
            .field("pattern", &self.pattern.as_str())
            .field("replacement", &self.replacement)
            .finish()
    }
}

/// The ordered rule list, built once at startup.
#[derive(Clone, Debug, Default)]
pub struct Rewriter {
    rules: Vec<RewriteRule>,
}

impl Rewriter {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self { rules }
    }

    /// Parse a whitespace separated list of rules.
    pub fn parse<'a>(rules: impl IntoIterator<Item = &'a str>) -> Result<Self, RuleError> {
        rules
            .into_iter()
            .flat_map(str::split_whitespace)
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run `url` through every rule in order. Never fails; a URL no rule
    /// matches comes back unchanged.
    pub fn rewrite(&self, url: &str) -> String {
        self.rules
            .iter()
            .fold(url.to_owned(), |out, rule| match rule.apply(&out) {
                Cow::Borrowed(_) => out,
                Cow::Owned(rewritten) => rewritten,
            })
    }
}

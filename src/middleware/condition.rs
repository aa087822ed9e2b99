//! Conditional middleware execution.
//!
//! # Responsibilities
//! - Match request path (exact, prefix with trailing `*`, substring, regex)
//! - Match request method (case-insensitive)
//! - Match header values (header names case-insensitive)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Every cache is an LRU with a fixed capacity, so high path cardinality
//!   cannot grow memory without bound
//! - Patterns compile once and are shared through the pattern cache
//! - Empty condition list = always matches

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use regex::Regex;

use crate::config::MiddlewareSettings;
use crate::context::Context;
use crate::error::{RouterError, RouterResult};
use crate::observability::metrics;

/// Custom predicate evaluated against a request.
pub type Predicate = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// What part of the request a condition inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionKind {
    Path,
    Method,
    /// Header with the given name.
    Header(String),
    Custom,
}

/// How the condition value is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Equals,
    Contains,
    Matches,
    Custom,
}

/// Value a condition compares against.
#[derive(Clone)]
pub enum ConditionValue {
    Text(String),
    /// Regular expression source, compiled through the pattern cache.
    Pattern(String),
    Predicate(Predicate),
}

impl fmt::Debug for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::Text(t) => f.debug_tuple("Text").field(t).finish(),
            ConditionValue::Pattern(p) => f.debug_tuple("Pattern").field(p).finish(),
            ConditionValue::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A single guard on middleware execution.
#[derive(Debug, Clone)]
pub struct Condition {
    pub kind: ConditionKind,
    pub value: ConditionValue,
    pub operator: ConditionOperator,
}

impl Condition {
    /// Exact path match; a trailing `*` turns it into a prefix match.
    pub fn path_equals(path: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Path,
            value: ConditionValue::Text(path.into()),
            operator: ConditionOperator::Equals,
        }
    }

    pub fn path_contains(fragment: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Path,
            value: ConditionValue::Text(fragment.into()),
            operator: ConditionOperator::Contains,
        }
    }

    pub fn path_matches(pattern: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Path,
            value: ConditionValue::Pattern(pattern.into()),
            operator: ConditionOperator::Matches,
        }
    }

    /// Method match; a comma-separated list matches any of its entries.
    pub fn method_equals(method: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Method,
            value: ConditionValue::Text(method.into()),
            operator: ConditionOperator::Equals,
        }
    }

    pub fn method_in(methods: &[&str]) -> Self {
        Self {
            kind: ConditionKind::Method,
            value: ConditionValue::Text(methods.join(",")),
            operator: ConditionOperator::Contains,
        }
    }

    pub fn header_equals(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Header(name.into()),
            value: ConditionValue::Text(value.into()),
            operator: ConditionOperator::Equals,
        }
    }

    pub fn header_contains(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Header(name.into()),
            value: ConditionValue::Text(value.into()),
            operator: ConditionOperator::Contains,
        }
    }

    pub fn header_matches(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Header(name.into()),
            value: ConditionValue::Pattern(pattern.into()),
            operator: ConditionOperator::Matches,
        }
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        Self {
            kind: ConditionKind::Custom,
            value: ConditionValue::Predicate(Arc::new(predicate)),
            operator: ConditionOperator::Custom,
        }
    }

    /// Reject conditions that can never be evaluated.
    pub(crate) fn validate(&self) -> RouterResult<()> {
        match (&self.value, self.operator) {
            (ConditionValue::Pattern(p), _) => Regex::new(p)
                .map(|_| ())
                .map_err(|e| RouterError::config(format!("invalid condition pattern '{p}': {e}"))),
            (ConditionValue::Text(_), ConditionOperator::Custom) => Err(RouterError::config(
                "custom operator requires a predicate value",
            )),
            (ConditionValue::Text(_), _) if self.kind == ConditionKind::Custom => Err(
                RouterError::config("custom condition requires a predicate value"),
            ),
            _ => Ok(()),
        }
    }
}

/// Occupancy of each condition cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub exact: usize,
    pub prefix: usize,
    pub pattern: usize,
    pub method: usize,
    pub header: usize,
}

/// Bounded caches backing condition evaluation.
pub struct ConditionCache {
    exact: Mutex<LruCache<String, bool>>,
    prefix: Mutex<LruCache<String, bool>>,
    patterns: Mutex<LruCache<String, Arc<Regex>>>,
    methods: Mutex<LruCache<String, Arc<str>>>,
    headers: Mutex<LruCache<String, Arc<str>>>,
}

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl ConditionCache {
    pub fn new(settings: &MiddlewareSettings) -> Self {
        Self {
            exact: Mutex::new(LruCache::new(capacity(settings.exact_cache_size))),
            prefix: Mutex::new(LruCache::new(capacity(settings.prefix_cache_size))),
            patterns: Mutex::new(LruCache::new(capacity(settings.pattern_cache_size))),
            methods: Mutex::new(LruCache::new(capacity(settings.method_cache_size))),
            headers: Mutex::new(LruCache::new(capacity(settings.header_cache_size))),
        }
    }

    /// True when every condition holds.
    pub fn matches_all(&self, conditions: &[Condition], ctx: &Context) -> bool {
        conditions.iter().all(|c| self.matches(c, ctx))
    }

    pub fn matches(&self, condition: &Condition, ctx: &Context) -> bool {
        if let ConditionValue::Predicate(predicate) = &condition.value {
            return predicate(ctx);
        }
        match &condition.kind {
            ConditionKind::Path => self.match_path(condition, ctx.path()),
            ConditionKind::Method => self.match_method(condition, ctx.method()),
            ConditionKind::Header(name) => {
                let name = self.normalized_header(name);
                match ctx.header(&name) {
                    Some(actual) => self.match_text(condition, actual),
                    None => false,
                }
            }
            ConditionKind::Custom => false,
        }
    }

    fn match_path(&self, condition: &Condition, path: &str) -> bool {
        match (&condition.value, condition.operator) {
            (ConditionValue::Text(expected), ConditionOperator::Equals) => {
                match expected.strip_suffix('*') {
                    Some(prefix) => self.cached_prefix(prefix, path),
                    None => self.cached_exact(expected, path),
                }
            }
            _ => self.match_text(condition, path),
        }
    }

    fn match_method(&self, condition: &Condition, method: &str) -> bool {
        match (&condition.value, condition.operator) {
            (ConditionValue::Text(expected), ConditionOperator::Equals)
            | (ConditionValue::Text(expected), ConditionOperator::Contains) => self
                .normalized_method(expected)
                .split(',')
                .any(|m| m.trim() == method),
            _ => self.match_text(condition, method),
        }
    }

    fn match_text(&self, condition: &Condition, actual: &str) -> bool {
        match (&condition.value, condition.operator) {
            (ConditionValue::Text(expected), ConditionOperator::Equals) => actual == expected,
            (ConditionValue::Text(expected), ConditionOperator::Contains) => actual.contains(expected.as_str()),
            (ConditionValue::Text(source), ConditionOperator::Matches)
            | (ConditionValue::Pattern(source), _) => match self.pattern(source) {
                Some(regex) => regex.is_match(actual),
                None => false,
            },
            _ => false,
        }
    }

    fn cached_exact(&self, expected: &str, path: &str) -> bool {
        let key = format!("{expected}\u{0}{path}");
        let mut cache = self.exact.lock().expect("exact path cache mutex poisoned");
        if let Some(hit) = cache.get(&key) {
            metrics::record_condition_cache("exact", true);
            return *hit;
        }
        metrics::record_condition_cache("exact", false);
        let result = expected == path;
        cache.put(key, result);
        result
    }

    fn cached_prefix(&self, prefix: &str, path: &str) -> bool {
        let key = format!("{prefix}\u{0}{path}");
        let mut cache = self.prefix.lock().expect("prefix path cache mutex poisoned");
        if let Some(hit) = cache.get(&key) {
            metrics::record_condition_cache("prefix", true);
            return *hit;
        }
        metrics::record_condition_cache("prefix", false);
        let result = path.starts_with(prefix);
        cache.put(key, result);
        result
    }

    fn pattern(&self, source: &str) -> Option<Arc<Regex>> {
        let mut cache = self.patterns.lock().expect("pattern cache mutex poisoned");
        if let Some(regex) = cache.get(source) {
            metrics::record_condition_cache("pattern", true);
            return Some(Arc::clone(regex));
        }
        metrics::record_condition_cache("pattern", false);
        match Regex::new(source) {
            Ok(regex) => {
                let regex = Arc::new(regex);
                cache.put(source.to_string(), Arc::clone(&regex));
                Some(regex)
            }
            Err(e) => {
                tracing::warn!(pattern = %source, error = %e, "Invalid condition pattern");
                None
            }
        }
    }

    fn normalized_method(&self, method: &str) -> Arc<str> {
        let mut cache = self.methods.lock().expect("method cache mutex poisoned");
        if let Some(hit) = cache.get(method) {
            return Arc::clone(hit);
        }
        let normalized: Arc<str> = Arc::from(method.to_ascii_uppercase());
        cache.put(method.to_string(), Arc::clone(&normalized));
        normalized
    }

    fn normalized_header(&self, name: &str) -> Arc<str> {
        let mut cache = self.headers.lock().expect("header cache mutex poisoned");
        if let Some(hit) = cache.get(name) {
            return Arc::clone(hit);
        }
        let normalized: Arc<str> = Arc::from(name.to_ascii_lowercase());
        cache.put(name.to_string(), Arc::clone(&normalized));
        normalized
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            exact: self.exact.lock().expect("exact path cache mutex poisoned").len(),
            prefix: self.prefix.lock().expect("prefix path cache mutex poisoned").len(),
            pattern: self.patterns.lock().expect("pattern cache mutex poisoned").len(),
            method: self.methods.lock().expect("method cache mutex poisoned").len(),
            header: self.headers.lock().expect("header cache mutex poisoned").len(),
        }
    }

    /// Drop result caches that are close to capacity.
    ///
    /// Returns the number of caches cleared. Compiled patterns and normalized
    /// names are kept; they are cheap to hold and expensive to rebuild.
    pub fn check_cache_pressure(&self) -> usize {
        let mut cleared = 0;
        for (name, cache) in [("exact", &self.exact), ("prefix", &self.prefix)] {
            let mut cache = cache.lock().expect("path cache mutex poisoned");
            let len = cache.len();
            let cap = cache.cap().get();
            if len * 10 >= cap * 9 {
                tracing::debug!(cache = name, len, cap, "Condition cache under pressure, clearing");
                cache.clear();
                cleared += 1;
            }
        }
        let stats = self.stats();
        tracing::trace!(?stats, "Condition cache pressure check complete");
        cleared
    }

    pub fn clear(&self) {
        self.exact.lock().expect("exact path cache mutex poisoned").clear();
        self.prefix.lock().expect("prefix path cache mutex poisoned").clear();
        self.patterns.lock().expect("pattern cache mutex poisoned").clear();
        self.methods.lock().expect("method cache mutex poisoned").clear();
        self.headers.lock().expect("header cache mutex poisoned").clear();
    }
}

impl fmt::Debug for ConditionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionCache").field("stats", &self.stats()).finish()
    }
}

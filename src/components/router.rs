//! Request routing orchestration
//!
//! Collects the rules matching a request, runs the weighted selector, and
//! memoizes decisions where that is safe. The rule list is immutable after
//! construction and shared read-only across request tasks.

use crate::components::matcher::{ConditionType, RequestView, RuleEngine};
use crate::components::selector::{select_backend, Selection};
use crate::config::{Config, RoutingRule};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Cache key: the decision is a pure function of these three for
/// condition-free rule sets.
type DecisionKey = (String, String, String);

pub struct Router {
    config: Arc<Config>,
    engine: RuleEngine,
    /// Memoized `(session, method, path) -> rule index` decisions.
    cache: DashMap<DecisionKey, Option<usize>>,
    /// A triple-keyed cache is only sound when no rule reads headers, query,
    /// cookies or body. Otherwise it stays empty.
    cacheable: bool,
    has_form_conditions: bool,
}

/// A routing decision scoped to the request that produced it.
pub struct RouteDecision<'a> {
    pub backend: &'a str,
    pub rule: Option<&'a RoutingRule>,
}

impl Router {
    pub fn new(config: Arc<Config>) -> Self {
        let cacheable = config
            .rules
            .iter()
            .all(|rule| rule.conditions.is_empty());
        let has_form_conditions = config.rules.iter().any(|rule| {
            rule.conditions
                .iter()
                .any(|c| ConditionType::parse(&c.condition_type) == ConditionType::Form)
        });
        Self {
            engine: RuleEngine::new(config.debug),
            cache: DashMap::new(),
            cacheable,
            has_form_conditions,
            config,
        }
    }

    /// Whether any configured rule inspects form bodies; the caller must
    /// buffer form bodies up front when this is set.
    pub fn has_form_conditions(&self) -> bool {
        self.has_form_conditions
    }

    /// Decide which backend receives this request.
    pub fn decide<'s>(&'s self, req: &RequestView<'_>, session_id: &str) -> RouteDecision<'s> {
        let key = self.cacheable.then(|| {
            (
                session_id.to_string(),
                req.method.to_string(),
                req.path.to_string(),
            )
        });
        if let Some(key) = &key {
            if let Some(entry) = self.cache.get(key) {
                let cached = *entry;
                drop(entry);
                return self.decision_from_index(cached);
            }
        }

        let matching: Vec<&RoutingRule> = self
            .config
            .rules
            .iter()
            .filter(|rule| self.engine.rule_matches(req, rule))
            .collect();

        if self.config.debug {
            debug!(
                "{} rule(s) match {} {}",
                matching.len(),
                req.method,
                req.path
            );
        }

        let selection = select_backend(&self.config, &matching, session_id);

        if let Some(key) = key {
            self.cache.insert(key, self.index_of(&selection));
        }

        RouteDecision {
            backend: selection.backend,
            rule: selection.rule,
        }
    }

    /// Wholesale cache clear, driven by the housekeeping timer.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    fn index_of(&self, selection: &Selection<'_>) -> Option<usize> {
        let rule = selection.rule?;
        self.config
            .rules
            .iter()
            .position(|candidate| std::ptr::eq(candidate, rule))
    }

    fn decision_from_index(&self, index: Option<usize>) -> RouteDecision<'_> {
        match index {
            Some(i) => {
                let rule = &self.config.rules[i];
                RouteDecision {
                    backend: &rule.backend,
                    rule: Some(rule),
                }
            }
            None => RouteDecision {
                backend: &self.config.default_backend,
                rule: None,
            },
        }
    }
}

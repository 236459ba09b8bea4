//! Weighted backend selection
//!
//! Given the rules that matched a request and the client's session id,
//! deterministically pick one backend so that backend share converges to the
//! configured percentages across sessions while any single session always
//! lands on the same backend for the same rule set.
//!
//! The stickiness hash digests the session id together with the identity of
//! every matched rule (affinity token, or path + method + backend). Re-keying
//! an experiment therefore legitimately re-buckets sessions; an unchanged
//! rule set never does.

use crate::config::{Config, RoutingRule};
use fnv::FnvHasher;
use std::hash::Hasher;

/// The outcome of a routing decision: the backend to forward to and the rule
/// that claimed the request, if any. Borrows from the configuration for the
/// duration of the request.
pub struct Selection<'a> {
    pub backend: &'a str,
    pub rule: Option<&'a RoutingRule>,
}

/// Accumulated weight for one backend within the top priority tier.
struct BackendWeight<'a> {
    backend: &'a str,
    total: f64,
    /// A zero-percentage contributor makes the backend unconditional within
    /// its group: its total is taken as 100.
    unconditional: bool,
    first_rule: &'a RoutingRule,
}

impl BackendWeight<'_> {
    fn weight(&self) -> f64 {
        if self.unconditional {
            100.0
        } else {
            self.total
        }
    }
}

/// Pick a backend for this request.
///
/// `matching` is the list of rules that matched, in definition order.
/// Selection:
/// 1. stable-sort by priority descending; a top rule without a percentage is
///    a hard route and wins outright,
/// 2. group the top priority tier's percentages by backend,
/// 3. lay the backends out on `[0, 100)` in URL order (rescaled when the
///    totals exceed 100),
/// 4. hash the session id and the matched rule identities into a point on
///    that range,
/// 5. forward to the interval the point falls in; a remainder not covered by
///    any interval belongs to the default backend.
pub fn select_backend<'a>(
    config: &'a Config,
    matching: &[&'a RoutingRule],
    session_id: &str,
) -> Selection<'a> {
    if matching.is_empty() {
        return Selection {
            backend: &config.default_backend,
            rule: None,
        };
    }

    let mut ordered: Vec<&RoutingRule> = matching.to_vec();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let top = ordered[0];
    if top.percentage <= 0.0 {
        return Selection {
            backend: &top.backend,
            rule: Some(top),
        };
    }

    // Group the top priority tier by backend, in first-seen order.
    let mut weights: Vec<BackendWeight<'a>> = Vec::new();
    for &rule in ordered.iter().take_while(|r| r.priority == top.priority) {
        match weights.iter_mut().find(|w| w.backend == rule.backend) {
            Some(weight) => {
                if rule.percentage > 0.0 {
                    weight.total += rule.percentage;
                } else {
                    weight.unconditional = true;
                }
            }
            None => weights.push(BackendWeight {
                backend: &rule.backend,
                total: rule.percentage.max(0.0),
                unconditional: rule.percentage <= 0.0,
                first_rule: rule,
            }),
        }
    }

    // URL order makes interval assignment reproducible across runs.
    weights.sort_by(|a, b| a.backend.cmp(b.backend));

    let total: f64 = weights.iter().map(BackendWeight::weight).sum();
    let scale = if total > 100.0 { 100.0 / total } else { 1.0 };

    let x = stickiness_point(session_id, matching);

    let mut cumulative = 0.0;
    for weight in &weights {
        cumulative += weight.weight() * scale;
        if x < cumulative {
            return Selection {
                backend: weight.backend,
                rule: Some(weight.first_rule),
            };
        }
    }

    if total < 100.0 {
        // The configured shares do not cover the whole range; the remainder
        // is the default backend's (canary semantics).
        return Selection {
            backend: &config.default_backend,
            rule: None,
        };
    }

    // Intervals tile [0, 100); landing here is floating-point rounding.
    let last = &weights[weights.len() - 1];
    Selection {
        backend: last.backend,
        rule: Some(last.first_rule),
    }
}

/// Deterministic point in `[0, 100)` for this (session, rule set) pair.
///
/// FNV-1a 64 over the session id, then over each matched rule's affinity
/// token when set, else its path + method + backend.
fn stickiness_point(session_id: &str, matching: &[&RoutingRule]) -> f64 {
    let mut hasher = FnvHasher::default();
    hasher.write(session_id.as_bytes());
    for rule in matching {
        if !rule.affinity_token.is_empty() {
            hasher.write(rule.affinity_token.as_bytes());
        } else {
            hasher.write(rule.path.as_bytes());
            hasher.write(rule.method.as_bytes());
            hasher.write(rule.backend.as_bytes());
        }
    }
    (hasher.finish() as f64 / 18_446_744_073_709_551_616.0) * 100.0
}

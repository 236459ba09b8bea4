//! Rule matching pipeline
//!
//! Scores an incoming request against a routing rule: typed value
//! comparison, per-kind condition extraction (header, query, cookie, form)
//! and the whole-rule path/method/conditions check.

use crate::components::session;
use crate::config::{RoutingRule, RuleCondition};
use hyper::HeaderMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Comparison operator of a condition, parsed case-insensitively from the
/// configuration string. Unknown operators never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Contains,
    Prefix,
    Suffix,
    Gt,
    Unknown,
}

impl Operator {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("eq") || s.eq_ignore_ascii_case("equals") {
            Operator::Eq
        } else if s.eq_ignore_ascii_case("contains") {
            Operator::Contains
        } else if s.eq_ignore_ascii_case("prefix") {
            Operator::Prefix
        } else if s.eq_ignore_ascii_case("suffix") {
            Operator::Suffix
        } else if s.eq_ignore_ascii_case("gt") {
            Operator::Gt
        } else {
            Operator::Unknown
        }
    }
}

/// Request attribute a condition inspects. Unknown types never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    Header,
    Query,
    Cookie,
    Form,
    Unknown,
}

impl ConditionType {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("header") {
            ConditionType::Header
        } else if s.eq_ignore_ascii_case("query") {
            ConditionType::Query
        } else if s.eq_ignore_ascii_case("cookie") {
            ConditionType::Cookie
        } else if s.eq_ignore_ascii_case("form") {
            ConditionType::Form
        } else {
            ConditionType::Unknown
        }
    }
}

/// Compare two string values with the given operator.
///
/// `gt` parses both sides as f64; if either side fails to parse the result
/// is false. Unknown operators are false.
pub fn compare_values(actual: &str, operator: &str, expected: &str) -> bool {
    match Operator::parse(operator) {
        Operator::Eq => actual == expected,
        Operator::Contains => actual.contains(expected),
        Operator::Prefix => actual.starts_with(expected),
        Operator::Suffix => actual.ends_with(expected),
        Operator::Gt => match (actual.parse::<f64>(), expected.parse::<f64>()) {
            (Ok(a), Ok(e)) => a > e,
            _ => false,
        },
        Operator::Unknown => false,
    }
}

/// The per-request view the matcher reads. Built once from the request head
/// plus the buffered form body, if any.
pub struct RequestView<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    /// URL-encoded form body, present only when the router buffered it.
    pub form_body: Option<&'a [u8]>,
}

impl<'a> RequestView<'a> {
    pub fn from_parts(parts: &'a http::request::Parts, form_body: Option<&'a [u8]>) -> Self {
        Self {
            method: parts.method.as_str(),
            path: parts.uri.path(),
            query: parts.uri.query(),
            headers: &parts.headers,
            form_body,
        }
    }
}

static UNKNOWN_TYPE_WARNED: AtomicBool = AtomicBool::new(false);

/// Evaluates rules against requests.
pub struct RuleEngine {
    debug: bool,
}

impl RuleEngine {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    /// Check whether a request matches a rule: exact path, then path prefix,
    /// then method, then all conditions (AND, short-circuit).
    pub fn rule_matches(&self, req: &RequestView<'_>, rule: &RoutingRule) -> bool {
        if !rule.path.is_empty() && rule.path != req.path {
            return false;
        }
        if !rule.path_prefix.is_empty() && !req.path.starts_with(&rule.path_prefix) {
            return false;
        }
        if !rule.method.is_empty() && rule.method != req.method {
            return false;
        }
        if rule.conditions.is_empty() {
            return true;
        }
        self.check_conditions(req, &rule.conditions)
    }

    fn check_conditions(&self, req: &RequestView<'_>, conditions: &[RuleCondition]) -> bool {
        conditions.iter().all(|c| self.check_condition(req, c))
    }

    fn check_condition(&self, req: &RequestView<'_>, condition: &RuleCondition) -> bool {
        let result = match ConditionType::parse(&condition.condition_type) {
            ConditionType::Header => self.check_header(req, condition),
            ConditionType::Query => self.check_query(req, condition),
            ConditionType::Cookie => self.check_cookie(req, condition),
            ConditionType::Form => self.check_form(req, condition),
            ConditionType::Unknown => {
                if !UNKNOWN_TYPE_WARNED.swap(true, Ordering::Relaxed) {
                    warn!("unknown condition type: {}", condition.condition_type);
                }
                false
            }
        };
        if self.debug {
            debug!(
                "condition check result for {} {}: {}",
                condition.condition_type, condition.parameter, result
            );
        }
        result
    }

    /// Multi-valued headers match if any value matches. Both sides are
    /// lowercased and trimmed before comparison; header values are the one
    /// condition kind clients routinely case-normalize.
    fn check_header(&self, req: &RequestView<'_>, condition: &RuleCondition) -> bool {
        let expected = condition.value.to_lowercase();
        let expected = expected.trim();
        for value in req.headers.get_all(condition.parameter.as_str()) {
            let Ok(value) = value.to_str() else { continue };
            let actual = value.to_lowercase();
            if compare_values(actual.trim(), &condition.operator, expected) {
                return true;
            }
        }
        false
    }

    /// An absent query parameter compares as the empty string.
    fn check_query(&self, req: &RequestView<'_>, condition: &RuleCondition) -> bool {
        let value = req
            .query
            .and_then(|q| form_value(q.as_bytes(), &condition.query_param))
            .unwrap_or_default();
        compare_values(&value, &condition.operator, &condition.value)
    }

    /// An absent cookie is a non-match, not an empty-string comparison.
    fn check_cookie(&self, req: &RequestView<'_>, condition: &RuleCondition) -> bool {
        match session::cookie_value(req.headers, &condition.parameter) {
            Some(value) => compare_values(&value, &condition.operator, &condition.value),
            None => false,
        }
    }

    /// Requires the buffered form body; a request without one (wrong method
    /// or content type, or a body that failed to decode) never matches. An
    /// absent field compares as the empty string.
    fn check_form(&self, req: &RequestView<'_>, condition: &RuleCondition) -> bool {
        let Some(body) = req.form_body else {
            return false;
        };
        let pairs: Vec<(String, String)> = match serde_urlencoded::from_bytes(body) {
            Ok(pairs) => pairs,
            Err(e) => {
                debug!("error parsing form data: {}", e);
                return false;
            }
        };
        let value = pairs
            .into_iter()
            .find(|(name, _)| name == &condition.parameter)
            .map(|(_, value)| value)
            .unwrap_or_default();
        compare_values(&value, &condition.operator, &condition.value)
    }
}

/// First value of a parameter in an URL-encoded string, or None on absence
/// or decode failure.
fn form_value(encoded: &[u8], name: &str) -> Option<String> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(encoded).ok()?;
    pairs
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, value)| value)
}

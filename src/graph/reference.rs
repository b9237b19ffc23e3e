//! Symbolic `${...}` references between resources.
//!
//! A string attribute may contain references of the form `${name}` or
//! `${name.attribute}`, pointing at another resource of the document, and
//! `${var.name}`, pointing at a document variable. Variables are substituted
//! while the graph is built; resource references stay symbolic until the
//! executor resolves them against applied state.

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use super::node::Attributes;

/// Matches `${target}` and `${target.attribute}`.
static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*([A-Za-z][A-Za-z0-9_-]*)(?:\.([A-Za-z0-9_-]+))?\s*\}")
        .unwrap_or_else(|e| unreachable!("reference pattern is valid: {e}"))
});

/// Namespace of document variables.
pub const VARIABLE_NAMESPACE: &str = "var";

/// A parsed `${...}` reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    /// Referenced logical name (or `var`).
    pub target: String,
    /// Referenced attribute, if any.
    pub attribute: Option<String>,
}

impl Reference {
    /// Returns true if this reference points at a document variable.
    #[must_use]
    pub fn is_variable(&self) -> bool {
        self.target == VARIABLE_NAMESPACE
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.attribute {
            Some(attr) => write!(f, "{}.{attr}", self.target),
            None => write!(f, "{}", self.target),
        }
    }
}

/// Collects every reference found in `value`, recursively.
#[must_use]
pub fn scan(value: &Value) -> BTreeSet<Reference> {
    let mut found = BTreeSet::new();
    visit_strings(value, &mut |s| {
        for caps in REFERENCE_PATTERN.captures_iter(s) {
            found.insert(Reference {
                target: caps[1].to_string(),
                attribute: caps.get(2).map(|m| m.as_str().to_string()),
            });
        }
    });
    found
}

/// Maps each top-level attribute to the resource references it contains.
#[must_use]
pub fn references_by_attribute(attributes: &Attributes) -> BTreeMap<String, BTreeSet<Reference>> {
    attributes
        .iter()
        .filter_map(|(key, value)| {
            let refs: BTreeSet<Reference> =
                scan(value).into_iter().filter(|r| !r.is_variable()).collect();
            (!refs.is_empty()).then(|| (key.clone(), refs))
        })
        .collect()
}

/// Replaces references in `value` using `lookup`.
///
/// A string consisting of exactly one reference takes the looked-up value
/// as is; references embedded in longer strings are interpolated. References
/// for which `skip` returns true are left untouched.
///
/// # Errors
///
/// Returns the first reference `lookup` cannot resolve.
pub fn substitute<F, S>(value: &Value, skip: &S, lookup: &mut F) -> Result<Value, Reference>
where
    F: FnMut(&Reference) -> Option<Value>,
    S: Fn(&Reference) -> bool,
{
    match value {
        Value::String(s) => substitute_str(s, skip, lookup),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, skip, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                out.insert(key.clone(), substitute(item, skip, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Substitutes `${var.*}` references with document variables.
///
/// # Errors
///
/// Returns the first variable missing from `variables`.
pub fn substitute_variables(
    value: &Value,
    variables: &BTreeMap<String, Value>,
) -> Result<Value, Reference> {
    substitute(value, &|r: &Reference| !r.is_variable(), &mut |r| {
        r.attribute.as_ref().and_then(|name| variables.get(name).cloned())
    })
}

fn substitute_str<F, S>(s: &str, skip: &S, lookup: &mut F) -> Result<Value, Reference>
where
    F: FnMut(&Reference) -> Option<Value>,
    S: Fn(&Reference) -> bool,
{
    if let Some(caps) = REFERENCE_PATTERN.captures(s) {
        let whole = caps.get(0).map_or("", |m| m.as_str());
        if whole.len() == s.len() {
            let reference = to_reference(&caps);
            if skip(&reference) {
                return Ok(Value::String(s.to_string()));
            }
            return lookup(&reference).ok_or(reference);
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in REFERENCE_PATTERN.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&s[last..whole.start()]);
        let reference = to_reference(&caps);
        if skip(&reference) {
            out.push_str(whole.as_str());
        } else {
            let resolved = lookup(&reference).ok_or_else(|| reference.clone())?;
            match resolved {
                Value::String(text) => out.push_str(&text),
                other => out.push_str(&other.to_string()),
            }
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn to_reference(caps: &regex::Captures<'_>) -> Reference {
    Reference {
        target: caps[1].to_string(),
        attribute: caps.get(2).map(|m| m.as_str().to_string()),
    }
}

fn visit_strings<F: FnMut(&str)>(value: &Value, f: &mut F) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|item| visit_strings(item, f)),
        Value::Object(map) => map.values().for_each(|item| visit_strings(item, f)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scan_nested_references() {
        let value = json!({
            "image": "${repo.repository_url}:latest",
            "logs": [{ "group": "${scheduler_logs}" }],
            "cluster": "${var.cluster}",
        });
        let refs = scan(&value);
        let targets: Vec<_> = refs.iter().map(ToString::to_string).collect();
        assert_eq!(targets, vec!["repo.repository_url", "scheduler_logs", "var.cluster"]);
    }

    #[test]
    fn test_whole_string_reference_keeps_type() {
        let value = json!("${target.max_capacity}");
        let out = substitute(&value, &|_: &Reference| false, &mut |_| Some(json!(4))).unwrap();
        assert_eq!(out, json!(4));
    }

    #[test]
    fn test_embedded_reference_is_interpolated() {
        let value = json!("service/${cluster.name}/scheduler");
        let out = substitute(&value, &|_: &Reference| false, &mut |r| {
            assert_eq!(r.target, "cluster");
            Some(json!("airflow"))
        })
        .unwrap();
        assert_eq!(out, json!("service/airflow/scheduler"));
    }

    #[test]
    fn test_substitute_variables_leaves_resource_references() {
        let vars = BTreeMap::from([(String::from("env"), json!("prod"))]);
        let value = json!(["airflow-${var.env}", "${repo.arn}"]);
        let out = substitute_variables(&value, &vars).unwrap();
        assert_eq!(out, json!(["airflow-prod", "${repo.arn}"]));
    }

    #[test]
    fn test_missing_variable_is_reported() {
        let value = json!("${var.missing}");
        let err = substitute_variables(&value, &BTreeMap::new()).unwrap_err();
        assert_eq!(err.to_string(), "var.missing");
    }

    #[test]
    fn test_references_by_attribute_skips_variables() {
        let attrs = Attributes::from([
            (String::from("cluster"), json!("${cluster.arn}")),
            (String::from("name"), json!("${var.name}")),
            (String::from("desired_count"), json!(1)),
        ]);
        let by_attr = references_by_attribute(&attrs);
        assert_eq!(by_attr.len(), 1);
        assert!(by_attr.contains_key("cluster"));
    }
}

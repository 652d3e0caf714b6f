//! View filter expressions.
//!
//! Clients describe which resources a view covers with a small JSON tree:
//! a top-level list ANDs its clauses, `{"uri": "pattern"}` matches by
//! topic restriction, `{"uri": {"$re": ".."}}` by regex, `{"meta": {k: v,
//! "$has": k}}` by metadata, `{"ns": [..]}` names namespaces, and
//! `{"$and"/"$or": [..]}` combine. The tree parses into a typed [`Expr`]
//! which is evaluated against `(uri, metadata)` pairs.

use std::collections::BTreeMap;

use bosswave_core::CoreError;
use bosswave_core::Result;
use bosswave_uri::restrict_by;
use regex::Regex;
use serde_json::Value;

/// A parsed view filter.
#[derive(Debug, Clone)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    /// URI covers the message topic under restriction.
    MatchUri(String),
    /// Regex over the full topic.
    RegexUri(String),
    /// Metadata key equals value.
    MetaEq(String, String),
    /// Metadata key is present.
    MetaHas(String),
    /// Topic namespace is one of these (base64url MVKs).
    Namespace(Vec<String>),
}

impl Expr {
    /// Parse a filter tree.
    pub fn from_tree(tree: &Value) -> Result<Expr> {
        parse_global(tree)
    }

    /// Evaluate against a full topic (`ns/suffix`) and its metadata.
    ///
    /// A `RegexUri` pattern that fails to compile evaluates false; the
    /// pattern was validated at parse time.
    pub fn matches(&self, topic: &str, meta: &BTreeMap<String, String>) -> bool {
        match self {
            Expr::And(subs) => subs.iter().all(|e| e.matches(topic, meta)),
            Expr::Or(subs) => subs.iter().any(|e| e.matches(topic, meta)),
            Expr::MatchUri(pattern) => restrict_by(topic, pattern).is_some_and(|merged| merged == topic),
            Expr::RegexUri(pattern) => Regex::new(pattern).map(|re| re.is_match(topic)).unwrap_or(false),
            Expr::MetaEq(k, v) => meta.get(k) == Some(v),
            Expr::MetaHas(k) => meta.contains_key(k),
            Expr::Namespace(names) => {
                let ns = topic.split('/').next().unwrap_or("");
                names.iter().any(|n| n == ns)
            }
        }
    }

    /// Every namespace the filter names, for subscription planning.
    pub fn namespaces(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_namespaces(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_namespaces(&self, out: &mut Vec<String>) {
        match self {
            Expr::And(subs) | Expr::Or(subs) => {
                for e in subs {
                    e.collect_namespaces(out);
                }
            }
            Expr::Namespace(names) => out.extend(names.iter().cloned()),
            _ => {}
        }
    }
}

fn bad(reason: impl Into<String>) -> CoreError {
    CoreError::BadOperation {
        reason: reason.into(),
    }
}

fn parse_global(tree: &Value) -> Result<Expr> {
    let obj = match tree {
        Value::Array(items) => {
            let subs = items.iter().map(parse_global).collect::<Result<Vec<_>>>()?;
            return Ok(Expr::And(subs));
        }
        Value::Object(obj) => obj,
        other => return Err(bad(format!("invalid filter structure: {other}"))),
    };

    let mut clauses = Vec::new();
    for (key, el) in obj {
        match key.as_str() {
            "ns" => {
                let Value::Array(items) = el else {
                    return Err(bad("operand to 'ns' must be an array of strings"));
                };
                let mut names = Vec::with_capacity(items.len());
                for item in items {
                    let Value::String(s) = item else {
                        return Err(bad("operand to 'ns' must be an array of strings"));
                    };
                    names.push(s.clone());
                }
                clauses.push(Expr::Namespace(names));
            }
            "uri" => clauses.push(parse_uri(el)?),
            "meta" => clauses.push(parse_meta(el)?),
            "$and" => {
                let Value::Array(items) = el else {
                    return Err(bad("operand to '$and' must be an array"));
                };
                clauses.push(Expr::And(items.iter().map(parse_global).collect::<Result<Vec<_>>>()?));
            }
            "$or" => {
                let Value::Array(items) = el else {
                    return Err(bad("operand to '$or' must be an array"));
                };
                clauses.push(Expr::Or(items.iter().map(parse_global).collect::<Result<Vec<_>>>()?));
            }
            other => return Err(bad(format!("unexpected key at this scope: {other:?}"))),
        }
    }
    Ok(Expr::And(clauses))
}

fn parse_uri(el: &Value) -> Result<Expr> {
    match el {
        Value::String(pattern) => Ok(Expr::MatchUri(pattern.clone())),
        Value::Object(obj) => {
            let Some(Value::String(pattern)) = obj.get("$re") else {
                return Err(bad("expected a string '$re' pattern"));
            };
            if obj.len() > 1 {
                return Err(bad("unexpected keys in uri filter"));
            }
            Regex::new(pattern).map_err(|e| bad(format!("bad uri regex: {e}")))?;
            Ok(Expr::RegexUri(pattern.clone()))
        }
        other => Err(bad(format!("unexpected uri structure: {other}"))),
    }
}

fn parse_meta(el: &Value) -> Result<Expr> {
    let Value::Object(obj) = el else {
        return Err(bad("operand to 'meta' must be a string map"));
    };
    let mut clauses = Vec::new();
    for (key, value) in obj {
        let Value::String(value) = value else {
            return Err(bad("operand to 'meta' must be a string map"));
        };
        match key.as_str() {
            "$has" => clauses.push(Expr::MetaHas(value.clone())),
            _ => clauses.push(Expr::MetaEq(key.clone(), value.clone())),
        }
    }
    Ok(Expr::And(clauses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_uri_pattern_clause() {
        let ex = Expr::from_tree(&json!({"uri": "ns1/a/+"})).unwrap();
        assert!(ex.matches("ns1/a/b", &meta(&[])));
        assert!(!ex.matches("ns1/a/b/c", &meta(&[])));
    }

    #[test]
    fn test_uri_regex_clause() {
        let ex = Expr::from_tree(&json!({"uri": {"$re": "lamp[0-9]+$"}})).unwrap();
        assert!(ex.matches("ns1/floor2/lamp7", &meta(&[])));
        assert!(!ex.matches("ns1/floor2/switch", &meta(&[])));
    }

    #[test]
    fn test_meta_clauses() {
        let ex = Expr::from_tree(&json!({"meta": {"room": "410", "$has": "owner"}})).unwrap();
        assert!(ex.matches("ns1/x", &meta(&[("room", "410"), ("owner", "ops")])));
        assert!(!ex.matches("ns1/x", &meta(&[("room", "410")])));
        assert!(!ex.matches("ns1/x", &meta(&[("room", "411"), ("owner", "ops")])));
    }

    #[test]
    fn test_top_level_list_is_and() {
        let ex = Expr::from_tree(&json!([{"ns": ["ns1"]}, {"uri": "ns1/a/*"}])).unwrap();
        assert!(ex.matches("ns1/a/b/c", &meta(&[])));
        assert!(!ex.matches("ns2/a/b/c", &meta(&[])));
        assert_eq!(ex.namespaces(), vec!["ns1".to_string()]);
    }

    #[test]
    fn test_or_combinator() {
        let ex = Expr::from_tree(&json!({"$or": [{"uri": "ns1/a"}, {"uri": "ns1/b"}]})).unwrap();
        assert!(ex.matches("ns1/a", &meta(&[])));
        assert!(ex.matches("ns1/b", &meta(&[])));
        assert!(!ex.matches("ns1/c", &meta(&[])));
    }

    #[test]
    fn test_parse_rejections() {
        assert!(Expr::from_tree(&json!({"bogus": 1})).is_err());
        assert!(Expr::from_tree(&json!({"uri": {"$re": "(unclosed"}})).is_err());
        assert!(Expr::from_tree(&json!({"ns": "not-a-list"})).is_err());
        assert!(Expr::from_tree(&json!(42)).is_err());
    }

    #[test]
    fn test_namespace_collection_through_combinators() {
        let ex = Expr::from_tree(&json!({"$or": [{"ns": ["a"]}, {"ns": ["b", "a"]}]})).unwrap();
        assert_eq!(ex.namespaces(), vec!["a".to_string(), "b".to_string()]);
    }
}

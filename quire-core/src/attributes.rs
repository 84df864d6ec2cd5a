//! Formatting attributes carried by retain and insert components.
//!
//! An attribute map is a sorted `key → value` map. On a retain, a
//! [`AttributeValue::Null`] value means "remove this attribute from the
//! retained span"; on an insert, null values are never stored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single formatting attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Removes the attribute when applied through a retain
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

/// Attribute map attached to a component. Empty means "no formatting".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes(BTreeMap<String, AttributeValue>);

impl Attributes {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.0.iter()
    }

    /// Attributes of `b` applied on top of `a`.
    ///
    /// With `keep_null` the null markers of `b` survive (retain composed with
    /// retain); without it they are stripped (insert composed with retain).
    pub fn compose(a: &Attributes, b: &Attributes, keep_null: bool) -> Attributes {
        let mut out = b.0.clone();
        if !keep_null {
            out.retain(|_, v| !v.is_null());
        }
        for (key, value) in &a.0 {
            if !b.0.contains_key(key) {
                out.insert(key.clone(), value.clone());
            }
        }
        Attributes(out)
    }

    /// Rewrite `b` so it can follow `a` over the same span.
    ///
    /// When `a_wins`, keys formatted by both sides are dropped from `b`;
    /// otherwise `b` is kept as is and overrides `a`.
    pub fn transform(a: &Attributes, b: &Attributes, a_wins: bool) -> Attributes {
        if !a_wins {
            return b.clone();
        }
        Attributes(
            b.0.iter()
                .filter(|(key, _)| !a.0.contains_key(*key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Attributes that undo `attr` over a span whose original formatting was `base`.
    pub fn invert(attr: &Attributes, base: &Attributes) -> Attributes {
        let mut out = BTreeMap::new();
        for (key, value) in &base.0 {
            if let Some(applied) = attr.0.get(key) {
                if applied != value {
                    out.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, value) in &attr.0 {
            if !base.0.contains_key(key) && !value.is_null() {
                out.insert(key.clone(), AttributeValue::Null);
            }
        }
        Attributes(out)
    }
}

impl<K: Into<String>, V: Into<AttributeValue>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Attributes(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

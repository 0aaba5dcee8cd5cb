//! The option tree.
//!
//! Task options are an arbitrary nesting of mappings, sequences and scalars,
//! where any position may hold a [`TagExpr`] instead of a concrete value.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SweepError;
use crate::tag::{Tag, TagExpr, with_fresh_tags};

/// A node of an option structure.
///
/// Mappings keep their keys in the order they were written, through
/// substitution and serialization alike. Equality ignores that order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    Tag(TagExpr),
    Map(IndexMap<String, Value>),
}

impl Value {
    /// Builds a mapping from key/value pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Builds a sequence.
    pub fn seq<V, I>(items: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Value::Seq(items.into_iter().map(Into::into).collect())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn at(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Seq(seq) => seq.get(index),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(x) => Some(x),
            Value::Int(x) => Some(x as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(seq) => Some(seq),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> Option<&Tag> {
        match self {
            Value::Tag(expr) => Some(&expr.tag),
            _ => None,
        }
    }

    /// Deserializes concrete options into a typed structure.
    ///
    /// Tags left in the tree are not valid input; substitute them first.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, SweepError> {
        with_fresh_tags(|| serde_json::to_value(self).and_then(serde_json::from_value))
            .map_err(|e| SweepError::InvalidOptions(std::any::type_name::<T>().into(), e))
    }

    /// Reads an option tree from JSON. Tags get fresh identities, shared by
    /// every occurrence of the same tag in `json`.
    pub fn from_json(json: &str) -> Result<Self, SweepError> {
        Ok(with_fresh_tags(|| serde_json::from_str(json))?)
    }
}

macro_rules! impl_from {
    ($($T:ty => $V:ident),* $(,)?) => {$(
        impl From<$T> for Value {
            fn from(value: $T) -> Self {
                Value::$V(value.into())
            }
        }
    )*};
}

impl_from! {
    bool => Bool,
    i32 => Int,
    i64 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    &str => Str,
    String => Str,
    TagExpr => Tag,
    Tag => Tag,
    &Tag => Tag,
    IndexMap<String, Value> => Map,
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value.into_iter().collect())
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Int(value as i64)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::seq(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

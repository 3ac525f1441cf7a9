//! Host-side representation of JavaScript values.
//!
//! `JsValue` is the currency of every boundary crossing: binding arguments,
//! binding results, and evaluation results are all expressed in it. Unlike a
//! JSON value it can represent `undefined`, NaN and ±Infinity, insertion
//! ordering, `Map`/`Set`, and error objects.
//!
//! Note: the Serialize/Deserialize implementations are manually implemented
//! because `Map`, `Set`, and `Error` have no faithful JSON shape.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::runtime::error::{Error, Result, ScriptError};

/// A JavaScript value owned by the host.
///
/// Composite variants are owned trees: a container cannot hold itself, so
/// circular host values are unrepresentable by construction. Script-side
/// aliasing is handled by the marshaler instead.
#[derive(Clone, Debug, PartialEq)]
pub enum JsValue {
    /// JavaScript `undefined`
    Undefined,
    /// JavaScript `null`
    Null,
    /// JavaScript boolean
    Bool(bool),
    /// JavaScript integer (within i64 range)
    Int(i64),
    /// JavaScript float (including NaN and ±Infinity)
    Float(f64),
    /// JavaScript string
    String(String),
    /// JavaScript array (preserves order)
    Array(Vec<JsValue>),
    /// A plain JavaScript object; string keys, insertion order preserved
    Object(IndexMap<String, JsValue>),
    /// A JavaScript `Map`; keys may be any value
    Map(Vec<(JsValue, JsValue)>),
    /// A JavaScript `Set`
    Set(Vec<JsValue>),
    /// A JavaScript `Error` object
    Error(ScriptError),
}

impl JsValue {
    /// Tag name used in coercion diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Null => "null",
            JsValue::Bool(_) => "boolean",
            JsValue::Int(_) => "integer",
            JsValue::Float(_) => "float",
            JsValue::String(_) => "string",
            JsValue::Array(_) => "array",
            JsValue::Object(_) => "object",
            JsValue::Map(_) => "map",
            JsValue::Set(_) => "set",
            JsValue::Error(_) => "error",
        }
    }

    /// Build a plain-object value from key/value pairs.
    ///
    /// This is the "object-like" conversion target: every key must already be
    /// a string. A non-string key fails with [`Error::UnsupportedKeyType`];
    /// use [`JsValue::Map`] when keys are arbitrary values.
    pub fn object_from_pairs<I>(pairs: I) -> Result<JsValue>
    where
        I: IntoIterator<Item = (JsValue, JsValue)>,
    {
        let mut map = IndexMap::new();
        for (key, value) in pairs {
            match key {
                JsValue::String(k) => {
                    map.insert(k, value);
                }
                other => return Err(Error::UnsupportedKeyType(other.type_name().to_string())),
            }
        }
        Ok(JsValue::Object(map))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, JsValue::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JsValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            JsValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsValue::Int(i) => Some(*i as f64),
            JsValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JsValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<()> for JsValue {
    fn from(_: ()) -> Self {
        JsValue::Undefined
    }
}

impl From<bool> for JsValue {
    fn from(v: bool) -> Self {
        JsValue::Bool(v)
    }
}

macro_rules! from_int {
    ($($t:ty),*) => {$(
        impl From<$t> for JsValue {
            fn from(v: $t) -> Self {
                JsValue::Int(v as i64)
            }
        }
    )*};
}

from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for JsValue {
    fn from(v: f32) -> Self {
        // f32 widens losslessly into a double
        JsValue::Float(f64::from(v))
    }
}

impl From<f64> for JsValue {
    fn from(v: f64) -> Self {
        JsValue::Float(v)
    }
}

impl From<&str> for JsValue {
    fn from(v: &str) -> Self {
        JsValue::String(v.to_string())
    }
}

impl From<String> for JsValue {
    fn from(v: String) -> Self {
        JsValue::String(v)
    }
}

impl From<ScriptError> for JsValue {
    fn from(v: ScriptError) -> Self {
        JsValue::Error(v)
    }
}

impl<T: Into<JsValue>> From<Vec<T>> for JsValue {
    fn from(v: Vec<T>) -> Self {
        JsValue::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<JsValue>> From<Option<T>> for JsValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => JsValue::Null,
        }
    }
}

impl From<IndexMap<String, JsValue>> for JsValue {
    fn from(v: IndexMap<String, JsValue>) -> Self {
        JsValue::Object(v)
    }
}

// Manual Serialize implementation that errors on variants without a faithful
// serialized shape.
impl Serialize for JsValue {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::Error as _;
        match self {
            JsValue::Undefined | JsValue::Null => serializer.serialize_none(),
            JsValue::Bool(b) => serializer.serialize_bool(*b),
            JsValue::Int(i) => serializer.serialize_i64(*i),
            JsValue::Float(f) => serializer.serialize_f64(*f),
            JsValue::String(s) => serializer.serialize_str(s),
            JsValue::Array(arr) => arr.serialize(serializer),
            JsValue::Object(obj) => obj.serialize(serializer),
            JsValue::Map(_) | JsValue::Set(_) | JsValue::Error(_) => Err(S::Error::custom(
                format!("JsValue of type '{}' has no serialized form", self.type_name()),
            )),
        }
    }
}

// Manual Deserialize implementation over the JSON-shaped subset.
impl<'de> Deserialize<'de> for JsValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct JsValueVisitor;

        impl<'de> Visitor<'de> for JsValueVisitor {
            type Value = JsValue;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter
                    .write_str("a JavaScript value (null, bool, number, string, array, or object)")
            }

            fn visit_bool<E>(self, value: bool) -> std::result::Result<Self::Value, E> {
                Ok(JsValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E> {
                Ok(JsValue::Int(value))
            }

            fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E> {
                if value <= i64::MAX as u64 {
                    Ok(JsValue::Int(value as i64))
                } else {
                    Ok(JsValue::Float(value as f64))
                }
            }

            fn visit_f64<E>(self, value: f64) -> std::result::Result<Self::Value, E> {
                Ok(JsValue::Float(value))
            }

            fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E> {
                Ok(JsValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> std::result::Result<Self::Value, E> {
                Ok(JsValue::String(value))
            }

            fn visit_none<E>(self) -> std::result::Result<Self::Value, E> {
                Ok(JsValue::Null)
            }

            fn visit_unit<E>(self) -> std::result::Result<Self::Value, E> {
                Ok(JsValue::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element()? {
                    vec.push(elem);
                }
                Ok(JsValue::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut obj = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    obj.insert(key, value);
                }
                Ok(JsValue::Object(obj))
            }
        }

        deserializer.deserialize_any(JsValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_constructors() {
        assert_eq!(JsValue::from(7i32), JsValue::Int(7));
        assert_eq!(JsValue::from(7u32), JsValue::Int(7));
        assert_eq!(JsValue::from(1.5f32), JsValue::Float(1.5));
        assert_eq!(JsValue::from(0.25f64), JsValue::Float(0.25));
        assert_eq!(JsValue::from(()), JsValue::Undefined);
    }

    #[test]
    fn special_floats_are_representable() {
        let nan = JsValue::Float(f64::NAN);
        let inf = JsValue::Float(f64::INFINITY);
        assert!(matches!(nan, JsValue::Float(f) if f.is_nan()));
        assert!(matches!(inf, JsValue::Float(f) if f.is_infinite()));
    }

    #[test]
    fn object_from_pairs_requires_string_keys() {
        let ok = JsValue::object_from_pairs(vec![
            (JsValue::from("a"), JsValue::Int(1)),
            (JsValue::from("b"), JsValue::Int(2)),
        ])
        .unwrap();
        match ok {
            JsValue::Object(map) => {
                assert_eq!(map.get("a"), Some(&JsValue::Int(1)));
                assert_eq!(map.get("b"), Some(&JsValue::Int(2)));
            }
            other => panic!("expected object, got {:?}", other),
        }

        let err = JsValue::object_from_pairs(vec![(JsValue::Int(1), JsValue::Int(2))]);
        assert!(matches!(err, Err(Error::UnsupportedKeyType(_))));
    }

    #[test]
    fn map_keys_are_unrestricted() {
        let map = JsValue::Map(vec![(JsValue::Int(1), JsValue::from("one"))]);
        assert_eq!(map.type_name(), "map");
    }

    #[test]
    fn serialize_json_subset() {
        let value = JsValue::Object(IndexMap::from([
            ("n".to_string(), JsValue::Int(3)),
            (
                "xs".to_string(),
                JsValue::Array(vec![JsValue::Bool(true), JsValue::Null]),
            ),
        ]));
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"n":3,"xs":[true,null]}"#);

        let back: JsValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn serialize_rejects_map_set_error() {
        assert!(serde_json::to_string(&JsValue::Map(Vec::new())).is_err());
        assert!(serde_json::to_string(&JsValue::Set(Vec::new())).is_err());
        assert!(serde_json::to_string(&JsValue::Error(ScriptError::new("Error", "x"))).is_err());
    }
}

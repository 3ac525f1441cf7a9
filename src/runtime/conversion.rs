//! Conversion between host Rust types and [`JsValue`].
//!
//! [`FromJsValue`] is applied to evaluation results and is where the numeric
//! coercion rules live: a script integer widens into a host float slot, and a
//! script float with no fractional part narrows into a host integer slot.
//! Implementing the trait for a custom type is the caller-supplied coercion
//! strategy; anything the rules cannot bridge fails with
//! [`Error::TypeCoercion`].

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::runtime::error::{Error, Result, ScriptError};
use crate::runtime::js_value::JsValue;

/// Extract a typed host value from a [`JsValue`].
pub trait FromJsValue: Sized {
    fn from_js_value(value: JsValue) -> Result<Self>;
}

/// Convert a host value into a [`JsValue`].
pub trait IntoJsValue {
    fn into_js_value(self) -> JsValue;
}

impl<T: Into<JsValue>> IntoJsValue for T {
    fn into_js_value(self) -> JsValue {
        self.into()
    }
}

fn coercion_error(expected: &'static str, value: &JsValue) -> Error {
    Error::TypeCoercion {
        expected,
        actual: value.type_name(),
    }
}

impl FromJsValue for JsValue {
    fn from_js_value(value: JsValue) -> Result<Self> {
        Ok(value)
    }
}

// Any result can be discarded into a unit.
impl FromJsValue for () {
    fn from_js_value(_: JsValue) -> Result<Self> {
        Ok(())
    }
}

impl FromJsValue for bool {
    fn from_js_value(value: JsValue) -> Result<Self> {
        match value {
            JsValue::Bool(b) => Ok(b),
            other => Err(coercion_error("bool", &other)),
        }
    }
}

impl FromJsValue for i64 {
    fn from_js_value(value: JsValue) -> Result<Self> {
        match value {
            JsValue::Int(i) => Ok(i),
            // An integral double narrows exactly into an integer slot.
            JsValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(f as i64),
            other => Err(coercion_error("i64", &other)),
        }
    }
}

impl FromJsValue for i32 {
    fn from_js_value(value: JsValue) -> Result<Self> {
        let wide = i64::from_js_value(value.clone()).map_err(|_| coercion_error("i32", &value))?;
        i32::try_from(wide).map_err(|_| coercion_error("i32", &value))
    }
}

impl FromJsValue for f64 {
    fn from_js_value(value: JsValue) -> Result<Self> {
        match value {
            JsValue::Float(f) => Ok(f),
            // Integer slots widen into a double, the host-side counterpart of
            // the script engine's numeric widening.
            JsValue::Int(i) => Ok(i as f64),
            other => Err(coercion_error("f64", &other)),
        }
    }
}

impl FromJsValue for String {
    fn from_js_value(value: JsValue) -> Result<Self> {
        match value {
            JsValue::String(s) => Ok(s),
            other => Err(coercion_error("String", &other)),
        }
    }
}

impl FromJsValue for ScriptError {
    fn from_js_value(value: JsValue) -> Result<Self> {
        match value {
            JsValue::Error(e) => Ok(e),
            other => Err(coercion_error("ScriptError", &other)),
        }
    }
}

impl<T: FromJsValue> FromJsValue for Option<T> {
    fn from_js_value(value: JsValue) -> Result<Self> {
        match value {
            JsValue::Undefined | JsValue::Null => Ok(None),
            other => T::from_js_value(other).map(Some),
        }
    }
}

impl<T: FromJsValue> FromJsValue for Vec<T> {
    fn from_js_value(value: JsValue) -> Result<Self> {
        match value {
            JsValue::Array(items) => items.into_iter().map(T::from_js_value).collect(),
            JsValue::Set(items) => items.into_iter().map(T::from_js_value).collect(),
            other => Err(coercion_error("Vec", &other)),
        }
    }
}

impl<T: FromJsValue> FromJsValue for HashMap<String, T> {
    fn from_js_value(value: JsValue) -> Result<Self> {
        match value {
            JsValue::Object(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, T::from_js_value(v)?)))
                .collect(),
            other => Err(coercion_error("HashMap", &other)),
        }
    }
}

impl<T: FromJsValue> FromJsValue for IndexMap<String, T> {
    fn from_js_value(value: JsValue) -> Result<Self> {
        match value {
            JsValue::Object(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, T::from_js_value(v)?)))
                .collect(),
            other => Err(coercion_error("IndexMap", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_widens_into_float_slot() {
        let f = f64::from_js_value(JsValue::Int(41)).unwrap();
        assert_eq!(f, 41.0);
    }

    #[test]
    fn integral_float_narrows_into_int_slot() {
        assert_eq!(i64::from_js_value(JsValue::Float(12.0)).unwrap(), 12);
        assert!(i64::from_js_value(JsValue::Float(12.5)).is_err());
        assert!(i64::from_js_value(JsValue::Float(f64::NAN)).is_err());
    }

    #[test]
    fn out_of_range_i32_is_rejected() {
        assert!(i32::from_js_value(JsValue::Int(i64::from(i32::MAX) + 1)).is_err());
        assert_eq!(i32::from_js_value(JsValue::Int(-5)).unwrap(), -5);
    }

    #[test]
    fn mismatches_report_both_sides() {
        let err = String::from_js_value(JsValue::Int(3)).unwrap_err();
        match err {
            Error::TypeCoercion { expected, actual } => {
                assert_eq!(expected, "String");
                assert_eq!(actual, "integer");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn null_and_undefined_become_none() {
        assert_eq!(Option::<i64>::from_js_value(JsValue::Null).unwrap(), None);
        assert_eq!(
            Option::<i64>::from_js_value(JsValue::Undefined).unwrap(),
            None
        );
        assert_eq!(
            Option::<i64>::from_js_value(JsValue::Int(9)).unwrap(),
            Some(9)
        );
    }

    #[test]
    fn arrays_and_sets_collect_into_vec() {
        let arr = JsValue::Array(vec![JsValue::Int(1), JsValue::Int(2)]);
        assert_eq!(Vec::<i64>::from_js_value(arr).unwrap(), vec![1, 2]);

        let set = JsValue::Set(vec![JsValue::from("a")]);
        assert_eq!(Vec::<String>::from_js_value(set).unwrap(), vec!["a"]);
    }
}

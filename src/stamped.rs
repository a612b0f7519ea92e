//! Typed, timestamped values for global parameters.
//!
//! The configuration model evolves over time; rather than a bespoke column
//! per parameter, every global parameter is a [`StampedValue`]: one of four
//! primitive types together with the instant it was last modified. Backends
//! exchange stamped values in a textual form, so every value can be
//! re-parsed into its declared type.

use std::fmt;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The four primitive types a stamped value can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    String,
    Integer,
    Boolean,
    Real,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::String => "string",
            ElementKind::Integer => "integer",
            ElementKind::Boolean => "boolean",
            ElementKind::Real => "real",
        };
        f.write_str(name)
    }
}

/// A typed primitive value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ElementValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Real(f64),
}

impl ElementValue {
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementValue::String(_) => ElementKind::String,
            ElementValue::Integer(_) => ElementKind::Integer,
            ElementValue::Boolean(_) => ElementKind::Boolean,
            ElementValue::Real(_) => ElementKind::Real,
        }
    }
}

/// A named primitive value carrying its last-modification instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedValue {
    name: CompactString,
    value: Option<ElementValue>,
    modified_at: DateTime<Utc>,
}

impl StampedValue {
    /// A stamped value with no value yet. Accessors on it fail with
    /// `InvalidOperation` until a value is assigned.
    pub fn named(name: impl Into<CompactString>) -> Self {
        StampedValue {
            name: name.into(),
            value: None,
            modified_at: Utc::now(),
        }
    }

    pub fn with_value(name: impl Into<CompactString>, value: ElementValue) -> Self {
        StampedValue {
            name: name.into(),
            value: Some(value),
            modified_at: Utc::now(),
        }
    }

    /// Builds a stamped value from free-form JSON. JSON null is rejected as
    /// `BadValue`; arrays and objects are not primitive and fail with
    /// `TypeError`.
    pub fn from_json(name: impl Into<CompactString>, json: &serde_json::Value) -> Result<Self> {
        let name = name.into();
        let value = match json {
            serde_json::Value::String(s) => ElementValue::String(s.clone()),
            serde_json::Value::Bool(b) => ElementValue::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ElementValue::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    ElementValue::Real(f)
                } else {
                    return Err(Error::BadValue(format!(
                        "parameter `{name}`: numeric value {n} out of range"
                    )));
                }
            }
            serde_json::Value::Null => {
                return Err(Error::BadValue(format!(
                    "parameter `{name}`: value is null"
                )));
            }
            other => {
                return Err(Error::TypeError(format!(
                    "parameter `{name}`: expected a primitive, got {other}"
                )));
            }
        };
        Ok(StampedValue::with_value(name, value))
    }

    /// Rebuilds a stamped value from its persisted textual form.
    pub fn from_element(
        name: impl Into<CompactString>,
        kind: ElementKind,
        text: &str,
        modified_at: DateTime<Utc>,
    ) -> Result<Self> {
        let name = name.into();
        let value = parse_text(&name, kind, text)?;
        Ok(StampedValue {
            name,
            value: Some(value),
            modified_at,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    pub fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = at;
    }

    /// Bumps the modification stamp to now.
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    pub fn kind(&self) -> Result<ElementKind> {
        self.value
            .as_ref()
            .map(ElementValue::kind)
            .ok_or_else(|| self.absent("type"))
    }

    /// Any of the four types renders as a string: integers and reals via
    /// their lexical form, booleans as `"1"`/`"0"`.
    pub fn get_string(&self) -> Result<String> {
        match self.present("string")? {
            ElementValue::String(s) => Ok(s.clone()),
            ElementValue::Integer(i) => Ok(i.to_string()),
            ElementValue::Boolean(b) => Ok(if *b { "1" } else { "0" }.to_string()),
            ElementValue::Real(r) => Ok(r.to_string()),
        }
    }

    pub fn get_integer(&self) -> Result<i64> {
        match self.present("integer")? {
            ElementValue::Integer(i) => Ok(*i),
            other => Err(self.mismatch(ElementKind::Integer, other)),
        }
    }

    pub fn get_bool(&self) -> Result<bool> {
        match self.present("boolean")? {
            ElementValue::Boolean(b) => Ok(*b),
            other => Err(self.mismatch(ElementKind::Boolean, other)),
        }
    }

    pub fn get_double(&self) -> Result<f64> {
        match self.present("real")? {
            ElementValue::Real(r) => Ok(*r),
            other => Err(self.mismatch(ElementKind::Real, other)),
        }
    }

    /// The canonical textual form used when a backend persists the value:
    /// booleans serialize as `"true"`/`"false"`, numbers via their lexical
    /// forms.
    pub fn as_text(&self) -> Result<String> {
        match self.present("text")? {
            ElementValue::String(s) => Ok(s.clone()),
            ElementValue::Integer(i) => Ok(i.to_string()),
            ElementValue::Boolean(b) => Ok(if *b { "true" } else { "false" }.to_string()),
            ElementValue::Real(r) => Ok(r.to_string()),
        }
    }

    /// Re-parses the textual form into the requested type. Fails with
    /// `BadValue` when the text does not lex as that type.
    pub fn to_element(&self, kind: ElementKind) -> Result<ElementValue> {
        let text = self.as_text()?;
        parse_text(&self.name, kind, &text)
    }

    fn present(&self, what: &str) -> Result<&ElementValue> {
        self.value.as_ref().ok_or_else(|| self.absent(what))
    }

    fn absent(&self, what: &str) -> Error {
        Error::InvalidOperation(format!(
            "parameter `{}`: attempt to read {what} of an absent value",
            self.name
        ))
    }

    fn mismatch(&self, wanted: ElementKind, got: &ElementValue) -> Error {
        Error::TypeError(format!(
            "parameter `{}`: accessed as {wanted}, but holds {}",
            self.name,
            got.kind()
        ))
    }
}

fn parse_text(name: &str, kind: ElementKind, text: &str) -> Result<ElementValue> {
    match kind {
        ElementKind::String => Ok(ElementValue::String(text.to_string())),
        ElementKind::Integer => text.parse::<i64>().map(ElementValue::Integer).map_err(|_| {
            Error::BadValue(format!(
                "parameter `{name}`: integer expected, value is `{text}`"
            ))
        }),
        ElementKind::Boolean => match text {
            "true" => Ok(ElementValue::Boolean(true)),
            "false" => Ok(ElementValue::Boolean(false)),
            _ => Err(Error::BadValue(format!(
                "parameter `{name}`: boolean expected, value is `{text}`"
            ))),
        },
        ElementKind::Real => text.parse::<f64>().map(ElementValue::Real).map_err(|_| {
            Error::BadValue(format!(
                "parameter `{name}`: real number expected, value is `{text}`"
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn integer_accessors() {
        let v = StampedValue::with_value("renew-timer", ElementValue::Integer(1000));
        assert_eq!(v.get_integer().unwrap(), 1000);
        assert_eq!(v.get_string().unwrap(), "1000");
        assert!(matches!(v.get_bool(), Err(Error::TypeError(_))));
        assert_eq!(v.kind().unwrap(), ElementKind::Integer);
    }

    #[test]
    fn boolean_renders_both_forms() {
        let v = StampedValue::with_value("ddns-enabled", ElementValue::Boolean(true));
        assert_eq!(v.get_string().unwrap(), "1");
        assert_eq!(v.as_text().unwrap(), "true");
        assert_eq!(
            v.to_element(ElementKind::Boolean).unwrap(),
            ElementValue::Boolean(true)
        );
    }

    #[test]
    fn absent_value_accessors_fail() {
        let v = StampedValue::named("pending");
        assert!(matches!(v.kind(), Err(Error::InvalidOperation(_))));
        assert!(matches!(v.get_string(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn from_json_rejects_compound_values() {
        let err = StampedValue::from_json("bad", &serde_json::json!([1, 2])).unwrap_err();
        assert!(matches!(err, Error::TypeError(_)));
        let err = StampedValue::from_json("null", &serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, Error::BadValue(_)));
    }

    #[test]
    fn lexical_failure_is_bad_value() {
        let v = StampedValue::with_value("name", ElementValue::String("not-a-number".into()));
        assert!(matches!(
            v.to_element(ElementKind::Integer),
            Err(Error::BadValue(_))
        ));
    }

    proptest! {
        // from_element(to_element(v)) reproduces the same element for every
        // primitive payload.
        #[test]
        fn round_trips_integers(i in any::<i64>()) {
            let v = StampedValue::with_value("p", ElementValue::Integer(i));
            let elem = v.to_element(ElementKind::Integer).unwrap();
            let back = StampedValue::from_element("p", ElementKind::Integer,
                &v.as_text().unwrap(), v.modified_at()).unwrap();
            prop_assert_eq!(back.to_element(ElementKind::Integer).unwrap(), elem);
        }

        #[test]
        fn round_trips_strings(s in ".*") {
            let v = StampedValue::with_value("p", ElementValue::String(s));
            let elem = v.to_element(ElementKind::String).unwrap();
            let back = StampedValue::from_element("p", ElementKind::String,
                &v.as_text().unwrap(), v.modified_at()).unwrap();
            prop_assert_eq!(back.to_element(ElementKind::String).unwrap(), elem);
        }
    }
}

//! Text → native conversion for values read back from the cache.
//!
//! Every cached field comes back as text. An entity either declares a
//! per-field kind table ([`Coercion::Typed`]) or hands over a whole-record
//! conversion hook ([`Coercion::Convert`]).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use super::error::DomainError;
use super::value::{FieldValue, Record};

/// Declared native type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Uuid,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Boolean => "boolean",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Uuid => "uuid",
        }
    }

    /// Convert cache text into this kind. Empty text is `Null` for every
    /// kind except `Text`.
    pub fn coerce(self, field: &str, raw: &str) -> Result<FieldValue, DomainError> {
        if raw.is_empty() && self != FieldKind::Text {
            return Ok(FieldValue::Null);
        }
        let fail = || DomainError::decode(field, raw, self.as_str());
        match self {
            FieldKind::Text => Ok(FieldValue::Text(raw.to_string())),
            FieldKind::Integer => raw.parse().map(FieldValue::Int).map_err(|_| fail()),
            FieldKind::Float => raw.parse().map(FieldValue::Float).map_err(|_| fail()),
            FieldKind::Boolean => parse_bool(raw).map(FieldValue::Bool).ok_or_else(fail),
            FieldKind::Timestamp => OffsetDateTime::parse(raw, &Rfc3339)
                .map(FieldValue::Timestamp)
                .map_err(|_| fail()),
            FieldKind::Uuid => Uuid::parse_str(raw)
                .map(FieldValue::Uuid)
                .map_err(|_| fail()),
        }
    }
}

impl FromStr for FieldKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "string" => Ok(FieldKind::Text),
            "integer" | "int" => Ok(FieldKind::Integer),
            "float" | "double" => Ok(FieldKind::Float),
            "boolean" | "bool" => Ok(FieldKind::Boolean),
            "timestamp" | "date" => Ok(FieldKind::Timestamp),
            "uuid" => Ok(FieldKind::Uuid),
            other => Err(DomainError::validation(format!(
                "unknown field kind `{other}`"
            ))),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "true" | "TRUE" | "True" | "1" => Some(true),
        "false" | "FALSE" | "False" | "0" => Some(false),
        _ => None,
    }
}

pub type CoerceFn = Arc<dyn Fn(&str) -> Result<FieldValue, DomainError> + Send + Sync>;
pub type ConvertFn = Arc<dyn Fn(Record) -> Record + Send + Sync>;

/// How one field is converted back to native form.
#[derive(Clone)]
pub enum FieldCoercer {
    Kind(FieldKind),
    Custom(CoerceFn),
}

impl FieldCoercer {
    pub fn apply(&self, field: &str, raw: &str) -> Result<FieldValue, DomainError> {
        match self {
            FieldCoercer::Kind(kind) => kind.coerce(field, raw),
            FieldCoercer::Custom(coerce) => coerce(raw),
        }
    }
}

impl fmt::Debug for FieldCoercer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldCoercer::Kind(kind) => f.debug_tuple("Kind").field(kind).finish(),
            FieldCoercer::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Field name → coercer, declared once per entity.
#[derive(Debug, Clone, Default)]
pub struct CoercionTable {
    fields: BTreeMap<String, FieldCoercer>,
}

impl CoercionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), FieldCoercer::Kind(kind));
        self
    }

    pub fn custom<F>(mut self, name: impl Into<String>, coerce: F) -> Self
    where
        F: Fn(&str) -> Result<FieldValue, DomainError> + Send + Sync + 'static,
    {
        self.fields
            .insert(name.into(), FieldCoercer::Custom(Arc::new(coerce)));
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldCoercer> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Convert a text record. Fields without a declared coercer stay text.
    pub fn apply(&self, record: Record) -> Result<Record, DomainError> {
        let mut out = Record::new();
        for (field, value) in record {
            let converted = match (&value, self.fields.get(&field)) {
                (FieldValue::Text(raw), Some(coercer)) => coercer.apply(&field, raw)?,
                _ => value,
            };
            out.insert(field, converted);
        }
        Ok(out)
    }
}

impl<K: Into<String>> FromIterator<(K, FieldKind)> for CoercionTable {
    fn from_iter<I: IntoIterator<Item = (K, FieldKind)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |table, (name, kind)| table.field(name, kind))
    }
}

/// Coercion strategy of an entity.
#[derive(Clone, Default)]
pub enum Coercion {
    /// Values come back as text.
    #[default]
    Identity,
    /// Caller-supplied whole-record conversion.
    Convert(ConvertFn),
    /// Per-field kind table.
    Typed(CoercionTable),
}

impl Coercion {
    pub fn convert<F>(convert: F) -> Self
    where
        F: Fn(Record) -> Record + Send + Sync + 'static,
    {
        Coercion::Convert(Arc::new(convert))
    }

    pub fn apply(&self, record: Record) -> Result<Record, DomainError> {
        match self {
            Coercion::Identity => Ok(record),
            Coercion::Convert(convert) => Ok(convert(record)),
            Coercion::Typed(table) => table.apply(record),
        }
    }

    /// Coerce one text value; fields without a declared kind stay text.
    pub fn apply_field(&self, field: &str, raw: &str) -> Result<FieldValue, DomainError> {
        match self {
            Coercion::Typed(table) => match table.get(field) {
                Some(coercer) => coercer.apply(field, raw),
                None => Ok(FieldValue::Text(raw.to_string())),
            },
            _ => Ok(FieldValue::Text(raw.to_string())),
        }
    }
}

impl fmt::Debug for Coercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coercion::Identity => f.write_str("Identity"),
            Coercion::Convert(_) => f.write_str("Convert(..)"),
            Coercion::Typed(table) => f.debug_tuple("Typed").field(table).finish(),
        }
    }
}

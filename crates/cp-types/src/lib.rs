#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the derived dimension computed from [`STARTTIME_FIELD`].
pub const UPTIME_FIELD: &str = "uptime";
/// Source field holding the epoch-seconds start timestamp.
pub const STARTTIME_FIELD: &str = "starttime";
/// Label used for derived values that cannot be computed.
pub const INVALID_LABEL: &str = "invalid";
/// Header of the implicit count column in flat outputs.
pub const COUNT_FIELD: &str = "count";
/// Separator between parts of a composite column key.
pub const COMPOSITE_SEPARATOR: char = '|';

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("record has {values} values but only {headers} headers")]
    RecordTooWide { headers: usize, values: usize },
    #[error("column key requires at least one part")]
    EmptyColumnKey,
    #[error("duplicate field {field:?} in record")]
    DuplicateField { field: String },
}

/// One input row: an ordered mapping from field name to string value.
///
/// Field names are shared between all records of a source. A field is
/// *absent* when the record is shorter than the header row or when the name
/// is not part of the header at all; an empty string is a present value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    row_number: usize,
    fields: Arc<[String]>,
    values: Vec<String>,
}

impl Record {
    /// Build a record over a shared header. `row_number` is the 1-based data
    /// row position in the source (the header row is not counted).
    pub fn new(
        row_number: usize,
        fields: Arc<[String]>,
        values: Vec<String>,
    ) -> Result<Self, TypeError> {
        if values.len() > fields.len() {
            return Err(TypeError::RecordTooWide {
                headers: fields.len(),
                values: values.len(),
            });
        }
        Ok(Self {
            row_number,
            fields,
            values,
        })
    }

    /// Convenience constructor used by tests and fixtures.
    pub fn from_pairs<K, V>(
        row_number: usize,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self, TypeError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut fields = Vec::new();
        let mut values = Vec::new();
        for (key, value) in pairs {
            let key = key.into();
            if fields.contains(&key) {
                return Err(TypeError::DuplicateField { field: key });
            }
            fields.push(key);
            values.push(value.into());
        }
        Self::new(row_number, fields.into(), values)
    }

    #[must_use]
    pub fn row_number(&self) -> usize {
        self.row_number
    }

    /// Value of `field`, or `None` when the field is absent. With duplicate
    /// header names the first occurrence wins.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        let position = self.fields.iter().position(|name| name == field)?;
        self.values.get(position).map(String::as_str)
    }

    #[must_use]
    pub fn has_field(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    #[must_use]
    pub fn field_names(&self) -> &[String] {
        &self.fields
    }

    /// Present `(field, value)` pairs in header order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .zip(self.values.iter())
            .map(|(field, value)| (field.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Ordered tuple of row-field values. Ordering is element-wise, so sorted
/// row keys follow tuple comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(Vec<String>);

impl RowKey {
    #[must_use]
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn values(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn into_values(self) -> Vec<String> {
        self.0
    }

    /// Extend the key with one trailing value (used for the flat shape, where
    /// the derived value becomes the last key part).
    #[must_use]
    pub fn with_suffix(mut self, value: String) -> Self {
        self.0.push(value);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for RowKey {
    fn from(values: Vec<String>) -> Self {
        Self(values)
    }
}

impl<const N: usize> From<[&str; N]> for RowKey {
    fn from(values: [&str; N]) -> Self {
        Self(values.iter().map(|value| (*value).to_owned()).collect())
    }
}

/// A discovered pivot column, held in its display form.
///
/// A single column field yields the bare value; two or more fields yield the
/// `|`-joined composite in configured order. Equality and ordering are on the
/// display form, so composites that render identically are the same column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnKey(String);

impl ColumnKey {
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> Result<Self, TypeError> {
        match parts {
            [] => Err(TypeError::EmptyColumnKey),
            [single] => Ok(Self(single.as_ref().to_owned())),
            many => {
                let mut joined = String::new();
                for (idx, part) in many.iter().enumerate() {
                    if idx > 0 {
                        joined.push(COMPOSITE_SEPARATOR);
                    }
                    joined.push_str(part.as_ref());
                }
                Ok(Self(joined))
            }
        }
    }

    /// Wrap an already-rendered key, e.g. one returned by a query engine.
    #[must_use]
    pub fn from_display(display: impl Into<String>) -> Self {
        Self(display.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ColumnKey {
    fn from(display: &str) -> Self {
        Self(display.to_owned())
    }
}

/// True when a raw value counts as null for column-key purposes.
#[must_use]
pub fn is_null_value(value: Option<&str>) -> bool {
    value.is_none_or(str::is_empty)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ColumnKey, Record, RowKey, TypeError, is_null_value};

    fn header(names: &[&str]) -> Arc<[String]> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn short_record_reports_trailing_fields_absent() {
        let record = Record::new(1, header(&["ns", "pod", "starttime"]), vec!["a".into()])
            .expect("record");
        assert_eq!(record.get("ns"), Some("a"));
        assert_eq!(record.get("pod"), None);
        assert_eq!(record.get("missing"), None);
        assert!(!record.has_field("starttime"));
    }

    #[test]
    fn empty_string_is_present_but_null_for_columns() {
        let record = Record::from_pairs(3, [("ns", ""), ("pod", "p1")]).expect("record");
        assert_eq!(record.get("ns"), Some(""));
        assert!(is_null_value(record.get("ns")));
        assert!(is_null_value(record.get("absent")));
        assert!(!is_null_value(record.get("pod")));
        assert_eq!(record.row_number(), 3);
    }

    #[test]
    fn record_wider_than_header_is_rejected() {
        let err = Record::new(1, header(&["a"]), vec!["1".into(), "2".into()])
            .expect_err("too wide");
        assert_eq!(
            err,
            TypeError::RecordTooWide {
                headers: 1,
                values: 2
            }
        );
    }

    #[test]
    fn duplicate_pairs_are_rejected() {
        let err = Record::from_pairs(1, [("a", "1"), ("a", "2")]).expect_err("duplicate");
        assert!(matches!(err, TypeError::DuplicateField { field } if field == "a"));
    }

    #[test]
    fn column_key_collapses_single_part() {
        let single = ColumnKey::from_parts(&["0-3 months"]).expect("single");
        assert_eq!(single.as_str(), "0-3 months");

        let composite = ColumnKey::from_parts(&["0-3 months", "eu-west"]).expect("composite");
        assert_eq!(composite.as_str(), "0-3 months|eu-west");

        assert_eq!(
            ColumnKey::from_parts::<&str>(&[]),
            Err(TypeError::EmptyColumnKey)
        );
    }

    #[test]
    fn column_keys_order_by_display_form() {
        let mut keys = vec![
            ColumnKey::from_parts(&["b", "a"]).expect("key"),
            ColumnKey::from_parts(&["a|z", "a"]).expect("key"),
            ColumnKey::from_parts(&["a", "b"]).expect("key"),
        ];
        keys.sort();
        let rendered: Vec<&str> = keys.iter().map(ColumnKey::as_str).collect();
        assert_eq!(rendered, ["a|b", "a|z|a", "b|a"]);
    }

    #[test]
    fn row_keys_order_by_tuple_comparison() {
        let mut keys = vec![
            RowKey::from(["b", "a"]),
            RowKey::from(["a", "z"]),
            RowKey::from(["a", "b"]),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                RowKey::from(["a", "b"]),
                RowKey::from(["a", "z"]),
                RowKey::from(["b", "a"]),
            ]
        );
        let extended = RowKey::from(["a"]).with_suffix("1-2 years".to_owned());
        assert_eq!(extended.values(), ["a", "1-2 years"]);
    }
}

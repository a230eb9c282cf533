//! The three lookup shapes of a store read.

use crate::domain::value::FieldValue;

/// Read by unique key, by unique-index value, or by multi-index value.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    ByUniqueKey(FieldValue),
    ByUniqueIndex {
        field: String,
        value: FieldValue,
    },
    /// `count < 0` reads the whole partition.
    ByMultiIndex {
        field: String,
        value: FieldValue,
        count: i64,
        start: usize,
    },
}

impl Lookup {
    pub fn key(uk: impl Into<FieldValue>) -> Self {
        Lookup::ByUniqueKey(uk.into())
    }

    pub fn index(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Lookup::ByUniqueIndex {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn multi(field: impl Into<String>, value: impl Into<FieldValue>, count: i64) -> Self {
        Lookup::ByMultiIndex {
            field: field.into(),
            value: value.into(),
            count,
            start: 0,
        }
    }

    /// Offset of a multi-index window; ignored by the other shapes.
    pub fn starting_at(self, offset: usize) -> Self {
        match self {
            Lookup::ByMultiIndex {
                field,
                value,
                count,
                ..
            } => Lookup::ByMultiIndex {
                field,
                value,
                count,
                start: offset,
            },
            other => other,
        }
    }
}

/// Newest-first window over set members, `[start, start + count)`.
pub(crate) fn member_window(mut members: Vec<String>, count: i64, start: usize) -> Vec<String> {
    members.reverse();
    let available = members.len().saturating_sub(start);
    let take = if count < 0 {
        available
    } else {
        (count as usize).min(available)
    };
    members.into_iter().skip(start).take(take).collect()
}

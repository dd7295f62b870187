//! Type change classification
//!
//! A change of a field's logical type is one of:
//! - identical: nothing to do
//! - widening: every stored value stays valid (possibly re-encoded)
//! - narrowing: some stored values may not fit; needs confirmation
//! - incompatible: no conversion path; only allowed on empty tables
//!
//! Each non-identical change carries the value transforms the migrator must
//! run, in order, before the column takes its new physical type.

use serde::{Deserialize, Serialize};

use super::types::{LogicalType, MAX_EMAIL_LENGTH};

/// Classification of a `from -> to` logical type change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Identical,
    Widening,
    Narrowing,
    Incompatible,
}

/// Deterministic rewrite applied to existing values of a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transform", rename_all = "snake_case")]
pub enum ValueTransform {
    /// Keep the first `max_length` characters
    TruncateText { max_length: u32 },
    /// Drop the fractional part (toward zero)
    TruncateToInteger,
    /// `YYYY-MM-DD` becomes midnight UTC
    DateToDatetime,
    /// RFC 3339 UTC instant becomes its calendar date
    KeepDatePart,
    /// Values outside `options` become NULL
    NullifyOutsideChoices { options: Vec<String> },
    /// Values outside the bounds become NULL
    NullifyOutsideRange {
        min: Option<f64>,
        max: Option<f64>,
    },
    /// Every value becomes NULL
    NullifyAll,
}

impl ValueTransform {
    /// Whether the transform can lose information
    pub fn is_lossy(&self) -> bool {
        !matches!(self, ValueTransform::DateToDatetime)
    }
}

/// Result of classifying a type change
#[derive(Debug, Clone, PartialEq)]
pub struct TypeChange {
    pub kind: ChangeKind,
    pub transforms: Vec<ValueTransform>,
}

impl TypeChange {
    fn identical() -> Self {
        Self {
            kind: ChangeKind::Identical,
            transforms: Vec::new(),
        }
    }

    fn widening() -> Self {
        Self {
            kind: ChangeKind::Widening,
            transforms: Vec::new(),
        }
    }

    fn narrowing(transforms: Vec<ValueTransform>) -> Self {
        Self {
            kind: ChangeKind::Narrowing,
            transforms,
        }
    }

    fn incompatible() -> Self {
        Self {
            kind: ChangeKind::Incompatible,
            transforms: vec![ValueTransform::NullifyAll],
        }
    }

    /// Widening when `fits` holds, otherwise a narrowing with `transform`
    fn widen_or(fits: bool, transform: ValueTransform) -> Self {
        if fits {
            Self::widening()
        } else {
            Self::narrowing(vec![transform])
        }
    }
}

fn text_limit_fits(old: Option<u32>, new: Option<u32>) -> bool {
    match (old, new) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(old), Some(new)) => new >= old,
    }
}

fn range_contains<T: PartialOrd>(old: (Option<T>, Option<T>), new: (Option<T>, Option<T>)) -> bool {
    let lower_ok = match (old.0, new.0) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(old), Some(new)) => new <= old,
    };
    let upper_ok = match (old.1, new.1) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(old), Some(new)) => new >= old,
    };
    lower_ok && upper_ok
}

fn int_bounds(min: Option<i64>, max: Option<i64>) -> (Option<f64>, Option<f64>) {
    (min.map(|v| v as f64), max.map(|v| v as f64))
}

fn longest_option(options: &[String]) -> u32 {
    options
        .iter()
        .map(|o| o.chars().count() as u32)
        .max()
        .unwrap_or(0)
}

/// Classifies a logical type change
pub fn classify(from: &LogicalType, to: &LogicalType) -> TypeChange {
    use LogicalType as T;

    if from == to {
        return TypeChange::identical();
    }

    match (from, to) {
        (T::ShortText { max_length: old }, T::ShortText { max_length: new })
        | (T::ShortText { max_length: old }, T::LongText { max_length: Some(new) }) => {
            TypeChange::widen_or(new >= old, ValueTransform::TruncateText { max_length: *new })
        }
        (T::ShortText { .. }, T::LongText { max_length: None }) => TypeChange::widening(),
        (T::LongText { max_length: old }, T::LongText { max_length: new }) => match new {
            Some(limit) => TypeChange::widen_or(
                text_limit_fits(*old, Some(*limit)),
                ValueTransform::TruncateText { max_length: *limit },
            ),
            None => TypeChange::widening(),
        },
        (T::LongText { max_length: old }, T::ShortText { max_length: new }) => TypeChange::widen_or(
            text_limit_fits(*old, Some(*new)),
            ValueTransform::TruncateText { max_length: *new },
        ),
        (T::Email, T::ShortText { max_length: new })
        | (T::Email, T::LongText { max_length: Some(new) }) => TypeChange::widen_or(
            *new >= MAX_EMAIL_LENGTH,
            ValueTransform::TruncateText { max_length: *new },
        ),
        (T::Email, T::LongText { max_length: None }) => TypeChange::widening(),
        (T::Choice { options }, T::ShortText { max_length: new })
        | (T::Choice { options }, T::LongText { max_length: Some(new) }) => TypeChange::widen_or(
            longest_option(options) <= *new,
            ValueTransform::TruncateText { max_length: *new },
        ),
        (T::Choice { .. }, T::LongText { max_length: None }) => TypeChange::widening(),
        (T::Choice { options: old }, T::Choice { options: new }) => TypeChange::widen_or(
            old.iter().all(|o| new.contains(o)),
            ValueTransform::NullifyOutsideChoices {
                options: new.clone(),
            },
        ),
        (
            T::Integer {
                min: old_min,
                max: old_max,
            },
            T::Integer {
                min: new_min,
                max: new_max,
            },
        ) => {
            let (min, max) = int_bounds(*new_min, *new_max);
            TypeChange::widen_or(
                range_contains((*old_min, *old_max), (*new_min, *new_max)),
                ValueTransform::NullifyOutsideRange { min, max },
            )
        }
        (
            T::Integer {
                min: old_min,
                max: old_max,
            },
            T::Decimal { min, max },
        ) => TypeChange::widen_or(
            range_contains(int_bounds(*old_min, *old_max), (*min, *max)),
            ValueTransform::NullifyOutsideRange {
                min: *min,
                max: *max,
            },
        ),
        (
            T::Decimal {
                min: old_min,
                max: old_max,
            },
            T::Decimal { min, max },
        ) => TypeChange::widen_or(
            range_contains((*old_min, *old_max), (*min, *max)),
            ValueTransform::NullifyOutsideRange {
                min: *min,
                max: *max,
            },
        ),
        (T::Decimal { .. }, T::Integer { min, max }) => {
            let mut transforms = vec![ValueTransform::TruncateToInteger];
            if min.is_some() || max.is_some() {
                let (min, max) = int_bounds(*min, *max);
                transforms.push(ValueTransform::NullifyOutsideRange { min, max });
            }
            TypeChange::narrowing(transforms)
        }
        (T::Date, T::Datetime) => TypeChange {
            kind: ChangeKind::Widening,
            transforms: vec![ValueTransform::DateToDatetime],
        },
        (T::Datetime, T::Date) => TypeChange::narrowing(vec![ValueTransform::KeepDatePart]),
        _ => TypeChange::incompatible(),
    }
}

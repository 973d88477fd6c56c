//! Dimension values: scalars, integer range sets and string sets.

use std::collections::BTreeSet;
use std::fmt;

use crate::ResourceError;

const MILLIS: u64 = 1000;

// =============================================================================
// Scalar
// =============================================================================

/// Non-negative fixed-point quantity with three decimal digits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scalar(u64);

impl Scalar {
    pub const ZERO: Self = Self(0);

    /// Rounds `value` to the nearest thousandth.
    pub fn from_f64(value: f64) -> Result<Self, ResourceError> {
        if !value.is_finite() || value < 0.0 {
            return Err(ResourceError::InvalidScalar(value.to_string()));
        }
        let millis = (value * MILLIS as f64).round();
        if millis >= u64::MAX as f64 {
            return Err(ResourceError::InvalidScalar(value.to_string()));
        }
        Ok(Self(millis as u64))
    }

    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    #[must_use]
    pub const fn millis(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / MILLIS as f64
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MILLIS;
        let frac = self.0 % MILLIS;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:03}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

// =============================================================================
// Ranges
// =============================================================================

/// A set of integers stored as sorted, disjoint, non-adjacent inclusive
/// intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Ranges(Vec<(u64, u64)>);

impl Ranges {
    /// Builds a canonical range set. Intervals with `lo > hi` are swapped.
    pub fn new(intervals: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let raw = intervals
            .into_iter()
            .map(|(lo, hi)| if lo <= hi { (lo, hi) } else { (hi, lo) })
            .collect();
        Self(normalize(raw))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn intervals(&self) -> &[(u64, u64)] {
        &self.0
    }

    /// Number of integers covered.
    pub fn count(&self) -> u64 {
        self.0
            .iter()
            .map(|(lo, hi)| (hi - lo).saturating_add(1))
            .fold(0u64, u64::saturating_add)
    }

    pub fn union(&self, other: &Ranges) -> Ranges {
        let mut all = self.0.clone();
        all.extend_from_slice(&other.0);
        Ranges(normalize(all))
    }

    /// True iff every integer in `other` is also in `self`.
    pub fn contains(&self, other: &Ranges) -> bool {
        other
            .0
            .iter()
            .all(|&(lo, hi)| self.0.iter().any(|&(a, b)| a <= lo && hi <= b))
    }

    /// `self \ other`, or `None` when `other` is not a subset of `self`.
    pub fn difference(&self, other: &Ranges) -> Option<Ranges> {
        if !self.contains(other) {
            return None;
        }
        let mut out = Vec::with_capacity(self.0.len());
        for &(a, b) in &self.0 {
            let mut cursor = Some(a);
            for &(lo, hi) in other.0.iter().filter(|(lo, hi)| *hi >= a && *lo <= b) {
                if let Some(start) = cursor {
                    if lo > start {
                        out.push((start, lo - 1));
                    }
                }
                cursor = hi.checked_add(1);
            }
            if let Some(start) = cursor {
                if start <= b {
                    out.push((start, b));
                }
            }
        }
        Some(Ranges(out))
    }
}

fn normalize(mut intervals: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    intervals.sort_unstable();
    let mut out: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for (lo, hi) in intervals {
        if let Some(last) = out.last_mut() {
            if lo <= last.1.saturating_add(1) {
                last.1 = last.1.max(hi);
                continue;
            }
        }
        out.push((lo, hi));
    }
    out
}

impl fmt::Display for Ranges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (lo, hi)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{lo}-{hi}")?;
        }
        f.write_str("]")
    }
}

// =============================================================================
// Value
// =============================================================================

/// The value of one named dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Scalar(Scalar),
    Ranges(Ranges),
    Set(BTreeSet<String>),
}

impl Value {
    /// Kind name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Ranges(_) => "range set",
            Value::Set(_) => "string set",
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Value::Scalar(s) => s.is_zero(),
            Value::Ranges(r) => r.is_empty(),
            Value::Set(s) => s.is_empty(),
        }
    }

    /// Magnitude used for share computations: the scalar amount, the number
    /// of integers in a range set, or the number of set members.
    pub fn quantity(&self) -> f64 {
        match self {
            Value::Scalar(s) => s.as_f64(),
            Value::Ranges(r) => r.count() as f64,
            Value::Set(s) => s.len() as f64,
        }
    }

    pub(crate) fn add(&self, other: &Value, name: &str) -> Result<Value, ResourceError> {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(Scalar(
                a.0.checked_add(b.0)
                    .ok_or_else(|| ResourceError::InvalidScalar(format!("{a} + {b}")))?,
            ))),
            (Value::Ranges(a), Value::Ranges(b)) => Ok(Value::Ranges(a.union(b))),
            (Value::Set(a), Value::Set(b)) => Ok(Value::Set(a.union(b).cloned().collect())),
            _ => Err(self.mismatch(other, name)),
        }
    }

    pub(crate) fn sub(&self, other: &Value, name: &str) -> Result<Value, ResourceError> {
        let underflow = || ResourceError::Underflow {
            name: name.to_string(),
            wanted: other.to_string(),
            available: self.to_string(),
        };
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => a
                .0
                .checked_sub(b.0)
                .map(|m| Value::Scalar(Scalar(m)))
                .ok_or_else(underflow),
            (Value::Ranges(a), Value::Ranges(b)) => {
                a.difference(b).map(Value::Ranges).ok_or_else(underflow)
            }
            (Value::Set(a), Value::Set(b)) => {
                if b.is_subset(a) {
                    Ok(Value::Set(a.difference(b).cloned().collect()))
                } else {
                    Err(underflow())
                }
            }
            _ => Err(self.mismatch(other, name)),
        }
    }

    /// Kinds that disagree are never contained in each other.
    pub(crate) fn contains(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => a >= b,
            (Value::Ranges(a), Value::Ranges(b)) => a.contains(b),
            (Value::Set(a), Value::Set(b)) => b.is_subset(a),
            _ => false,
        }
    }

    fn mismatch(&self, other: &Value, name: &str) -> ResourceError {
        ResourceError::KindMismatch {
            name: name.to_string(),
            existing: self.kind(),
            incoming: other.kind(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(s) => fmt::Display::fmt(s, f),
            Value::Ranges(r) => fmt::Display::fmt(r, f),
            Value::Set(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(item)?;
                }
                f.write_str("}")
            }
        }
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{parse, ResourceError, Scalar, Value};

/// A bundle of named resource dimensions.
///
/// Dimensions are stored sorted by name; empty dimensions are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    inner: BTreeMap<String, Value>,
}

impl Resources {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `name:value;...` text format.
    pub fn parse(text: &str) -> Result<Self, ResourceError> {
        parse::parse(text)
    }

    /// Convenience constructor for a single scalar dimension.
    pub fn scalar(name: &str, amount: f64) -> Result<Self, ResourceError> {
        let mut out = Self::new();
        out.add_dimension(name, Value::Scalar(Scalar::from_f64(amount)?))?;
        Ok(out)
    }

    /// Adds `value` to the dimension `name`, creating it if absent.
    pub fn add_dimension(&mut self, name: &str, value: Value) -> Result<(), ResourceError> {
        let merged = match self.inner.get(name) {
            Some(existing) => existing.add(&value, name)?,
            None => value,
        };
        self.put(name.to_string(), merged);
        Ok(())
    }

    fn put(&mut self, name: String, value: Value) {
        if value.is_empty() {
            self.inner.remove(&name);
        } else {
            self.inner.insert(name, value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.inner.get(name)
    }

    /// Scalar amount of `name`, if it is a scalar dimension.
    pub fn get_scalar(&self, name: &str) -> Option<f64> {
        match self.inner.get(name) {
            Some(Value::Scalar(s)) => Some(s.as_f64()),
            _ => None,
        }
    }

    /// Magnitude of `name` for share computations; zero when absent.
    pub fn quantity(&self, name: &str) -> f64 {
        self.inner.get(name).map_or(0.0, Value::quantity)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True iff every dimension of `other` fits inside this bundle.
    pub fn contains(&self, other: &Resources) -> bool {
        other.inner.iter().all(|(name, wanted)| {
            self.inner
                .get(name)
                .is_some_and(|have| have.contains(wanted))
        })
    }

    pub fn checked_add(&self, other: &Resources) -> Result<Resources, ResourceError> {
        let mut out = self.clone();
        for (name, value) in &other.inner {
            out.add_dimension(name, value.clone())?;
        }
        Ok(out)
    }

    /// Fails with [`ResourceError::Underflow`] if any dimension of `other`
    /// exceeds this bundle.
    pub fn checked_sub(&self, other: &Resources) -> Result<Resources, ResourceError> {
        let mut out = self.clone();
        for (name, wanted) in &other.inner {
            let have = out.inner.get(name).ok_or_else(|| ResourceError::Underflow {
                name: name.clone(),
                wanted: wanted.to_string(),
                available: "nothing".to_string(),
            })?;
            let left = have.sub(wanted, name)?;
            out.put(name.clone(), left);
        }
        Ok(out)
    }

    /// In-place [`checked_add`](Self::checked_add); unchanged on error.
    pub fn try_add_assign(&mut self, other: &Resources) -> Result<(), ResourceError> {
        *self = self.checked_add(other)?;
        Ok(())
    }

    /// In-place [`checked_sub`](Self::checked_sub); unchanged on error.
    pub fn try_sub_assign(&mut self, other: &Resources) -> Result<(), ResourceError> {
        *self = self.checked_sub(other)?;
        Ok(())
    }

    /// Sums a sequence of bundles.
    pub fn try_sum<'a>(
        bundles: impl IntoIterator<Item = &'a Resources>,
    ) -> Result<Resources, ResourceError> {
        bundles
            .into_iter()
            .try_fold(Resources::new(), |acc, r| acc.checked_add(r))
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.inner.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{name}:{value}")?;
        }
        Ok(())
    }
}

impl FromStr for Resources {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for Resources {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Resources {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

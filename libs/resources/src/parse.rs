//! Text format.
//!
//! Entries are `name:value` separated by `;`. Whitespace around tokens is
//! ignored and empty entries are skipped. Repeated names are added together.

use std::collections::BTreeSet;

use crate::{Ranges, ResourceError, Resources, Scalar, Value};

pub(crate) fn parse(text: &str) -> Result<Resources, ResourceError> {
    let mut resources = Resources::new();

    for entry in text.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (name, raw) = entry
            .split_once(':')
            .ok_or_else(|| ResourceError::parse(entry, "expected 'name:value'"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ResourceError::parse(entry, "empty resource name"));
        }

        let value = parse_value(entry, raw.trim())?;
        resources.add_dimension(name, value)?;
    }

    Ok(resources)
}

fn parse_value(entry: &str, raw: &str) -> Result<Value, ResourceError> {
    if let Some(body) = raw.strip_prefix('[') {
        let body = body
            .strip_suffix(']')
            .ok_or_else(|| ResourceError::parse(entry, "unterminated range set"))?;
        return parse_ranges(entry, body).map(Value::Ranges);
    }

    if let Some(body) = raw.strip_prefix('{') {
        let body = body
            .strip_suffix('}')
            .ok_or_else(|| ResourceError::parse(entry, "unterminated string set"))?;
        let items: BTreeSet<String> = body
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        return Ok(Value::Set(items));
    }

    let amount: f64 = raw
        .parse()
        .map_err(|_| ResourceError::parse(entry, format!("'{raw}' is not a number")))?;
    Scalar::from_f64(amount).map(Value::Scalar)
}

fn parse_ranges(entry: &str, body: &str) -> Result<Ranges, ResourceError> {
    let mut intervals = Vec::new();

    for part in body.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (lo, hi) = match part.split_once('-') {
            Some((lo, hi)) => (lo.trim(), hi.trim()),
            None => (part, part),
        };
        let lo: u64 = lo
            .parse()
            .map_err(|_| ResourceError::parse(entry, format!("bad range bound '{lo}'")))?;
        let hi: u64 = hi
            .parse()
            .map_err(|_| ResourceError::parse(entry, format!("bad range bound '{hi}'")))?;
        if lo > hi {
            return Err(ResourceError::parse(
                entry,
                format!("range {lo}-{hi} is inverted"),
            ));
        }
        intervals.push((lo, hi));
    }

    Ok(Ranges::new(intervals))
}

//! Resource bundles for the cluster manager.
//!
//! A [`Resources`] bundle maps a dimension name to a typed [`Value`]:
//!
//! ```text
//! cpus:2;mem:1024;disk:1024;ports:[1-10, 20-30];zones:{eu-1, eu-2}
//! ```
//!
//! - scalars are fixed point with three decimal digits
//! - ranges are inclusive integer intervals, kept sorted and coalesced
//! - sets are sorted string sets
//!
//! Dimensions are kept in a `BTreeMap` and empty dimensions are dropped, so
//! equal quantities always compare equal and format identically.

mod error;
mod parse;
mod resources;
mod value;

pub use error::ResourceError;
pub use resources::Resources;
pub use value::{Ranges, Scalar, Value};

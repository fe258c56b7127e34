//! The flag set: a flat mapping from flag name to boolean value.
use std::collections::HashMap;

use derive_more::{Deref, From, Into};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A resolved set of feature flags.
///
/// Keys are open-ended flag names; a flag that is missing from the set is treated as `false` by
/// [`FlagsView::get`](crate::FlagsView::get).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, From, Into, Deref)]
#[serde(transparent)]
pub struct FlagSet(HashMap<String, bool>);

impl FlagSet {
    /// Create an empty flag set.
    pub fn new() -> FlagSet {
        FlagSet::default()
    }

    /// Convert an arbitrary JSON value into a flag set.
    ///
    /// Fails with [`Error::InvalidFlagShape`] unless `value` is an object whose values are all
    /// booleans.
    pub fn from_value(value: serde_json::Value) -> Result<FlagSet> {
        if !is_flags_shape(&value) {
            return Err(Error::InvalidFlagShape);
        }
        Ok(serde_json::from_value(value)?)
    }
}

impl<K: Into<String>> FromIterator<(K, bool)> for FlagSet {
    fn from_iter<T: IntoIterator<Item = (K, bool)>>(iter: T) -> Self {
        FlagSet(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Returns `true` if `value` is an object and every one of its values is a boolean.
///
/// A single non-boolean value anywhere rejects the whole object.
pub fn is_flags_shape(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => map.values().all(serde_json::Value::is_boolean),
        _ => false,
    }
}

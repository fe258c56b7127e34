//! Ready-made interceptors for forcing flags on top of the resolved set.
//!
//! Register them with [`FeatureFlagStorage::use_interceptor`](crate::FeatureFlagStorage::use_interceptor).
use crate::FlagSet;

/// An interceptor that answers for exactly the flags in `forced`.
pub fn fixed(forced: FlagSet) -> impl Fn(&str) -> Option<bool> + Send + Sync + 'static {
    move |key: &str| forced.get(key).copied()
}

/// Collect forced flags from `NAME=value` pairs whose name starts with `prefix`.
///
/// The prefix is stripped and the rest of the name lowercased, with `_` mapped to `-`, so
/// `FEATURE_FLAG_NEW_EDITOR=true` forces `new-editor`. Values are `true`/`1`/`on` or
/// `false`/`0`/`off` (case insensitive); anything else is ignored.
///
/// ```
/// # use feature_flags::overrides;
/// let forced = overrides::from_env_vars(
///     "FEATURE_FLAG_",
///     [("FEATURE_FLAG_NEW_EDITOR".to_owned(), "on".to_owned())],
/// );
/// assert_eq!(forced.get("new-editor"), Some(&true));
/// ```
///
/// Pass `std::env::vars()` to read the process environment.
pub fn from_env_vars(prefix: &str, vars: impl IntoIterator<Item = (String, String)>) -> FlagSet {
    vars.into_iter()
        .filter_map(|(name, value)| {
            let flag = name.strip_prefix(prefix)?;
            if flag.is_empty() {
                return None;
            }
            let value = match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => true,
                "false" | "0" | "off" => false,
                _ => {
                    log::warn!(target: "feature_flags", "ignoring {name}: {value:?} is not a boolean");
                    return None;
                }
            };
            Some((flag.to_ascii_lowercase().replace('_', "-"), value))
        })
        .collect()
}

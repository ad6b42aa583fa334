//! Overriding a group of named user settings and putting them back.

use super::PlatformResult;

/// String-valued per-user settings, such as values under one HKCU registry key.
pub(crate) trait SettingStore {
    fn get(&self, name: &str) -> PlatformResult<Option<String>>;
    fn set(&self, name: &str, value: &str) -> PlatformResult<()>;
    fn delete(&self, name: &str) -> PlatformResult<()>;
}

/// Previous value of each overridden setting; `None` means it did not exist.
pub(crate) type Saved = Vec<(String, Option<String>)>;

/// Write every override, returning the prior values in the same order.
///
/// A failed write puts back the values already changed before returning the error.
pub(crate) fn override_all(
    store: &dyn SettingStore,
    overrides: &[(&str, &str)],
) -> PlatformResult<Saved> {
    let mut saved = Saved::with_capacity(overrides.len());
    for (name, _) in overrides {
        saved.push((name.to_string(), store.get(name)?));
    }
    for (written, (name, value)) in overrides.iter().enumerate() {
        if let Err(e) = store.set(name, value) {
            let _ = restore_all(store, &saved[..written]);
            return Err(e);
        }
    }
    Ok(saved)
}

/// Restore every saved value, deleting those that did not exist. Keeps going
/// past failures and returns the first one.
pub(crate) fn restore_all(
    store: &dyn SettingStore,
    saved: &[(String, Option<String>)],
) -> PlatformResult<()> {
    let mut first_error = None;
    for (name, value) in saved {
        let result = match value {
            Some(value) => store.set(name, value),
            None => store.delete(name),
        };
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

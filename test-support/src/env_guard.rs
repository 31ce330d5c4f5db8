//! Scoped environment overrides for configuration tests.
//!
//! [`EnvVarGuard`] changes one or more variables and puts every original
//! value back on drop. Environment mutation is process-wide, so callers must
//! run serially (`#[serial_test::serial]`).

use std::ffi::{OsStr, OsString};

/// Restores the variables it touched when dropped.
#[derive(Debug, Default)]
pub struct EnvVarGuard {
    saved: Vec<(OsString, Option<OsString>)>,
}

impl EnvVarGuard {
    /// Set `key` to `value` until the guard is dropped.
    pub fn set(key: &str, value: &str) -> Self {
        let mut guard = Self::default();
        guard.save(key.into());
        write_var(key, Some(OsStr::new(value)));
        guard
    }

    /// Unset `key` until the guard is dropped.
    pub fn remove(key: &str) -> Self {
        let mut guard = Self::default();
        guard.save(key.into());
        write_var(key, None);
        guard
    }

    /// Unset every variable starting with `prefix`, e.g. `SW3D_`.
    ///
    /// Keeps stray overrides in the developer's shell from leaking into
    /// configuration tests.
    pub fn clear_prefixed(prefix: &str) -> Self {
        let mut guard = Self::default();
        let matching: Vec<OsString> = std::env::vars_os()
            .map(|(k, _)| k)
            .filter(|k| k.to_str().is_some_and(|k| k.starts_with(prefix)))
            .collect();
        for key in matching {
            guard.save(key.clone());
            write_var(&key, None);
        }
        guard
    }

    /// Also set `key` to `value`, restored by this same guard.
    #[must_use]
    pub fn and_set(mut self, key: &str, value: &str) -> Self {
        self.save(key.into());
        write_var(key, Some(OsStr::new(value)));
        self
    }

    fn save(&mut self, key: OsString) {
        let original = std::env::var_os(&key);
        self.saved.push((key, original));
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        // Reverse order so repeated keys end at their first saved value.
        for (key, original) in self.saved.drain(..).rev() {
            write_var(&key, original.as_deref());
        }
    }
}

fn write_var(key: impl AsRef<OsStr>, value: Option<&OsStr>) {
    // SAFETY: guards are only used from serialised tests.
    unsafe {
        match value {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
    }
}

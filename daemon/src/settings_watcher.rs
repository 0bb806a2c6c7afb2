/// Change detection for individual settings keys.
///
/// Config reloads arrive for any edit of the file, including edits that leave
/// a given key untouched.  A [`SettingsWatcher`] remembers the last value it
/// saw for one dotted key path and only reports real changes.
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use tracing::debug;

/// Live, shared view of the daemon's settings.
///
/// Clones share the same table; [`SettingsStore::replace`] is visible to every
/// watcher bound to the store.
#[derive(Debug, Clone, Default)]
pub struct SettingsStore {
    table: Arc<RwLock<toml::Table>>,
}

impl SettingsStore {
    pub fn new(table: toml::Table) -> Self {
        Self {
            table: Arc::new(RwLock::new(table)),
        }
    }

    pub fn replace(&self, table: toml::Table) {
        match self.table.write() {
            Ok(mut guard) => *guard = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
    }

    /// Looks up a dotted key path such as `appearance.dark.theme`.
    pub fn lookup(&self, key_path: &str) -> Option<toml::Value> {
        let guard = match self.table.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut segments = key_path.split('.');
        let mut value = guard.get(segments.next()?)?;
        for segment in segments {
            value = value.as_table()?.get(segment)?;
        }
        Some(value.clone())
    }
}

type StoreOpener = Box<dyn Fn() -> Option<SettingsStore> + Send>;

/// Fires a callback only when the value at `key_path` changes.
pub struct SettingsWatcher<T> {
    key_path: String,
    last: Option<T>,
    store: Option<SettingsStore>,
    open_store: StoreOpener,
}

impl<T> SettingsWatcher<T>
where
    T: DeserializeOwned + PartialEq + Clone,
{
    /// `open_store` is not called until the first [`poll`](Self::poll), so
    /// watchers can be declared before the settings have been loaded.
    pub fn new<F>(key_path: impl Into<String>, open_store: F) -> Self
    where
        F: Fn() -> Option<SettingsStore> + Send + 'static,
    {
        Self {
            key_path: key_path.into(),
            last: None,
            store: None,
            open_store: Box::new(open_store),
        }
    }

    #[cfg(test)]
    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    /// Last value the callback was fired with.
    #[cfg(test)]
    pub fn last(&self) -> Option<&T> {
        self.last.as_ref()
    }

    /// Reads the current value and calls `on_change(new, old)` if it differs
    /// from the last one seen.  `old` is `None` on the first firing.
    ///
    /// Returns the callback's result, or `None` when it did not fire.
    pub fn poll<R>(&mut self, on_change: impl FnOnce(&T, Option<&T>) -> R) -> Option<R> {
        if self.store.is_none() {
            self.store = (self.open_store)();
        }
        let Some(store) = self.store.as_ref() else {
            debug!(key = %self.key_path, "Settings store not available yet");
            return None;
        };

        let Some(raw) = store.lookup(&self.key_path) else {
            debug!(key = %self.key_path, "Setting is not present");
            return None;
        };
        let new: T = match raw.try_into() {
            Ok(value) => value,
            Err(e) => {
                debug!(key = %self.key_path, "Setting has an unexpected type: {e}");
                return None;
            }
        };

        if self.last.as_ref() == Some(&new) {
            return None;
        }
        let old = self.last.replace(new.clone());
        Some(on_change(&new, old.as_ref()))
    }
}

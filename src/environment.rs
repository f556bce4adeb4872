//! Container environment variables
//!
//! An ordered key/value mapping where setting an existing key replaces its
//! value in place, rendered to the `KEY=value` list the daemon expects.

use std::collections::BTreeMap;

/// Ordered environment for a container or exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerEnvironment {
    entries: Vec<(String, String)>,
}

impl ContainerEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, keeping its original position if already present.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
        self
    }

    /// Builder-style [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Apply every entry of `other` on top of this environment.
    pub fn merge<K, V, I>(&mut self, other: I) -> &mut Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in other {
            self.set(key, value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Render as `KEY=value` strings in insertion order.
    pub fn render(&self) -> Vec<String> {
        self.entries.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// System properties passed to the application server as one variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdditionalParameters {
    entries: BTreeMap<String, String>,
}

impl AdditionalParameters {
    /// Environment variable carrying the rendered parameters.
    pub const ENV_KEY: &'static str = "ADDITIONAL_PARAMETERS";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render as space-separated `-Dkey=value` options.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("-D{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Add the rendered parameters to `env`; does nothing when empty.
    pub fn apply_to(&self, env: &mut ContainerEnvironment) {
        if !self.is_empty() {
            env.set(Self::ENV_KEY, self.render());
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AdditionalParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.set(k, v);
        }
        params
    }
}

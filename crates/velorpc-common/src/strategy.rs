//! Key-based strategy resolution.
//!
//! Every pluggable capability (serializer, load balancer, retry, tolerance,
//! registry backend) is selected by a string key from configuration. A
//! [`StrategyRegistry`] maps keys to shared implementations and always has a
//! compiled-in default, so resolution never fails: a missing or unknown key
//! yields the default and a log line.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use velorpc_common::strategy::StrategyRegistry;
//!
//! trait Greeting: Send + Sync {
//!     fn word(&self) -> &'static str;
//! }
//! struct Hello;
//! struct Hola;
//! impl Greeting for Hello { fn word(&self) -> &'static str { "hello" } }
//! impl Greeting for Hola { fn word(&self) -> &'static str { "hola" } }
//!
//! let greetings: StrategyRegistry<dyn Greeting> =
//!     StrategyRegistry::new("greeting", "hello", Arc::new(Hello));
//! greetings.register("hola", Arc::new(Hola));
//!
//! assert_eq!(greetings.resolve(Some("hola")).word(), "hola");
//! assert_eq!(greetings.resolve(Some("bonjour")).word(), "hello");
//! assert_eq!(greetings.resolve(None).word(), "hello");
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub struct StrategyRegistry<T: ?Sized> {
    capability: &'static str,
    default_key: String,
    default: Arc<T>,
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> StrategyRegistry<T> {
    /// Creates a registry whose default is also registered under `default_key`.
    pub fn new(capability: &'static str, default_key: impl Into<String>, default: Arc<T>) -> Self {
        let default_key = default_key.into();
        let mut entries = HashMap::new();
        entries.insert(default_key.clone(), default.clone());
        Self {
            capability,
            default_key,
            default,
            entries: RwLock::new(entries),
        }
    }

    /// Name of the capability this registry resolves, used in log lines.
    pub fn capability(&self) -> &'static str {
        self.capability
    }

    pub fn default_key(&self) -> &str {
        &self.default_key
    }

    /// Resolves `key`, falling back to the default for a missing, blank or
    /// unknown key.
    pub fn resolve(&self, key: Option<&str>) -> Arc<T> {
        let key = match key.map(str::trim) {
            Some(k) if !k.is_empty() => k,
            _ => {
                tracing::debug!(
                    "No {} configured, using default '{}'",
                    self.capability,
                    self.default_key
                );
                return self.default.clone();
            }
        };

        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(found) => found.clone(),
            None => {
                tracing::warn!(
                    "Unknown {} '{}', falling back to default '{}'",
                    self.capability,
                    key,
                    self.default_key
                );
                self.default.clone()
            }
        }
    }

    /// Registers an implementation under `key`, replacing any previous one.
    ///
    /// Re-registering the default key changes what that key resolves to but
    /// not the fallback used for unknown keys.
    pub fn register(&self, key: impl Into<String>, implementation: Arc<T>) {
        let key = key.into();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.insert(key.clone(), implementation).is_some() {
            tracing::debug!("Replaced {} '{}'", self.capability, key);
        }
    }

    /// Registers every entry. Loading the same table twice leaves the
    /// registry unchanged.
    pub fn load<K, I>(&self, entries: I)
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Arc<T>)>,
    {
        for (key, implementation) in entries {
            self.register(key, implementation);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> String;
    }

    struct Fixed(&'static str);

    impl Named for Fixed {
        fn name(&self) -> String {
            self.0.to_string()
        }
    }

    fn registry() -> StrategyRegistry<dyn Named> {
        let registry: StrategyRegistry<dyn Named> =
            StrategyRegistry::new("test strategy", "alpha", Arc::new(Fixed("alpha")));
        registry.load(vec![
            ("beta", Arc::new(Fixed("beta")) as Arc<dyn Named>),
            ("gamma", Arc::new(Fixed("gamma")) as Arc<dyn Named>),
        ]);
        registry
    }

    #[test]
    fn test_resolves_registered_key() {
        assert_eq!(registry().resolve(Some("beta")).name(), "beta");
    }

    #[test]
    fn test_absent_and_blank_keys_fall_back() {
        let r = registry();
        assert_eq!(r.resolve(None).name(), "alpha");
        assert_eq!(r.resolve(Some("")).name(), "alpha");
        assert_eq!(r.resolve(Some("   ")).name(), "alpha");
    }

    #[test]
    fn test_unknown_key_falls_back() {
        assert_eq!(registry().resolve(Some("nonexistent")).name(), "alpha");
    }

    #[test]
    fn test_key_is_trimmed() {
        assert_eq!(registry().resolve(Some(" gamma ")).name(), "gamma");
    }

    #[test]
    fn test_reregistration_overwrites() {
        let r = registry();
        r.register("beta", Arc::new(Fixed("beta-2")));
        assert_eq!(r.resolve(Some("beta")).name(), "beta-2");
    }

    #[test]
    fn test_load_is_idempotent() {
        let r = registry();
        let before = r.keys();
        r.load(vec![("beta", Arc::new(Fixed("beta")) as Arc<dyn Named>)]);
        assert_eq!(r.keys(), before);
        assert_eq!(before, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_default_registered_under_its_key() {
        let r = registry();
        assert!(r.contains("alpha"));
        assert_eq!(r.default_key(), "alpha");
        assert_eq!(r.capability(), "test strategy");
    }
}

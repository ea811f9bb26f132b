use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use super::{Dada, Descriptor, Driver, Generic, Mark5B, Vdif};
use crate::prelude::*;
use crate::quantization::CodecSet;

/// Format drivers by name, plus the shared sample codecs.
#[derive(Debug, Clone)]
pub struct Registry {
    drivers: HashMap<String, Arc<dyn Driver>>,
    codecs: Arc<CodecSet>,
}

impl Default for Registry {
    /// Registry holding the built-in `vdif`, `mark5b`, and `dada` drivers.
    fn default() -> Self {
        let mut registry = Registry::empty();
        registry.register(Arc::new(Vdif::default()));
        registry.register(Arc::new(Mark5B::default()));
        registry.register(Arc::new(Dada::default()));
        registry
    }
}

impl Registry {
    /// Registry with no drivers.
    #[must_use]
    pub fn empty() -> Self {
        Registry {
            drivers: HashMap::new(),
            codecs: Arc::new(CodecSet::default()),
        }
    }

    /// Process-wide registry of the built-in drivers.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::default)
    }

    /// Add `driver`, replacing any driver registered under the same name.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        let name = driver.name().to_string();
        debug!(format = %name, "registering format driver");
        self.drivers.insert(name, driver);
    }

    /// Add a [Generic] driver for `descriptor`.
    ///
    /// # Errors
    /// If the descriptor is incomplete or inconsistent.
    pub fn register_descriptor(&mut self, descriptor: Descriptor) -> Result<()> {
        self.register(Arc::new(Generic::new(descriptor)?));
        Ok(())
    }

    /// Add a [Generic] driver from a JSON [Descriptor].
    ///
    /// # Errors
    /// [Error::Descriptor] for malformed JSON, [Error::Config] for an inconsistent
    /// descriptor.
    pub fn register_json(&mut self, json: &str) -> Result<()> {
        self.register(Arc::new(Generic::from_json(json)?));
        Ok(())
    }

    /// # Errors
    /// [Error::UnsupportedFormat] if no driver has this name.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnsupportedFormat(name.to_string()))
    }

    /// Registered format names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn codecs(&self) -> &Arc<CodecSet> {
        &self.codecs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = Registry::default();
        assert_eq!(registry.names(), vec!["dada", "mark5b", "vdif"]);
        assert_eq!(registry.lookup("vdif").unwrap().name(), "vdif");
    }

    #[test]
    fn unknown_format() {
        let err = Registry::global().lookup("vdif2000").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(name) if name == "vdif2000"));
    }

    #[test]
    fn register_json_adds_a_format() {
        let mut registry = Registry::empty();
        registry
            .register_json(
                r#"{
                    "name": "tiny",
                    "frame_size": {"fixed": 8},
                    "header_size": {"fixed": 4},
                    "sync": [222, 173],
                    "layout": {"word_bytes": 4, "words": 1, "endian": "little", "fields": []},
                    "quantization": {"bits": 2, "complex": false, "coding": "offset_binary"},
                    "nchan": 4
                }"#,
            )
            .unwrap();
        assert_eq!(registry.names(), vec!["tiny"]);

        assert!(matches!(
            registry.register_json("{\"name\": 1}"),
            Err(Error::Descriptor(_))
        ));
    }
}

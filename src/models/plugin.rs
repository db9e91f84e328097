//! Plugin descriptor, read from the plugin's `config.json` and registered in the
//! plugins store at startup.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::ConfigurationError;
use crate::messaging::messages::dispatcher_queue_name;

/// Identity and defaults of an analysis plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            depends_on: Vec::new(),
            description: String::new(),
            config: serde_json::Value::Null,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let descriptor_error = |reason: String| ConfigurationError::Descriptor {
            path: path.display().to_string(),
            reason,
        };

        let raw = std::fs::read_to_string(path).map_err(|e| descriptor_error(e.to_string()))?;
        let descriptor: Self =
            serde_json::from_str(&raw).map_err(|e| descriptor_error(e.to_string()))?;

        if descriptor.name.trim().is_empty() {
            return Err(descriptor_error("plugin name must not be empty".to_string()));
        }
        Ok(descriptor)
    }

    /// Inbound work queue for this plugin
    pub fn queue_name(&self) -> String {
        dispatcher_queue_name(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"name":"js-sbom","version":"1.0.0","depends_on":[],"description":"SBOM builder","config":{{"project":{{"type":"string"}}}}}}"#
        )
        .unwrap();

        let descriptor = PluginDescriptor::from_file(file.path()).unwrap();
        assert_eq!(descriptor.name, "js-sbom");
        assert_eq!(descriptor.queue_name(), "dispatcher_js-sbom");
        assert!(descriptor.config.get("project").is_some());
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = PluginDescriptor::from_file("/nonexistent/config.json").unwrap_err();
        assert!(matches!(err, ConfigurationError::Descriptor { .. }));
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name":"  ","version":"1.0.0"}}"#).unwrap();
        assert!(PluginDescriptor::from_file(file.path()).is_err());
    }
}

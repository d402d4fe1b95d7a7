//! Metadata Record encoding.

use std::collections::BTreeMap;

use faasgrid_core::ServiceDescriptor;
use faasgrid_core::constants::{DESCRIPTOR_KEY, SCRIPT_KEY, SERVICE_LABEL};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::{StateError, StateResult};

/// A descriptor split into its serialized form and its script.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub service: ServiceDescriptor,
    pub script: String,
}

impl MetadataRecord {
    pub fn from_descriptor(service: &ServiceDescriptor) -> Self {
        let mut stripped = service.clone();
        let script = std::mem::take(&mut stripped.script);
        Self {
            service: stripped,
            script,
        }
    }

    /// Rejoin the script with the descriptor.
    pub fn into_descriptor(self) -> ServiceDescriptor {
        ServiceDescriptor {
            script: self.script,
            ..self.service
        }
    }

    pub fn name(&self) -> &str {
        &self.service.name
    }

    /// Build the ConfigMap persisting this record.
    pub fn to_config_map(&self, namespace: &str) -> StateResult<ConfigMap> {
        let yaml = self.service.to_yaml().map_err(|e| StateError::Encode {
            service: self.service.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.service.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    SERVICE_LABEL.to_string(),
                    self.service.name.clone(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (DESCRIPTOR_KEY.to_string(), yaml),
                (SCRIPT_KEY.to_string(), self.script.clone()),
            ])),
            ..Default::default()
        })
    }

    /// Decode a stored ConfigMap. A missing descriptor key or malformed
    /// YAML is a [`StateError::Decode`]; a missing script is an empty one.
    pub fn from_config_map(config_map: &ConfigMap) -> StateResult<Self> {
        let service_name = config_map.metadata.name.clone().unwrap_or_default();
        let decode_err = |reason: String| StateError::Decode {
            service: service_name.clone(),
            reason,
        };

        let data = config_map
            .data
            .as_ref()
            .ok_or_else(|| decode_err("record has no data".to_string()))?;
        let yaml = data
            .get(DESCRIPTOR_KEY)
            .ok_or_else(|| decode_err(format!("missing {DESCRIPTOR_KEY}")))?;
        let service = ServiceDescriptor::from_yaml(yaml).map_err(|e| decode_err(e.to_string()))?;
        let script = data.get(SCRIPT_KEY).cloned().unwrap_or_default();

        Ok(Self { service, script })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor {
            name: "s1".to_string(),
            image: "alpine".to_string(),
            cpu: "1.0".to_string(),
            memory: "1Gi".to_string(),
            script: "#!/bin/sh\necho $INPUT_FILE_PATH\n".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn config_map_layout() {
        let record = MetadataRecord::from_descriptor(&descriptor());
        let cm = record.to_config_map("faasgrid-svc").unwrap();

        assert_eq!(cm.metadata.name.as_deref(), Some("s1"));
        assert_eq!(
            cm.metadata.labels.as_ref().unwrap().get(SERVICE_LABEL).map(String::as_str),
            Some("s1")
        );
        let data = cm.data.as_ref().unwrap();
        assert_eq!(data.len(), 2);
        assert!(data[SCRIPT_KEY].contains("INPUT_FILE_PATH"));
        assert!(!data[DESCRIPTOR_KEY].contains("INPUT_FILE_PATH"));
    }

    #[test]
    fn decodes_back_to_the_same_descriptor() {
        let original = descriptor();
        let cm = MetadataRecord::from_descriptor(&original)
            .to_config_map("ns")
            .unwrap();
        let decoded = MetadataRecord::from_config_map(&cm).unwrap().into_descriptor();
        assert_eq!(decoded, original);
    }

    #[test]
    fn undecodable_records() {
        let mut cm = MetadataRecord::from_descriptor(&descriptor())
            .to_config_map("ns")
            .unwrap();
        cm.data
            .as_mut()
            .unwrap()
            .insert(DESCRIPTOR_KEY.to_string(), "name: [unterminated".to_string());
        assert!(matches!(
            MetadataRecord::from_config_map(&cm),
            Err(StateError::Decode { .. })
        ));

        cm.data = None;
        assert!(matches!(
            MetadataRecord::from_config_map(&cm),
            Err(StateError::Decode { .. })
        ));
    }
}

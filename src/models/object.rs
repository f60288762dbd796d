//! Object records mirrored from the remote source
//!
//! Every record carries an identity (namespace/name) and a resource version
//! token. The payload itself is opaque to the controller.

use serde::{Deserialize, Serialize};

/// Identity and revision of a remote object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Namespace, or `None` for cluster-scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Object name, unique within its namespace
    pub name: String,

    /// Opaque revision token assigned by the source
    #[serde(default)]
    pub resource_version: String,
}

impl ObjectMeta {
    /// Create metadata for a namespaced object
    pub fn namespaced(
        namespace: impl Into<String>,
        name: impl Into<String>,
        resource_version: impl Into<String>,
    ) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
            resource_version: resource_version.into(),
        }
    }

    /// Create metadata for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>, resource_version: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
            resource_version: resource_version.into(),
        }
    }
}

/// An object that can be mirrored in the cache
///
/// The controller never looks past the metadata; everything else is payload.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Identity and revision of this object
    fn metadata(&self) -> &ObjectMeta;

    /// Mutable access to the metadata, used by sources that stamp revisions
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Revision token of this object
    fn resource_version(&self) -> &str {
        &self.metadata().resource_version
    }
}

/// Schemaless object: metadata plus an arbitrary JSON body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicObject {
    /// Object metadata
    pub metadata: ObjectMeta,

    /// Every other top-level field
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl DynamicObject {
    /// Create an object with an empty body
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            metadata,
            data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Replace the body
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

impl Resource for DynamicObject {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Full snapshot of the remote collection
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectList<K> {
    /// Collection revision the snapshot was taken at; watches resume from here
    pub resource_version: String,

    /// Every object in the collection
    pub items: Vec<K>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Test 1: Metadata uses camelCase on the wire
    #[test]
    fn test_object_meta_wire_format() {
        let meta = ObjectMeta::namespaced("default", "pod-a", "42");
        let value = serde_json::to_value(&meta).unwrap();

        assert_eq!(
            value,
            json!({"namespace": "default", "name": "pod-a", "resourceVersion": "42"})
        );
    }

    // Test 2: Cluster-scoped metadata omits the namespace
    #[test]
    fn test_cluster_scoped_meta_omits_namespace() {
        let meta = ObjectMeta::cluster_scoped("node-1", "7");
        let value = serde_json::to_value(&meta).unwrap();

        assert_eq!(value, json!({"name": "node-1", "resourceVersion": "7"}));
    }

    // Test 3: DynamicObject keeps unknown fields as payload
    #[test]
    fn test_dynamic_object_roundtrip_keeps_payload() {
        let raw = json!({
            "metadata": {"namespace": "ns", "name": "pod-a", "resourceVersion": "3"},
            "spec": {"containers": [{"name": "app"}]},
            "status": {"phase": "Running"}
        });

        let obj: DynamicObject = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(obj.metadata.name, "pod-a");
        assert_eq!(obj.resource_version(), "3");
        assert_eq!(obj.data["status"]["phase"], "Running");

        assert_eq!(serde_json::to_value(&obj).unwrap(), raw);
    }

    // Test 4: Missing resource version defaults to empty
    #[test]
    fn test_missing_resource_version_defaults_empty() {
        let obj: DynamicObject =
            serde_json::from_value(json!({"metadata": {"name": "orphan"}})).unwrap();

        assert_eq!(obj.metadata.namespace, None);
        assert_eq!(obj.resource_version(), "");
    }
}

use crate::errors::*;
use serde::Deserialize;
use serde_yaml::Value;

/// Annotation listing the images observed in a document.
pub const IMAGES_ANNOTATION: &str = "kbld.k14s.io/images";

/// One YAML document from the input stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    doc: Value,
}

impl Resource {
    pub fn from_value(doc: Value) -> Resource {
        Resource { doc }
    }

    /// Parses a stream of `---` separated YAML documents, skipping empty ones.
    pub fn parse_stream(buf: &str) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        for document in serde_yaml::Deserializer::from_str(buf) {
            let doc = Value::deserialize(document).context("Failed to parse yaml document")?;
            if doc.is_null() {
                continue;
            }
            resources.push(Resource { doc });
        }
        Ok(resources)
    }

    pub fn api_version(&self) -> Option<&str> {
        self.doc.get("apiVersion")?.as_str()
    }

    pub fn kind(&self) -> Option<&str> {
        self.doc.get("kind")?.as_str()
    }

    pub fn value(&self) -> &Value {
        &self.doc
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.doc
    }

    pub fn deep_copy(&self) -> Resource {
        self.clone()
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        let buf = serde_yaml::to_string(&self.doc).context("Failed to serialize yaml document")?;
        Ok(buf.into_bytes())
    }

    /// Sets `metadata.annotations.<key>`, creating the intermediate maps.
    pub fn set_annotation(&mut self, key: &str, value: String) -> Result<()> {
        let root = self
            .doc
            .as_mapping_mut()
            .context("Expected document to be a yaml mapping")?;

        let metadata = root
            .entry(Value::from("metadata"))
            .or_insert_with(|| Value::Mapping(Default::default()));
        let metadata = metadata
            .as_mapping_mut()
            .context("Expected metadata to be a yaml mapping")?;

        let annotations = metadata
            .entry(Value::from("annotations"))
            .or_insert_with(|| Value::Mapping(Default::default()));
        let annotations = annotations
            .as_mapping_mut()
            .context("Expected metadata.annotations to be a yaml mapping")?;

        annotations.insert(Value::from(key), Value::from(value));
        Ok(())
    }
}

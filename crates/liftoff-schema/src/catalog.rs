use crate::records::Provider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outputs every service product must declare: where to push images and
/// which release pointer to move.
pub const SERVICE_REQUIRED_OUTPUTS: [&str; 2] = ["artifact_repository", "release_target"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    Resource,
    Service,
    Environment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProductSpec {
    pub kind: ProductKind,
    pub provider: Provider,
    /// Module directory, relative to the configured modules root.
    pub module: String,
    /// Output fields the module must return.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Output field that carries the provider-side identifier.
    #[serde(default = "default_id_output")]
    pub id_output: String,
}

fn default_id_output() -> String {
    "id".to_owned()
}

impl ProductSpec {
    pub fn new(kind: ProductKind, provider: Provider, module: &str, outputs: &[&str]) -> Self {
        Self {
            kind,
            provider,
            module: module.to_owned(),
            outputs: outputs.iter().map(|s| (*s).to_owned()).collect(),
            id_output: default_id_output(),
        }
    }

    /// Declared output fields absent from `outputs`.
    pub fn missing_outputs(&self, outputs: &BTreeMap<String, String>) -> Vec<String> {
        self.outputs
            .iter()
            .filter(|field| !outputs.contains_key(field.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ProductCatalog {
    products: BTreeMap<String, ProductSpec>,
}

impl ProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: &str, spec: ProductSpec) -> Self {
        self.insert(name, spec);
        self
    }

    pub fn insert(&mut self, name: &str, spec: ProductSpec) {
        self.products.insert(name.to_owned(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ProductSpec> {
        self.products.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ProductSpec)> {
        self.products.iter()
    }

    /// The environment-level product for a provider, if one is declared.
    pub fn environment_product(&self, provider: Provider) -> Option<(&String, &ProductSpec)> {
        self.products
            .iter()
            .find(|(_, spec)| spec.kind == ProductKind::Environment && spec.provider == provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_outputs_lists_absent_fields() {
        let spec = ProductSpec::new(
            ProductKind::Resource,
            Provider::Gcp,
            "gcp_bucket",
            &["bucket_name", "url"],
        );
        let mut outputs = BTreeMap::new();
        outputs.insert("bucket_name".to_owned(), "b".to_owned());
        outputs.insert("extra".to_owned(), "ignored".to_owned());
        assert_eq!(spec.missing_outputs(&outputs), vec!["url".to_owned()]);
    }

    #[test]
    fn catalog_parses_from_toml_with_default_id_output() {
        let catalog: ProductCatalog = toml::from_str(
            r#"
[gcp_bucket]
kind = "resource"
provider = "gcp"
module = "gcp/bucket"
outputs = ["bucket_name"]

[gcp_env]
kind = "environment"
provider = "gcp"
module = "gcp/environment"
"#,
        )
        .unwrap();
        let bucket = catalog.get("gcp_bucket").unwrap();
        assert_eq!(bucket.id_output, "id");
        assert_eq!(bucket.module, "gcp/bucket");
        assert_eq!(
            catalog.environment_product(Provider::Gcp).map(|(n, _)| n.as_str()),
            Some("gcp_env")
        );
        assert!(catalog.environment_product(Provider::Aws).is_none());
    }

    #[test]
    fn catalog_rejects_unknown_fields() {
        let result: Result<ProductCatalog, _> = toml::from_str(
            r#"
[x]
kind = "resource"
provider = "gcp"
module = "m"
colour = "blue"
"#,
        );
        assert!(result.is_err());
    }
}

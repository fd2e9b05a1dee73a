use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A handle to one output field of another resource.
///
/// Declared in configuration as `{ output = "connection_url", of = "db" }`.
/// The referenced resource must be applied before the referencing one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputHandle {
    pub output: String,
    pub of: String,
}

impl fmt::Display for OutputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.of, self.output)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Output(OutputHandle),
    Literal(serde_json::Value),
}

impl InputValue {
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn output_of(resource: &str, field: &str) -> Self {
        Self::Output(OutputHandle {
            output: field.to_owned(),
            of: resource.to_owned(),
        })
    }
}

/// Inputs as declared in configuration, keyed by variable name.
pub type Inputs = BTreeMap<String, InputValue>;

/// Names of every resource referenced through an [`OutputHandle`].
pub fn referenced_resources(inputs: &Inputs) -> BTreeSet<String> {
    inputs
        .values()
        .filter_map(|v| match v {
            InputValue::Output(handle) => Some(handle.of.clone()),
            InputValue::Literal(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_reference_parses_from_toml() {
        let inputs: Inputs = toml::from_str(
            r#"
tier = "db-f1-micro"
replicas = 2
url = { output = "connection_url", of = "db" }
"#,
        )
        .unwrap();
        assert_eq!(inputs["tier"], InputValue::literal("db-f1-micro"));
        assert_eq!(inputs["replicas"], InputValue::literal(2));
        assert_eq!(inputs["url"], InputValue::output_of("db", "connection_url"));
    }

    #[test]
    fn tables_with_other_keys_stay_literal() {
        let inputs: Inputs = toml::from_str(
            r#"
labels = { team = "core", tier = "gold" }
"#,
        )
        .unwrap();
        assert!(matches!(inputs["labels"], InputValue::Literal(_)));
    }

    #[test]
    fn referenced_resources_collects_unique_names() {
        let mut inputs = Inputs::new();
        inputs.insert("a".to_owned(), InputValue::output_of("db", "host"));
        inputs.insert("b".to_owned(), InputValue::output_of("db", "port"));
        inputs.insert("c".to_owned(), InputValue::output_of("queue", "url"));
        inputs.insert("d".to_owned(), InputValue::literal(true));
        let refs = referenced_resources(&inputs);
        assert_eq!(refs.into_iter().collect::<Vec<_>>(), vec!["db", "queue"]);
    }

    #[test]
    fn json_roundtrip_keeps_handles() {
        let value = InputValue::output_of("db", "host");
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"output":"host","of":"db"}"#);
        let back: InputValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}

use crate::CoreError;
use liftoff_schema::{ResourceConfig, ServiceConfig};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_resources(resources: &[ResourceConfig]) -> Self {
        let mut graph = Self::new();
        for r in resources {
            graph.add(&r.name, r.dependencies());
        }
        graph
    }

    pub fn with_services(mut self, services: &[ServiceConfig]) -> Self {
        for s in services {
            self.add(&s.name, s.dependencies());
        }
        self
    }

    pub fn add(&mut self, unit: &str, deps: BTreeSet<String>) {
        self.deps.entry(unit.to_owned()).or_default().extend(deps);
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.deps.contains_key(unit)
    }

    pub fn dependencies(&self, unit: &str) -> impl Iterator<Item = &String> {
        self.deps.get(unit).into_iter().flatten()
    }

    /// Units that depend directly on `unit`, sorted.
    pub fn dependents(&self, unit: &str) -> Vec<String> {
        self.deps
            .iter()
            .filter(|(_, deps)| deps.contains(unit))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// `roots` plus everything they depend on, transitively.
    pub fn closure<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = roots.into_iter().map(str::to_owned).collect();
        while let Some(unit) = stack.pop() {
            if !seen.insert(unit.clone()) {
                continue;
            }
            stack.extend(self.dependencies(&unit).cloned());
        }
        seen
    }

    /// Kahn's algorithm, one layer at a time. Units in a layer only depend
    /// on earlier layers; names inside a layer are sorted. Dependencies on
    /// units outside the graph are ignored here (they must already exist).
    pub fn layers(&self) -> Result<Vec<Vec<String>>, CoreError> {
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = self
            .deps
            .iter()
            .map(|(unit, deps)| {
                let inside = deps
                    .iter()
                    .map(String::as_str)
                    .filter(|d| self.deps.contains_key(*d))
                    .collect();
                (unit.as_str(), inside)
            })
            .collect();

        let mut layers = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(unit, _)| *unit)
                .collect();
            if ready.is_empty() {
                return Err(CoreError::DependencyCycle(
                    remaining.keys().map(|s| (*s).to_owned()).collect(),
                ));
            }
            for unit in &ready {
                remaining.remove(unit);
            }
            for deps in remaining.values_mut() {
                for unit in &ready {
                    deps.remove(unit);
                }
            }
            layers.push(ready.into_iter().map(str::to_owned).collect());
        }
        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_schema::InputValue;

    fn resource(name: &str, depends_on: &[&str]) -> ResourceConfig {
        ResourceConfig {
            name: name.to_owned(),
            product: "p".to_owned(),
            depends_on: depends_on.iter().map(|s| (*s).to_owned()).collect(),
            inputs: Default::default(),
        }
    }

    #[test]
    fn layers_respect_dependencies() {
        let mut cache = resource("cache", &[]);
        cache
            .inputs
            .insert("network".to_owned(), InputValue::output_of("vpc", "id"));
        let graph = DependencyGraph::from_resources(&[
            resource("db", &["vpc"]),
            cache,
            resource("vpc", &[]),
            resource("bucket", &[]),
            resource("worker", &["db", "cache"]),
        ]);
        let layers = graph.layers().unwrap();
        assert_eq!(
            layers,
            vec![
                vec!["bucket".to_owned(), "vpc".to_owned()],
                vec!["cache".to_owned(), "db".to_owned()],
                vec!["worker".to_owned()],
            ]
        );
    }

    #[test]
    fn cycles_are_reported() {
        let graph = DependencyGraph::from_resources(&[
            resource("a", &["b"]),
            resource("b", &["c"]),
            resource("c", &["a"]),
            resource("free", &[]),
        ]);
        match graph.layers() {
            Err(CoreError::DependencyCycle(units)) => assert_eq!(units, vec!["a", "b", "c"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn external_dependencies_do_not_block() {
        let graph = DependencyGraph::from_resources(&[resource("db", &["already-there"])]);
        assert_eq!(graph.layers().unwrap(), vec![vec!["db".to_owned()]]);
    }

    #[test]
    fn closure_and_dependents() {
        let graph = DependencyGraph::from_resources(&[
            resource("vpc", &[]),
            resource("db", &["vpc"]),
            resource("queue", &[]),
        ])
        .with_services(&[ServiceConfig {
            name: "api".to_owned(),
            product: "run".to_owned(),
            dockerfile: "Dockerfile".to_owned(),
            build_directory: ".".into(),
            build_ignore: vec![],
            depends_on: vec!["db".to_owned()],
            inputs: Default::default(),
        }]);
        let closure = graph.closure(["api"]);
        assert_eq!(
            closure.into_iter().collect::<Vec<_>>(),
            vec!["api", "db", "vpc"]
        );
        assert_eq!(graph.dependents("db"), vec!["api"]);
        assert_eq!(graph.dependents("vpc"), vec!["db"]);
        assert!(graph.dependents("queue").is_empty());
    }
}

use crate::bucket::{BucketProvider, WriteCondition};
use crate::StoreError;
use liftoff_schema::{EnvName, Outputs, ProjectName};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Identity of one resource's outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputsKey {
    pub project: ProjectName,
    pub environment: EnvName,
    pub product: String,
    pub resource: String,
}

impl OutputsKey {
    pub fn new(project: &ProjectName, environment: &EnvName, product: &str, resource: &str) -> Self {
        Self {
            project: project.clone(),
            environment: environment.clone(),
            product: product.to_owned(),
            resource: resource.to_owned(),
        }
    }

    /// Object name inside the environment's artifact bucket.
    pub fn object_name(&self) -> String {
        format!("resources/{}.yaml", self.resource)
    }
}

impl fmt::Display for OutputsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.project, self.environment, self.product, self.resource
        )
    }
}

/// Provider outputs of applied resources.
///
/// Durable copies live as flat YAML maps at `resources/{name}.yaml` in the
/// environment's artifact bucket. Lookups are memoized in a map owned by
/// this value, so its lifetime is that of one orchestrator run. Entries are
/// keyed by bucket as well, since two environments may share a key.
pub struct OutputsCache {
    buckets: Arc<dyn BucketProvider>,
    local: RwLock<HashMap<(String, OutputsKey), Outputs>>,
}

impl OutputsCache {
    pub fn new(buckets: Arc<dyn BucketProvider>) -> Self {
        Self {
            buckets,
            local: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, bucket: &str, key: &OutputsKey) -> Result<Option<Outputs>, StoreError> {
        let cache_key = (bucket.to_owned(), key.clone());
        let hit = self
            .local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key)
            .cloned();
        if hit.is_some() {
            return Ok(hit);
        }
        let Some(object) = self.buckets.bucket(bucket).get(&key.object_name()).await? else {
            return Ok(None);
        };
        let outputs: Outputs = serde_yaml::from_slice(&object.data)?;
        debug!(key = %key, bucket, "outputs loaded from bucket");
        self.local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache_key, outputs.clone());
        Ok(Some(outputs))
    }

    pub async fn put(&self, bucket: &str, key: &OutputsKey, outputs: &Outputs) -> Result<(), StoreError> {
        let yaml = serde_yaml::to_string(outputs)?;
        self.buckets
            .bucket(bucket)
            .put(&key.object_name(), yaml.into_bytes(), WriteCondition::Always)
            .await?;
        self.local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((bucket.to_owned(), key.clone()), outputs.clone());
        debug!(key = %key, bucket, fields = outputs.len(), "outputs cached");
        Ok(())
    }

    pub async fn remove(&self, bucket: &str, key: &OutputsKey) -> Result<(), StoreError> {
        self.local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(bucket.to_owned(), key.clone()));
        self.buckets
            .bucket(bucket)
            .delete(&key.object_name(), WriteCondition::Always)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBuckets, ObjectStorage};

    fn key() -> OutputsKey {
        OutputsKey::new(
            &ProjectName::new("shop"),
            &EnvName::new("dev"),
            "gcp_sql",
            "db",
        )
    }

    fn outputs() -> Outputs {
        let mut o = Outputs::new();
        o.insert("connection_url".to_owned(), "postgres://db:5432".to_owned());
        o.insert("id".to_owned(), "projects/p/instances/db".to_owned());
        o
    }

    #[test]
    fn key_format() {
        assert_eq!(key().to_string(), "shop:dev:gcp_sql:db");
        assert_eq!(key().object_name(), "resources/db.yaml");
    }

    #[tokio::test]
    async fn put_writes_yaml_to_bucket() {
        let buckets = Arc::new(MemoryBuckets::new());
        let cache = OutputsCache::new(buckets.clone());
        cache.put("shop-dev", &key(), &outputs()).await.unwrap();

        let object = buckets
            .get("shop-dev")
            .get("resources/db.yaml")
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8(object.data).unwrap();
        assert!(text.contains("connection_url: postgres://db:5432"));
    }

    #[tokio::test]
    async fn fresh_cache_reads_durable_copy() {
        let buckets = Arc::new(MemoryBuckets::new());
        OutputsCache::new(buckets.clone())
            .put("shop-dev", &key(), &outputs())
            .await
            .unwrap();

        let next_run = OutputsCache::new(buckets);
        assert_eq!(next_run.get("shop-dev", &key()).await.unwrap(), Some(outputs()));
        assert!(next_run.get("other-bucket", &key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_local_entries_stay_in_their_bucket() {
        let cache = OutputsCache::new(Arc::new(MemoryBuckets::new()));
        cache.put("shop-dev", &key(), &outputs()).await.unwrap();
        assert_eq!(cache.get("shop-dev", &key()).await.unwrap(), Some(outputs()));
        assert!(cache.get("shop-prod", &key()).await.unwrap().is_none());

        cache.remove("shop-prod", &key()).await.unwrap();
        assert_eq!(cache.get("shop-dev", &key()).await.unwrap(), Some(outputs()));
    }

    #[tokio::test]
    async fn remove_clears_both_layers() {
        let buckets = Arc::new(MemoryBuckets::new());
        let cache = OutputsCache::new(buckets);
        cache.put("b", &key(), &outputs()).await.unwrap();
        cache.remove("b", &key()).await.unwrap();
        assert!(cache.get("b", &key()).await.unwrap().is_none());
    }
}

//! Provisioning driver.
//!
//! Turns one unit (a resource, a service's infrastructure, or the
//! environment itself) into an engine run: output handles are resolved
//! against the run's outputs cache, inputs and environment context become
//! the engine's variable set, the engine converges the unit's module against
//! its own state location, and the returned outputs are checked against the
//! product's declared schema before they are cached.

use crate::concurrency::fan_out;
use crate::context::{EnvironmentView, Run};
use crate::graph::DependencyGraph;
use crate::report::{UnitKind, UnitReport};
use crate::CoreError;
use liftoff_runtime::{EngineRequest, LogSink, RuntimeError};
use liftoff_schema::{
    referenced_resources, InputValue, Inputs, LockToken, OperationType, Outputs, ProductSpec,
    RecordKey, RecordKind, ResourceConfig, ResourceRecord, ResourceStatus,
};
use liftoff_store::OutputsKey;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// One unit the engine converges.
#[derive(Debug, Clone, Copy)]
pub struct Unit<'a> {
    pub key: &'a RecordKey,
    pub product_name: &'a str,
    pub product: &'a ProductSpec,
    pub inputs: &'a Inputs,
    pub depends_on: &'a [String],
}

impl Unit<'_> {
    pub fn name(&self) -> &str {
        self.key.name.as_deref().unwrap_or("environment")
    }

    /// Provider-side name handed to modules as `resource_id`.
    fn resource_id(&self) -> String {
        match &self.key.name {
            Some(name) => format!("{}-{}-{name}", self.key.project, self.key.environment),
            None => format!("{}-{}", self.key.project, self.key.environment),
        }
    }

    fn outputs_key(&self) -> OutputsKey {
        OutputsKey::new(
            &self.key.project,
            &self.key.environment,
            self.product_name,
            self.name(),
        )
    }
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Resolve every declared input to a JSON value.
///
/// A handle to a resource that is not `ready`, or whose outputs were never
/// cached, fails with `DependencyNotReady`; a handle to a field the resource
/// did not return fails with `MissingOutput`. Explicit `depends_on` entries
/// must be ready as well.
pub async fn resolve_inputs(
    run: &Run,
    env: &EnvironmentView,
    unit: &str,
    inputs: &Inputs,
    depends_on: &[String],
) -> Result<BTreeMap<String, Value>, CoreError> {
    let mut wanted: BTreeSet<String> = referenced_resources(inputs);
    wanted.extend(depends_on.iter().cloned());

    let mut outputs: BTreeMap<String, Outputs> = BTreeMap::new();
    for dependency in wanted {
        let record: Option<ResourceRecord> = run
            .ctx()
            .store()
            .get(&RecordKey::resource(&env.project, &env.name, &dependency))
            .await?;
        let not_ready = || CoreError::DependencyNotReady {
            unit: unit.to_owned(),
            dependency: dependency.clone(),
        };
        let record = record.filter(ResourceRecord::is_ready).ok_or_else(not_ready)?;
        let key = OutputsKey::new(&env.project, &env.name, &record.product, &dependency);
        let cached = run
            .outputs()
            .get(env.bucket(), &key)
            .await?
            .ok_or_else(not_ready)?;
        outputs.insert(dependency, cached);
    }

    let mut resolved = BTreeMap::new();
    for (name, value) in inputs {
        let value = match value {
            InputValue::Literal(v) => v.clone(),
            InputValue::Output(handle) => {
                let field = outputs
                    .get(&handle.of)
                    .and_then(|o| o.get(&handle.output))
                    .ok_or_else(|| CoreError::MissingOutput {
                        unit: unit.to_owned(),
                        resource: handle.of.clone(),
                        output: handle.output.clone(),
                    })?;
                Value::String(field.clone())
            }
        };
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

/// Resolved inputs rendered as strings, as release targets expect them.
pub fn stringify(values: BTreeMap<String, Value>) -> BTreeMap<String, String> {
    values
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect()
}

fn engine_request(
    run: &Run,
    env: &EnvironmentView,
    unit: &Unit<'_>,
    mut variables: BTreeMap<String, Value>,
    lock_id: &LockToken,
) -> EngineRequest {
    let provider = &env.record.provider_config;
    for (name, value) in [
        ("project", env.project.to_string()),
        ("environment", env.name.to_string()),
        ("resource_id", unit.resource_id()),
        ("region", provider.region.clone()),
        ("account_id", provider.account_id.clone()),
        ("identity", provider.identity.clone()),
        ("artifact_bucket", provider.artifact_bucket.clone()),
        ("provider", provider.provider.to_string()),
    ] {
        variables.insert(name.to_owned(), Value::String(value));
    }
    EngineRequest {
        unit: unit.name().to_owned(),
        module_dir: run.ctx().settings().modules_dir.join(&unit.product.module),
        state: run
            .ctx()
            .engine_state()
            .location(env, unit.key, lock_id.as_str()),
        variables,
    }
}

fn engine_failure(unit: &str, source: RuntimeError, sink: &dyn LogSink, destroy: bool) -> CoreError {
    if let Err(e) = sink.flush() {
        warn!(unit, error = %e, "failed to flush unit log");
    }
    let log_ref = sink.reference();
    if destroy {
        CoreError::DestroyFailed {
            unit: unit.to_owned(),
            source,
            log_ref,
        }
    } else {
        CoreError::ProvisionFailed {
            unit: unit.to_owned(),
            source,
            log_ref,
        }
    }
}

/// Run the engine for `unit` with already resolved `variables`, validate
/// its outputs, and cache them. The caller holds the unit's lock.
pub async fn converge(
    run: &Run,
    env: &EnvironmentView,
    unit: &Unit<'_>,
    variables: BTreeMap<String, Value>,
    lock_id: &LockToken,
    sink: &dyn LogSink,
) -> Result<Outputs, CoreError> {
    let request = engine_request(run, env, unit, variables, lock_id);
    let engine = &run.ctx().bindings().engine;
    info!(
        unit = unit.name(),
        engine = engine.name(),
        state = %request.state.render(),
        "applying"
    );
    let outputs = tokio::select! {
        () = run.cancel().cancelled() => {
            let _ = sink.flush();
            return Err(CoreError::Cancelled);
        }
        applied = engine.apply(&request, sink) => {
            applied.map_err(|e| engine_failure(unit.name(), e, sink, false))?
        }
    };

    let missing = unit.product.missing_outputs(&outputs);
    if !missing.is_empty() {
        let _ = sink.flush();
        return Err(CoreError::InvalidOutputForResource {
            unit: unit.name().to_owned(),
            product: unit.product_name.to_owned(),
            missing,
        });
    }
    if unit.key.kind != RecordKind::Environment {
        run.outputs()
            .put(env.bucket(), &unit.outputs_key(), &outputs)
            .await?;
    }
    debug!(unit = unit.name(), fields = outputs.len(), "outputs validated");
    Ok(outputs)
}

/// Resolve, converge, validate, cache.
pub async fn provision_unit(
    run: &Run,
    env: &EnvironmentView,
    unit: &Unit<'_>,
    lock_id: &LockToken,
    sink: &dyn LogSink,
) -> Result<Outputs, CoreError> {
    let variables = resolve_inputs(run, env, unit.name(), unit.inputs, unit.depends_on).await?;
    converge(run, env, unit, variables, lock_id, sink).await
}

/// Tear `unit` down. Inputs that can no longer be resolved are left out.
pub async fn teardown(
    run: &Run,
    env: &EnvironmentView,
    unit: &Unit<'_>,
    lock_id: &LockToken,
    sink: &dyn LogSink,
) -> Result<(), CoreError> {
    let variables = match resolve_inputs(run, env, unit.name(), unit.inputs, &[]).await {
        Ok(variables) => variables,
        Err(e) => {
            warn!(unit = unit.name(), error = %e, "destroying with literal inputs only");
            unit.inputs
                .iter()
                .filter_map(|(k, v)| match v {
                    InputValue::Literal(v) => Some((k.clone(), v.clone())),
                    InputValue::Output(_) => None,
                })
                .collect()
        }
    };
    let request = engine_request(run, env, unit, variables, lock_id);
    info!(unit = unit.name(), state = %request.state.render(), "destroying");
    tokio::select! {
        () = run.cancel().cancelled() => Err(CoreError::Cancelled),
        destroyed = run.ctx().bindings().engine.destroy(&request, sink) => {
            destroyed.map_err(|e| engine_failure(unit.name(), e, sink, true))
        }
    }
}

fn resource_product<'a>(
    run: &'a Run,
    env: &EnvironmentView,
    name: &str,
    product: &str,
) -> Result<&'a ProductSpec, CoreError> {
    let spec = run
        .ctx()
        .config()
        .products
        .get(product)
        .ok_or_else(|| CoreError::UnknownUnit {
            what: "product",
            name: product.to_owned(),
        })?;
    if spec.provider != env.provider() {
        return Err(CoreError::ProviderMismatch {
            unit: name.to_owned(),
            product: product.to_owned(),
            expected: env.provider(),
            actual: spec.provider,
        });
    }
    Ok(spec)
}

/// Create or update one resource under its lock.
///
/// The record is `creating` while the engine runs. A failed apply leaves it
/// `failed` with the attempted inputs; a successful one leaves it `ready`
/// with the provider id from the product's id output.
pub async fn apply(
    run: &Run,
    env: &EnvironmentView,
    resource: &ResourceConfig,
) -> Result<Outputs, CoreError> {
    let product = resource_product(run, env, &resource.name, &resource.product)?;
    let key = RecordKey::resource(&env.project, &env.name, &resource.name);
    let lock_key = key.lock_key();
    let guard = run
        .ctx()
        .locks()
        .acquire_guard(&lock_key, OperationType::CreateResource)
        .await?;
    let result = if run.cancel().is_cancelled() {
        Err(CoreError::Cancelled)
    } else {
        apply_locked(run, env, resource, product, &key, guard.token()).await
    };
    if let Err(e) = guard.release().await {
        warn!(resource = %resource.name, error = %e, "failed to release resource lock");
    }
    result
}

async fn apply_locked(
    run: &Run,
    env: &EnvironmentView,
    resource: &ResourceConfig,
    product: &ProductSpec,
    key: &RecordKey,
    token: &LockToken,
) -> Result<Outputs, CoreError> {
    let store = run.ctx().store();
    let existing: Option<ResourceRecord> = store.get(key).await?;
    if let Some(existing) = &existing {
        if existing.product != resource.product {
            return Err(CoreError::ProductMismatch {
                unit: resource.name.clone(),
                deployed: existing.product.clone(),
                configured: resource.product.clone(),
            });
        }
    }
    let variables = resolve_inputs(
        run,
        env,
        &resource.name,
        &resource.inputs,
        &resource.depends_on,
    )
    .await?;

    let stamp = now();
    let mut record = match existing {
        Some(existing) => existing,
        None => ResourceRecord {
            name: resource.name.clone(),
            provider: product.provider,
            product: resource.product.clone(),
            status: ResourceStatus::Creating,
            declared_inputs: Inputs::new(),
            attempted_inputs: None,
            provider_id: None,
            depends_on: Vec::new(),
            created_at: stamp.clone(),
            updated_at: stamp,
        },
    };
    record.status = ResourceStatus::Creating;
    record.attempted_inputs = None;
    record.depends_on.clone_from(&resource.depends_on);
    store.save(key, &record, token).await?;

    let sink = run.open_log(&resource.name);
    let unit = Unit {
        key,
        product_name: &resource.product,
        product,
        inputs: &resource.inputs,
        depends_on: &resource.depends_on,
    };
    match converge(run, env, &unit, variables, token, sink.as_ref()).await {
        Ok(outputs) => {
            record.status = ResourceStatus::Ready;
            record.declared_inputs.clone_from(&resource.inputs);
            record.provider_id = outputs.get(&product.id_output).cloned();
            store.save(key, &record, token).await?;
            info!(resource = %resource.name, provider_id = record.provider_id.as_deref().unwrap_or(""), "resource ready");
            Ok(outputs)
        }
        Err(e) => {
            record.status = ResourceStatus::Failed;
            record.attempted_inputs = Some(resource.inputs.clone());
            if let Err(save) = store.save(key, &record, token).await {
                warn!(resource = %resource.name, error = %save, "failed to record resource failure");
            }
            Err(e)
        }
    }
}

/// Names of live units in `env` that still need `resource`.
pub async fn dependents_of(
    run: &Run,
    env: &EnvironmentView,
    resource: &str,
) -> Result<Vec<String>, CoreError> {
    let store = run.ctx().store();
    let mut dependents = BTreeSet::new();
    for record in store.list_resources(&env.project, &env.name).await? {
        if record.name != resource
            && (record.depends_on.iter().any(|d| d == resource)
                || referenced_resources(&record.declared_inputs).contains(resource))
        {
            dependents.insert(record.name);
        }
    }
    for record in store.list_services(&env.project, &env.name).await? {
        let configured = run
            .ctx()
            .config()
            .service(&record.name)
            .is_some_and(|s| s.dependencies().contains(resource));
        if configured || referenced_resources(&record.declared_inputs).contains(resource) {
            dependents.insert(record.name);
        }
    }
    Ok(dependents.into_iter().collect())
}

/// Destroy one resource under its lock and forget its outputs.
///
/// Refused with `DependentsExist` while other resources or services still
/// reference it. Both checks run again once the lock is held.
pub async fn destroy(run: &Run, env: &EnvironmentView, name: &str) -> Result<(), CoreError> {
    let key = RecordKey::resource(&env.project, &env.name, name);
    destroyable(run, env, &key, name).await?;

    let lock_key = key.lock_key();
    let guard = run
        .ctx()
        .locks()
        .acquire_guard(&lock_key, OperationType::DestroyResource)
        .await?;
    let result = destroy_locked(run, env, name, &key, guard.token()).await;
    if let Err(e) = guard.release().await {
        warn!(resource = name, error = %e, "failed to release resource lock");
    }
    result
}

async fn destroyable(
    run: &Run,
    env: &EnvironmentView,
    key: &RecordKey,
    name: &str,
) -> Result<ResourceRecord, CoreError> {
    let record: ResourceRecord = run
        .ctx()
        .store()
        .get(key)
        .await?
        .ok_or_else(|| CoreError::UnknownUnit {
            what: "resource",
            name: name.to_owned(),
        })?;
    let dependents = dependents_of(run, env, name).await?;
    if !dependents.is_empty() {
        return Err(CoreError::DependentsExist {
            resource: name.to_owned(),
            dependents,
        });
    }
    Ok(record)
}

async fn destroy_locked(
    run: &Run,
    env: &EnvironmentView,
    name: &str,
    key: &RecordKey,
    token: &LockToken,
) -> Result<(), CoreError> {
    let mut record = destroyable(run, env, key, name).await?;
    let product = resource_product(run, env, name, &record.product)?;
    let store = run.ctx().store();
    record.status = ResourceStatus::Deleting;
    store.save(key, &record, token).await?;

    let sink = run.open_log(&record.name);
    let unit = Unit {
        key,
        product_name: &record.product,
        product,
        inputs: &record.declared_inputs,
        depends_on: &[],
    };
    if let Err(e) = teardown(run, env, &unit, token, sink.as_ref()).await {
        record.status = ResourceStatus::Failed;
        record.attempted_inputs = Some(record.declared_inputs.clone());
        if let Err(save) = store.save(key, &record, token).await {
            warn!(resource = %record.name, error = %save, "failed to record destroy failure");
        }
        return Err(e);
    }

    run.outputs().remove(env.bucket(), &unit.outputs_key()).await?;
    store.delete(key, token).await?;
    info!(resource = %record.name, "resource destroyed");
    Ok(())
}

/// Apply `resources` in dependency order, one topological layer at a time
/// with at most `limit` units in flight.
///
/// Units whose dependency failed or was skipped are skipped; once the run
/// is cancelled every remaining unit is skipped.
pub async fn apply_all(
    run: &Run,
    env: &EnvironmentView,
    resources: &[ResourceConfig],
    limit: usize,
) -> Result<Vec<UnitReport>, CoreError> {
    let graph = DependencyGraph::from_resources(resources);
    let layers = graph.layers()?;
    let by_name: BTreeMap<&str, &ResourceConfig> =
        resources.iter().map(|r| (r.name.as_str(), r)).collect();

    let mut reports = Vec::with_capacity(resources.len());
    let mut broken: BTreeSet<String> = BTreeSet::new();
    for layer in layers {
        let mut ready = Vec::new();
        for name in layer {
            if run.cancel().is_cancelled() {
                broken.insert(name.clone());
                reports.push(UnitReport::skipped(&name, UnitKind::Resource, "run cancelled"));
                continue;
            }
            if let Some(dep) = graph.dependencies(&name).find(|d| broken.contains(*d)) {
                let reason = format!("dependency '{dep}' did not apply");
                broken.insert(name.clone());
                reports.push(UnitReport::skipped(&name, UnitKind::Resource, &reason));
                continue;
            }
            if let Some(resource) = by_name.get(name.as_str()) {
                ready.push((*resource).clone());
            }
        }

        let outcomes = fan_out(
            limit,
            ready,
            |resource| {
                let run = run.clone();
                let env = env.clone();
                async move {
                    let result = apply(&run, &env, &resource).await;
                    (resource.name, result)
                }
            },
            |resource| {
                (
                    resource.name.clone(),
                    Err(CoreError::OperationFailed {
                        operation: format!("apply of {}", resource.name),
                        reason: "task panicked".to_owned(),
                        log_ref: None,
                    }),
                )
            },
        )
        .await;

        for (name, result) in outcomes {
            match result {
                Ok(_) => reports.push(UnitReport::succeeded(&name, UnitKind::Resource)),
                Err(e) => {
                    warn!(resource = %name, error = %e, "resource failed");
                    broken.insert(name.clone());
                    reports.push(UnitReport::failed(&name, UnitKind::Resource, None, &e));
                }
            }
        }
    }
    Ok(reports)
}

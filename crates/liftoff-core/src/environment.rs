use crate::context::{Context, EnvironmentView};
use crate::provision::{self, now, Unit};
use crate::CoreError;
use liftoff_schema::{
    validate_name, EnvName, EnvironmentRecord, EnvironmentStatus, EnvironmentType, Inputs, Lock,
    LockKey, LockToken, OperationType, ProviderConfig, RecordKey,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Register an environment and provision its environment-level product,
/// if the catalog declares one for the provider.
///
/// Re-running against a `failed` or `creating` environment retries;
/// a `ready` one is `EnvironmentExists`.
pub async fn create_environment(
    ctx: &Arc<Context>,
    name: &EnvName,
    env_type: EnvironmentType,
    provider_config: ProviderConfig,
) -> Result<EnvironmentRecord, CoreError> {
    validate_name("environment", name)?;
    let key = RecordKey::environment(ctx.project(), name);
    let guard = ctx
        .locks()
        .acquire_guard(&key.lock_key(), OperationType::CreateEnvironment)
        .await?;
    let result = create_locked(ctx, name, &key, env_type, provider_config, guard.token()).await;
    if let Err(e) = guard.release().await {
        warn!(environment = %name, error = %e, "failed to release environment lock");
    }
    result
}

async fn create_locked(
    ctx: &Arc<Context>,
    name: &EnvName,
    key: &RecordKey,
    env_type: EnvironmentType,
    provider_config: ProviderConfig,
    token: &LockToken,
) -> Result<EnvironmentRecord, CoreError> {
    let store = ctx.store();
    let existing: Option<EnvironmentRecord> = store.get(key).await?;
    if existing
        .as_ref()
        .is_some_and(|e| e.status == EnvironmentStatus::Ready)
    {
        return Err(CoreError::EnvironmentExists(name.to_string()));
    }
    let stamp = now();
    let mut record = EnvironmentRecord {
        env_type,
        provider_config,
        status: EnvironmentStatus::Creating,
        created_at: existing.map_or_else(|| stamp.clone(), |e| e.created_at),
        updated_at: stamp,
    };
    record = store.save(key, &record, token).await?;

    let catalog = &ctx.config().products;
    if let Some((product_name, product)) = catalog.environment_product(record.provider_config.provider) {
        let run = ctx.begin_run();
        let env = EnvironmentView {
            project: ctx.project().clone(),
            name: name.clone(),
            record: record.clone(),
        };
        let sink = run.open_log("environment");
        let inputs = Inputs::new();
        let unit = Unit {
            key,
            product_name,
            product,
            inputs: &inputs,
            depends_on: &[],
        };
        if let Err(e) = provision::provision_unit(&run, &env, &unit, token, sink.as_ref()).await {
            record.status = EnvironmentStatus::Failed;
            if let Err(save) = store.save(key, &record, token).await {
                warn!(environment = %name, error = %save, "failed to record environment failure");
            }
            return Err(e);
        }
    }

    record.status = EnvironmentStatus::Ready;
    let record = store.save(key, &record, token).await?;
    info!(
        environment = %name,
        provider = %record.provider_config.provider,
        account = %record.provider_config.account_id,
        "environment ready"
    );
    Ok(record)
}

/// Remove an environment. Refused while any resource or service record
/// remains in it.
pub async fn delete_environment(ctx: &Arc<Context>, name: &EnvName) -> Result<(), CoreError> {
    ctx.environment(name).await?;
    let key = RecordKey::environment(ctx.project(), name);
    let guard = ctx
        .locks()
        .acquire_guard(&key.lock_key(), OperationType::DeleteEnvironment)
        .await?;
    let result = delete_locked(ctx, name, &key, guard.token()).await;
    if let Err(e) = guard.release().await {
        warn!(environment = %name, error = %e, "failed to release environment lock");
    }
    result
}

async fn delete_locked(
    ctx: &Arc<Context>,
    name: &EnvName,
    key: &RecordKey,
    token: &LockToken,
) -> Result<(), CoreError> {
    // Read under the lock; the record may have moved since the caller looked.
    let mut env = ctx.environment(name).await?;
    let store = ctx.store();
    let resources = store.list_resources(&env.project, &env.name).await?;
    let services = store.list_services(&env.project, &env.name).await?;
    if !resources.is_empty() || !services.is_empty() {
        return Err(CoreError::EnvironmentNotEmpty {
            environment: env.name.to_string(),
            resources: resources.into_iter().map(|r| r.name).collect(),
            services: services.into_iter().map(|s| s.name).collect(),
        });
    }

    let catalog = &ctx.config().products;
    if let Some((product_name, product)) = catalog.environment_product(env.provider()) {
        let run = ctx.begin_run();
        let sink = run.open_log("environment");
        let inputs = Inputs::new();
        let unit = Unit {
            key,
            product_name,
            product,
            inputs: &inputs,
            depends_on: &[],
        };
        if let Err(e) = provision::teardown(&run, &env, &unit, token, sink.as_ref()).await {
            env.record.status = EnvironmentStatus::Failed;
            if let Err(save) = store.save(key, &env.record, token).await {
                warn!(environment = %env.name, error = %save, "failed to record environment failure");
            }
            return Err(e);
        }
    }

    store.delete(key, token).await?;
    info!(environment = %env.name, "environment deleted");
    Ok(())
}

/// Destroy one resource. Refused while other units reference it.
pub async fn destroy_resource(
    ctx: &Arc<Context>,
    environment: &EnvName,
    resource: &str,
) -> Result<(), CoreError> {
    let env = ctx.environment(environment).await?;
    let run = ctx.begin_run();
    provision::destroy(&run, &env, resource).await
}

/// Remove whatever lock is held on `key`, returning it for the audit trail.
pub async fn force_unlock(ctx: &Context, key: &LockKey) -> Result<Option<Lock>, CoreError> {
    Ok(ctx.locks().force_release(key).await?)
}

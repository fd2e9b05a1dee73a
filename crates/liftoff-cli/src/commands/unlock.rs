use super::{confirm, json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use liftoff_core::environment::force_unlock;
use liftoff_core::{Context, CoreError};
use liftoff_schema::{EnvName, LockKey};
use std::sync::Arc;

/// Which lock of an environment to break.
#[derive(Debug, Clone)]
pub enum Target {
    Environment,
    Resource(String),
    Service(String),
}

pub async fn run(
    ctx: &Arc<Context>,
    environment: &str,
    target: Target,
    yes: bool,
    json: bool,
) -> Result<u8, CoreError> {
    let environment = EnvName::new(environment);
    let project = ctx.project();
    let key = match &target {
        Target::Environment => LockKey::environment(project, &environment),
        Target::Resource(name) => LockKey::resource(project, &environment, name),
        Target::Service(name) => LockKey::service(project, &environment, name),
    };

    let Some(current) = ctx.locks().inspect(&key).await? else {
        if json {
            println!("{}", json_pretty(&serde_json::json!({"key": key, "removed": null}))?);
        } else {
            println!("no lock held on {key}");
        }
        return Ok(EXIT_SUCCESS);
    };
    if !json {
        println!(
            "{key} is held by {} ({} since {})",
            current.holder, current.operation, current.acquired_at
        );
    }
    if !confirm(&format!("force-release the lock on {key}"), yes)? {
        return Ok(EXIT_FAILURE);
    }

    let removed = force_unlock(ctx, &key).await?;
    if json {
        println!("{}", json_pretty(&serde_json::json!({"key": key, "removed": removed}))?);
    } else if let Some(lock) = removed {
        println!("released lock of {}", lock.holder);
    } else {
        println!("lock on {key} was already gone");
    }
    Ok(EXIT_SUCCESS)
}

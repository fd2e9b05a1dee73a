use super::{colorize_status, confirm, json_pretty, spin_fail, spin_ok, spinner, EXIT_FAILURE, EXIT_SUCCESS};
use liftoff_core::environment::{create_environment, delete_environment};
use liftoff_core::{Context, CoreError};
use liftoff_schema::{EnvName, EnvironmentRecord, EnvironmentType, ProviderConfig, RecordKey};
use std::sync::Arc;

pub async fn create(
    ctx: &Arc<Context>,
    name: &str,
    env_type: EnvironmentType,
    provider_config: ProviderConfig,
    json: bool,
) -> Result<u8, CoreError> {
    let name = EnvName::new(name);
    let pb = (!json).then(|| spinner(&format!("creating environment {name}…")));
    let record = match create_environment(ctx, &name, env_type, provider_config).await {
        Ok(record) => record,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, &format!("environment {name} failed"));
            }
            return Err(e);
        }
    };
    if let Some(pb) = &pb {
        spin_ok(pb, &format!("environment {name} ready"));
    }
    if json {
        let payload = serde_json::json!({
            "name": name,
            "environment": record,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        let config = &record.provider_config;
        println!(
            "{name}: {} on {} ({}, {})",
            record.env_type, config.provider, config.account_id, config.region
        );
    }
    Ok(EXIT_SUCCESS)
}

pub async fn delete(ctx: &Arc<Context>, name: &str, yes: bool, json: bool) -> Result<u8, CoreError> {
    let name = EnvName::new(name);
    // Fail on a missing environment before asking.
    ctx.environment(&name).await?;
    if !confirm(&format!("delete environment {name}"), yes)? {
        return Ok(EXIT_FAILURE);
    }
    let pb = (!json).then(|| spinner(&format!("deleting environment {name}…")));
    if let Err(e) = delete_environment(ctx, &name).await {
        if let Some(pb) = &pb {
            spin_fail(pb, &format!("environment {name} not deleted"));
        }
        return Err(e);
    }
    if let Some(pb) = &pb {
        spin_ok(pb, &format!("environment {name} deleted"));
    }
    if json {
        println!("{}", json_pretty(&serde_json::json!({"deleted": name}))?);
    }
    Ok(EXIT_SUCCESS)
}

pub async fn list(ctx: &Arc<Context>, json: bool) -> Result<u8, CoreError> {
    let store = ctx.store();
    let mut envs = Vec::new();
    for name in store.list_environments(ctx.project()).await? {
        let record: Option<EnvironmentRecord> = store
            .get(&RecordKey::environment(ctx.project(), &name))
            .await?;
        if let Some(record) = record {
            envs.push((name, record));
        }
    }
    if json {
        let payload: Vec<_> = envs
            .iter()
            .map(|(name, record)| serde_json::json!({"name": name, "environment": record}))
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else if envs.is_empty() {
        println!("no environments found");
    } else {
        println!(
            "{:<16} {:<12} {:<10} {:<10} ACCOUNT",
            "NAME", "TYPE", "PROVIDER", "STATUS"
        );
        for (name, record) in &envs {
            println!(
                "{:<16} {:<12} {:<10} {:<10} {}",
                name.as_str(),
                record.env_type.to_string(),
                record.provider_config.provider.to_string(),
                colorize_status(&record.status.to_string()),
                record.provider_config.account_id
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

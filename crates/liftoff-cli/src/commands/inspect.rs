use super::{colorize_status, json_pretty, EXIT_SUCCESS};
use liftoff_core::{Context, CoreError};
use liftoff_schema::{EnvName, LockKey};
use std::sync::Arc;

pub async fn run(ctx: &Arc<Context>, name: &str, json: bool) -> Result<u8, CoreError> {
    let name = EnvName::new(name);
    let env = ctx.environment(&name).await?;
    let store = ctx.store();
    let resources = store.list_resources(ctx.project(), &name).await?;
    let services = store.list_services(ctx.project(), &name).await?;
    let lock = ctx
        .locks()
        .inspect(&LockKey::environment(ctx.project(), &name))
        .await?;

    if json {
        let payload = serde_json::json!({
            "name": name,
            "environment": env.record,
            "lock": lock,
            "resources": resources,
            "services": services,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    let record = &env.record;
    let config = &record.provider_config;
    println!("environment: {name}");
    println!("type:        {}", record.env_type);
    println!("status:      {}", colorize_status(&record.status.to_string()));
    println!("provider:    {}", config.provider);
    println!("account:     {}", config.account_id);
    println!("region:      {}", config.region);
    println!("identity:    {}", config.identity);
    println!("bucket:      {}", config.artifact_bucket);
    println!("created_at:  {}", record.created_at);
    println!("updated_at:  {}", record.updated_at);
    if let Some(lock) = &lock {
        println!(
            "locked by:   {} ({} since {})",
            lock.holder, lock.operation, lock.acquired_at
        );
    }

    if !resources.is_empty() {
        println!();
        println!("{:<16} {:<12} {:<14} PROVIDER_ID", "RESOURCE", "PRODUCT", "STATUS");
        for r in &resources {
            let status = if r.attempted_inputs.is_some() {
                "failed".to_owned()
            } else {
                r.status.to_string()
            };
            println!(
                "{:<16} {:<12} {:<14} {}",
                r.name,
                r.product,
                colorize_status(&status),
                r.provider_id.as_deref().unwrap_or("-")
            );
        }
    }
    if !services.is_empty() {
        println!();
        println!("{:<16} {:<16} {:<15} URL", "SERVICE", "STATUS", "DEPLOYMENT");
        for s in &services {
            println!(
                "{:<16} {:<16} {:<15} {}",
                s.name,
                colorize_status(&s.status.to_string()),
                s.deployment_id.map_or_else(|| "-".to_owned(), |id| id.to_string()),
                s.service_url.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

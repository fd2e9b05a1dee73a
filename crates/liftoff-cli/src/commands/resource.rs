use super::{confirm, json_pretty, print_report, spin_fail, spin_ok, spinner, EXIT_FAILURE, EXIT_SUCCESS};
use liftoff_core::environment::destroy_resource;
use liftoff_core::{Context, CoreError, Deployer};
use liftoff_schema::EnvName;
use std::sync::Arc;

/// Apply the named resources (all when none are named) and their dependencies.
pub async fn create(
    ctx: &Arc<Context>,
    environment: &str,
    names: &[String],
    concurrency: Option<usize>,
    json: bool,
) -> Result<u8, CoreError> {
    let environment = EnvName::new(environment);
    let deployer = Deployer::new(Arc::clone(ctx));
    let pb = (!json).then(|| spinner(&format!("applying resources in {environment}…")));
    let report = match deployer.apply_resources(&environment, names, concurrency).await {
        Ok(report) => report,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "apply failed");
            }
            return Err(e);
        }
    };
    if let Some(pb) = &pb {
        if report.is_success() {
            spin_ok(pb, "resources applied");
        } else {
            spin_fail(pb, "some resources failed");
        }
    }
    print_report(&report, json)
}

pub async fn destroy(
    ctx: &Arc<Context>,
    environment: &str,
    name: &str,
    yes: bool,
    json: bool,
) -> Result<u8, CoreError> {
    let environment = EnvName::new(environment);
    ctx.environment(&environment).await?;
    if !confirm(&format!("destroy resource {name} in {environment}"), yes)? {
        return Ok(EXIT_FAILURE);
    }
    let pb = (!json).then(|| spinner(&format!("destroying {name}…")));
    if let Err(e) = destroy_resource(ctx, &environment, name).await {
        if let Some(pb) = &pb {
            spin_fail(pb, &format!("{name} not destroyed"));
        }
        return Err(e);
    }
    if let Some(pb) = &pb {
        spin_ok(pb, &format!("{name} destroyed"));
    }
    if json {
        let payload = serde_json::json!({
            "environment": environment,
            "destroyed": name,
        });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}

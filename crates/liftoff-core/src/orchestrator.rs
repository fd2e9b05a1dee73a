//! Deploy and promote orchestrators.
//!
//! A run validates everything it can before touching any record, applies
//! the resources the selected services need in dependency order, then drives
//! each service through its phases under the service lock. Unit failures are
//! reported in the [`RunReport`]; only configuration errors found before any
//! mutation surface as `Err`.

use crate::build::{self, BuildMode};
use crate::concurrency::{cancellable, fan_out};
use crate::context::{Context, EnvironmentView, Run};
use crate::graph::DependencyGraph;
use crate::lifecycle::{DeployPhase, PhaseTracker};
use crate::promote;
use crate::provision::{self, now, Unit};
use crate::release;
use crate::report::{RunReport, UnitKind, UnitReport};
use crate::CoreError;
use liftoff_runtime::LogSink;
use liftoff_schema::{
    DeploymentId, EnvName, EnvironmentStatus, LockToken, OperationType, Outputs, ProductSpec,
    RecordKey, ResourceConfig, ServiceConfig, ServiceRecord, ServiceStatus,
};
use liftoff_store::OutputsKey;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub build_mode: BuildMode,
    /// Use the cached outputs of existing infrastructure instead of
    /// applying resources and service infrastructure.
    pub skip_resource_creation: bool,
    /// Deploy only these services (and the resources they need).
    pub services: Option<Vec<String>>,
    /// Units in flight at once; defaults to `settings.concurrency`.
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct PromoteOptions {
    /// `Remote` copies registry-side, `Local` pulls, retags, and pushes.
    pub build_mode: BuildMode,
    pub skip_resource_creation: bool,
    pub services: Option<Vec<String>>,
    pub concurrency: Option<usize>,
}

/// How a service gets its artifact.
#[derive(Clone)]
enum Delivery {
    Build(BuildMode),
    Promote {
        from: EnvironmentView,
        mode: BuildMode,
    },
}

impl Delivery {
    fn operation(&self) -> OperationType {
        match self {
            Delivery::Build(_) => OperationType::DeployService,
            Delivery::Promote { .. } => OperationType::PromoteService,
        }
    }

    fn tracker(&self) -> PhaseTracker {
        match self {
            Delivery::Build(_) => PhaseTracker::deploy(),
            Delivery::Promote { .. } => PhaseTracker::promote(),
        }
    }

    fn failed_status(&self) -> ServiceStatus {
        match self {
            Delivery::Build(_) => ServiceStatus::DeployFailed,
            Delivery::Promote { .. } => ServiceStatus::PromoteFailed,
        }
    }
}

/// Units one run works on, checked up front.
struct Plan {
    resources: Vec<ResourceConfig>,
    services: Vec<ServiceConfig>,
}

/// Per-service settings shared by every task of a run.
#[derive(Clone)]
struct ServiceJob {
    run: Run,
    env: EnvironmentView,
    delivery: Delivery,
    skip_infra: bool,
}

pub struct Deployer {
    ctx: Arc<Context>,
}

impl Deployer {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    fn concurrency(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.ctx.settings().concurrency).max(1)
    }

    async fn ready_environment(&self, name: &EnvName) -> Result<EnvironmentView, CoreError> {
        let env = self.ctx.environment(name).await?;
        if env.record.status != EnvironmentStatus::Ready {
            return Err(CoreError::EnvironmentNotReady {
                environment: name.to_string(),
                status: env.record.status.to_string(),
            });
        }
        self.ctx.bindings().provider(env.provider())?;
        Ok(env)
    }

    fn check_provider(
        &self,
        env: &EnvironmentView,
        unit: &str,
        product: &str,
    ) -> Result<(), CoreError> {
        let spec = self.product(product)?;
        if spec.provider != env.provider() {
            return Err(CoreError::ProviderMismatch {
                unit: unit.to_owned(),
                product: product.to_owned(),
                expected: env.provider(),
                actual: spec.provider,
            });
        }
        Ok(())
    }

    fn product(&self, name: &str) -> Result<&ProductSpec, CoreError> {
        self.ctx
            .config()
            .products
            .get(name)
            .ok_or_else(|| CoreError::UnknownUnit {
                what: "product",
                name: name.to_owned(),
            })
    }

    /// Validate configuration, selection, providers, products, and the
    /// dependency graph. Reads records but never writes.
    async fn plan(
        &self,
        env: &EnvironmentView,
        selection: Option<&[String]>,
    ) -> Result<Plan, CoreError> {
        let config = self.ctx.config();
        config.validate()?;

        let services: Vec<ServiceConfig> = match selection {
            Some(names) => names
                .iter()
                .map(|name| {
                    config.service(name).cloned().ok_or_else(|| CoreError::UnknownUnit {
                        what: "service",
                        name: name.clone(),
                    })
                })
                .collect::<Result<_, _>>()?,
            None => config.services.clone(),
        };

        let graph = DependencyGraph::from_resources(&config.resources).with_services(&services);
        graph.layers()?;
        let needed = graph.closure(services.iter().map(|s| s.name.as_str()));
        let resources: Vec<ResourceConfig> = config
            .resources
            .iter()
            .filter(|r| needed.contains(&r.name))
            .cloned()
            .collect();

        for r in &resources {
            self.check_provider(env, &r.name, &r.product)?;
        }
        for s in &services {
            self.check_provider(env, &s.name, &s.product)?;
            let existing: Option<ServiceRecord> = self
                .ctx
                .store()
                .get(&RecordKey::service(&env.project, &env.name, &s.name))
                .await?;
            if let Some(existing) = existing {
                if existing.product != s.product {
                    return Err(CoreError::ProductMismatch {
                        unit: s.name.clone(),
                        deployed: existing.product,
                        configured: s.product.clone(),
                    });
                }
            }
        }
        Ok(Plan {
            resources,
            services,
        })
    }

    /// Build and release services into `environment`.
    pub async fn deploy(
        &self,
        environment: &EnvName,
        options: &DeployOptions,
    ) -> Result<RunReport, CoreError> {
        let env = self.ready_environment(environment).await?;
        let plan = self.plan(&env, options.services.as_deref()).await?;
        let run = self.ctx.begin_run();
        info!(
            run = %run.id(),
            environment = %environment,
            services = plan.services.len(),
            resources = plan.resources.len(),
            "deploy started"
        );
        let job = ServiceJob {
            run: run.clone(),
            env,
            delivery: Delivery::Build(options.build_mode),
            skip_infra: options.skip_resource_creation,
        };
        let report = RunReport::new(&run, environment, "deploy");
        self.execute(job, plan, report, self.concurrency(options.concurrency))
            .await
    }

    /// Release into `to` the exact artifacts currently live in `from`.
    pub async fn promote(
        &self,
        from: &EnvName,
        to: &EnvName,
        options: &PromoteOptions,
    ) -> Result<RunReport, CoreError> {
        let source = self.ready_environment(from).await?;
        let env = self.ready_environment(to).await?;
        let plan = self.plan(&env, options.services.as_deref()).await?;
        let run = self.ctx.begin_run();
        info!(
            run = %run.id(),
            from = %from,
            to = %to,
            services = plan.services.len(),
            "promote started"
        );
        let job = ServiceJob {
            run: run.clone(),
            env,
            delivery: Delivery::Promote {
                from: source,
                mode: options.build_mode,
            },
            skip_infra: options.skip_resource_creation,
        };
        let report = RunReport::new(&run, to, "promote");
        self.execute(job, plan, report, self.concurrency(options.concurrency))
            .await
    }

    /// Apply the named resources (all when empty) and everything they
    /// depend on.
    pub async fn apply_resources(
        &self,
        environment: &EnvName,
        names: &[String],
        concurrency: Option<usize>,
    ) -> Result<RunReport, CoreError> {
        let env = self.ctx.environment(environment).await?;
        if env.record.status != EnvironmentStatus::Ready {
            return Err(CoreError::EnvironmentNotReady {
                environment: environment.to_string(),
                status: env.record.status.to_string(),
            });
        }
        let config = self.ctx.config();
        config.validate()?;
        for name in names {
            if config.resource(name).is_none() {
                return Err(CoreError::UnknownUnit {
                    what: "resource",
                    name: name.clone(),
                });
            }
        }
        let graph = DependencyGraph::from_resources(&config.resources);
        let wanted = if names.is_empty() {
            config.resources.iter().map(|r| r.name.clone()).collect()
        } else {
            graph.closure(names.iter().map(String::as_str))
        };
        let resources: Vec<ResourceConfig> = config
            .resources
            .iter()
            .filter(|r| wanted.contains(&r.name))
            .cloned()
            .collect();
        for r in &resources {
            self.check_provider(&env, &r.name, &r.product)?;
        }

        let run = self.ctx.begin_run();
        let mut report = RunReport::new(&run, environment, "apply");
        report.units =
            provision::apply_all(&run, &env, &resources, self.concurrency(concurrency)).await?;
        Ok(report.finish())
    }

    /// Re-release the previous version of one service.
    pub async fn rollback(
        &self,
        environment: &EnvName,
        service: &str,
    ) -> Result<ServiceRecord, CoreError> {
        let env = self.ready_environment(environment).await?;
        let config = self
            .ctx
            .config()
            .service(service)
            .ok_or_else(|| CoreError::UnknownUnit {
                what: "service",
                name: service.to_owned(),
            })?;
        let run = self.ctx.begin_run();
        release::rollback(&run, &env, config).await
    }

    async fn execute(
        &self,
        job: ServiceJob,
        plan: Plan,
        mut report: RunReport,
        limit: usize,
    ) -> Result<RunReport, CoreError> {
        if !job.skip_infra {
            report.units =
                provision::apply_all(&job.run, &job.env, &plan.resources, limit).await?;
        }
        let broken: BTreeSet<String> = report
            .units
            .iter()
            .filter(|u| u.is_failed() || u.is_skipped())
            .map(|u| u.name.clone())
            .collect();

        let items: Vec<(ServiceConfig, Option<String>)> = plan
            .services
            .into_iter()
            .map(|s| {
                let blocked = s.dependencies().into_iter().find(|d| broken.contains(d));
                (s, blocked)
            })
            .collect();
        let services = fan_out(
            limit,
            items,
            |(service, blocked)| {
                let job = job.clone();
                async move {
                    match blocked {
                        Some(dep) => UnitReport::skipped(
                            &service.name,
                            UnitKind::Service,
                            &format!("dependency '{dep}' did not apply"),
                        ),
                        None => run_service(&job, &service).await,
                    }
                }
            },
            |(service, _)| {
                UnitReport::failed(
                    &service.name,
                    UnitKind::Service,
                    None,
                    &CoreError::OperationFailed {
                        operation: format!("deploy of {}", service.name),
                        reason: "task panicked".to_owned(),
                        log_ref: None,
                    },
                )
            },
        )
        .await;
        report.units.extend(services);

        let report = report.finish();
        info!(run = %report.run_id, summary = %report.summary(), "run finished");
        Ok(report)
    }
}

/// Drive one service through its phases. The service lock is released on
/// every path out of here, cancellation included.
async fn run_service(job: &ServiceJob, service: &ServiceConfig) -> UnitReport {
    let run = &job.run;
    let mut tracker = job.delivery.tracker();
    let key = RecordKey::service(&job.env.project, &job.env.name, &service.name);

    // The acquire is not raced against cancellation: a lock written by a
    // dropped acquire would have no guard to release it.
    let lock_key = key.lock_key();
    let locked = match tracker.advance(DeployPhase::Locking) {
        Ok(()) => run
            .ctx()
            .locks()
            .acquire_guard(&lock_key, job.delivery.operation())
            .await
            .map_err(CoreError::from),
        Err(e) => Err(e),
    };
    let guard = match locked {
        Ok(guard) => guard,
        Err(e) => {
            warn!(service = %service.name, error = %e, "service not locked");
            let phase = tracker.fail();
            return UnitReport::failed(&service.name, UnitKind::Service, Some(phase), &e);
        }
    };
    if run.cancel().is_cancelled() {
        if let Err(e) = guard.release().await {
            warn!(service = %service.name, error = %e, "failed to release service lock");
        }
        let phase = tracker.fail();
        return UnitReport::failed(
            &service.name,
            UnitKind::Service,
            Some(phase),
            &CoreError::Cancelled,
        );
    }

    let sink = run.open_log(&service.name);
    let report = match job.run_locked(service, &key, guard.token(), &mut tracker, sink.as_ref()).await {
        Ok(report) => report,
        Err(e) => {
            let phase = tracker.fail();
            warn!(service = %service.name, %phase, error = %e, "service failed");
            let mut report = UnitReport::failed(&service.name, UnitKind::Service, Some(phase), &e);
            if report.log_ref.is_none() {
                report.log_ref = sink.reference();
            }
            report
        }
    };
    if let Err(e) = sink.flush() {
        warn!(service = %service.name, error = %e, "failed to flush service log");
    }
    if let Err(e) = guard.release().await {
        warn!(service = %service.name, error = %e, "failed to release service lock");
    }
    report
}

impl ServiceJob {
    async fn run_locked(
        &self,
        service: &ServiceConfig,
        key: &RecordKey,
        token: &LockToken,
        tracker: &mut PhaseTracker,
        sink: &dyn LogSink,
    ) -> Result<UnitReport, CoreError> {
        let store = self.run.ctx().store();
        let existing: Option<ServiceRecord> = store.get(key).await?;
        let previous_live = existing.as_ref().and_then(ServiceRecord::live_version);
        let stamp = now();
        let mut record = existing.clone().unwrap_or_else(|| ServiceRecord {
            name: service.name.clone(),
            provider: self.env.provider(),
            product: service.product.clone(),
            status: self.delivery.failed_status(),
            declared_inputs: service.inputs.clone(),
            service_url: None,
            deployment_id: None,
            provider_id: None,
            artifact: None,
            previous: None,
            created_at: stamp.clone(),
            updated_at: stamp,
        });

        let outcome = self
            .deliver(service, key, token, tracker, sink, existing.as_ref(), &mut record)
            .await;
        match outcome {
            Ok((deployment_id, url)) => {
                record.status = ServiceStatus::Ready;
                record.service_url = Some(url.clone());
                record.deployment_id = Some(deployment_id);
                record.declared_inputs.clone_from(&service.inputs);
                if previous_live.is_some() {
                    record.previous = previous_live;
                }
                store.save(key, &record, token).await?;
                tracker.advance(DeployPhase::Ready)?;
                Ok(UnitReport::released(&service.name, deployment_id, &url))
            }
            Err(e) => {
                record.status = self.delivery.failed_status();
                record.deployment_id = None;
                record.service_url = None;
                record.artifact = None;
                if previous_live.is_some() {
                    record.previous = previous_live;
                }
                if let Err(save) = store.save(key, &record, token).await {
                    warn!(service = %service.name, error = %save, "failed to record service failure");
                }
                Err(e)
            }
        }
    }

    /// Infrastructure, artifact, release. Updates `record` with what became
    /// known along the way; the caller writes it once at the end.
    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        service: &ServiceConfig,
        key: &RecordKey,
        token: &LockToken,
        tracker: &mut PhaseTracker,
        sink: &dyn LogSink,
        existing: Option<&ServiceRecord>,
        record: &mut ServiceRecord,
    ) -> Result<(DeploymentId, String), CoreError> {
        let run = &self.run;
        let env = &self.env;
        let cancel = run.cancel();
        check_cancelled(run)?;
        tracker.advance(DeployPhase::EnsuringResources)?;
        let infra = cancellable(cancel, self.ensure_infra(service, key, token, sink)).await?;
        let product = product_of(run, service)?;
        record.provider_id = infra.get(&product.id_output).cloned();
        let repository = required_output(&infra, service, "artifact_repository")?;
        let target = required_output(&infra, service, "release_target")?;

        let deployment_id = DeploymentId::next(
            existing
                .and_then(|r| r.deployment_id)
                .max(existing.and_then(|r| r.previous.as_ref().map(|p| p.deployment_id))),
        );

        check_cancelled(run)?;
        let artifact = match &self.delivery {
            Delivery::Build(mode) => {
                tracker.advance(DeployPhase::Building)?;
                cancellable(
                    cancel,
                    build::build(run, env, service, repository, deployment_id, *mode, sink),
                )
                .await?
            }
            Delivery::Promote { from, mode } => {
                tracker.advance(DeployPhase::Promoting)?;
                cancellable(
                    cancel,
                    promote::promote(
                        run,
                        from,
                        env,
                        &service.name,
                        None,
                        deployment_id,
                        repository,
                        *mode,
                        sink,
                    ),
                )
                .await?
            }
        };
        record.artifact = Some(artifact.clone());

        check_cancelled(run)?;
        tracker.advance(DeployPhase::Releasing)?;
        let inputs = release::release_inputs(run, env, service).await?;
        let url = release::release(
            run,
            env,
            &service.name,
            target,
            &artifact,
            deployment_id,
            inputs,
        )
        .await?;
        Ok((deployment_id, url))
    }

    /// Apply the service's infrastructure, or read its cached outputs when
    /// resource creation is skipped.
    async fn ensure_infra(
        &self,
        service: &ServiceConfig,
        key: &RecordKey,
        token: &LockToken,
        sink: &dyn LogSink,
    ) -> Result<Outputs, CoreError> {
        let run = &self.run;
        let env = &self.env;
        let product = product_of(run, service)?;
        if self.skip_infra {
            let cached = run
                .outputs()
                .get(
                    env.bucket(),
                    &OutputsKey::new(&env.project, &env.name, &service.product, &service.name),
                )
                .await?
                .ok_or_else(|| CoreError::DependencyNotReady {
                    unit: service.name.clone(),
                    dependency: format!("{} infrastructure", service.name),
                })?;
            let missing = product.missing_outputs(&cached);
            if !missing.is_empty() {
                return Err(CoreError::InvalidOutputForResource {
                    unit: service.name.clone(),
                    product: service.product.clone(),
                    missing,
                });
            }
            return Ok(cached);
        }
        let unit = Unit {
            key,
            product_name: &service.product,
            product,
            inputs: &service.inputs,
            depends_on: &service.depends_on,
        };
        provision::provision_unit(run, env, &unit, token, sink).await
    }
}

fn check_cancelled(run: &Run) -> Result<(), CoreError> {
    if run.cancel().is_cancelled() {
        Err(CoreError::Cancelled)
    } else {
        Ok(())
    }
}

fn product_of<'a>(run: &'a Run, service: &ServiceConfig) -> Result<&'a ProductSpec, CoreError> {
    run.ctx()
        .config()
        .products
        .get(&service.product)
        .ok_or_else(|| CoreError::UnknownUnit {
            what: "product",
            name: service.product.clone(),
        })
}

fn required_output<'a>(
    outputs: &'a Outputs,
    service: &ServiceConfig,
    field: &str,
) -> Result<&'a str, CoreError> {
    outputs
        .get(field)
        .map(String::as_str)
        .ok_or_else(|| CoreError::MissingOutput {
            unit: service.name.clone(),
            resource: service.name.clone(),
            output: field.to_owned(),
        })
}

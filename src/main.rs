use std::sync::Arc;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use postgres_operator::{self, telemetry, State};
use postgres_operator::config::{interval_from_secs, NamespaceOperatingMode, OperatorConfig, WorkerCounts};
use postgres_operator::controllers::factory::KubeGroupFactory;
use postgres_operator::controllers::namespace::namespace_group;
use postgres_operator::controllers::Context;
use postgres_operator::manager::ControllerManager;
use postgres_operator::Metrics;

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Namespaces to manage from startup on
    #[arg(long, env = "NAMESPACE", value_delimiter = ',')]
    namespaces: Vec<String>,

    #[arg(long, env = "NAMESPACE_MODE", value_enum, default_value = "dynamic")]
    namespace_mode: NamespaceOperatingMode,

    /// Namespaces labelled `pgo-installation-name=<name>` are managed in dynamic mode
    #[arg(long, env = "PGO_INSTALLATION_NAME", default_value = "devtest")]
    installation_name: String,

    #[arg(long, env = "PGCLUSTER_WORKER_COUNT", default_value_t = 1)]
    pgcluster_workers: usize,
    #[arg(long, env = "PGTASK_WORKER_COUNT", default_value_t = 1)]
    pgtask_workers: usize,
    #[arg(long, env = "PGREPLICA_WORKER_COUNT", default_value_t = 1)]
    pgreplica_workers: usize,
    #[arg(long, env = "CONFIGMAP_WORKER_COUNT", default_value_t = 2)]
    configmap_workers: usize,
    #[arg(long, env = "POD_WORKER_COUNT", default_value_t = 1)]
    pod_workers: usize,
    #[arg(long, env = "JOB_WORKER_COUNT", default_value_t = 1)]
    job_workers: usize,
    #[arg(long, env = "NAMESPACE_WORKER_COUNT", default_value_t = 3)]
    namespace_workers: usize,

    #[arg(long, env = "CACHE_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    cache_sync_timeout_secs: u64,
    /// Zero disables the periodic namespace resync
    #[arg(long, env = "NAMESPACE_REFRESH_INTERVAL", default_value_t = 60)]
    namespace_refresh_interval_secs: u64,
    /// Zero disables the periodic config map resync
    #[arg(long, env = "CONTROLLER_GROUP_REFRESH_INTERVAL", default_value_t = 60)]
    controller_group_refresh_interval_secs: u64,
    #[arg(long, env = "ROLLOUT_TIMEOUT_SECS", default_value_t = 600)]
    rollout_timeout_secs: u64,

    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: String,
}

impl Arguments {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            installation_name: self.installation_name.clone(),
            namespace_mode: self.namespace_mode,
            workers: WorkerCounts {
                pgcluster: self.pgcluster_workers,
                pgtask: self.pgtask_workers,
                pgreplica: self.pgreplica_workers,
                configmap: self.configmap_workers,
                pod: self.pod_workers,
                job: self.job_workers,
                namespace: self.namespace_workers,
            },
            cache_sync_timeout: std::time::Duration::from_secs(self.cache_sync_timeout_secs),
            namespace_refresh_interval: interval_from_secs(self.namespace_refresh_interval_secs),
            controller_group_refresh_interval: interval_from_secs(self.controller_group_refresh_interval_secs),
            rollout_timeout: std::time::Duration::from_secs(self.rollout_timeout_secs),
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

/// Runs the namespace controller until `stop` fires.
async fn watch_namespaces(
    client: Client,
    manager: Arc<ControllerManager>,
    config: OperatorConfig,
    operator_metrics: Metrics,
    stop: CancellationToken,
) {
    let mut group = namespace_group(client, manager, &config, operator_metrics);
    let never = CancellationToken::new();
    if let Err(err) = group.start(config.cache_sync_timeout, &never).await {
        error!("namespace watch failed to start: {err}");
        return;
    }
    info!(installation = %config.installation_name, "watching namespaces");
    stop.cancelled().await;
    if let Err(err) = group.stop().await {
        warn!("namespace watch did not stop cleanly: {err}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let args: Arguments = Arguments::parse();
    let config = args.operator_config();

    let client = Client::try_default().await?;
    let state = State::new(&config);
    let operator_metrics = Metrics::default().register(&state.registry)?;
    let ctx = Context::new(client.clone(), config.clone(), &state, operator_metrics.clone());
    let manager = Arc::new(ControllerManager::new(
        Arc::new(KubeGroupFactory::new(ctx)),
        config.cache_sync_timeout,
        operator_metrics.clone(),
    ));
    let state = state.with_manager(manager.clone());

    for namespace in args.namespaces.iter().filter(|ns| !ns.is_empty()) {
        if let Err(err) = manager.add_group(namespace).await {
            error!(%namespace, "unable to add controller group: {err}");
        }
    }
    if let Err(err) = manager.run_all().await {
        error!("not every controller group started: {err}");
    }

    let stop = CancellationToken::new();
    let namespaces = config.namespace_mode.watches_namespaces().then(|| {
        tokio::spawn(watch_namespaces(
            client,
            manager.clone(),
            config.clone(),
            operator_metrics,
            stop.clone(),
        ))
    });

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.bind_address)?
    .shutdown_timeout(5)
    .run();

    // actix handles SIGTERM/SIGINT and returns once it is shut down
    let served = server.await;

    info!("shutting down controller groups");
    stop.cancel();
    if let Some(namespaces) = namespaces {
        namespaces.await?;
    }
    if let Err(err) = manager.remove_all().await {
        error!("not every controller group stopped cleanly: {err}");
    }
    served?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn arguments_are_consistent() {
        Arguments::command().debug_assert();
    }

    #[test]
    fn flags_populate_operator_config() {
        let args = Arguments::try_parse_from([
            "postgres-operator",
            "--namespaces",
            "team-a,team-b",
            "--namespace-mode",
            "disabled",
            "--pod-workers",
            "0",
            "--namespace-refresh-interval-secs",
            "0",
        ])
        .unwrap();
        assert_eq!(args.namespaces, vec!["team-a", "team-b"]);

        let config = args.operator_config();
        assert_eq!(config.namespace_mode, NamespaceOperatingMode::Disabled);
        assert_eq!(config.workers.pod, 0);
        assert_eq!(config.workers.configmap, 2);
        assert_eq!(config.namespace_refresh_interval, None);
    }
}

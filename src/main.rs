use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use watchdog::config::{load_prober_config, load_weeder_config};
use watchdog::prober::{self, ProberManager};
use watchdog::util::{metrics::Metrics, telemetry};
use watchdog::weeder::{self, WeederManager};

#[derive(Parser)]
#[command(
    name = "dependency-watchdog",
    version,
    about = "Watchdog for tenant control planes hosted on a management cluster"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe tenant API servers and suspend their dependants during external outages
    Prober(RunArgs),
    /// Delete crash-looping pods once the service they depend on recovers
    Weeder(RunArgs),
}

impl Command {
    fn args(&self) -> &RunArgs {
        match self {
            Command::Prober(args) | Command::Weeder(args) => args,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// Path to the command's YAML configuration
    #[arg(long = "config-file")]
    config_file: PathBuf,
    /// Kubeconfig for the management cluster; in-cluster config when absent
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
    #[arg(long = "concurrent-reconciles", default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    concurrent_reconciles: u16,
    #[arg(long = "leader-election-namespace", default_value = "garden")]
    leader_election_namespace: String,
    #[arg(long = "enable-leader-election", default_value_t = false)]
    enable_leader_election: bool,
    #[arg(long = "kube-api-qps", default_value_t = 20.0)]
    kube_api_qps: f64,
    #[arg(long = "kube-api-burst", default_value_t = 100)]
    kube_api_burst: u32,
    #[arg(long = "metrics-bind-addr", default_value = "0.0.0.0:9643")]
    metrics_bind_addr: String,
    #[arg(long = "health-bind-addr", default_value = "0.0.0.0:9644")]
    health_bind_addr: String,
}

/// The registry the running command feeds; read by the index route.
#[derive(Clone)]
enum Managers {
    Prober(Arc<ProberManager>),
    Weeder(Arc<WeederManager>),
}

#[get("/metrics")]
async fn metrics(registry: Data<Registry>, _req: HttpRequest) -> impl Responder {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&families, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(managers: Data<Managers>, _req: HttpRequest) -> impl Responder {
    match managers.get_ref() {
        Managers::Prober(manager) => HttpResponse::Ok().json(manager.get_all_probers().await),
        Managers::Weeder(manager) => HttpResponse::Ok().json(manager.get_all_weeders().await),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init().await;

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    let args = cli.command.args();
    debug!(
        concurrent_reconciles = args.concurrent_reconciles,
        leader_election = args.enable_leader_election,
        leader_election_namespace = %args.leader_election_namespace,
        qps = args.kube_api_qps,
        burst = args.kube_api_burst,
        "run options"
    );
    let client = management_client(args).await?;

    let registry = Registry::default();
    let watchdog_metrics = Arc::new(
        Metrics::default()
            .register(&registry)
            .context("failed to register metrics")?,
    );

    let (managers, controller) = match &cli.command {
        Command::Prober(args) => {
            let config = Arc::new(load_prober_config(&args.config_file)?);
            let manager = Arc::new(ProberManager::new(token.clone()));
            info!(config_file = %args.config_file.display(), "starting prober");
            let controller = tokio::spawn(prober::controller::run(
                client,
                config,
                manager.clone(),
                watchdog_metrics,
                token.clone(),
            ));
            (Managers::Prober(manager), controller)
        }
        Command::Weeder(args) => {
            let config = Arc::new(load_weeder_config(&args.config_file)?);
            let manager = Arc::new(WeederManager::new(token.clone()));
            info!(config_file = %args.config_file.display(), "starting weeder");
            let controller = tokio::spawn(weeder::controller::run(
                client,
                config,
                manager.clone(),
                watchdog_metrics,
                token.clone(),
            ));
            (Managers::Weeder(manager), controller)
        }
    };

    let server = HttpServer::new({
        let registry = registry.clone();
        let managers = managers.clone();
        move || {
            App::new()
                .app_data(Data::new(registry.clone()))
                .app_data(Data::new(managers.clone()))
                .wrap(middleware::Logger::default().exclude("/health"))
                .service(index)
                .service(health)
                .service(metrics)
        }
    })
    .disable_signals()
    .bind(&args.metrics_bind_addr)
    .with_context(|| format!("cannot bind {}", args.metrics_bind_addr))?
    .bind(&args.health_bind_addr)
    .with_context(|| format!("cannot bind {}", args.health_bind_addr))?
    .shutdown_timeout(5)
    .run();
    let server_handle = server.handle();
    {
        let token = token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            server_handle.stop(true).await;
        });
    }

    let (controller_result, server_result) = tokio::join!(controller, server);
    server_result.context("http server failed")?;
    controller_result.context("controller task panicked")??;

    info!("watchdog shut down cleanly");
    Ok(())
}

async fn management_client(args: &RunArgs) -> anyhow::Result<Client> {
    match &args.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("cannot read kubeconfig {}", path.display()))?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("cannot load kubeconfig")?;
            Client::try_from(config).context("cannot build management cluster client")
        }
        None => Client::try_default()
            .await
            .context("cannot build in-cluster management client"),
    }
}

/// First SIGINT/SIGTERM drains gracefully, a second one aborts.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "cannot install SIGINT handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        info!("shutdown signal received, draining");
        token.cancel();
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        warn!("second shutdown signal, aborting");
        std::process::exit(1);
    });
}

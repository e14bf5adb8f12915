use std::{net::SocketAddr, sync::Arc, time::Duration};

use is_terminal::IsTerminal;
use tokio::{io::AsyncWriteExt, net::TcpListener, signal, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use controller::{
    dmc::{Dmc, RateLimiterConfig},
    metrics::Metrics,
    rgd, Context, Error, Result,
};

fn main() {
    use clap::{crate_authors, crate_description, crate_name, crate_version, Arg, ArgAction, Command};
    use std::process;

    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommands([Command::new("run").about("run the resource graph orchestrator").args([
            Arg::new("metrics_address")
                .long("metrics-bind-address")
                .help("address to bind for the HTTP metrics endpoint")
                .default_value("[::]:8078"),
            Arg::new("probe_address")
                .long("probe-bind-address")
                .help("address to bind for the HTTP health/readiness endpoint")
                .default_value("[::]:8079"),
            Arg::new("leader_elect")
                .long("leader-elect")
                .help("Flag for if leader election is needed. Currently does nothing.")
                .hide(true)
                .action(ArgAction::SetTrue),
            Arg::new("allow_crd_deletion")
                .long("allow-crd-deletion")
                .help("delete the derived CustomResourceDefinition when its owning ResourceGraphDefinition is deleted")
                .action(ArgAction::SetTrue),
            Arg::new("rgd_concurrency")
                .long("rgd-concurrency")
                .help("maximum number of ResourceGraphDefinitions reconciled concurrently")
                .default_value("4"),
            Arg::new("dmc_workers")
                .long("dmc-workers")
                .help("number of workers draining the dynamic multiplexing controller's shared queue")
                .default_value("4"),
            Arg::new("min_retry_delay")
                .long("min-retry-delay")
                .help("delay, in milliseconds, before the first retry of a failed work item")
                .default_value("5"),
            Arg::new("max_retry_delay")
                .long("max-retry-delay")
                .help("cap, in milliseconds, on the exponential retry backoff")
                .default_value("1000000"),
            Arg::new("rate_per_second")
                .long("rate-per-second")
                .help("steady-state token refill rate for the shared workqueue")
                .default_value("10"),
            Arg::new("burst")
                .long("burst")
                .help("token bucket burst capacity for the shared workqueue")
                .default_value("100"),
            Arg::new("resync_period")
                .long("resync-period")
                .help("default full-resync interval, in seconds, for an instance whose ResourceGraphDefinition doesn't set its own")
                .env("KRO_RESYNC_PERIOD")
                .default_value("600"),
            Arg::new("queue_max_retries")
                .long("queue-max-retries")
                .help("number of rate-limited retries a work item tolerates before being dropped")
                .default_value("15"),
            Arg::new("shutdown_timeout")
                .long("shutdown-timeout")
                .help("seconds to wait for in-flight work items to finish during graceful shutdown")
                .default_value("30"),
            Arg::new("client_qps")
                .long("client-qps")
                .help("steady-state requests per second allowed against the API server")
                .default_value("20"),
            Arg::new("client_burst")
                .long("client-burst")
                .help("burst of requests allowed against the API server")
                .default_value("30"),
            Arg::new("log_level")
                .long("log-level")
                .help("default tracing filter directive, overridden by RUST_LOG")
                .env("KRO_LOG_LEVEL")
                .default_value("info"),
        ])]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("run", m)) => match Args::try_from(m) {
            Ok(args) => startup(args),
            Err(e) => Err(e),
        },
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    metrics_address: SocketAddr,
    probe_address: SocketAddr,
    _leader_elect: bool,
    allow_crd_deletion: bool,
    rgd_concurrency: usize,
    dmc_workers: usize,
    limiter: RateLimiterConfig,
    resync_period: Duration,
    shutdown_timeout: Duration,
    client_qps: f64,
    client_burst: usize,
    log_level: String,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = Error;

    fn try_from(m: &clap::ArgMatches) -> Result<Self> {
        fn get<T: std::str::FromStr>(m: &clap::ArgMatches, id: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            m.get_one::<String>(id)
                .expect("has default_value")
                .parse()
                .map_err(|e| Error::Other(anyhow::anyhow!("invalid value for --{id}: {e}")))
        }

        Ok(Self {
            metrics_address: m.get_one::<String>("metrics_address").unwrap().parse()?,
            probe_address: m.get_one::<String>("probe_address").unwrap().parse()?,
            _leader_elect: m.get_flag("leader_elect"),
            allow_crd_deletion: m.get_flag("allow_crd_deletion"),
            rgd_concurrency: get(m, "rgd_concurrency")?,
            dmc_workers: get(m, "dmc_workers")?,
            limiter: RateLimiterConfig {
                min_retry_delay: Duration::from_millis(get(m, "min_retry_delay")?),
                max_retry_delay: Duration::from_millis(get(m, "max_retry_delay")?),
                rate_per_second: get(m, "rate_per_second")?,
                burst: get(m, "burst")?,
                max_retries: get(m, "queue_max_retries")?,
            },
            resync_period: Duration::from_secs(get(m, "resync_period")?),
            shutdown_timeout: Duration::from_secs(get(m, "shutdown_timeout")?),
            client_qps: get(m, "client_qps")?,
            client_burst: get(m, "client_burst")?,
            log_level: m.get_one::<String>("log_level").unwrap().clone(),
        })
    }
}

fn startup(args: Args) -> Result<()> {
    use tokio::runtime;
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;

    let prom =
        metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(args.metrics_address);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();

    rt.handle().spawn(async move {
        if let Err(e) = prom.install() {
            error!("error setting up prometheus endpoint: {e}");
        }
    });
    rt.handle().spawn(probe(args.probe_address, token.clone()));
    let sigstop = token.clone();
    rt.handle().spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGTERM: {err}");
        }
        sigstop.cancel();
    });
    let runstop = token.clone();
    rt.block_on(run(args, runstop))
}

/// Probe serves a minimal liveness/readiness endpoint: every accepted connection gets a fixed
/// `200 OK` and is closed, since the controller has no per-dependency health state worth
/// distinguishing from "the process is up".
async fn probe(addr: SocketAddr, cancel: CancellationToken) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, "error binding probe listener: {e}");
            return;
        }
    };
    info!(%addr, "started probe server");
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((mut socket, _)) = accepted else { continue };
                tokio::spawn(async move {
                    const RESPONSE: &[u8] =
                        b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok";
                    let _ = socket.write_all(RESPONSE).await;
                    let _ = socket.shutdown().await;
                });
            }
        }
    }
}

async fn run(args: Args, token: CancellationToken) -> Result<()> {
    let base_config = kube::Config::infer().await?;
    let client = client_for(&base_config, args.client_qps, args.client_burst)?;

    info!(
        rgd_concurrency = args.rgd_concurrency,
        dmc_workers = args.dmc_workers,
        allow_crd_deletion = args.allow_crd_deletion,
        "setup done, starting controllers"
    );

    let metrics = Metrics::default();
    let dmc = Arc::new(Dmc::new(client.clone(), args.dmc_workers, args.limiter, metrics.dmc.clone()));
    let ctx = Arc::new(Context {
        client,
        base_config,
        dmc: dmc.clone(),
        metrics,
        default_resync_seconds: args.resync_period.as_secs(),
        allow_crd_deletion: args.allow_crd_deletion,
    });

    let mut set = JoinSet::new();
    set.spawn(rgd::controller(token.clone(), ctx.clone()));
    let shutdown_timeout = args.shutdown_timeout;
    set.spawn(async move { dmc.run(token, shutdown_timeout).await });
    while let Some(res) = set.join_next().await {
        match res {
            Err(e) => error!("error joining controller task: {e}"),
            Ok(Err(e)) => error!("error from controller: {e}"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}

/// Client_for builds the base `kube::Client`, layering a token-bucket rate limit onto outgoing
/// requests so a runaway reconcile loop can't overrun the API server.
fn client_for(config: &kube::Config, qps: f64, burst: usize) -> Result<kube::Client> {
    use hyper_util::{client::legacy::Client as HyperClient, rt::TokioExecutor};
    use kube::client::ConfigExt;
    use tower::ServiceBuilder;

    let rate = qps.max(1.0);
    let per = Duration::from_secs_f64(burst as f64 / rate);

    let https = config.openssl_https_connector()?;
    let auth_layer = config.auth_layer()?;
    let connector = HyperClient::builder(TokioExecutor::new()).build(https);
    let service = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .option_layer(auth_layer)
        .rate_limit(burst as u64, per)
        .service(connector);
    Ok(kube::Client::new(service, config.default_namespace.clone()))
}

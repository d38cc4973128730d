use anyhow::Result;
use clap::Parser;
use printforge::dispatch::{self, AutoDispatch, DispatchCoordinator, HttpPrintPartner};
use printforge::http::{self, AppState};
use printforge::pipeline::{Pipeline, PipelineSettings};
use printforge::reconstruction::HttpReconstruction;
use printforge::segmentation::{LocalHeuristic, RemoteCutout, SegmentationChain, SegmentationStrategy};
use printforge::{config, db, fetch, outbox, sweeper};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let segmentation_http = fetch::build_http_client(Duration::from_secs(cfg.segmentation.timeout_seconds))?;
    let reconstruction_http = fetch::build_http_client(Duration::from_secs(cfg.reconstruction.timeout_seconds))?;
    let partner_http = fetch::build_http_client(Duration::from_secs(cfg.dispatch.timeout_seconds))?;
    let service_http = fetch::build_http_client(Duration::from_secs(30))?;

    let auto = AutoDispatch::new(cfg.dispatch.auto_dispatch);
    let dispatcher = DispatchCoordinator::new(
        pool.clone(),
        Arc::new(HttpPrintPartner::from_config(partner_http, &cfg)),
        dispatch::notifier_from_config(service_http.clone(), &cfg),
        auto,
        chrono::Duration::seconds(cfg.dispatch.claim_lease_seconds as i64),
    );

    let strategies: Vec<Arc<dyn SegmentationStrategy>> = vec![
        Arc::new(RemoteCutout::from_config(segmentation_http, &cfg)),
        Arc::new(LocalHeuristic::new()),
    ];
    let chain = SegmentationChain::new(strategies);
    let pipeline = Pipeline::new(
        pool.clone(),
        service_http,
        chain,
        Arc::new(HttpReconstruction::from_config(reconstruction_http, &cfg)),
        PipelineSettings::from_config(&cfg),
    )
    .with_dispatcher(dispatcher.clone());

    // Spawn outbox worker (single-threaded)
    let worker_pool = pool.clone();
    let worker_dispatcher = dispatcher.clone();
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let max_backoff = cfg.app.max_backoff_seconds as i64;
    tokio::spawn(async move {
        loop {
            match outbox::process_next_task(&worker_pool, &worker_dispatcher, max_backoff).await {
                Ok(processed) => {
                    if !processed {
                        tokio::time::sleep(poll_sleep).await;
                    }
                }
                Err(err) => {
                    error!(?err, "outbox worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    // Periodic retention sweep
    let sweep_pool = pool.clone();
    let window = cfg.retention_window();
    let mut ticker = tokio::time::interval(cfg.sweep_interval());
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            if let Err(err) = sweeper::sweep(&sweep_pool, window).await {
                error!(?err, "retention sweep failed");
            }
        }
    });

    let state = AppState {
        pool,
        pipeline: Arc::new(pipeline),
        dispatcher,
        content_dir: cfg.content_dir(),
        retention_window: cfg.retention_window(),
    };
    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "starting printforge server");
    http::serve(listener, state).await
}

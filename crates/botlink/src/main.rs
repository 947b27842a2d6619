use std::{path::PathBuf, time::Duration};

use botlink::{
    cli::Args,
    config::Config,
    gateway::run_gateway,
    shutdown::Shutdown,
    supervisor::{ChildSpec, Supervisor},
    tracing_init::init_tracing,
    worker::run_worker,
};
use botlink_ipc::spawn_named;
use clap::Parser;
use eyre::WrapErr;
use mimalloc::MiMalloc;
use tracing::{Instrument, info, info_span};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Blocking calls still running at exit (a method past its budget, a stuck
/// stop hook) are abandoned after this long.
const RUNTIME_DRAIN: Duration = Duration::from_secs(1);

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let config = Config::load(args.config().map(PathBuf::as_path))
        .wrap_err("loading configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("unable to initialize tokio runtime")?;

    let outcome = runtime.block_on(async move {
        init_tracing(args.log_path().map(PathBuf::as_path))
            .wrap_err("opening log file")?;
        let shutdown = Shutdown::new();
        shutdown.trigger_on_signals();

        let span = info_span!("botlink", role = args.role());
        spawn_named("root", run_role(args, config, shutdown).instrument(span))
            .await
            .wrap_err("root task panicked")?
    });
    runtime.shutdown_timeout(RUNTIME_DRAIN);

    std::process::exit(outcome?)
}

async fn run_role(args: Args, config: Config, shutdown: Shutdown) -> eyre::Result<i32> {
    match &args {
        Args::Supervise { .. } => {
            let config_path = args.config().map(PathBuf::as_path);
            let log_path = args.log_path().map(PathBuf::as_path);
            let supervisor = Supervisor::new(
                ChildSpec::for_role("worker", config_path, log_path)?,
                ChildSpec::for_role("gateway", config_path, log_path)?,
                config,
            );
            supervisor.run(shutdown).await?;
            info!("supervisor stopped");
            Ok(0)
        }
        Args::Gateway { .. } => {
            run_gateway(&config, shutdown).await?;
            Ok(0)
        }
        Args::Worker { .. } => {
            let exit = run_worker(&config, shutdown).await?;
            Ok(exit.into())
        }
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;

use handoff_server::config::{Config, ConfigSnapshot, ConfigWatcher};
use handoff_server::server::{
    self, handler, AdmissionLimiter, BinaryWatcher, Generation, HttpEngine, LifecycleController,
    Outcome, ProcessSpawner, SignalEvent,
};
use handoff_server::{logger, Error};

/// Capacity of the lifecycle event queue
const EVENT_QUEUE: usize = 8;

#[derive(Debug, Parser)]
#[command(name = "handoff_server", version, about = "HTTP server with zero-downtime restarts")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Recover the listener inherited from the previous generation instead of binding
    #[arg(short = 'g', long)]
    graceful: bool,

    /// Override the number of tokio worker threads
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let cfg = Config::load_from(&cli.config)?;
    logger::init(&cfg.logging)?;

    // 创建 Tokio 运行时，根据 workers 配置设置线程数
    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();

    if let Some(workers) = cli.workers.or(cfg.server.workers) {
        runtime_builder.worker_threads(workers);
        tracing::info!(workers, "using configured worker threads");
    }

    let runtime = runtime_builder.build()?;
    let outcome = runtime.block_on(async_main(cli, cfg));
    runtime.shutdown_timeout(Duration::from_secs(1));

    let outcome = outcome?;
    match outcome.successor {
        Some(pid) => tracing::info!(successor = pid, "generation retired after handoff"),
        None => tracing::info!("server stopped"),
    }
    if outcome.drain_timed_out {
        tracing::warn!("some connections were closed before completing");
    }
    Ok(())
}

async fn async_main(cli: Cli, cfg: Config) -> Result<Outcome, Error> {
    let recover = cli.graceful || server::recover_requested();
    let listener = server::acquire(cfg.socket_addr()?, recover, cfg.tls_paths())?;
    let generation = Generation::current(listener.is_inherited());

    // Registered before serving, so an early SIGHUP is queued instead of killing us
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    server::start_signal_handler(events_tx.clone())?;

    let limiter = Arc::new(AdmissionLimiter::new(cfg.limiter.capacity));
    let engine = HttpEngine::start(
        listener.tokio_listener()?,
        limiter,
        handler::generation_status(generation.clone()),
        listener.tls_acceptor()?,
        cfg.header_read_timeout(),
    )?;
    logger::log_server_start(&listener.addr(), &generation, listener.tls_paths().is_some());

    match server::notify_parent_ready() {
        Ok(true) => tracing::info!("reported readiness to the previous generation"),
        Ok(false) => {}
        Err(e) => tracing::warn!(error = %e, "could not report readiness to the previous generation"),
    }

    if cfg.watcher.enabled {
        let restart_on_change = cfg.watcher.restart_on_change;
        let events = events_tx.clone();
        ConfigWatcher::new(cfg.watch_path(&cli.config)).watch(
            cfg.watch_interval(),
            move |snapshot: &ConfigSnapshot| {
                // Never hand off to a generation that would fail to start
                Config::from_toml(&snapshot.content)?;
                if restart_on_change {
                    events
                        .try_send(SignalEvent::Restart)
                        .map_err(|e| Error::Config(format!("restart not queued: {e}")))?;
                }
                Ok(())
            },
        );
    }

    if cfg.upgrade.watch_binary {
        BinaryWatcher::for_current_exe()?.watch(
            Duration::from_secs(cfg.upgrade.interval_secs.max(1)),
            events_tx.clone(),
        );
    }
    drop(events_tx);

    let spawner = ProcessSpawner::for_current_exe(cfg.ready_timeout())?;
    let controller = LifecycleController::new(listener, engine, spawner, cfg.grace_timeout());
    Ok(controller.run(events_rx).await)
}

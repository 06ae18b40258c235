use std::sync::Arc;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;

use tcb_core::{
    clock::SystemClock,
    commands::CommandSurface,
    config::{Config, LifetimePolicy},
    domain::OwnerId,
    lifecycle::LifecycleManager,
    locks::OwnerLocks,
    provider::{ChannelProvider, TimeoutProvider},
    store::{RecordStore, SqliteStore},
    sweeper::{ExpirySweeper, SweeperConfig},
};
use tcb_discord::{run_gateway, DiscordProvider, GatewayRouter};

const USAGE: &str = "usage: tcb [run | sweep | command <owner_id> <text...>]";

struct App {
    discord: Arc<DiscordProvider>,
    sweeper: ExpirySweeper,
    surface: Arc<CommandSurface>,
    lifetimes: LifetimePolicy,
}

impl App {
    fn build(cfg: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn RecordStore> = Arc::new(
            SqliteStore::open(&cfg.database_path)
                .with_context(|| format!("opening {}", cfg.database_path.display()))?,
        );
        let discord = Arc::new(DiscordProvider::from_config(cfg)?);
        let provider: Arc<dyn ChannelProvider> =
            Arc::new(TimeoutProvider::new(discord.clone(), cfg.provider_timeout));
        let clock = Arc::new(SystemClock);
        let locks = Arc::new(OwnerLocks::new());

        let manager = Arc::new(LifecycleManager::new(
            store.clone(),
            provider.clone(),
            clock.clone(),
            locks.clone(),
            cfg.lifetimes,
        ));
        let sweeper = ExpirySweeper::new(store, provider, clock, locks, SweeperConfig::from(cfg));

        Ok(Self {
            discord,
            sweeper,
            surface: Arc::new(CommandSurface::new(manager)),
            lifetimes: cfg.lifetimes,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tcb_core::logging::init("tcb")?;

    let cfg = Config::load()?;
    let app = App::build(&cfg)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => run(&app).await,
        Some("sweep") => {
            let report = app.sweeper.sweep_once().await?;
            println!("{report:#?}");
            Ok(())
        }
        Some("command") => {
            let owner = args
                .get(1)
                .and_then(|s| s.parse::<u64>().ok())
                .context(USAGE)?;
            let text = args[2..].join(" ");
            if text.is_empty() {
                bail!(USAGE);
            }
            let resp = app.surface.handle_text(OwnerId(owner), &text).await;
            println!("{resp}");
            Ok(())
        }
        Some(other) => bail!("unknown subcommand {other:?}\n{USAGE}"),
    }
}

/// Gateway plus sweeper until a signal arrives or either of them dies.
async fn run(app: &App) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let router = GatewayRouter::new(app.discord.clone(), app.surface.clone(), app.lifetimes);
    let mut gateway = tokio::spawn(run_gateway(router, cancel.clone()));
    app.sweeper.start().await;

    let gateway_exit = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested");
            None
        }
        _ = app.sweeper.stopped() => {
            tracing::error!("expiry sweeper exited on its own");
            None
        }
        res = &mut gateway => {
            tracing::error!("gateway exited on its own");
            Some(res)
        }
    };

    cancel.cancel();
    let gateway_res = match gateway_exit {
        Some(res) => res,
        None => gateway.await,
    };
    let sweeper_res = app.sweeper.stop().await;

    gateway_res.context("gateway task panicked")??;
    sweeper_res?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

mod admin;
mod ads;
mod banned_words;
mod config;
mod gate;
mod groups;
mod handlers;
mod models;
mod platform;
mod scheduler;
mod store;

use anyhow::{Context, Result};
use std::{path::PathBuf, sync::Arc, time::Duration};
use teloxide::{
    dispatching::UpdateHandler, error_handlers::LoggingErrorHandler, prelude::*,
    utils::command::BotCommands,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{load_config, parse_config_arg, validate_config};
use crate::handlers::{notify_startup, on_command, on_message, AppState, Command};
use crate::platform::{ChatApi, TelegramApi};
use crate::scheduler::AdBroadcaster;
use crate::store::{RecordStore, SnapshotStore};

fn schema() -> UpdateHandler<anyhow::Error> {
    Update::filter_message()
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(on_command),
        )
        .branch(dptree::endpoint(on_message))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));

    let cfg = load_config(&config_path)?;
    validate_config(&cfg)?;
    let schedule = cfg.broadcast.schedule()?;

    let filter = cfg.bot.log_level.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let data_dir = cfg.runtime.data_dir();
    std::fs::create_dir_all(&data_dir).with_context(|| format!("create data dir: {}", data_dir))?;
    let store: Arc<dyn RecordStore> =
        Arc::new(SnapshotStore::load(SnapshotStore::snapshot_path(&data_dir))?);

    let (shutdown_tx, _shutdown_rx0) = broadcast::channel::<()>(8);

    let shutdown_ctrl = shutdown_tx.clone();
    let ctrl_handle = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_ctrl.send(());
    });

    let bot = Bot::new(cfg.bot.token.clone());
    let me = bot.get_me().send().await?;
    let bot_username = me.user.username.clone().unwrap_or_else(|| "bot".into());

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("set_my_commands failed: {:?}", e);
    }

    let api: Arc<dyn ChatApi> = Arc::new(TelegramApi::new(bot.clone()));
    let state = Arc::new(AppState::new(store.clone(), &cfg.moderation, me.user.id));

    notify_startup(&state, api.as_ref()).await;

    let broadcaster = AdBroadcaster::new(state.ads.clone(), state.groups.clone());
    let api_bc = api.clone();
    let shutdown_rx_bc = shutdown_tx.subscribe();
    let h_broadcast = tokio::spawn(async move {
        broadcaster.run(api_bc, schedule, shutdown_rx_bc).await;
    });

    let h_autosave = match cfg.runtime.autosave_secs.filter(|s| *s > 0) {
        Some(secs) => {
            let store_save = store.clone();
            let mut shutdown_rx_save = shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                let period = Duration::from_secs(secs);
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = shutdown_rx_save.recv() => { break; }
                        _ = ticker.tick() => {
                            if let Err(e) = store_save.flush().await {
                                warn!("autosave failed: {:?}", e);
                            }
                        }
                    }
                }
            }))
        }
        None => None,
    };

    info!("Start polling as @{} (data dir {})", bot_username, data_dir);

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![state, api])
        .default_handler(|upd| async move {
            let _ = upd;
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    let _ = shutdown_tx.send(());
    let _ = ctrl_handle.await;
    let _ = h_broadcast.await;
    if let Some(h) = h_autosave {
        let _ = h.await;
    }

    store.flush().await.context("final snapshot flush")?;
    info!("state saved, bye");
    Ok(())
}

// PalNet node: LAN discovery, signed peer links, and character-state sync daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use pal_core::{
    parse_payload, BattleEndPayload, BattleInvitePayload, CharacterActionPayload, Envelope, Keypair,
    MessageType, TrustLayer,
};
use pal_node::{config, Config, NetworkManager, PeerInfo, SyncService};
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("pal-node {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load(config_path.as_deref()).context("loading config")?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let keypair = Keypair::generate();
    let trust = match &cfg.peer_id {
        Some(id) => TrustLayer::with_peer_id(keypair, id.clone()),
        None => TrustLayer::new(keypair),
    }
    .with_key_change_policy(cfg.key_change_policy);

    let network = Arc::new(NetworkManager::new(cfg.network_config(), Arc::new(trust)));
    log_collaborator_messages(&network);
    network.start().await.context("starting network manager")?;

    let sync = SyncService::new(Arc::clone(&network), cfg.strategy, &cfg.priorities);
    sync.set_sync_interval(cfg.sync_interval()).await?;
    sync.start();
    info!(version = VERSION, strategy = %cfg.strategy, "pal-node running");

    shutdown_signal().await?;
    info!("shutting down");
    sync.stop().await;
    network.stop().await;
    Ok(())
}

/// UI and battle messages belong to other components; the daemon only logs them.
fn log_collaborator_messages(network: &NetworkManager) {
    network.register_handler(
        MessageType::CharacterAction,
        |env: Envelope, from: PeerInfo| -> anyhow::Result<()> {
            let action: CharacterActionPayload = parse_payload(&env)?;
            info!(peer = %from.id, action = %action.action, character = %action.character_id, "character action");
            Ok(())
        },
    );
    network.register_handler(
        MessageType::BattleInvite,
        |env: Envelope, from: PeerInfo| -> anyhow::Result<()> {
            let invite: BattleInvitePayload = parse_payload(&env)?;
            info!(peer = %from.id, battle = %invite.battle_id, to = %invite.to_character_id, "battle invite");
            Ok(())
        },
    );
    network.register_handler(
        MessageType::BattleEnd,
        |env: Envelope, from: PeerInfo| -> anyhow::Result<()> {
            let end: BattleEndPayload = parse_payload(&env)?;
            info!(peer = %from.id, battle = %end.battle_id, winner = ?end.winner, reason = ?end.reason, "battle ended");
            Ok(())
        },
    );
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

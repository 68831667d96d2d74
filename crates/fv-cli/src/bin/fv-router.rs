use anyhow::{anyhow, Result};
use clap::Parser;
use fv_cli::{apply_persisted_log_level, init_tracing, router_cli::{RouterArgs, RouterCommand}};
use peer_net::IdentityKeyPair;
use router_core::{settings, Directory};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "fv-router starting");

    let args = RouterArgs::parse();
    match args.cmd {
        Some(RouterCommand::Keygen) => keygen(),
        Some(RouterCommand::CreateConfig) => create_config().await?,
        Some(RouterCommand::Run) | None => run_service().await?,
    }
    Ok(())
}

fn keygen() {
    let pair = IdentityKeyPair::generate();
    println!("Private key: {}", pair.private_key_hex());
    println!("Public key: {}", pair.public_key_hex());
}

async fn create_config() -> Result<()> {
    println!("Creation of initial configuration started.");

    let settings_path = settings::settings_file_path();
    println!("Settings file path: {}", settings_path.display());
    if settings_path.exists() {
        return Err(anyhow!("settings file already exists, refusing to overwrite"));
    }

    if state_store::router_db_exists().await {
        return Err(anyhow!("directory database already exists, refusing to overwrite"));
    }

    let directory = Directory::open().await?;
    directory.seed_admin_user().await?;

    let pair = IdentityKeyPair::generate();
    let public_key_path = settings::public_key_file_path();
    if let Some(parent) = public_key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&public_key_path, pair.public_key_hex())?;
    println!("Public key file: {}", public_key_path.display());

    let config = fv_types::config::RouterConfig {
        private_key: pair.private_key_hex(),
        ..Default::default()
    };
    settings::save(&settings_path, &config)?;

    println!("Configuration successfully created. Don't forget to change your password!");
    println!("User name: {}", router_core::directory::INITIAL_ADMIN_USER);
    println!("Password: {}", router_core::directory::INITIAL_ADMIN_PASSWORD);
    Ok(())
}

async fn run_service() -> Result<()> {
    let settings_path = settings::settings_file_path();
    let config = settings::load(&settings_path)
        .map_err(|e| anyhow!("failed to load router settings (run create-config first): {e}"))?;
    let identity = IdentityKeyPair::from_hex(&config.private_key)
        .map_err(|e| anyhow!("invalid private key in settings: {e}"))?;

    let directory = Directory::open().await?;
    apply_persisted_log_level(directory.pool()).await;

    tokio::select! {
        result = router_core::run_router_server(config, directory, identity) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
    Ok(())
}

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fv_cli::{host_cli::HostArgs, init_tracing};
use host_core::{
    desktop::NullPipelineFactory,
    router_link::RouterLink,
    session_manager::{NullLauncher, UserSessionManager},
    settings,
};
use peer_net::IdentityKeyPair;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "fv-host starting");

    let args = HostArgs::parse();
    let settings_path = settings::settings_file_path();

    if args.import.is_some() && args.export.is_some() {
        if !args.silent {
            eprintln!("Export and import parameters can not be specified together.");
        }
        warn!("import and export specified at the same time");
        return ExitCode::FAILURE;
    }

    if let Some(source) = args.import {
        return match settings::import_from_file(&source, &settings_path) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                if !args.silent {
                    eprintln!("Import failed: {e}");
                }
                error!(error = %e, "settings import failed");
                ExitCode::FAILURE
            }
        };
    }

    if let Some(target) = args.export {
        return match settings::export_to_file(&settings_path, &target) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                if !args.silent {
                    eprintln!("Export failed: {e}");
                }
                error!(error = %e, "settings export failed");
                ExitCode::FAILURE
            }
        };
    }

    if let Err(e) = settings::integrity_check(&settings_path) {
        error!(error = %e, "integrity check failed");
        return ExitCode::FAILURE;
    }

    match run_service(&settings_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "host service failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_service(settings_path: &std::path::Path) -> anyhow::Result<()> {
    let mut host_settings = if settings_path.exists() {
        settings::load(settings_path)?
    } else {
        settings::HostSettings::default()
    };

    // First run mints the host identity.
    if host_settings.private_key.is_empty() {
        host_settings.private_key = IdentityKeyPair::generate().private_key_hex();
        settings::save(settings_path, &host_settings)?;
        info!("generated host identity");
    }
    let identity = IdentityKeyPair::from_hex(&host_settings.private_key)?;
    info!(key_hash = %identity.public_key_hash(), "host identity loaded");

    let link = RouterLink::new(host_settings.config.router_server_endpoint.clone(), identity);
    let manager = UserSessionManager::start(
        host_settings.config.clone(),
        link.clone(),
        Arc::new(NullLauncher),
        Arc::new(NullPipelineFactory),
    );
    link.set_manager(manager.clone());
    tokio::spawn(link.run());

    #[cfg(unix)]
    {
        let endpoint = host_core::ipc::default_ipc_endpoint();
        let server = host_core::ipc::IpcServer::bind(&endpoint)?;
        info!(endpoint = %endpoint.display(), "IPC endpoint bound");
        tokio::select! {
            _ = manager.serve_ipc(server) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = manager;
        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
    }

    Ok(())
}

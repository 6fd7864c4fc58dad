use ark_core::coordinator::Coordinator;
use ark_core::database::Database;
use ark_core::extended_rpc::{ExtendedRpc, RetryConfig};
use ark_core::utils::get_configuration_for_binaries;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::process::exit;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let (config, _) = get_configuration_for_binaries();

    if let Some(addr) = config.metrics_addr {
        if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
            eprintln!("Can't start the metrics exporter on {addr}: {e}");
            exit(1);
        }
        tracing::info!("Serving metrics on {addr}");
    }

    let db = match Database::new(&config).await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };
    let rpc = match ExtendedRpc::new(
        config.bitcoin_rpc_url.clone(),
        &config.bitcoin_rpc_user,
        &config.bitcoin_rpc_password,
        RetryConfig::default(),
    ) {
        Ok(rpc) => rpc,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    let coordinator = match Coordinator::from_config(&config, Arc::new(rpc), db.clone()) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };
    tracing::info!(
        "Coordinator {} running rounds on {}",
        coordinator.public_key(),
        config.network
    );

    let result = tokio::select! {
        result = coordinator.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
            Ok(())
        }
    };
    db.close().await;

    if let Err(e) = result {
        eprintln!("{e}");
        exit(1);
    }
}

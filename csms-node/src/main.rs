//! CSMS Node - CLI for the OCPP central system
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (ws://0.0.0.0:8180/<station-id>, ocpp1.6)
//! csms-node
//!
//! # Require Basic auth for two stations
//! csms-node --basic-auth --credential CP001:secret1 --credential CP002:secret2
//!
//! # Accept every station and transaction without business logic
//! csms-node --accept-all --heartbeat-interval 60
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use csms_server::ocpp::v16::{
    AuthorizationStatus, AuthorizeRequest, AuthorizeResponse, BootNotificationRequest,
    BootNotificationResponse, IdTagInfo, StartTransactionRequest, StartTransactionResponse,
    StatusNotificationRequest, StopTransactionRequest, StopTransactionResponse,
};
use csms_server::{CentralSystem, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// OCPP 1.6 central system server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8180")]
    listen: SocketAddr,

    /// Require HTTP Basic authentication on connect
    #[arg(long)]
    basic_auth: bool,

    /// Station credential as STATION:PASSWORD (can be repeated)
    #[arg(long, value_parser = parse_credential)]
    credential: Vec<(String, String)>,

    /// Timeout for server-initiated requests, in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Answer boots, authorizations and transactions with Accepted
    #[arg(long)]
    accept_all: bool,

    /// Heartbeat interval handed out with accepted boots, in seconds
    #[arg(long, default_value = "300")]
    heartbeat_interval: i32,

    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = ServerConfig::new(args.listen)
        .with_request_timeout(Duration::from_secs(args.request_timeout));
    let config = if args.basic_auth {
        config.with_basic_auth()
    } else {
        config
    };

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║               CSMS Node - OCPP Central System                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:   {:<50} ║", format!("ws://{}/<station-id>", config.listen_addr));
    println!("║  Protocol: {:<50} ║", config.version);
    println!("║  Auth:     {:<50} ║", if config.require_basic_auth { "basic" } else { "none" });
    println!("║  Stations: {:<50} ║", args.credential.len());
    println!("║  Started:  {:<50} ║", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let central = CentralSystem::new(config);

    for (station, password) in &args.credential {
        central.add_credential(station.as_str(), password.as_str());
        info!("Added credential for {}", station);
    }

    central.on_request_received(|ctx, status: &StatusNotificationRequest| {
        info!(
            "{} connector {}: {:?} ({:?})",
            ctx.station_id, status.connector_id, status.status, status.error_code
        );
    })?;

    if args.accept_all {
        accept_all(&central, args.heartbeat_interval)?;
        info!("Accepting all boots, authorizations and transactions");
    }

    let server = central.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            server.shutdown();
        }
    });

    central.run().await?;
    Ok(())
}

/// Register permissive responders for the station-initiated core actions
fn accept_all(central: &CentralSystem, heartbeat_interval: i32) -> csms_server::error::Result<()> {
    central.respond_with(move |ctx, boot: BootNotificationRequest| async move {
        info!(
            "Boot from {}: {} {}",
            ctx.station_id, boot.charge_point_vendor, boot.charge_point_model
        );
        Ok(Some(BootNotificationResponse::accepted(heartbeat_interval)))
    })?;

    central.respond_with(|_, _: AuthorizeRequest| async {
        Ok(Some(AuthorizeResponse {
            id_tag_info: IdTagInfo::new(AuthorizationStatus::Accepted),
        }))
    })?;

    let next_transaction = Arc::new(AtomicI32::new(1));
    central.respond_with(move |ctx, start: StartTransactionRequest| {
        let transaction_id = next_transaction.fetch_add(1, Ordering::Relaxed);
        async move {
            info!(
                "Transaction {} started on {} connector {} by {}",
                transaction_id, ctx.station_id, start.connector_id, start.id_tag
            );
            Ok(Some(StartTransactionResponse {
                id_tag_info: IdTagInfo::new(AuthorizationStatus::Accepted),
                transaction_id,
            }))
        }
    })?;

    central.respond_with(|ctx, stop: StopTransactionRequest| async move {
        info!(
            "Transaction {} stopped on {} at {} Wh",
            stop.transaction_id, ctx.station_id, stop.meter_stop
        );
        Ok(Some(StopTransactionResponse {
            id_tag_info: Some(IdTagInfo::new(AuthorizationStatus::Accepted)),
        }))
    })?;

    Ok(())
}

/// Parse `STATION:PASSWORD`
fn parse_credential(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((station, password)) if !station.is_empty() => {
            Ok((station.to_string(), password.to_string()))
        }
        _ => Err(format!("expected STATION:PASSWORD, got {:?}", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_credential() {
        assert_eq!(
            parse_credential("CP1:pa:ss"),
            Ok(("CP1".to_string(), "pa:ss".to_string()))
        );
        assert!(parse_credential("CP1").is_err());
        assert!(parse_credential(":pw").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::parse_from([
            "csms-node",
            "--credential",
            "CP1:a",
            "--credential",
            "CP2:b",
            "--accept-all",
        ]);

        assert_eq!(args.credential.len(), 2);
        assert!(args.accept_all);
        assert_eq!(args.listen.port(), 8180);
    }
}

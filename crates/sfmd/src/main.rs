//! sfmd — SFM AirDrop daemon.
//!
//! Loads configuration, brings up the device identity and trust store,
//! advertises on mDNS, and serves the transfer API until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use sfm_airdrop::discovery::Advertiser;
use sfm_airdrop::{AirdropServer, TofuStore};
use sfm_core::identity::DeviceIdentity;

mod config;
use config::SfmdConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SfmdConfig::load().context("failed to load configuration")?;
    tracing::info!(
        device_name = %config.device_name,
        port = config.listen_port,
        download_dir = %config.download_dir.display(),
        "sfmd starting"
    );

    let identity = Arc::new(
        DeviceIdentity::load_or_generate(&config.identity_dir)
            .context("failed to load device identity")?,
    );
    tracing::info!(fingerprint = %identity.fingerprint(), "device identity ready");

    let trust = Arc::new(
        TofuStore::open(config.identity_dir.join("trusted_devices.json"))
            .context("failed to open trust store")?,
    );

    let advertiser = Advertiser::start(&config.device_name, config.listen_port)
        .context("failed to start mDNS advertising")?;

    let server = AirdropServer::new(
        config.device_name.clone(),
        identity,
        config.download_dir.clone(),
        trust,
    )
    .with_idle_timeout(Duration::from_secs(config.session_idle_secs))
    .with_accept_callback(Arc::new(|offer| {
        tracing::info!(
            sender = %offer.sender_name,
            fingerprint = %offer.sender_fingerprint,
            file = %offer.file_name,
            bytes = offer.size,
            "accepting incoming transfer"
        );
        true
    }));

    tokio::select! {
        result = server.serve(config.listen_port) => {
            result.context("transfer server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            // Open sessions are dropped with the process; partial output
            // files stay on disk.
            tracing::info!("shutdown requested");
        }
    }

    advertiser.stop();
    Ok(())
}

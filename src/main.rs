//! WeChat Web Client - Main Entry Point
//!
//! Logs in by QR code, keeps the session synced and logs every incoming
//! message until Ctrl-C or until the server ends the session.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wechat_web_client::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,wechat_web_client=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 WeChat Web client starting...");

    // Load configuration
    let config = ClientConfig::from_env()?;
    info!("📋 Configuration loaded, login host {}", config.login_host);

    let gateway =
        Arc::new(ReqwestGateway::new(&config.user_agent).context("Failed to build HTTP client")?);
    let client = WechatClient::new(config, gateway);

    let session_ended = Arc::new(Notify::new());
    client.subscribe(Arc::new(log_event_handler(
        client.config().clone(),
        session_ended.clone(),
    )));

    client.start().await.context("Failed to start WeChat client")?;

    let own = client
        .own_user()
        .map(|user| user.display_name().to_string())
        .unwrap_or_default();
    info!(
        "✅ Logged in as {}, {} contacts and {} groups",
        own,
        client.directory().contacts().len(),
        client.directory().groups().len()
    );

    // Wait for shutdown signal or for the server to drop the session
    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("📢 Shutdown signal received"),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        _ = session_ended.notified() => info!("📴 Session ended by server"),
    }

    info!("🛑 Stopping client...");
    if let Err(err) = client.stop().await {
        warn!("Stop did not complete cleanly: {}", err);
    }

    info!("✅ WeChat Web client stopped");
    Ok(())
}

/// Log every notification; signal `session_ended` when the session is gone
fn log_event_handler(
    config: ClientConfig,
    session_ended: Arc<Notify>,
) -> impl Fn(&Event) + Send + Sync + 'static {
    move |event: &Event| match event {
        Event::TicketReady(uuid) => {
            info!("📱 Scan to log in: {}", config.qr_code_url(uuid));
        }
        Event::Authenticated => info!("🔐 Login confirmed"),
        Event::DirectoryReady(members) => info!("📒 {} members loaded", members.len()),
        Event::Text(message) => {
            info!(
                "💬 {} -> {}: {}",
                message.from_name, message.to_name, message.raw_content
            );
        }
        Event::Image(message) | Event::Voice(message) | Event::Sticker(message) => {
            match (message.media_payload(), message.media_error()) {
                (Some(media), _) => info!(
                    "📎 {:?} from {} ({} bytes)",
                    message.kind,
                    message.from_name,
                    media.data.len()
                ),
                (None, Some(err)) => warn!(
                    "📎 {:?} from {}, media unavailable: {}",
                    message.kind, message.from_name, err
                ),
                (None, None) => info!("📎 {:?} from {}", message.kind, message.from_name),
            }
        }
        Event::StatusNotify(message) => info!("🔔 Status notification from {}", message.from_name),
        Event::VerifyRequest(message) => info!("🤝 Friend request from {}", message.from_name),
        Event::SessionError(err) => error!("❌ Session error ({}): {}", err.kind(), err),
        Event::SessionEnded => {
            info!("👋 Session ended");
            session_ended.notify_one();
        }
    }
}

//! CLI command implementations

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use wayconf::{ConfigSources, WaypostConfig};
use waypost::session::{HostEnvironment, SessionConfig, SessionManager};
use waypost::transport::{Priority, TransportConfig, TransportEvent, TransportManager};
use waystore::{PersistentStore, StoreConfig};

/// Time given to the link reactor to write what is already in its channel.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

fn open_store(config: &WaypostConfig) -> Result<PersistentStore> {
    let store_config = StoreConfig::with_base_path(&config.paths.store_dir);
    PersistentStore::open(&store_config)
        .with_context(|| format!("Failed to open store at {}", config.paths.store_dir.display()))
}

fn transport_for(config: &WaypostConfig, url: Option<&str>) -> Result<TransportManager> {
    let mut transport_config = TransportConfig::from(&config.transport);
    if let Some(url) = url {
        transport_config.url = Some(url.to_string());
    }
    if transport_config.url.is_none() {
        bail!(
            "No collector URL.\n\n\
             Pass --url ws://host:port/path or set transport.url in waypost.toml \
             (or WAYPOST_URL)."
        );
    }
    Ok(TransportManager::builder(transport_config).build())
}

/// Restore or create the visitor session and print it with its validation.
pub async fn session(config: &WaypostConfig, landing_page: Option<String>) -> Result<()> {
    let store = open_store(config)?;
    let mut env = HostEnvironment::new();
    if let Some(page) = landing_page {
        env = env.with_landing_page(page);
    }

    let manager = SessionManager::new(SessionConfig::from(&config.session), store, Arc::new(env));
    let session = manager.initialize_session();
    let validation = manager.validate_session();

    let output = json!({
        "session": session,
        "ephemeral": manager.is_ephemeral(),
        "validation": validation,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Connect, send one event, close.
pub async fn send(
    config: &WaypostConfig,
    name: &str,
    data: Option<&str>,
    url: Option<&str>,
    priority: &str,
) -> Result<()> {
    let data = data
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("Failed to parse --data as JSON")?;
    let priority: Priority = priority.parse().map_err(anyhow::Error::msg)?;

    let transport = transport_for(config, url)?;
    transport.connect(None).await.context("Failed to connect")?;

    if !transport.send_event(name, data, Some(priority)) {
        transport.destroy();
        bail!("Event was queued, not sent; the link dropped");
    }

    transport.disconnect();
    tokio::time::sleep(DRAIN_GRACE).await;

    let metrics = transport.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    transport.destroy();
    Ok(())
}

/// Print inbound messages until Ctrl-C.
pub async fn listen(config: &WaypostConfig, url: Option<&str>) -> Result<()> {
    let transport = transport_for(config, url)?;

    transport.on_any(|event| match event {
        TransportEvent::MessageReceived(message) => match message.encode() {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("unprintable message {}: {}", message.id, e),
        },
        TransportEvent::ConnectionClose { code, reason, .. } => {
            eprintln!("closed ({}): {}", code, reason);
        }
        TransportEvent::ConnectionReconnecting { attempt, delay } => {
            eprintln!("reconnecting in {:?} (attempt {})", delay, attempt);
        }
        TransportEvent::ConnectionError { error } => eprintln!("error: {}", error),
        _ => {}
    });

    transport.connect(None).await.context("Failed to connect")?;
    eprintln!("listening, Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    transport.destroy();
    Ok(())
}

pub fn show_config(config: &WaypostConfig, sources: &ConfigSources) -> Result<()> {
    if sources.files.is_empty() {
        println!("# no config files found, showing defaults");
    }
    for file in &sources.files {
        println!("# loaded: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# env override: {}", var);
    }
    println!("{}", config.to_toml());
    Ok(())
}

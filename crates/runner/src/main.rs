use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rusty_interceptor_core::MessageCatalog;
use rusty_interceptor_proxy::{ConfigLoader, Interceptor, InterceptorConfig, StaticKeySource};

#[derive(Debug, Deserialize)]
struct RunnerConfig {
    #[serde(flatten)]
    interceptor: InterceptorConfig,
    /// Message catalog JSON exported by the offline analysis step.
    catalog: Option<String>,
    /// Hex key tables, one per line.
    key_material: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn read_companion(relative_path: &str) -> anyhow::Result<String> {
    let path = ConfigLoader::resolve_path(relative_path)?;
    std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::var("RUSTY_INTERCEPTOR_CONFIG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "interceptor.toml".to_string());
    let config: RunnerConfig = ConfigLoader::parse_from_file(&config_path)?;
    config.interceptor.validate()?;

    let mut interceptor = Interceptor::new(config.interceptor.clone());

    match &config.key_material {
        Some(path) => {
            let source = StaticKeySource::from_hex_lines(&read_companion(path)?)
                .with_context(|| format!("load key material {path}"))?;
            info!("runner.key_material tables={}", source.len());
            interceptor = interceptor.with_key_source(Arc::new(source));
        }
        None if config.interceptor.recover_key => {
            warn!("runner.key_material missing; client traffic will be relayed undeciphered");
        }
        None => {}
    }

    if let Some(path) = &config.catalog {
        let catalog = MessageCatalog::from_json_str(&read_companion(path)?)
            .with_context(|| format!("load catalog {path}"))?;
        interceptor.install_catalog(catalog);
    }

    interceptor.on_connected(|| {
        info!("runner.connected");
        Ok(())
    });
    interceptor.on_disconnected(|reason| {
        info!("runner.disconnected reason={reason}");
        Ok(())
    });
    interceptor.on_incoming(|packet| {
        info!("<- {packet}");
        Ok(())
    });
    interceptor.on_outgoing(|packet| {
        info!("-> {packet}");
        Ok(())
    });

    let addr = interceptor.start().await?;
    info!(
        "runner.ready listen={} upstream={}",
        addr,
        interceptor.config().upstream
    );

    tokio::select! {
        reason = interceptor.closed() => {
            info!("runner.exit reason={reason}");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("listen for ctrl-c")?;
            interceptor.stop();
            let reason = interceptor.closed().await;
            info!("runner.exit reason={reason}");
        }
    }
    Ok(())
}

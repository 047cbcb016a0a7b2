//! Grid Engine Binary
//!
//! Runs one grid engine against the in-memory paper venue and replays the
//! configured price path through it.
//!
//! ```bash
//! cargo run --bin grid_engine -- grid_engine.toml
//! ```
//!
//! Any setting can be overridden from the environment or a `.env` file, e.g.
//! `GRID__GRID__UPPER_BOUND=125`. `RUST_LOG` overrides `log.level`.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use grid_engine::config::Settings;
use grid_engine::grid::{Engine, PaperGateway};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dotenv = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let default_config = "grid_engine.toml".to_string();
    let config_path = args.get(1).unwrap_or(&default_config);
    if !std::path::Path::new(config_path).exists() {
        eprintln!("Config file '{}' not found. Please create one.", config_path);
        std::process::exit(1);
    }

    let settings = Settings::new(config_path)?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log.level.as_str()),
    )
    .init();

    match dotenv {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let gateway = Arc::new(PaperGateway::new(
        settings.initial_price(),
        settings.paper.available_margin,
    ));

    let engine = match Engine::start(
        Arc::clone(&gateway),
        settings.grid.clone(),
        settings.engine.clone(),
    )
    .await
    {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start grid engine: {}", e);
            return Err(e.into());
        }
    };

    let replay = tokio::spawn(replay_prices(
        Arc::clone(&gateway),
        settings.paper.price_path.clone(),
        Duration::from_millis(settings.paper.tick_ms),
    ));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        }
        _ = engine.wait_until_stopped() => {
            info!("Engine halted on its own");
        }
    }

    replay.abort();
    engine.stop().await?;

    let status = engine.status().await;
    let position = gateway.position().await;
    info!(
        "Final position {} @ {}, realized PnL {:.4}",
        position.size, position.entry_price, position.realized_pnl
    );
    println!("{}", status.to_json()?);

    Ok(())
}

async fn replay_prices(gateway: Arc<PaperGateway>, path: Vec<f64>, tick: Duration) {
    if path.is_empty() {
        info!("No price path configured, holding the initial price");
        return;
    }

    for price in path {
        tokio::time::sleep(tick).await;
        let fills = gateway.set_price(price).await;
        info!("Paper price -> {} ({} fills)", price, fills.len());
    }

    info!("Price path finished, press Ctrl-C to stop");
}

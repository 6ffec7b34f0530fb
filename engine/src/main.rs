use std::sync::Arc;

use async_trait::async_trait;

use broker::error::BrokerError;
use broker::terminal::{Terminal, TerminalApi};
use broker::types::{
    CloseOrder, Credentials, OpenOrder, Position, SymbolInfo, TickQuote,
};
use engine::{
    config::EngineConfig,
    engine::Engine,
    journal::store_sqlx::SqlxCopyLogStore,
    notify::Notifier,
};

/// Stand-in vendor terminal for running the engine without a real broker.
// TODO: Replace with the FFI adapter around the vendor terminal library.
struct StubTerminal;

impl TerminalApi for StubTerminal {
    fn login(&mut self, _creds: &Credentials) -> Result<(), BrokerError> {
        Ok(())
    }

    fn positions(&mut self) -> Result<Vec<Position>, BrokerError> {
        Ok(vec![])
    }

    fn pending_orders(&mut self) -> Result<u32, BrokerError> {
        Ok(0)
    }

    fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, BrokerError> {
        Ok(SymbolInfo {
            name: symbol.to_string(),
            volume_min: 0.01,
            digits: 5,
        })
    }

    fn tick(&mut self, _symbol: &str) -> Result<TickQuote, BrokerError> {
        Err(BrokerError::NoTick)
    }

    fn position(&mut self, _ticket: u64) -> Result<Option<Position>, BrokerError> {
        Ok(None)
    }

    fn market_open(&mut self, _order: &OpenOrder) -> Result<u64, BrokerError> {
        Err(BrokerError::NoTick)
    }

    fn market_close(&mut self, _order: &CloseOrder) -> Result<(), BrokerError> {
        Err(BrokerError::NotFound)
    }

    fn modify_sltp(&mut self, _ticket: u64, _sl: f64, _tp: f64) -> Result<(), BrokerError> {
        Err(BrokerError::NotFound)
    }

    fn shutdown(&mut self) {}
}

/// Notifier that renders user events into the process log; the production
/// deployment injects the WebSocket hub here.
struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_to_user(&self, user_id: &str, msg: serde_json::Value) -> anyhow::Result<()> {
        tracing::info!(user_id, message = %msg, "user notification");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    common::logger::init_tracing(is_production);

    tracing::info!("Starting copy engine...");

    let cfg = EngineConfig::from_env();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://copy_engine_dev.db".to_string());
    let store = SqlxCopyLogStore::connect(&database_url).await?;
    store.migrate().await?;

    let terminal = Terminal::spawn(Box::new(StubTerminal), cfg.op_deadline())?;

    let engine = Engine::new(cfg, terminal.clone(), Arc::new(LogNotifier), Arc::new(store))?;
    engine.start().await?;

    tracing::info!("Engine started; waiting for shutdown signal");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    engine.stop().await;
    terminal.shutdown().await;

    Ok(())
}

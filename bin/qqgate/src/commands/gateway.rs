use std::sync::Arc;

use async_trait::async_trait;
use qqgate_channel::AccountGateway;
use qqgate_core::{Account, Config, HostServices, InboundEvent, Paths, ReplySink, Result};
use qqgate_storage::SessionStore;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Built-in connectivity-check pipeline: echoes the inbound text back.
/// Real deployments embed `qqgate-channel` and provide their own
/// `HostServices` implementation instead of running this binary's default.
struct EchoHost;

#[async_trait]
impl HostServices for EchoHost {
    async fn dispatch_reply(
        &self,
        account: &Account,
        event: &InboundEvent,
        sink: Arc<dyn ReplySink>,
    ) -> Result<()> {
        info!(
            account = %account.id,
            sender = %event.sender_id,
            content = %event.content,
            "Echoing inbound message"
        );
        sink.deliver(format!("收到：{}", event.content), Vec::new())
            .await;
        Ok(())
    }

    async fn on_ready(&self, account: &Account) {
        info!(account = %account.id, "Account is ready");
    }
}

pub async fn run() -> Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;
    let config = Config::load(&paths)?;

    let enabled: Vec<Account> = config.enabled_accounts().cloned().collect();
    if enabled.is_empty() {
        warn!("No enabled accounts; add one to {} or set QQBOT_APP_ID / QQBOT_CLIENT_SECRET", paths.config_file().display());
        return Ok(());
    }

    let sessions = Arc::new(SessionStore::new(paths));
    let host: Arc<dyn HostServices> = Arc::new(EchoHost);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // One flusher coalesces session writes for every account.
    let flusher = {
        let sessions = sessions.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { sessions.run_flusher(shutdown).await })
    };

    let mut gateways = Vec::new();
    let mut handles = Vec::new();
    for account in enabled {
        let gateway = AccountGateway::new(account, host.clone(), sessions.clone());
        gateways.push(gateway.clone());
        handles.push(tokio::spawn(gateway.run()));
    }

    info!(accounts = gateways.len(), "Gateway running; Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(qqgate_core::Error::Io)?;
    info!("Shutting down");

    for gateway in &gateways {
        gateway.stop();
    }
    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }
    let _ = flusher.await;
    Ok(())
}

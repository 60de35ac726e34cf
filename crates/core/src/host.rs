use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Account;
use crate::error::Result;
use crate::message::InboundEvent;

/// Receives the reply pipeline's outputs for one inbound event. The gateway
/// hands an implementation of this to `HostServices::dispatch_reply`; calls
/// route into the outbound dispatcher.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Final reply: text plus any media the pipeline produced. Called once.
    async fn deliver(&self, text: String, media_urls: Vec<String>);

    /// Incremental progress. `text` is the accumulated reply so far; targets
    /// that cannot stream ignore these.
    async fn partial(&self, text: String);
}

/// The capabilities the embedding host provides to every account gateway.
/// The gateway never reaches into the host beyond this seam.
#[async_trait]
pub trait HostServices: Send + Sync {
    /// Run the reply pipeline for one inbound event, emitting output through
    /// `sink`. Must be cancel-safe: the caller applies a watchdog timeout.
    async fn dispatch_reply(
        &self,
        account: &Account,
        event: &InboundEvent,
        sink: Arc<dyn ReplySink>,
    ) -> Result<()>;

    /// Activity bookkeeping (known-user tracking lives host-side).
    fn record_activity(&self, _account_id: &str, _sender_id: &str) {}

    /// Invoked after a successful READY handshake.
    async fn on_ready(&self, _account: &Account) {}
}

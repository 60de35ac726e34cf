use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use qqgate_core::{Account, ChatKind, HostServices, InboundEvent, ReplySink};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::dispatch::OutboundDispatcher;
use crate::images::resolve_images;
use crate::stream::StreamSender;

/// Queue capacity; overflow drops the oldest entry.
const MAX_QUEUE: usize = 1000;
/// The pipeline gets this long to produce a first sign of life.
const PIPELINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Hand-off between the WebSocket receive loop and the worker that runs the
/// reply pipeline. `push` never blocks and never awaits — the receive loop
/// must get back to the socket immediately or heartbeats starve behind a
/// slow pipeline.
pub struct InboundQueue {
    inner: Mutex<VecDeque<InboundEvent>>,
    notify: Notify,
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. At capacity the oldest entry gives way.
    pub fn push(&self, event: InboundEvent) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.len() >= MAX_QUEUE {
                if let Some(dropped) = inner.pop_front() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        message_id = %dropped.message_id,
                        "Inbound queue full, dropping oldest event"
                    );
                }
            }
            inner.push_back(event);
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> InboundEvent {
        loop {
            if let Some(event) = self.inner.lock().unwrap().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn mark_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridges the reply pipeline's outputs to the dispatcher. Partials stream
/// on C2C targets; the final delivery sends images first and closes any open
/// stream with the cleaned text.
pub struct PipelineSink {
    dispatcher: Arc<OutboundDispatcher>,
    event: InboundEvent,
    fired: AtomicBool,
    stream: tokio::sync::Mutex<Option<Arc<StreamSender>>>,
}

impl PipelineSink {
    pub fn new(dispatcher: Arc<OutboundDispatcher>, event: InboundEvent) -> Self {
        Self {
            dispatcher,
            event,
            fired: AtomicBool::new(false),
            stream: tokio::sync::Mutex::new(None),
        }
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Relaxed)
    }

    async fn stream_for_event(&self) -> Option<Arc<StreamSender>> {
        if self.event.kind != ChatKind::C2c {
            return None;
        }
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let sender = Arc::new(self.dispatcher.stream_sender(&self.event));
            tokio::spawn(Arc::clone(&sender).run_keepalive());
            *guard = Some(sender);
        }
        guard.clone()
    }

    /// Close out any open stream; `final_text` empty just terminates it.
    async fn close_stream(&self, final_text: String) {
        if let Some(stream) = self.stream.lock().await.clone() {
            stream.end(final_text).await;
        }
    }

    /// Kill an open stream without an END chunk (timeout/error path).
    pub async fn abandon(&self) {
        if let Some(stream) = self.stream.lock().await.clone() {
            stream.abandon().await;
        }
    }
}

#[async_trait]
impl ReplySink for PipelineSink {
    async fn partial(&self, text: String) {
        self.fired.store(true, Ordering::Relaxed);
        if let Some(stream) = self.stream_for_event().await {
            stream.push_text(text).await;
        }
        // Non-C2C targets cannot stream; partials are progress-only there.
    }

    async fn deliver(&self, text: String, media_urls: Vec<String>) {
        self.fired.store(true, Ordering::Relaxed);

        let has_stream = self.stream.lock().await.is_some();
        if has_stream {
            // Media still goes over the rich-media path; the text closes the
            // stream instead of opening a second message.
            let resolved = resolve_images(&text, &media_urls);
            let intent = qqgate_core::OutboundIntent {
                target: self.event.reply_target(),
                text: None,
                media_sources: Vec::new(),
                reply_to: Some(self.event.message_id.clone()),
                account_id: self.dispatcher.account_id().to_string(),
            };
            for source in resolved.sources {
                let result = self.dispatcher.send_media(&intent, source).await;
                if let Some(e) = result.error {
                    warn!(error = %e, "Image send failed during streamed reply");
                }
            }
            self.close_stream(resolved.cleaned_text).await;
        } else {
            for result in self
                .dispatcher
                .deliver_reply(&self.event, &text, &media_urls)
                .await
            {
                if let Some(e) = result.error {
                    warn!(error = %e, "Reply delivery partially failed");
                }
            }
        }
    }
}

/// Drains the queue one event at a time, running the reply pipeline under a
/// watchdog. A pipeline that neither delivers nor streams within the window
/// gets its slot freed and the user a short notice.
pub async fn run_worker(
    queue: Arc<InboundQueue>,
    account: Account,
    host: Arc<dyn HostServices>,
    dispatcher: Arc<OutboundDispatcher>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    debug!(account = %account.id, "Inbound worker started");
    loop {
        let event = tokio::select! {
            event = queue.pop() => event,
            _ = shutdown.recv() => break,
        };

        host.record_activity(&account.id, &event.sender_id);

        // Friend chats show a typing indicator while the pipeline thinks.
        if event.kind == ChatKind::C2c {
            let notify = dispatcher
                .send_input_notify(&event.sender_id, &event.message_id, 10)
                .await;
            if let Some(e) = notify.error {
                debug!(error = %e, "Input notify failed");
            }
        }

        let sink = Arc::new(PipelineSink::new(dispatcher.clone(), event.clone()));
        let outcome = tokio::time::timeout(
            PIPELINE_TIMEOUT,
            host.dispatch_reply(&account, &event, sink.clone()),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                // A stream the pipeline opened but never closed still needs
                // its END chunk.
                sink.close_stream(String::new()).await;
            }
            Ok(Err(e)) => {
                error!(account = %account.id, error = %e, "Reply pipeline failed");
                sink.abandon().await;
                dispatcher.notify_failure(&event, &e).await;
            }
            Err(_) => {
                warn!(account = %account.id, message_id = %event.message_id, "Reply pipeline timed out");
                sink.abandon().await;
                if !sink.fired() {
                    dispatcher.notify_timeout(&event).await;
                }
            }
        }
        queue.mark_processed();
    }
    debug!(account = %account.id, "Inbound worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> InboundEvent {
        InboundEvent {
            kind: ChatKind::C2c,
            sender_id: "u1".to_string(),
            sender_name: None,
            content: "hi".to_string(),
            message_id: id.to_string(),
            timestamp_ms: 0,
            channel_id: None,
            guild_id: None,
            group_openid: None,
            attachments: vec![],
        }
    }

    #[test]
    fn test_push_pop_fifo() {
        let queue = InboundQueue::new();
        queue.push(event("a"));
        queue.push(event("b"));
        assert_eq!(queue.len(), 2);
        let first = queue.inner.lock().unwrap().pop_front().unwrap();
        assert_eq!(first.message_id, "a");
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = InboundQueue::new();
        for i in 0..MAX_QUEUE + 5 {
            queue.push(event(&format!("m{}", i)));
        }
        assert_eq!(queue.len(), MAX_QUEUE);
        assert_eq!(queue.dropped_count(), 5);
        // m0..m4 gone; head is m5, tail is the newest.
        let inner = queue.inner.lock().unwrap();
        assert_eq!(inner.front().unwrap().message_id, "m5");
        assert_eq!(
            inner.back().unwrap().message_id,
            format!("m{}", MAX_QUEUE + 4)
        );
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(InboundQueue::new());
        let q2 = queue.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(event("wake"));
        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message_id, "wake");
    }

    #[test]
    fn test_processed_counter() {
        let queue = InboundQueue::new();
        assert_eq!(queue.processed_count(), 0);
        queue.mark_processed();
        queue.mark_processed();
        assert_eq!(queue.processed_count(), 2);
    }
}

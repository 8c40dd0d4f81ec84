use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use crate::error::SignalingError;
use crate::message::{SignalKind, SignalMessage};

pub type MessageHandler = Arc<dyn Fn(&SignalMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
pub(crate) enum Outbound {
    Message(SignalMessage),
    Close,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    handlers: Vec<(SubscriptionId, MessageHandler)>,
}

/// Fan-out of inbound lobby messages. Shared between the channel and its
/// reader task so the reader never keeps the channel itself alive.
#[derive(Default)]
struct Dispatcher {
    subscribers: Mutex<Subscribers>,
    lost: AtomicBool,
}

impl Dispatcher {
    fn subscribe(&self, handler: MessageHandler) -> SubscriptionId {
        let mut guard = self.subscribers.lock();
        guard.next_id += 1;
        let id = SubscriptionId(guard.next_id);
        guard.handlers.push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .handlers
            .retain(|(existing, _)| *existing != id);
    }

    fn clear(&self) {
        self.subscribers.lock().handlers.clear();
    }

    fn dispatch(&self, message: &SignalMessage) {
        // Handlers may subscribe or unsubscribe while running.
        let handlers: Vec<MessageHandler> = self
            .subscribers
            .lock()
            .handlers
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(message);
        }
    }

    fn dispatch_text(&self, text: &str) {
        match SignalMessage::decode(text) {
            Ok(message) => {
                tracing::trace!(
                    target = "lobby",
                    event = "ws_in",
                    kind = ?message.kind(),
                    len = text.len()
                );
                self.dispatch(&message);
            }
            Err(err) => {
                tracing::debug!(target = "lobby", error = %err, "dropping undecodable lobby frame");
            }
        }
    }

    fn connection_lost(&self) {
        if !self.lost.swap(true, Ordering::SeqCst) {
            tracing::debug!(target = "lobby", "lobby connection lost");
            self.dispatch(&SignalMessage::LobbyConnectionLost);
        }
    }
}

/// Removes its handler when dropped or explicitly unsubscribed.
pub struct Subscription {
    id: SubscriptionId,
    dispatcher: Weak<Dispatcher>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Some(dispatcher) = self.dispatcher.upgrade() {
                dispatcher.unsubscribe(self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// A filtered subscription that buffers matches between waits.
pub struct SignalStream {
    kinds: Vec<SignalKind>,
    rx: mpsc::UnboundedReceiver<SignalMessage>,
    _subscription: Subscription,
}

impl SignalStream {
    /// Next message of a requested kind. An `error` frame fails the wait with
    /// [`SignalingError::Remote`]; connection loss fails it with
    /// [`SignalingError::Closed`] unless that notice was requested.
    pub async fn next(&mut self, timeout: Duration) -> Result<SignalMessage, SignalingError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Err(SignalingError::Timeout(timeout)),
            Ok(None) => Err(SignalingError::Closed),
            Ok(Some(SignalMessage::Error { reason })) => Err(SignalingError::Remote(reason)),
            Ok(Some(SignalMessage::LobbyConnectionLost))
                if !self.kinds.contains(&SignalKind::LobbyConnectionLost) =>
            {
                Err(SignalingError::Closed)
            }
            Ok(Some(message)) => Ok(message),
        }
    }
}

/// Persistent message-oriented connection to the rendezvous lobby.
pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    dispatcher: Arc<Dispatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingChannel {
    pub async fn connect(url: &Url, timeout: Duration) -> Result<Arc<Self>, SignalingError> {
        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| SignalingError::Connection(format!("timed out connecting to {url}")))?
            .map_err(|err| SignalingError::Connection(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "lobby", url = %url, "lobby websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let dispatcher = Arc::new(Dispatcher::default());

        let writer_dispatcher = Arc::clone(&dispatcher);
        let writer = tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Message(message) => {
                        let text = match message.encode() {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::warn!(target = "lobby", error = %err, "failed to encode lobby message");
                                continue;
                            }
                        };
                        tracing::trace!(
                            target = "lobby",
                            event = "ws_out",
                            kind = ?message.kind(),
                            len = text.len()
                        );
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            writer_dispatcher.connection_lost();
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        });

        let reader_dispatcher = Arc::clone(&dispatcher);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader_dispatcher.dispatch_text(&text),
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            reader_dispatcher.dispatch_text(&text);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "lobby", "lobby websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "lobby", "lobby websocket error: {err}");
                            }
                        }
                        break;
                    }
                }
            }
            reader_dispatcher.connection_lost();
        });

        Ok(Arc::new(Self {
            outbound,
            dispatcher,
            tasks: Mutex::new(vec![writer, reader]),
        }))
    }

    /// Channel with no websocket behind it; outbound messages land on the
    /// returned receiver and inbound ones are injected with `dispatch_local`.
    #[cfg(test)]
    pub(crate) fn detached() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            outbound,
            dispatcher: Arc::new(Dispatcher::default()),
            tasks: Mutex::new(Vec::new()),
        });
        (channel, rx)
    }

    pub fn is_open(&self) -> bool {
        !self.dispatcher.lost.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Fire-and-forget; dropped silently once the connection is gone.
    pub fn send(&self, message: SignalMessage) {
        if !self.is_open() {
            tracing::trace!(target = "lobby", kind = ?message.kind(), "lobby closed; dropping message");
            return;
        }
        let _ = self.outbound.send(Outbound::Message(message));
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SignalMessage) + Send + Sync + 'static,
    {
        let id = self.dispatcher.subscribe(Arc::new(handler));
        Subscription {
            id,
            dispatcher: Arc::downgrade(&self.dispatcher),
            active: AtomicBool::new(true),
        }
    }

    /// Drop every registered handler, including ones held by flows in
    /// progress; their waits then time out.
    pub fn clear_subscribers(&self) {
        self.dispatcher.clear();
    }

    /// Deliver a locally produced message to every subscriber.
    pub fn dispatch_local(&self, message: SignalMessage) {
        self.dispatcher.dispatch(&message);
    }

    pub fn stream(&self, kinds: &[SignalKind]) -> SignalStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.dispatcher.lost.load(Ordering::SeqCst) {
            let _ = tx.send(SignalMessage::LobbyConnectionLost);
        }
        let wanted = kinds.to_vec();
        let subscription = self.subscribe(move |message| {
            let kind = message.kind();
            if wanted.contains(&kind)
                || kind == SignalKind::Error
                || kind == SignalKind::LobbyConnectionLost
            {
                let _ = tx.send(message.clone());
            }
        });
        SignalStream {
            kinds: kinds.to_vec(),
            rx,
            _subscription: subscription,
        }
    }

    /// Resolve with the first inbound message whose kind is in `kinds`.
    pub async fn await_one(
        &self,
        kinds: &[SignalKind],
        timeout: Duration,
    ) -> Result<SignalMessage, SignalingError> {
        let mut stream = self.stream(kinds);
        stream.next(timeout).await
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
        let mut tasks = self.tasks.lock();
        // The writer gets to flush the close frame; the reader can go now.
        if tasks.len() > 1 {
            for handle in tasks.drain(1..) {
                handle.abort();
            }
        }
        self.dispatcher.lost.store(true, Ordering::SeqCst);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

//! Client side of the link between a UI context and the background process.
//!
//! A [`ConnectionChannel`] survives transport drops: sends made while the link
//! is down are queued in order and flushed ahead of any later send once a new
//! link is up. Losing the host itself, or running out of connect attempts,
//! kills the channel for good.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::Message;
use crate::{Error, Result};

pub mod memory;
pub mod unix;

/// One established transport. The inbound side closing (`None`) is a
/// transient drop; a [`Message::HostShutdown`] means the host is gone.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Message>,
    pub inbound: mpsc::UnboundedReceiver<Message>,
}

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<Link>> + Send + 'a>>;

pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> ConnectFuture<'_>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    Message(Message),
    /// The link dropped; a reconnect follows unless disabled.
    TransientDrop,
    /// The host announced shutdown. Terminal, reported once.
    HostGone,
    /// Connect attempts ran out. Terminal, reported once.
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Connect attempts per `connect()` call, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt.
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub auto_reconnect: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            auto_reconnect: true,
        }
    }
}

impl ChannelOptions {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

type Listener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

struct Shared {
    state: ChannelState,
    link: Option<mpsc::UnboundedSender<Message>>,
    link_cancel: CancellationToken,
    generation: u64,
    queue: VecDeque<Message>,
    dead: bool,
}

struct Inner {
    connector: Arc<dyn Connector>,
    options: ChannelOptions,
    shared: Mutex<Shared>,
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_listener: Mutex<u64>,
    connect_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct ConnectionChannel {
    inner: Arc<Inner>,
}

impl ConnectionChannel {
    pub fn new(connector: Arc<dyn Connector>, options: ChannelOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                options,
                shared: Mutex::new(Shared {
                    state: ChannelState::Disconnected,
                    link: None,
                    link_cancel: CancellationToken::new(),
                    generation: 0,
                    queue: VecDeque::new(),
                    dead: false,
                }),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener: Mutex::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    pub fn is_dead(&self) -> bool {
        self.lock().dead
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Establishes the link, retrying with doubling delays. Once the attempts
    /// run out the channel is dead and listeners get
    /// [`ChannelEvent::RetriesExhausted`].
    pub async fn connect(&self) -> Result<()> {
        let _serial = self.inner.connect_lock.lock().await;
        {
            let sh = self.lock();
            if sh.dead {
                return Err(Error::TransportDead);
            }
            if sh.link.is_some() {
                return Ok(());
            }
        }
        self.set_state(ChannelState::Connecting);

        let connector = self.inner.connector.clone();
        let mut attempts = 0u32;
        let result = (|| {
            attempts += 1;
            connector.connect()
        })
        .retry(self.inner.options.backoff())
        .sleep(tokio::time::sleep)
        .notify(|err: &Error, delay: Duration| {
            warn!(
                event = "channel.connect_failed",
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "channel.connect_failed"
            );
        })
        .await;

        match result {
            Ok(link) => {
                self.install(link);
                info!(event = "channel.connected", attempts, "channel.connected");
                Ok(())
            }
            Err(err) => {
                warn!(
                    event = "channel.retries_exhausted",
                    attempts,
                    error = %err,
                    "channel.retries_exhausted"
                );
                if self.kill() {
                    self.emit(&ChannelEvent::RetriesExhausted { attempts });
                }
                Err(Error::TransportDead)
            }
        }
    }

    /// Transmits immediately when connected, otherwise queues. Fails only
    /// once the channel is dead.
    pub fn send(&self, message: Message) -> Result<Delivery> {
        let mut sh = self.lock();
        if sh.dead {
            return Err(Error::TransportDead);
        }
        if let Some(tx) = &sh.link {
            match tx.send(message) {
                Ok(()) => return Ok(Delivery::Sent),
                Err(mpsc::error::SendError(message)) => {
                    // Writer side gone; the reader will report the drop.
                    sh.link = None;
                    sh.queue.push_back(message);
                    return Ok(Delivery::Queued);
                }
            }
        }
        debug!(
            event = "channel.queued",
            kind = message.kind(),
            queued = sh.queue.len() as u64 + 1,
            "channel.queued"
        );
        sh.queue.push_back(message);
        Ok(Delivery::Queued)
    }

    /// Drops the current link without reconnecting. Queued messages are
    /// kept for a later `connect()`.
    pub fn disconnect(&self) {
        let changed = {
            let mut sh = self.lock();
            sh.generation += 1;
            sh.link_cancel.cancel();
            sh.link = None;
            sh.state != ChannelState::Disconnected
        };
        if changed {
            self.set_state(ChannelState::Disconnected);
        }
    }

    /// Registers `f` for every channel event. The listener stays registered
    /// until the returned handle is dropped or unsubscribed.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn on_event(&self, f: impl Fn(&ChannelEvent) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut next = self
                .inner
                .next_listener
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(f));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Event stream backed by a listener; events are buffered unboundedly.
    pub fn events(&self) -> (Subscription, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.on_event(move |ev| {
            let _ = tx.send(ev.clone());
        });
        (sub, rx)
    }

    fn install(&self, link: Link) {
        let Link { outbound, inbound } = link;
        let (generation, cancel) = {
            let mut sh = self.lock();
            let mut flushed = 0u64;
            while let Some(message) = sh.queue.pop_front() {
                if let Err(mpsc::error::SendError(message)) = outbound.send(message) {
                    sh.queue.push_front(message);
                    break;
                }
                flushed += 1;
            }
            if flushed > 0 {
                debug!(event = "channel.flushed", flushed, "channel.flushed");
            }
            sh.generation += 1;
            sh.link_cancel = CancellationToken::new();
            sh.link = Some(outbound);
            (sh.generation, sh.link_cancel.clone())
        };
        self.set_state(ChannelState::Connected);
        tokio::spawn(read_link(self.clone(), generation, cancel, inbound));
    }

    fn on_link_closed(&self, generation: u64) {
        {
            let mut sh = self.lock();
            if sh.generation != generation || sh.dead {
                return;
            }
            sh.link = None;
        }
        info!(event = "channel.dropped", "channel.dropped");
        self.set_state(ChannelState::Disconnected);
        self.emit(&ChannelEvent::TransientDrop);

        if self.inner.options.auto_reconnect {
            tokio::spawn(self.clone().reconnect());
        }
    }

    fn on_host_gone(&self, generation: u64) {
        if self.lock().generation != generation {
            return;
        }
        if self.kill() {
            info!(event = "channel.host_gone", "channel.host_gone");
            self.emit(&ChannelEvent::HostGone);
        }
    }

    fn reconnect(self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let _ = self.connect().await;
        })
    }

    /// Marks the channel dead. Returns false if it already was.
    fn kill(&self) -> bool {
        let dropped = {
            let mut sh = self.lock();
            if sh.dead {
                return false;
            }
            sh.dead = true;
            sh.generation += 1;
            sh.link_cancel.cancel();
            sh.link = None;
            std::mem::take(&mut sh.queue).len()
        };
        if dropped > 0 {
            warn!(event = "channel.queue_dropped", dropped, "channel.queue_dropped");
        }
        self.set_state(ChannelState::Disconnected);
        true
    }

    fn set_state(&self, state: ChannelState) {
        {
            let mut sh = self.lock();
            if sh.state == state {
                return;
            }
            sh.state = state;
        }
        self.emit(&ChannelEvent::StateChanged(state));
    }

    fn emit(&self, event: &ChannelEvent) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn read_link(
    channel: ConnectionChannel,
    generation: u64,
    cancel: CancellationToken,
    mut inbound: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            m = inbound.recv() => m,
        };
        match message {
            Some(Message::HostShutdown) => {
                channel.on_host_gone(generation);
                return;
            }
            Some(message) => channel.emit(&ChannelEvent::Message(message)),
            None => {
                channel.on_link_closed(generation);
                return;
            }
        }
    }
}

/// Unregisters its listener on drop.
pub struct Subscription {
    inner: Weak<Inner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::memory::memory_transport;
    use super::*;
    use crate::protocol::LogLevel;

    fn log(n: u32) -> Message {
        Message::DebugLog {
            level: LogLevel::Info,
            message: format!("m{n}"),
        }
    }

    fn opts() -> ChannelOptions {
        ChannelOptions {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            auto_reconnect: true,
        }
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Message {
        loop {
            match rx.recv().await {
                Some(ChannelEvent::Message(m)) => return m,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_messages_flush_before_later_sends() {
        let (connector, mut host) = memory_transport();
        let channel = ConnectionChannel::new(Arc::new(connector), opts());

        assert_eq!(channel.send(log(1)).unwrap(), Delivery::Queued);
        assert_eq!(channel.send(log(2)).unwrap(), Delivery::Queued);
        assert_eq!(channel.queued(), 2);

        channel.connect().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(channel.send(log(3)).unwrap(), Delivery::Sent);

        let mut server = host.accept().await.unwrap();
        for n in 1..=3 {
            assert_eq!(server.inbound.recv().await.unwrap(), log(n));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_backs_off_with_doubling_delays() {
        let (connector, _host) = memory_transport();
        connector.fail_next(2);
        let channel = ConnectionChannel::new(Arc::new(connector.clone()), opts());

        let start = Instant::now();
        channel.connect().await.unwrap();
        assert_eq!(connector.attempts(), 3);
        // 100ms then 200ms
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_kill_the_channel_once() {
        let (connector, _host) = memory_transport();
        connector.fail_next(100);
        let channel = ConnectionChannel::new(Arc::new(connector.clone()), opts());
        let (_sub, mut events) = channel.events();

        assert!(matches!(channel.connect().await, Err(Error::TransportDead)));
        assert_eq!(connector.attempts(), 4);
        assert!(channel.is_dead());
        assert!(matches!(channel.send(log(1)), Err(Error::TransportDead)));
        assert!(matches!(channel.connect().await, Err(Error::TransportDead)));

        let mut exhausted = 0;
        while let Ok(ev) = events.try_recv() {
            if let ChannelEvent::RetriesExhausted { attempts } = ev {
                assert_eq!(attempts, 4);
                exhausted += 1;
            }
        }
        assert_eq!(exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_drop_reconnects_and_keeps_order() {
        let (connector, mut host) = memory_transport();
        let channel = ConnectionChannel::new(Arc::new(connector.clone()), opts());
        let (_sub, mut events) = channel.events();

        channel.connect().await.unwrap();
        let first = host.accept().await.unwrap();
        drop(first);

        loop {
            match events.recv().await.unwrap() {
                ChannelEvent::TransientDrop => break,
                ChannelEvent::HostGone => panic!("drop is not host loss"),
                _ => {}
            }
        }
        channel.send(log(7)).unwrap();

        let mut second = host.accept().await.unwrap();
        assert_eq!(second.inbound.recv().await.unwrap(), log(7));
        assert_eq!(connector.attempts(), 2);
        assert!(!channel.is_dead());

        second.outbound.send(log(8)).unwrap();
        assert_eq!(next_message(&mut events).await, log(8));
    }

    #[tokio::test(start_paused = true)]
    async fn host_shutdown_is_terminal_and_distinct() {
        let (connector, mut host) = memory_transport();
        let channel = ConnectionChannel::new(Arc::new(connector.clone()), opts());
        let (_sub, mut events) = channel.events();

        channel.connect().await.unwrap();
        let server = host.accept().await.unwrap();
        server.outbound.send(Message::HostShutdown).unwrap();
        drop(server);

        let mut seen = Vec::new();
        loop {
            let ev = events.recv().await.unwrap();
            let gone = ev == ChannelEvent::HostGone;
            seen.push(ev);
            if gone {
                break;
            }
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
        while let Ok(ev) = events.try_recv() {
            seen.push(ev);
        }

        assert!(channel.is_dead());
        assert!(!seen.contains(&ChannelEvent::TransientDrop));
        assert_eq!(seen.iter().filter(|e| **e == ChannelEvent::HostGone).count(), 1);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let (connector, _host) = memory_transport();
        let channel = ConnectionChannel::new(Arc::new(connector), opts());
        let hits = Arc::new(Mutex::new(0u32));

        let sub = {
            let hits = hits.clone();
            channel.on_event(move |_| *hits.lock().unwrap() += 1)
        };
        channel.connect().await.unwrap();
        let before = *hits.lock().unwrap();
        assert!(before >= 1);

        sub.unsubscribe();
        channel.disconnect();
        assert_eq!(*hits.lock().unwrap(), before);
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }
}

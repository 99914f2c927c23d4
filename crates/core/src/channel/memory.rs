use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;

use super::{ConnectFuture, Connector, Link};
use crate::Error;

/// In-process transport. Every successful connect hands the host side of
/// the new link to the paired [`MemoryHost`].
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<Link>,
    fail_next: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

pub struct MemoryHost {
    accept_rx: mpsc::UnboundedReceiver<Link>,
}

pub fn memory_transport() -> (MemoryConnector, MemoryHost) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            accept_tx,
            fail_next: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(AtomicU32::new(0)),
        },
        MemoryHost { accept_rx },
    )
}

/// Two cross-wired links: what one side sends the other receives.
pub fn link_pair() -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Link {
            outbound: a_tx,
            inbound: a_rx,
        },
        Link {
            outbound: b_tx,
            inbound: b_rx,
        },
    )
}

impl MemoryConnector {
    /// Makes the next `n` connect attempts fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::TransportDisconnected);
            }

            let (client, host) = link_pair();
            self.accept_tx
                .send(host)
                .map_err(|_| Error::TransportDisconnected)?;
            Ok(client)
        })
    }
}

impl MemoryHost {
    /// Host side of the next accepted link; `None` once every connector is gone.
    pub async fn accept(&mut self) -> Option<Link> {
        self.accept_rx.recv().await
    }
}

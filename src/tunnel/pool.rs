//! Bounded FIFO of idle tunnel links

use super::TunnelError;
use futures_util::FutureExt;
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

/// A link the pool can hold
pub trait TunnelLink: Send + 'static {
    /// True once the remote end has gone away.
    ///
    /// Must not block; a link whose state is unknown counts as open.
    fn is_closed(&self) -> bool;
}

impl TunnelLink for TcpStream {
    fn is_closed(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.peek(&mut probe).now_or_never() {
            // Nothing to read yet: idle and open
            None => false,
            Some(Ok(0)) => true,
            Some(Ok(_)) => false,
            Some(Err(_)) => true,
        }
    }
}

/// Bounded pool of idle links, handed out oldest first.
///
/// Closed links are pruned lazily whenever the pool is touched. The lock is
/// held only for the list mutation.
pub struct TunnelPool<L = TcpStream> {
    links: Mutex<VecDeque<L>>,
    capacity: usize,
}

impl<L: TunnelLink> TunnelPool<L> {
    pub fn new(capacity: usize) -> Self {
        Self {
            links: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a link, returning the new pool size.
    ///
    /// A full pool rejects the link and closes it; the pool is left untouched.
    pub async fn insert(&self, link: L) -> Result<usize, TunnelError> {
        let rejected = {
            let mut links = self.links.lock().await;
            prune(&mut links);
            if links.len() < self.capacity {
                links.push_back(link);
                return Ok(links.len());
            }
            link
        };
        drop(rejected);
        Err(TunnelError::PoolFull {
            capacity: self.capacity,
        })
    }

    /// Take the oldest link that is still open
    pub async fn pop(&self) -> Result<L, TunnelError> {
        let mut links = self.links.lock().await;
        while let Some(link) = links.pop_front() {
            if link.is_closed() {
                trace!("Discarding closed tunnel link");
                continue;
            }
            return Ok(link);
        }
        Err(TunnelError::TunnelUnavailable)
    }

    /// Number of open links
    pub async fn len(&self) -> usize {
        let mut links = self.links.lock().await;
        prune(&mut links);
        links.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn prune<L: TunnelLink>(links: &mut VecDeque<L>) {
    let before = links.len();
    links.retain(|link| !link.is_closed());
    if links.len() != before {
        trace!("Pruned {} closed tunnel links", before - links.len());
    }
}

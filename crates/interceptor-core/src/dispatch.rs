//! Ordered predicate -> handler bindings for one traffic direction.
//!
//! Entries are tried in registration order and only the **first** whose
//! predicate accepts a packet runs. One-shot entries (including
//! [`DispatchRegistry::wait_for`] waiters) are removed under the write lock
//! before their handler runs, so they fire at most once even when several
//! tasks dispatch concurrently. Attach and detach may race with dispatch.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::FutureExt;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::packet::Packet;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Observes or rewrites a packet before it is relayed. Setting
/// [`Packet::block`] suppresses forwarding.
pub trait PacketHandler: Send + Sync {
    fn handle<'a>(&'a self, packet: &'a mut Packet) -> HandlerFuture<'a>;
}

impl<F> PacketHandler for F
where
    F: Fn(&mut Packet) -> anyhow::Result<()> + Send + Sync,
{
    fn handle<'a>(&'a self, packet: &'a mut Packet) -> HandlerFuture<'a> {
        Box::pin(std::future::ready(self(packet)))
    }
}

type Predicate = Arc<dyn Fn(&Packet) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum PacketMatcher {
    Header(u16),
    /// Catalog identity hash; only tagged packets can match.
    Hash(Arc<str>),
    Predicate(Predicate),
}

impl PacketMatcher {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Packet) -> bool + Send + Sync + 'static,
    {
        PacketMatcher::Predicate(Arc::new(f))
    }

    pub fn hash(hash: impl Into<Arc<str>>) -> Self {
        PacketMatcher::Hash(hash.into())
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        match self {
            PacketMatcher::Header(header) => packet.header() == *header,
            PacketMatcher::Hash(hash) => packet.identity_hash() == Some(&**hash),
            PacketMatcher::Predicate(predicate) => {
                std::panic::catch_unwind(AssertUnwindSafe(|| (**predicate)(packet))).unwrap_or(false)
            }
        }
    }
}

impl From<u16> for PacketMatcher {
    fn from(header: u16) -> Self {
        PacketMatcher::Header(header)
    }
}

impl fmt::Debug for PacketMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketMatcher::Header(header) => write!(f, "Header({header})"),
            PacketMatcher::Hash(hash) => write!(f, "Hash({hash})"),
            PacketMatcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Unmatched,
    Handled(HandlerId),
    /// The handler returned an error or panicked; the packet is still forwarded
    /// unless it was blocked before the failure.
    Failed(HandlerId),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("wait cancelled before a matching packet arrived")]
    Cancelled,
}

enum Action {
    Handler(Arc<dyn PacketHandler>),
    Waiter(oneshot::Sender<Packet>),
}

struct Entry {
    id: HandlerId,
    matcher: PacketMatcher,
    once: bool,
    action: Action,
}

struct Inner {
    lane: &'static str,
    next_id: AtomicU64,
    entries: RwLock<Vec<Entry>>,
}

/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct DispatchRegistry {
    inner: Arc<Inner>,
}

impl DispatchRegistry {
    pub fn new(lane: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                lane,
                next_id: AtomicU64::new(1),
                entries: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn lane(&self) -> &'static str {
        self.inner.lane
    }

    pub fn attach<P, F>(&self, predicate: P, handler: F) -> HandlerId
    where
        P: Fn(&Packet) -> bool + Send + Sync + 'static,
        F: Fn(&mut Packet) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.attach_matching(PacketMatcher::predicate(predicate), handler)
    }

    /// [`DispatchRegistry::attach`] for handlers that need to await.
    pub fn attach_handler<P, H>(&self, predicate: P, handler: H) -> HandlerId
    where
        P: Fn(&Packet) -> bool + Send + Sync + 'static,
        H: PacketHandler + 'static,
    {
        self.attach_matching(PacketMatcher::predicate(predicate), handler)
    }

    pub fn attach_matching<H>(&self, matcher: PacketMatcher, handler: H) -> HandlerId
    where
        H: PacketHandler + 'static,
    {
        self.push(matcher, false, Action::Handler(Arc::new(handler)))
    }

    /// Like [`DispatchRegistry::attach_matching`], but the entry detaches itself
    /// on its first match.
    pub fn attach_once<H>(&self, matcher: PacketMatcher, handler: H) -> HandlerId
    where
        H: PacketHandler + 'static,
    {
        self.push(matcher, true, Action::Handler(Arc::new(handler)))
    }

    pub fn detach(&self, id: HandlerId) -> bool {
        let mut entries = self.inner.entries.write();
        let Some(index) = entries.iter().position(|entry| entry.id == id) else {
            return false;
        };
        entries.remove(index);
        if entries.is_empty() {
            debug!("interceptor.dispatch.hook_removed lane={}", self.inner.lane);
        }
        true
    }

    /// True while at least one entry is registered; relay lanes skip dispatch otherwise.
    pub fn is_hooked(&self) -> bool {
        !self.inner.entries.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves with a copy of the next packet `matcher` accepts. Dropping the
    /// future detaches the waiter.
    pub fn wait_for(&self, matcher: impl Into<PacketMatcher>) -> WaitFor {
        let (tx, rx) = oneshot::channel();
        let id = self.push(matcher.into(), true, Action::Waiter(tx));
        WaitFor {
            id,
            registry: self.clone(),
            rx,
            done: false,
        }
    }

    /// Resolves every pending [`WaitFor`] with [`WaitError::Cancelled`].
    pub fn cancel_waiters(&self) -> usize {
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|entry| !matches!(entry.action, Action::Waiter(_)));
        before - entries.len()
    }

    pub async fn dispatch(&self, packet: &mut Packet) -> DispatchOutcome {
        let Some((id, action)) = self.select(packet) else {
            return DispatchOutcome::Unmatched;
        };

        let handler = match action {
            Action::Handler(handler) => handler,
            Action::Waiter(tx) => {
                // The waiter may have been dropped between selection and now.
                let _ = tx.send(packet.clone());
                return DispatchOutcome::Handled(id);
            }
        };

        let result = AssertUnwindSafe(async { handler.handle(packet).await })
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => DispatchOutcome::Handled(id),
            Ok(Err(err)) => {
                warn!(
                    "interceptor.dispatch.handler_error lane={} id={} header={} error={:#}",
                    self.inner.lane,
                    id,
                    packet.header(),
                    err
                );
                DispatchOutcome::Failed(id)
            }
            Err(_) => {
                warn!(
                    "interceptor.dispatch.handler_panic lane={} id={} header={}",
                    self.inner.lane,
                    id,
                    packet.header()
                );
                DispatchOutcome::Failed(id)
            }
        }
    }

    fn push(&self, matcher: PacketMatcher, once: bool, action: Action) -> HandlerId {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.inner.entries.write();
        if entries.is_empty() {
            debug!("interceptor.dispatch.hook_installed lane={}", self.inner.lane);
        }
        entries.push(Entry {
            id,
            matcher,
            once,
            action,
        });
        id
    }

    /// First matching entry; one-shot entries are taken out of the list.
    /// Predicates see a snapshot and run without the lock held, so they may
    /// attach or detach on this registry.
    fn select(&self, packet: &Packet) -> Option<(HandlerId, Action)> {
        let snapshot: Vec<(HandlerId, PacketMatcher)> = self
            .inner
            .entries
            .read()
            .iter()
            .map(|entry| (entry.id, entry.matcher.clone()))
            .collect();

        snapshot
            .into_iter()
            .filter(|(_, matcher)| matcher.matches(packet))
            .find_map(|(id, _)| self.claim(id))
    }

    /// None when the entry was detached, or a one-shot entry was claimed by
    /// another dispatch, after the snapshot was taken.
    fn claim(&self, id: HandlerId) -> Option<(HandlerId, Action)> {
        let entries = self.inner.entries.upgradable_read();
        let index = entries.iter().position(|entry| entry.id == id)?;

        if !entries[index].once {
            return match &entries[index].action {
                Action::Handler(handler) => Some((id, Action::Handler(handler.clone()))),
                Action::Waiter(_) => None,
            };
        }

        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        let entry = entries.remove(index);
        if entries.is_empty() {
            debug!("interceptor.dispatch.hook_removed lane={}", self.inner.lane);
        }
        Some((entry.id, entry.action))
    }
}

impl fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("lane", &self.inner.lane)
            .field("entries", &self.len())
            .finish()
    }
}

/// Pending [`DispatchRegistry::wait_for`].
pub struct WaitFor {
    id: HandlerId,
    registry: DispatchRegistry,
    rx: oneshot::Receiver<Packet>,
    done: bool,
}

impl WaitFor {
    pub fn id(&self) -> HandlerId {
        self.id
    }
}

impl Future for WaitFor {
    type Output = Result<Packet, WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(result.map_err(|_| WaitError::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for WaitFor {
    fn drop(&mut self) {
        if !self.done {
            self.registry.detach(self.id);
        }
    }
}

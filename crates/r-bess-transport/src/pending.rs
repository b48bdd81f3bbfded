//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "UDP device transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Registry of requests waiting for a reply, keyed by message id.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use r_bess_proto::{ParseError, Response};
use tokio::sync::{mpsc, oneshot};

use crate::{Result, TransportError};

/// One inbound datagram routed to a waiter.
#[derive(Debug)]
pub struct Delivery {
    /// Sender of the datagram.
    pub from: SocketAddr,
    /// Parsed envelope, or the parse failure for a datagram that carried our id.
    pub payload: std::result::Result<Response, ParseError>,
}

enum Waiter {
    /// Directed request: first matching datagram resolves it.
    Single(oneshot::Sender<Delivery>),
    /// Broadcast: every matching datagram is forwarded until the guard drops.
    Collect(mpsc::UnboundedSender<Delivery>),
}

struct Entry {
    token: u64,
    waiter: Waiter,
}

#[derive(Default)]
pub(crate) struct PendingRegistry {
    entries: Mutex<HashMap<u32, Entry>>,
    tokens: AtomicU64,
}

impl PendingRegistry {
    pub(crate) fn register_single(
        self: &Arc<Self>,
        id: u32,
    ) -> Result<(PendingGuard, oneshot::Receiver<Delivery>)> {
        let (tx, rx) = oneshot::channel();
        let guard = self.insert(id, Waiter::Single(tx))?;
        Ok((guard, rx))
    }

    pub(crate) fn register_collect(
        self: &Arc<Self>,
        id: u32,
    ) -> Result<(PendingGuard, mpsc::UnboundedReceiver<Delivery>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = self.insert(id, Waiter::Collect(tx))?;
        Ok((guard, rx))
    }

    fn insert(self: &Arc<Self>, id: u32, waiter: Waiter) -> Result<PendingGuard> {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(TransportError::DuplicateId(id));
        }
        entries.insert(id, Entry { token, waiter });
        Ok(PendingGuard {
            registry: Arc::clone(self),
            id,
            token,
        })
    }

    /// Route a delivery; returns `false` when nobody is waiting for `id`.
    pub(crate) fn dispatch(&self, id: u32, delivery: Delivery) -> bool {
        let mut entries = self.entries.lock();
        if let Some(Entry {
            waiter: Waiter::Collect(tx),
            ..
        }) = entries.get(&id)
        {
            return tx.send(delivery).is_ok();
        }
        match entries.remove(&id) {
            Some(Entry {
                waiter: Waiter::Single(tx),
                ..
            }) => tx.send(delivery).is_ok(),
            _ => false,
        }
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    fn release(&self, id: u32, token: u64) {
        let mut entries = self.entries.lock();
        if entries.get(&id).is_some_and(|entry| entry.token == token) {
            entries.remove(&id);
        }
    }
}

/// Removes its registry entry on drop, whether the request resolved, timed out, or was abandoned.
pub(crate) struct PendingGuard {
    registry: Arc<PendingRegistry>,
    id: u32,
    token: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.registry.release(self.id, self.token);
    }
}

//! Matching policies
//!
//! Under [`MatchingPolicy::Addressed`] every frame names its destination and
//! the matcher keeps no state. Under [`MatchingPolicy::Pairing`] connected
//! identities wait in a FIFO pool and are paired two at a time; frames then
//! go to the sender's peer.

use crate::identity::Identity;
use crate::protocol::{ControlFrame, FrameHeader};
use crate::registry::ClientRegistry;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How frames find their destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MatchingPolicy {
    /// Each frame carries its destination in `to`
    #[default]
    Addressed,
    /// The server pairs waiting clients and routes to the peer
    Pairing,
}

/// Why a frame could not be given a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unroutable {
    /// Addressed frame without `to`
    MissingDestination,
    /// Pairing policy, but the sender has no peer yet
    NotPaired,
    /// `to` is not the sender's assigned peer
    PeerMismatch,
}

#[derive(Debug)]
struct Waiting {
    identity: Identity,
    since: Instant,
}

/// Decides which identity a frame is for, and runs the pairing pool
#[derive(Debug)]
pub struct Matcher {
    policy: MatchingPolicy,
    enforce_peer: bool,
    pool: Mutex<VecDeque<Waiting>>,
}

impl Matcher {
    /// `enforce_peer` only matters for addressed routing: when set, a sender
    /// that has a peer may only address that peer.
    pub fn new(policy: MatchingPolicy, enforce_peer: bool) -> Self {
        Self {
            policy,
            enforce_peer,
            pool: Mutex::new(VecDeque::new()),
        }
    }

    pub fn policy(&self) -> MatchingPolicy {
        self.policy
    }

    fn pool(&self) -> MutexGuard<'_, VecDeque<Waiting>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of identities waiting for a partner
    pub fn waiting(&self) -> usize {
        self.pool().len()
    }

    /// Handle a freshly attached connection.
    ///
    /// Under pairing, enqueues the identity unless it is already waiting or
    /// already paired, then pairs the pool front-to-back. The first member of
    /// every new pair is told to send the offer. Returns the pairs formed.
    pub fn on_connected(&self, registry: &ClientRegistry, identity: Identity) -> Vec<(Identity, Identity)> {
        if self.policy != MatchingPolicy::Pairing {
            return Vec::new();
        }

        let mut pool = self.pool();
        let queued = pool.iter().any(|w| w.identity == identity);
        if !queued && registry.peer_of(identity).is_none() {
            pool.push_back(Waiting {
                identity,
                since: Instant::now(),
            });
        }

        let mut pairs = Vec::new();
        while pool.len() >= 2 {
            let (Some(first), Some(second)) = (pool.pop_front(), pool.pop_front()) else {
                break;
            };
            // a waiter whose connection went away in the meantime loses its spot
            if !registry.is_connected(first.identity) {
                pool.push_front(second);
                continue;
            }
            if !registry.is_connected(second.identity) {
                pool.push_front(first);
                continue;
            }
            if !registry.set_peer(first.identity, second.identity) {
                continue;
            }

            tracing::info!(first = %first.identity, second = %second.identity, "paired clients");
            if let Err(e) = registry.deliver(first.identity, &ControlFrame::SendOffer.to_string()) {
                tracing::warn!(identity = %first.identity, error = %e, "could not request offer");
            }
            pairs.push((first.identity, second.identity));
        }
        pairs
    }

    /// Forget a waiting identity whose connection closed.
    ///
    /// Keeps the entry if a newer connection was attached before the pool
    /// lock was taken. Returns whether it was removed.
    pub fn on_disconnected(&self, registry: &ClientRegistry, identity: Identity) -> bool {
        let mut pool = self.pool();
        if registry.is_connected(identity) {
            return false;
        }
        let before = pool.len();
        pool.retain(|w| w.identity != identity);
        pool.len() != before
    }

    /// Remove identities that have waited at least `timeout` as of `now` and
    /// tell them so. Returns the expired identities.
    pub fn expire_waiting(&self, registry: &ClientRegistry, timeout: Duration, now: Instant) -> Vec<Identity> {
        let mut expired = Vec::new();
        self.pool().retain(|w| {
            let keep = now.saturating_duration_since(w.since) < timeout;
            if !keep {
                expired.push(w.identity);
            }
            keep
        });

        for identity in &expired {
            let _ = registry.deliver(*identity, &ControlFrame::PairingTimeout.to_string());
        }
        expired
    }

    /// Pick the destination of a frame sent by `sender`
    pub fn destination(
        &self,
        registry: &ClientRegistry,
        sender: Identity,
        header: &FrameHeader,
    ) -> Result<Identity, Unroutable> {
        match self.policy {
            MatchingPolicy::Pairing => registry.peer_of(sender).ok_or(Unroutable::NotPaired),
            MatchingPolicy::Addressed => {
                let to = header.to.ok_or(Unroutable::MissingDestination)?;
                if self.enforce_peer {
                    if let Some(peer) = registry.peer_of(sender) {
                        if peer != to {
                            return Err(Unroutable::PeerMismatch);
                        }
                    }
                }
                Ok(to)
            }
        }
    }
}

//! Arbitration of a bounded resource pool among competing branches.
//!
//! Every grant, release and arbitration round happens inside one critical
//! section, so the amount granted per category never exceeds the pool's
//! capacity. Bids are served first-come-first-served: a bid that does not fit
//! blocks later bids for the same categories until it is granted, which keeps
//! large requests from starving behind a stream of small ones.

use crate::pool::ResourcePool;
use crate::requestor::ResourceRequestor;
use stagehand_core::ids::BidId;
use stagehand_core::{Error, ResourceRequest, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

/// How often a waiting bidder forces a fresh round on its own.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shared arbiter of a [`ResourcePool`].
#[derive(Clone)]
pub struct ResourceBidder {
    shared: Arc<Shared>,
}

struct Shared {
    pool: ResourcePool,
    poll_interval: Duration,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    in_use: HashMap<String, u32>,
    queue: VecDeque<PendingBid>,
}

struct PendingBid {
    id: BidId,
    label: String,
    request: ResourceRequest,
    requestor: Arc<dyn ResourceRequestor>,
    tx: oneshot::Sender<ResourceGrant>,
}

impl ResourceBidder {
    pub fn new(pool: ResourcePool) -> Self {
        Self::with_poll_interval(pool, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(pool: ResourcePool, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                poll_interval,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.shared.pool
    }

    /// Wait until `request` can be granted to `requestor`.
    ///
    /// The bid stays queued while the requestor is not bidding. Dropping the
    /// returned future withdraws the bid.
    pub async fn acquire(
        &self,
        requestor: Arc<dyn ResourceRequestor>,
        request: ResourceRequest,
    ) -> Result<ResourceGrant> {
        self.validate(&request)?;

        let id = BidId::new();
        let label = requestor.label();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            state.queue.push_back(PendingBid {
                id,
                label: label.clone(),
                request,
                requestor,
                tx,
            });
            debug!(bid = %id, requestor = %label, pending = state.queue.len(), "Bid submitted");
            self.shared.arbitrate(&mut state);
        }

        loop {
            match timeout(self.shared.poll_interval, &mut rx).await {
                Ok(Ok(grant)) => return Ok(grant),
                Ok(Err(_)) => return Err(Error::BidAbandoned(id.to_string())),
                Err(_) => {
                    trace!(bid = %id, "Re-polling bidders");
                    self.rearbitrate();
                }
            }
        }
    }

    /// Run an arbitration round now, e.g. after a paused branch resumes.
    pub fn rearbitrate(&self) {
        let mut state = self.shared.lock();
        self.shared.arbitrate(&mut state);
    }

    /// Amount of `category` currently granted.
    pub fn in_use(&self, category: &str) -> u32 {
        self.shared
            .lock()
            .in_use
            .get(category)
            .copied()
            .unwrap_or(0)
    }

    /// Number of bids waiting for a grant.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    fn validate(&self, request: &ResourceRequest) -> Result<()> {
        for (category, requested) in request.iter() {
            if requested == 0 {
                continue;
            }
            let capacity = self
                .shared
                .pool
                .capacity(category)
                .ok_or_else(|| Error::UnknownResource(category.to_string()))?;
            if requested > capacity {
                return Err(Error::ExceedsCapacity {
                    category: category.to_string(),
                    requested,
                    capacity,
                });
            }
        }
        Ok(())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fits(&self, state: &PoolState, request: &ResourceRequest) -> bool {
        request.iter().all(|(category, requested)| {
            let used = state.in_use.get(category).copied().unwrap_or(0);
            let capacity = self.pool.capacity(category).unwrap_or(0);
            requested == 0 || used + requested <= capacity
        })
    }

    fn arbitrate(self: &Arc<Self>, state: &mut PoolState) {
        let mut blocked: HashSet<String> = HashSet::new();
        let mut i = 0;
        while i < state.queue.len() {
            let bid = &state.queue[i];

            if bid.tx.is_closed() {
                debug!(bid = %bid.id, requestor = %bid.label, "Dropping abandoned bid");
                state.queue.remove(i);
                continue;
            }
            if !bid.requestor.is_bidding() {
                trace!(bid = %bid.id, requestor = %bid.label, "Requestor not bidding");
                i += 1;
                continue;
            }
            if bid.request.categories().any(|c| blocked.contains(c)) {
                i += 1;
                continue;
            }
            if !self.fits(state, &bid.request) {
                let bid = &state.queue[i];
                blocked.extend(
                    bid.request
                        .iter()
                        .filter(|(_, amount)| *amount > 0)
                        .map(|(c, _)| c.to_string()),
                );
                i += 1;
                continue;
            }

            let Some(bid) = state.queue.remove(i) else {
                break;
            };
            for (category, amount) in bid.request.iter() {
                *state.in_use.entry(category.to_string()).or_insert(0) += amount;
            }
            let grant = ResourceGrant {
                bid: bid.id,
                request: bid.request.clone(),
                shared: Arc::clone(self),
                released: false,
            };
            match bid.tx.send(grant) {
                Ok(()) => {
                    debug!(bid = %bid.id, requestor = %bid.label, "Bid granted");
                }
                Err(mut grant) => {
                    // The bidder went away between the closed check and the send.
                    grant.released = true;
                    Self::subtract(state, &bid.request);
                }
            }
        }
    }

    fn subtract(state: &mut PoolState, request: &ResourceRequest) {
        for (category, amount) in request.iter() {
            if let Some(used) = state.in_use.get_mut(category) {
                *used = used.saturating_sub(amount);
            }
        }
    }

    fn release(self: &Arc<Self>, bid: BidId, request: &ResourceRequest) {
        let mut state = self.lock();
        Self::subtract(&mut state, request);
        debug!(bid = %bid, "Grant released");
        self.arbitrate(&mut state);
    }
}

/// Capacity held by one contender. Released when dropped.
#[must_use = "dropping a grant releases its resources immediately"]
pub struct ResourceGrant {
    bid: BidId,
    request: ResourceRequest,
    shared: Arc<Shared>,
    released: bool,
}

impl ResourceGrant {
    pub fn bid(&self) -> BidId {
        self.bid
    }

    pub fn request(&self) -> &ResourceRequest {
        &self.request
    }

    /// Return the capacity to the pool and wake waiting bidders.
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(self.bid, &self.request);
        }
    }
}

impl Drop for ResourceGrant {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for ResourceGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGrant")
            .field("bid", &self.bid)
            .field("request", &self.request)
            .field("released", &self.released)
            .finish()
    }
}

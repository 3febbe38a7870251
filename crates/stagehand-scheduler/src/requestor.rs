//! Contenders for pool capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Something that may want capacity from a [`crate::ResourceBidder`].
///
/// `is_bidding` is asked afresh on every arbitration round. It runs inside
/// the bidder's critical section, so it must be cheap and must not call back
/// into the bidder.
pub trait ResourceRequestor: Send + Sync {
    fn is_bidding(&self) -> bool;

    /// Label used in logs.
    fn label(&self) -> String {
        "anonymous".to_string()
    }
}

/// A shareable on/off switch, e.g. cleared when a branch pauses.
#[derive(Debug, Clone)]
pub struct BiddingFlag {
    label: String,
    bidding: Arc<AtomicBool>,
}

impl BiddingFlag {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            bidding: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_bidding(&self, bidding: bool) {
        self.bidding.store(bidding, Ordering::SeqCst);
    }
}

impl ResourceRequestor for BiddingFlag {
    fn is_bidding(&self) -> bool {
        self.bidding.load(Ordering::SeqCst)
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

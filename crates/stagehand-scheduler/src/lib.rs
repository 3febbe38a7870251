//! Resource arbitration for concurrently running Stagehand branches.

pub mod bidder;
pub mod pool;
pub mod requestor;

pub use bidder::{ResourceBidder, ResourceGrant};
pub use pool::ResourcePool;
pub use requestor::{BiddingFlag, ResourceRequestor};

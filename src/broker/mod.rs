pub mod cache;
pub mod error;
pub mod fanout;
pub mod hex;
pub mod hrn;
pub mod identity;
pub mod ledger;
pub mod peer;
pub mod record;
pub mod rspec;
pub mod topology;
pub mod trie;

#[cfg(feature = "slicemgr")]
pub mod aggregate;
#[cfg(all(feature = "registry", feature = "slicemgr"))]
pub mod net;
#[cfg(feature = "registry")]
pub mod registry;

pub use error::BrokerError;
pub use hrn::{Hrn, RecordType};

// Resumable on-disk cache of partially downloaded tracks

mod entry;
pub mod range_set;
pub mod store;

pub use entry::CacheEntry;
pub use range_set::RangeSet;
pub use store::{CacheHandle, CacheStore, RangeRead};

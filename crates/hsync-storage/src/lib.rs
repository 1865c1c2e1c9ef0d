//! Outbound I/O for hackathon sync: paced, retrying HTTP fetches for source
//! adapters and the listing document store.

pub mod fetch;
pub mod pacing;
pub mod postgres;
pub mod store;

pub use fetch::{
    FetchError, FetchRequest, FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
    RetryPolicy,
};
pub use pacing::{SimpleTokenBucket, TokenBucketConfig};
pub use postgres::PgListingStore;
pub use store::{ListingStore, MemoryStore, StatusCounts, StoreError, StoreGateway, WriteResult};

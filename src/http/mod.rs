mod batch;
mod client;
mod fetcher;
mod url_builder;

pub use batch::{BatchHandle, BatchOutcome, BatchSummary, FetchItem, FetchStatus, ItemReport};
pub use client::{HttpClient, SHARED_CLIENT_CLASSIFIER};
pub use fetcher::{FetchRequest, HttpDataFetcher, PARTIAL_SUFFIX};
pub use url_builder::UrlBuilder;

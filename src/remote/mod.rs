//! Remote side of the engine: request descriptors, transports and the
//! paginating fetcher.

mod fetcher;
mod http;
mod request;
mod transport;

pub use fetcher::{
  map_status, FetchSummary, FetcherConfig, Page, PaginationPolicy, RemoteFetcher, DEFAULT_MAX_CONCURRENT,
  DEFAULT_MAX_PAGES,
};
pub use http::HttpTransport;
pub use request::{parse_next_link, RawResponse, RemoteRequest};
pub use transport::{Credentials, SessionProvider, StaticSession, Transport};

//! Paginated fetching with error mapping and a bounded worker pool.

use std::ops::ControlFlow;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::error::{ConfigurationError, FetchError};

use super::request::{RawResponse, RemoteRequest};
use super::transport::{Credentials, SessionProvider, Transport};

/// Default safety cap on followed pages.
pub const DEFAULT_MAX_PAGES: usize = 100;

/// Default number of fetches allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// When fetched pages are handed to the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationPolicy {
  /// Collect every page, deliver once
  #[default]
  Accumulate,
  /// Deliver each page as it arrives
  Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherConfig {
  pub max_pages: usize,
  pub max_concurrent: usize,
  pub pagination: PaginationPolicy,
}

impl Default for FetcherConfig {
  fn default() -> Self {
    Self {
      max_pages: DEFAULT_MAX_PAGES,
      max_concurrent: DEFAULT_MAX_CONCURRENT,
      pagination: PaginationPolicy::Accumulate,
    }
  }
}

impl FetcherConfig {
  pub fn validate(&self) -> Result<(), ConfigurationError> {
    if self.max_pages == 0 {
      return Err(ConfigurationError::ZeroPageCap);
    }
    if self.max_concurrent == 0 {
      return Err(ConfigurationError::ZeroConcurrency);
    }
    Ok(())
  }
}

/// Records handed to a fetch sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
  pub records: Vec<Value>,
  /// Zero-based index of the first network page in this delivery
  pub index: usize,
  /// No delivery follows this one
  pub is_last: bool,
  /// The page cap cut pagination short; the records are not the whole result
  pub truncated: bool,
  /// Continuation left unfollowed, set on the last delivery only
  pub next: Option<String>,
}

/// Totals for a completed fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
  pub pages: usize,
  pub records: usize,
  /// The page cap stopped pagination before the API did
  pub truncated: bool,
  /// The sink asked to stop early
  pub stopped: bool,
  /// Continuation left unfollowed by a page limit or the page cap
  pub next: Option<String>,
}

/// Executes requests through a transport, following continuations.
#[derive(Clone)]
pub struct RemoteFetcher {
  transport: Arc<dyn Transport>,
  session: Arc<dyn SessionProvider>,
  config: FetcherConfig,
  pool: Arc<Semaphore>,
}

impl RemoteFetcher {
  pub fn new(
    transport: Arc<dyn Transport>,
    session: Arc<dyn SessionProvider>,
    config: FetcherConfig,
  ) -> Result<Self, ConfigurationError> {
    config.validate()?;
    let pool = Arc::new(Semaphore::new(config.max_concurrent));
    Ok(Self {
      transport,
      session,
      config,
      pool,
    })
  }

  pub fn config(&self) -> &FetcherConfig {
    &self.config
  }

  /// Fetch every page of `request`, handing records to `sink` according to
  /// the pagination policy. The sink may return `ControlFlow::Break` to stop
  /// following pages.
  pub async fn fetch<F>(&self, request: &RemoteRequest, sink: F) -> Result<FetchSummary, FetchError>
  where
    F: FnMut(Page) -> ControlFlow<()> + Send,
  {
    self.fetch_pages(request, None, sink).await
  }

  /// Like `fetch`, but stop after `limit` pages and report the continuation
  /// in `FetchSummary::next` and on the last `Page`. Stopping at a limit is
  /// not a truncation.
  pub async fn fetch_pages<F>(
    &self,
    request: &RemoteRequest,
    limit: Option<usize>,
    mut sink: F,
  ) -> Result<FetchSummary, FetchError>
  where
    F: FnMut(Page) -> ControlFlow<()> + Send,
  {
    // A limit above the cap is just the cap.
    let limit = limit.map(|l| l.max(1)).filter(|l| *l <= self.config.max_pages);
    let _permit = self
      .pool
      .acquire()
      .await
      .map_err(|_| FetchError::Network("fetch pool closed".to_string()))?;

    let mut credentials = self.session.credentials().await;
    let mut reauthenticated = false;
    let mut summary = FetchSummary::default();
    let mut accumulated = Vec::new();
    let mut current = request.clone();

    loop {
      let response = self
        .send_once(&current, &mut credentials, &mut reauthenticated)
        .await?;
      let records = current.decode_records(&response.body)?;

      let page_index = summary.pages;
      summary.pages += 1;
      summary.records += records.len();

      let next = match response.next {
        Some(next) if limit.map_or(false, |l| summary.pages >= l) => {
          tracing::debug!(path = %request.path, pages = summary.pages, "page limit reached, keeping continuation");
          summary.next = Some(next);
          None
        }
        Some(next) if summary.pages >= self.config.max_pages => {
          tracing::warn!(
            path = %request.path,
            pages = summary.pages,
            skipped_next = %next,
            "page cap reached, stopping pagination"
          );
          summary.truncated = true;
          summary.next = Some(next);
          None
        }
        other => other,
      };
      let is_last = next.is_none();

      match self.config.pagination {
        PaginationPolicy::Accumulate => accumulated.extend(records),
        PaginationPolicy::Incremental => {
          let page = Page {
            records,
            index: page_index,
            is_last,
            truncated: summary.truncated,
            next: summary.next.clone(),
          };
          if sink(page).is_break() {
            summary.stopped = true;
            return Ok(summary);
          }
        }
      }

      match next {
        Some(next) => {
          tracing::debug!(path = %request.path, %next, "following next page");
          current = request.next_page(next);
        }
        None => break,
      }
    }

    if self.config.pagination == PaginationPolicy::Accumulate {
      let page = Page {
        records: accumulated,
        index: 0,
        is_last: true,
        truncated: summary.truncated,
        next: summary.next.clone(),
      };
      if sink(page).is_break() {
        summary.stopped = true;
      }
    }

    Ok(summary)
  }

  /// Send one page, refreshing credentials once per fetch on a 401.
  async fn send_once(
    &self,
    request: &RemoteRequest,
    credentials: &mut Option<Credentials>,
    reauthenticated: &mut bool,
  ) -> Result<RawResponse, FetchError> {
    loop {
      let response = self.transport.send(request, credentials.as_ref()).await?;
      match map_status(response.status) {
        Ok(()) => return Ok(response),
        Err(FetchError::Unauthorized) if !*reauthenticated => {
          *reauthenticated = true;
          tracing::debug!(path = %request.path, "unauthorized, refreshing credentials");
          *credentials = Some(self.session.refresh().await?);
        }
        Err(e) => return Err(e),
      }
    }
  }
}

impl std::fmt::Debug for RemoteFetcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RemoteFetcher")
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

/// Map an HTTP status to the fetch error taxonomy.
pub fn map_status(status: u16) -> Result<(), FetchError> {
  match status {
    200..=299 => Ok(()),
    401 => Err(FetchError::Unauthorized),
    code => Err(FetchError::ServerError(code)),
  }
}

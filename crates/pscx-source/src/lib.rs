//! Upstream registry page sources and the fetch-until-gone pagination loop.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pscx_core::Record;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pscx-source";

/// Path of the paginated practitioner listing, relative to the API base URL.
pub const PS_PAGE_PATH: &str = "/v2/ps";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageResponse {
    Records(Vec<Record>),
    /// The registry has no page at this cursor.
    EndOfPages,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("page {page} is not a list of practitioners: {source}")]
    Decode {
        page: u32,
        #[source]
        source: serde_json::Error,
    },
    #[error("page 0 of size {size} returned no practitioners")]
    EmptyFirstPage { size: u32 },
    #[error("registry has no pages at all")]
    NoPages,
    #[error("page size must be positive")]
    InvalidPageSize,
    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

impl FetchError {
    /// The registry answered, but with an impossible shape rather than an I/O failure.
    pub fn is_consistency_fault(&self) -> bool {
        matches!(self, Self::EmptyFirstPage { .. } | Self::NoPages)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Data,
    EndOfPages,
    Failure,
}

pub fn classify_status(status: StatusCode) -> PageStatus {
    if status.is_success() {
        PageStatus::Data
    } else if status == StatusCode::GONE {
        PageStatus::EndOfPages
    } else {
        PageStatus::Failure
    }
}

#[async_trait]
pub trait PageSource: Send + Sync {
    /// Human-readable location, used in logs.
    fn describe(&self) -> String;

    async fn fetch_page(&self, page: u32, size: u32) -> Result<PageResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

/// Registry client speaking `GET <base>/v2/ps?page=<n>&size=<s>`.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPageSource {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(%base_url, "registry client created");
        Ok(Self { client, base_url })
    }

    pub fn page_url(&self, page: u32, size: u32) -> String {
        format!("{}{PS_PAGE_PATH}?page={page}&size={size}", self.base_url)
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn fetch_page(&self, page: u32, size: u32) -> Result<PageResponse, FetchError> {
        let url = self.page_url(page, size);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();

        match classify_status(status) {
            PageStatus::EndOfPages => Ok(PageResponse::EndOfPages),
            PageStatus::Failure => Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            }),
            PageStatus::Data => {
                let body = resp.bytes().await?;
                let records = serde_json::from_slice::<Vec<Record>>(&body)
                    .map_err(|source| FetchError::Decode { page, source })?;
                debug!(page, size, records = records.len(), "page received");
                Ok(PageResponse::Records(records))
            }
        }
    }
}

/// One page of practitioners as delivered by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub records: Vec<Record>,
}

/// Walks pages 0, 1, 2… of a [`PageSource`] until it reports end of pages.
pub struct PaginatedFetcher<'s> {
    source: &'s dyn PageSource,
    page_size: u32,
    next_page: u32,
    exhausted: bool,
}

impl<'s> PaginatedFetcher<'s> {
    pub fn new(source: &'s dyn PageSource, page_size: u32) -> Result<Self, FetchError> {
        if page_size == 0 {
            return Err(FetchError::InvalidPageSize);
        }
        Ok(Self {
            source,
            page_size,
            next_page: 0,
            exhausted: false,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Pages successfully received so far.
    pub fn pages_fetched(&self) -> u32 {
        self.next_page
    }

    /// `Ok(None)` once the registry signals there are no more pages.
    ///
    /// Any error ends the walk; later calls return `Ok(None)`.
    pub async fn next_page(&mut self) -> Result<Option<Page>, FetchError> {
        if self.exhausted {
            return Ok(None);
        }
        let number = self.next_page;

        let response = match self.source.fetch_page(number, self.page_size).await {
            Ok(response) => response,
            Err(err) => {
                self.exhausted = true;
                warn!(page = number, %err, "page request failed");
                return Err(err);
            }
        };

        match response {
            PageResponse::EndOfPages if number == 0 => {
                self.exhausted = true;
                Err(FetchError::NoPages)
            }
            PageResponse::EndOfPages => {
                self.exhausted = true;
                info!(pages = number, "out of pages");
                Ok(None)
            }
            PageResponse::Records(records) if number == 0 && records.is_empty() => {
                self.exhausted = true;
                Err(FetchError::EmptyFirstPage {
                    size: self.page_size,
                })
            }
            PageResponse::Records(records) => {
                self.next_page += 1;
                debug!(page = number, size = self.page_size, "page accepted");
                Ok(Some(Page { number, records }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use axum::extract::Query;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde::Deserialize;

    struct ScriptedSource {
        script: Mutex<VecDeque<Result<PageResponse, FetchError>>>,
        calls: Mutex<Vec<(u32, u32)>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<PageResponse, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted".into()
        }

        async fn fetch_page(&self, page: u32, size: u32) -> Result<PageResponse, FetchError> {
            self.calls.lock().unwrap().push((page, size));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PageResponse::EndOfPages))
        }
    }

    fn records(ids: &[&str]) -> PageResponse {
        PageResponse::Records(
            ids.iter()
                .map(|id| Record {
                    id: Some(id.to_string()),
                    ids: vec![id.to_string()],
                    ..Default::default()
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn walks_pages_until_gone() {
        let source = ScriptedSource::new(vec![
            Ok(records(&["81"])),
            Ok(records(&["82", "83"])),
            Ok(records(&[])),
            Ok(PageResponse::EndOfPages),
        ]);
        let mut fetcher = PaginatedFetcher::new(&source, 2).unwrap();
        let mut numbers = Vec::new();
        while let Some(page) = fetcher.next_page().await.unwrap() {
            numbers.push((page.number, page.records.len()));
        }
        assert_eq!(numbers, vec![(0, 1), (1, 2), (2, 0)]);
        assert_eq!(fetcher.pages_fetched(), 3);
        assert!(fetcher.next_page().await.unwrap().is_none());
        assert_eq!(
            *source.calls.lock().unwrap(),
            vec![(0, 2), (1, 2), (2, 2), (3, 2)]
        );
    }

    #[tokio::test]
    async fn empty_first_page_is_a_consistency_fault() {
        let source = ScriptedSource::new(vec![Ok(records(&[]))]);
        let mut fetcher = PaginatedFetcher::new(&source, 1).unwrap();
        let err = fetcher.next_page().await.unwrap_err();
        assert!(matches!(err, FetchError::EmptyFirstPage { size: 1 }));
        assert!(err.is_consistency_fault());
        assert!(fetcher.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn gone_on_first_page_means_no_snapshot() {
        let source = ScriptedSource::new(vec![Ok(PageResponse::EndOfPages)]);
        let mut fetcher = PaginatedFetcher::new(&source, 1).unwrap();
        assert!(matches!(
            fetcher.next_page().await,
            Err(FetchError::NoPages)
        ));
    }

    #[tokio::test]
    async fn other_failures_stop_the_walk() {
        let source = ScriptedSource::new(vec![
            Ok(records(&["81"])),
            Err(FetchError::HttpStatus {
                status: 500,
                url: "x".into(),
            }),
            Ok(records(&["82"])),
        ]);
        let mut fetcher = PaginatedFetcher::new(&source, 1).unwrap();
        assert!(fetcher.next_page().await.unwrap().is_some());
        let err = fetcher.next_page().await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
        assert!(!err.is_consistency_fault());
        assert!(fetcher.next_page().await.unwrap().is_none());
        assert_eq!(source.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let source = ScriptedSource::new(vec![]);
        assert!(matches!(
            PaginatedFetcher::new(&source, 0),
            Err(FetchError::InvalidPageSize)
        ));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::OK), PageStatus::Data);
        assert_eq!(classify_status(StatusCode::GONE), PageStatus::EndOfPages);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), PageStatus::Failure);
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            PageStatus::Failure
        );
    }

    #[derive(Debug, Deserialize)]
    struct PageQuery {
        page: u32,
        size: u32,
    }

    async fn serve_registry(pages: Vec<(u16, String)>) -> String {
        let pages = Arc::new(pages);
        let router = Router::new().route(
            PS_PAGE_PATH,
            get(move |Query(q): Query<PageQuery>| {
                let pages = pages.clone();
                async move {
                    assert_eq!(q.size, 1);
                    match pages.get(q.page as usize) {
                        Some((status, body)) => (
                            StatusCode::from_u16(*status).unwrap(),
                            [("content-type", "application/json")],
                            body.clone(),
                        )
                            .into_response(),
                        None => StatusCode::GONE.into_response(),
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn http_source_maps_statuses() {
        let base = serve_registry(vec![
            (
                200,
                r#"[{"id":"810100000001","ids":["810100000001"],"lastName":"DUPONT"}]"#.into(),
            ),
            (500, "boom".into()),
            (200, "{not json".into()),
        ])
        .await;
        let source = HttpPageSource::new(&base, HttpClientConfig::default()).unwrap();
        assert!(source.page_url(3, 1).ends_with("/v2/ps?page=3&size=1"));
        assert!(!source.describe().ends_with('/'));

        match source.fetch_page(0, 1).await.unwrap() {
            PageResponse::Records(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].last_name.as_deref(), Some("DUPONT"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            source.fetch_page(1, 1).await,
            Err(FetchError::HttpStatus { status: 500, .. })
        ));
        assert!(matches!(
            source.fetch_page(2, 1).await,
            Err(FetchError::Decode { page: 2, .. })
        ));
        assert_eq!(
            source.fetch_page(3, 1).await.unwrap(),
            PageResponse::EndOfPages
        );
    }

    #[tokio::test]
    async fn http_walk_single_page_then_gone() {
        let base = serve_registry(vec![(
            200,
            r#"[{"ids":["60123"]}]"#.into(),
        )])
        .await;
        let source = HttpPageSource::new(base, HttpClientConfig::default()).unwrap();
        let mut fetcher = PaginatedFetcher::new(&source, 1).unwrap();
        let first = fetcher.next_page().await.unwrap().expect("page 0");
        assert_eq!(first.records[0].ids, vec!["60123".to_string()]);
        assert!(fetcher.next_page().await.unwrap().is_none());
    }
}

pub mod cleaner;
pub mod http_client;
pub mod parsers;

use crate::config::{RetryConfig, ScraperConfig};
use crate::error::FetchError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use self::http_client::HttpClient;
use self::parsers::parse_listing_page;

// ── Source trait ──────────────────────────────────────────────────────────────

/// Where detail pages come from, addressed by 1-based page index.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn detail_url(&self, page: u32) -> String;
    async fn fetch_detail(&self, page: u32) -> Result<String, FetchError>;
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Which listing pages to walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListingScope {
    /// Explicit listing page count; discovered from page 1 when absent.
    pub pages: Option<u32>,
    /// Upper bound applied after discovery (sample mode).
    pub cap: Option<u32>,
    pub delay: Duration,
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub listing_pages: u32,
    pub failed_listing_pages: u32,
    pub total_institutions: Option<u32>,
    pub detail_pages: usize,
}

// ── EDSP scraper ──────────────────────────────────────────────────────────────

pub struct EdspScraper {
    client: HttpClient,
    base_url: Url,
    detail_urls: Vec<String>,
    seen: HashSet<String>,
}

impl EdspScraper {
    pub fn new(config: &ScraperConfig, retry: &RetryConfig) -> Result<Self> {
        let base_url = Url::parse(config.base_url.trim())
            .with_context(|| format!("Invalid base URL {:?}", config.base_url))?;
        Ok(Self {
            client: HttpClient::new(config, retry)?,
            base_url,
            detail_urls: Vec::new(),
            seen: HashSet::new(),
        })
    }

    /// URL for the listing index page (paginated).
    fn listing_url(&self, page: u32) -> String {
        if page <= 1 {
            self.base_url.to_string()
        } else {
            let mut url = self.base_url.clone();
            url.query_pairs_mut().append_pair("page", &page.to_string());
            url.to_string()
        }
    }

    /// Number of detail pages discovered so far.
    pub fn detail_count(&self) -> u32 {
        self.detail_urls.len() as u32
    }

    /// Walk the listing pages and build the detail-page catalog.
    ///
    /// Listing page 1 must load; later listing pages that fail are logged and
    /// skipped.
    pub async fn discover(&mut self, scope: ListingScope) -> Result<DiscoveryReport> {
        let first_url = self.listing_url(1);
        info!("Fetching listing page 1 ({})", first_url);

        let html = self
            .client
            .get_text(&first_url)
            .await
            .context("Failed to fetch listing page 1")?;
        let first = parse_listing_page(&html, &self.base_url)?;

        let mut total = scope.pages.or(first.total_pages).unwrap_or(1).max(1);
        if let Some(cap) = scope.cap {
            total = total.min(cap.max(1));
        }
        info!(
            "Listing: {} pages, {} institutions reported",
            total,
            first.total_institutions.map(|n| n.to_string()).unwrap_or("?".into())
        );

        let mut report = DiscoveryReport {
            listing_pages: total,
            total_institutions: first.total_institutions,
            ..Default::default()
        };

        self.detail_urls.clear();
        self.seen.clear();
        self.merge(first.detail_urls);
        debug!("  Page 1: {} schools", self.detail_urls.len());

        for page in 2..=total {
            sleep(scope.delay).await;

            let url = self.listing_url(page);
            let listing = match self.client.get_text(&url).await {
                Ok(html) => parse_listing_page(&html, &self.base_url),
                Err(e) => {
                    warn!("Listing page {} skipped: {}", page, e);
                    report.failed_listing_pages += 1;
                    continue;
                }
            };

            match listing {
                Ok(listing) => {
                    let before = self.detail_urls.len();
                    self.merge(listing.detail_urls);
                    info!("  Page {}: {} new schools", page, self.detail_urls.len() - before);
                }
                Err(e) => {
                    warn!("Listing page {} unparseable: {}", page, e);
                    report.failed_listing_pages += 1;
                }
            }
        }

        report.detail_pages = self.detail_urls.len();
        info!("Total detail pages discovered: {}", report.detail_pages);
        Ok(report)
    }

    fn merge(&mut self, urls: Vec<String>) {
        for url in urls {
            if self.seen.insert(url.clone()) {
                self.detail_urls.push(url);
            }
        }
    }
}

#[async_trait]
impl PageSource for EdspScraper {
    fn detail_url(&self, page: u32) -> String {
        page.checked_sub(1)
            .and_then(|i| self.detail_urls.get(i as usize))
            .cloned()
            .unwrap_or_default()
    }

    async fn fetch_detail(&self, page: u32) -> Result<String, FetchError> {
        let url = self.detail_url(page);
        if url.is_empty() {
            return Err(FetchError::UnknownPage(page));
        }
        debug!("Fetching detail page {}: {}", page, url);
        self.client.get_text(&url).await
    }
}

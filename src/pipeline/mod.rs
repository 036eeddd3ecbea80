//! Pipeline orchestrator: ties scraper → extractor → CSV output together.
//!
//! ## Run modes
//!
//! `Sample` walks only the first `pipeline.sample_pages` listing pages;
//! `Full` walks every listing page. Both then fetch each discovered detail
//! page through [`Orchestrator`], which always yields one record per page
//! (a `FAILURE` row when fetching or parsing fails) and write the CSV.
//!
//! Each run is a fresh extraction into a new file.

use crate::config::{AppConfig, PipelineConfig};
use crate::models::{SchoolRecord, Status};
use crate::scraper::parsers::{EdspExtractor, Extractor};
use crate::scraper::{EdspScraper, ListingScope, PageSource};
use crate::storage::{self, CsvWriter};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_retry::strategy::jitter;
use tracing::{error, info, warn};

// ── Orchestrator ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub concurrency: usize,
    pub dispatch_delay: Duration,
    pub dispatch_jitter: Duration,
}

impl From<&PipelineConfig> for BatchConfig {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            concurrency: cfg.concurrency,
            dispatch_delay: cfg.request_delay(),
            dispatch_jitter: cfg.jitter(),
        }
    }
}

pub struct Orchestrator<S, E> {
    source: Arc<S>,
    extractor: Arc<E>,
    config: BatchConfig,
}

impl<S, E> Orchestrator<S, E>
where
    S: PageSource + 'static,
    E: Extractor + 'static,
{
    pub fn new(source: Arc<S>, extractor: Arc<E>, config: BatchConfig) -> Self {
        Self {
            source,
            extractor,
            config,
        }
    }

    pub async fn run(&self, pages: RangeInclusive<u32>) -> Vec<SchoolRecord> {
        self.run_until(pages, std::future::pending()).await
    }

    /// Process every page in `pages`, stopping dispatch once `shutdown`
    /// resolves. Returns exactly one record per page, sorted by page.
    pub async fn run_until<F>(&self, pages: RangeInclusive<u32>, shutdown: F) -> Vec<SchoolRecord>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let sem = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut pending = pages.into_iter();
        let mut handles = Vec::new();
        let mut records = Vec::new();
        let mut cancelled = false;

        for page in pending.by_ref() {
            let pause = if handles.is_empty() { Duration::ZERO } else { self.pause() };
            let dispatch = async {
                if !pause.is_zero() {
                    sleep(pause).await;
                }
                Arc::clone(&sem).acquire_owned().await
            };

            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                permit = dispatch => permit.ok(),
            };

            let Some(permit) = permit else {
                cancelled = true;
                records.push(self.cancelled(page));
                break;
            };

            let source = Arc::clone(&self.source);
            let extractor = Arc::clone(&self.extractor);
            let handle = tokio::spawn(async move {
                let _permit = permit;
                process_page(source.as_ref(), extractor.as_ref(), page).await
            });
            handles.push((page, handle));
        }

        if cancelled {
            warn!("Shutdown requested, {} pages left undispatched", pending.clone().count() + 1);
            records.extend(pending.map(|page| self.cancelled(page)));
        }

        for (page, mut handle) in handles {
            let joined = if cancelled {
                handle.abort();
                handle.await
            } else {
                let finished = tokio::select! {
                    biased;
                    res = &mut handle => Some(res),
                    _ = &mut shutdown => None,
                };
                match finished {
                    Some(res) => res,
                    None => {
                        warn!("Shutdown requested, abandoning in-flight pages");
                        cancelled = true;
                        handle.abort();
                        handle.await
                    }
                }
            };

            records.push(match joined {
                Ok(record) => record,
                Err(e) if e.is_cancelled() => {
                    SchoolRecord::failure(page, self.source.detail_url(page), "abandoned: run cancelled")
                }
                Err(e) => {
                    error!("Task panic for page {}: {}", page, e);
                    SchoolRecord::failure(page, self.source.detail_url(page), format!("worker panicked: {e}"))
                }
            });
        }

        records.sort_by_key(|r| r.page);
        records
    }

    fn pause(&self) -> Duration {
        let extra = if self.config.dispatch_jitter.is_zero() {
            Duration::ZERO
        } else {
            jitter(self.config.dispatch_jitter)
        };
        self.config.dispatch_delay + extra
    }

    fn cancelled(&self, page: u32) -> SchoolRecord {
        SchoolRecord::failure(page, self.source.detail_url(page), "cancelled before dispatch")
    }
}

/// Fetch + extract one detail page; every error becomes a `FAILURE` record.
async fn process_page<S, E>(source: &S, extractor: &E, page: u32) -> SchoolRecord
where
    S: PageSource + ?Sized,
    E: Extractor + ?Sized,
{
    let url = source.detail_url(page);

    let html = match source.fetch_detail(page).await {
        Ok(html) => html,
        Err(e) => {
            warn!("Page {}: fetch failed: {}", page, e);
            return SchoolRecord::failure(page, url, e.to_string());
        }
    };

    match extractor.extract(&html) {
        Ok(profile) => {
            info!("Page {}: {} ({})", page, profile.name, profile.classification);
            SchoolRecord::success(page, url, profile)
        }
        Err(e) => {
            warn!("Page {}: parse failed: {}", page, e);
            SchoolRecord::failure(page, url, e.to_string())
        }
    }
}

// ── Run summary ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub classifications: BTreeMap<String, usize>,
    pub listing_pages: u32,
    pub total_institutions: Option<u32>,
    pub output: PathBuf,
    pub size_bytes: u64,
}

impl RunSummary {
    pub fn from_records(records: &[SchoolRecord]) -> Self {
        let mut summary = RunSummary {
            total: records.len(),
            ..Default::default()
        };

        for record in records {
            match (record.status(), record.profile()) {
                (Status::Success, Some(profile)) => {
                    summary.successful += 1;
                    *summary
                        .classifications
                        .entry(profile.classification.to_string())
                        .or_default() += 1;
                }
                _ => summary.failed += 1,
            }
        }

        if summary.total > 0 {
            summary.success_rate = summary.successful as f64 * 100.0 / summary.total as f64;
        }
        summary
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Sample,
    Full,
}

pub struct Pipeline {
    config: AppConfig,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(
        &self,
        mode: RunMode,
        listing_pages: Option<u32>,
        output: Option<PathBuf>,
    ) -> Result<RunSummary> {
        let mut scraper = EdspScraper::new(&self.config.scraper, &self.config.retry)
            .context("Failed to build scraper")?;

        // ── 1. Discover detail pages ───────────────────────────────────────────
        info!("=== Step 1: Discovering schools ({:?} mode) ===", mode);
        let scope = self.listing_scope(mode, listing_pages);
        let report = scraper.discover(scope).await.context("School discovery failed")?;

        // ── 2. Fetch + extract every detail page ───────────────────────────────
        let count = scraper.detail_count();
        info!(
            "=== Step 2: Extracting {} schools (concurrency {}) ===",
            count, self.config.pipeline.concurrency
        );

        let extractor = EdspExtractor::new().context("Failed to build extractor")?;
        let orchestrator = Orchestrator::new(
            Arc::new(scraper),
            Arc::new(extractor),
            BatchConfig::from(&self.config.pipeline),
        );
        let records = if count == 0 {
            warn!("No detail pages discovered");
            Vec::new()
        } else {
            orchestrator
                .run_until(1..=count, shutdown_signal(self.config.pipeline.run_timeout()))
                .await
        };

        // ── 3. Write CSV ───────────────────────────────────────────────────────
        info!("=== Step 3: Writing {} records ===", records.len());
        let path = output.unwrap_or_else(|| storage::default_output_path(&self.config.output.dir, Utc::now()));
        let written = CsvWriter::write(&path, &records)?;

        match storage::verify_output(&path) {
            Ok(rows) if rows == records.len() => info!("Integrity check passed: {} rows", rows),
            Ok(rows) => warn!("Integrity check: wrote {} records but read back {} rows", records.len(), rows),
            Err(e) => warn!("Integrity check failed: {}", e),
        }

        let mut summary = RunSummary::from_records(&records);
        summary.listing_pages = report.listing_pages;
        summary.total_institutions = report.total_institutions;
        summary.output = written.path;
        summary.size_bytes = written.size_bytes;

        if let Err(e) = storage::write_summary(&summary.output, &summary) {
            warn!("Could not write run summary: {}", e);
        }

        info!(
            "=== Done: {} schools | {} ok | {} failed | {:.1}% success ===",
            summary.total, summary.successful, summary.failed, summary.success_rate
        );
        Ok(summary)
    }

    /// An explicit page count wins; sample mode otherwise stops after
    /// `pipeline.sample_pages`.
    fn listing_scope(&self, mode: RunMode, listing_pages: Option<u32>) -> ListingScope {
        let cap = match (mode, listing_pages) {
            (RunMode::Sample, None) => Some(self.config.pipeline.sample_pages),
            _ => None,
        };
        ListingScope {
            pages: listing_pages,
            cap,
            delay: self.config.pipeline.request_delay(),
        }
    }
}

/// Resolves on Ctrl-C or when the optional run timeout elapses.
async fn shutdown_signal(timeout: Option<Duration>) {
    let timer = async {
        match timeout {
            Some(t) => sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => warn!("Interrupt received, stopping dispatch"),
            Err(e) => {
                error!("Could not listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        },
        _ = timer => warn!("Run timeout reached, stopping dispatch"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::models::Classification;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PAGE: &str = "<div class=\"conteudo\">\
        <h2 class=\"escola-titulo\" id=\"nome-escola\">EE TESTE</h2>\
        <div class=\"tag\"><p class=\"tags\">EE</p></div></div>";

    /// Counts concurrent fetches; fails pages divisible by 5, serves broken
    /// markup for page 7.
    struct MockSource {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl MockSource {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageSource for MockSource {
        fn detail_url(&self, page: u32) -> String {
            format!("https://edsp.test/DetalhesEscola?codesc={page}")
        }

        async fn fetch_detail(&self, page: u32) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match page {
                p if p % 5 == 0 => Err(FetchError::Timeout { url: self.detail_url(p) }),
                7 => Ok("<html><body>Página não encontrada</body></html>".to_string()),
                _ => Ok(PAGE.to_string()),
            }
        }
    }

    fn orchestrator(source: Arc<MockSource>, concurrency: usize) -> Orchestrator<MockSource, EdspExtractor> {
        let config = BatchConfig {
            concurrency,
            dispatch_delay: Duration::ZERO,
            dispatch_jitter: Duration::ZERO,
        };
        Orchestrator::new(source, Arc::new(EdspExtractor::new().unwrap()), config)
    }

    #[tokio::test]
    async fn one_record_per_page_in_order() {
        let source = Arc::new(MockSource::new(Duration::from_millis(2)));
        let records = orchestrator(Arc::clone(&source), 4).run(3..=22).await;

        let pages: Vec<u32> = records.iter().map(|r| r.page).collect();
        assert_eq!(pages, (3..=22).collect::<Vec<_>>());
        assert_eq!(pages.iter().collect::<HashSet<_>>().len(), 20);
        assert_eq!(source.calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn failures_become_records_without_stopping_the_batch() {
        let source = Arc::new(MockSource::new(Duration::from_millis(1)));
        let records = orchestrator(source, 3).run(1..=10).await;

        for r in &records {
            assert_eq!(r.status() == Status::Failure, r.error_message().is_some());
        }

        let failed: Vec<u32> = records
            .iter()
            .filter(|r| r.status() == Status::Failure)
            .map(|r| r.page)
            .collect();
        assert_eq!(failed, vec![5, 7, 10]);

        let parse_failure = &records[6];
        assert!(parse_failure.error_message().unwrap().contains("div.conteudo"));
        assert_eq!(parse_failure.detail_url, "https://edsp.test/DetalhesEscola?codesc=7");

        let ok = records[0].profile().unwrap();
        assert_eq!(ok.name, "EE TESTE");
        assert_eq!(ok.classification, Classification::Ee);
    }

    #[tokio::test]
    async fn in_flight_fetches_never_exceed_limit() {
        let source = Arc::new(MockSource::new(Duration::from_millis(20)));
        let records = orchestrator(Arc::clone(&source), 3).run(1..=15).await;

        assert_eq!(records.len(), 15);
        assert_eq!(source.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_stops_dispatch_and_records_every_page() {
        let source = Arc::new(MockSource::new(Duration::from_secs(30)));
        let records = orchestrator(Arc::clone(&source), 2)
            .run_until(1..=6, sleep(Duration::from_millis(50)))
            .await;

        assert_eq!(records.iter().map(|r| r.page).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
        assert!(records.iter().all(|r| r.status() == Status::Failure));
        assert_eq!(records[0].error_message(), Some("abandoned: run cancelled"));
        assert_eq!(records[1].error_message(), Some("abandoned: run cancelled"));
        assert_eq!(records[2].error_message(), Some("cancelled before dispatch"));
        assert_eq!(records[5].error_message(), Some("cancelled before dispatch"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    /// Page 1 answers at once; every other page hangs.
    struct StallingSource;

    #[async_trait]
    impl PageSource for StallingSource {
        fn detail_url(&self, page: u32) -> String {
            format!("https://edsp.test/DetalhesEscola?codesc={page}")
        }

        async fn fetch_detail(&self, page: u32) -> Result<String, FetchError> {
            if page > 1 {
                sleep(Duration::from_secs(30)).await;
            }
            Ok(PAGE.to_string())
        }
    }

    #[tokio::test]
    async fn shutdown_while_joining_keeps_finished_pages() {
        let config = BatchConfig {
            concurrency: 10,
            dispatch_delay: Duration::ZERO,
            dispatch_jitter: Duration::ZERO,
        };
        let orchestrator = Orchestrator::new(
            Arc::new(StallingSource),
            Arc::new(EdspExtractor::new().unwrap()),
            config,
        );
        let records = orchestrator
            .run_until(1..=4, sleep(Duration::from_millis(50)))
            .await;

        assert_eq!(records.iter().map(|r| r.page).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(records[0].status(), Status::Success);
        assert_eq!(records[0].error_message(), None);
        for r in &records[1..] {
            assert_eq!(r.status(), Status::Failure);
            assert_eq!(r.error_message(), Some("abandoned: run cancelled"));
        }
    }

    fn pipeline(sample_pages: u32) -> Pipeline {
        let mut config = AppConfig::default();
        config.pipeline.sample_pages = sample_pages;
        Pipeline::new(config)
    }

    #[test]
    fn explicit_page_count_overrides_sample_cap() {
        let scope = pipeline(1).listing_scope(RunMode::Sample, Some(3));
        assert_eq!(scope.pages, Some(3));
        assert_eq!(scope.cap, None);

        let scope = pipeline(2).listing_scope(RunMode::Sample, None);
        assert_eq!(scope.pages, None);
        assert_eq!(scope.cap, Some(2));

        let scope = pipeline(2).listing_scope(RunMode::Full, None);
        assert_eq!(scope.cap, None);
    }

    #[tokio::test]
    async fn empty_range_yields_nothing() {
        let source = Arc::new(MockSource::new(Duration::ZERO));
        #[allow(clippy::reversed_empty_ranges)]
        let records = orchestrator(source, 2).run(5..=4).await;
        assert!(records.is_empty());
    }

    #[test]
    fn summary_counts_classifications_of_successes() {
        let records = vec![
            SchoolRecord::success(
                1,
                "u1",
                crate::models::SchoolProfile {
                    classification: Classification::Pei,
                    ..Default::default()
                },
            ),
            SchoolRecord::success(2, "u2", Default::default()),
            SchoolRecord::failure(3, "u3", "HTTP 500"),
            SchoolRecord::failure(4, "u4", "timeout"),
        ];
        let summary = RunSummary::from_records(&records);

        assert_eq!(summary.total, 4);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 2);
        assert!((summary.success_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(summary.classifications.get("PEI"), Some(&1));
        assert_eq!(summary.classifications.get("UNKNOWN"), Some(&1));
    }
}

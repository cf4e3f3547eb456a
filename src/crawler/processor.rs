use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cli::config::CrawlerConfig;
use crate::crawler::pages::{expand_page_urls, PageUrlError};
use crate::crawler::registry::{is_rate_limited, CrawlerRegistry, SiteCrawler};
use crate::crawler::task::{
    apply_outcome, only_cover_image, propagate_attributes, CatalogPageTask, ChapterTask, NovelTask,
    StageTask, TaskKind, TaskStatus,
};
use crate::storage::cache::{get_or_compute, Cache};
use crate::storage::tasks::{TaskFilter, TaskStore};
use crate::utils::metrics::MetricsCollector;

/// Business logic of the three pipeline stages.
///
/// Handlers never fail: whatever goes wrong is logged and mapped to "nothing
/// to forward", the bus message having already been consumed.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Expand the page-range expression of a catalog url
    fn parse_page_urls(&self, site: &str, url: &str) -> Result<Vec<String>, PageUrlError>;

    async fn handle_catalog_page_task(&self, payload: String) -> Vec<NovelTask>;

    async fn handle_novel_task(&self, payload: String) -> Vec<ChapterTask>;

    /// Terminal stage, returns the processed chapter
    async fn handle_chapter_task(&self, payload: String) -> Option<ChapterTask>;
}

/// Cache key of the stored record for `url`
pub fn cache_key(kind: TaskKind, url: &str) -> String {
    format!("crawler:task:{}:{}", kind, url)
}

/// Stage task knowing which crawl method handles it
#[async_trait]
trait StageCrawl: StageTask {
    /// Tasks this stage forwards downstream
    type Child: StageTask;

    async fn crawl(&mut self, crawler: &dyn SiteCrawler, skip_save_if_present: bool) -> Result<Vec<Self::Child>>;
}

#[async_trait]
impl StageCrawl for CatalogPageTask {
    type Child = NovelTask;

    async fn crawl(&mut self, crawler: &dyn SiteCrawler, _skip_save_if_present: bool) -> Result<Vec<NovelTask>> {
        crawler.crawl_catalog_page(self).await
    }
}

#[async_trait]
impl StageCrawl for NovelTask {
    type Child = ChapterTask;

    async fn crawl(&mut self, crawler: &dyn SiteCrawler, skip_save_if_present: bool) -> Result<Vec<ChapterTask>> {
        crawler.crawl_novel_page(self, skip_save_if_present).await
    }
}

#[async_trait]
impl StageCrawl for ChapterTask {
    // chapters have no downstream stage
    type Child = ChapterTask;

    async fn crawl(&mut self, crawler: &dyn SiteCrawler, skip_save_if_present: bool) -> Result<Vec<ChapterTask>> {
        crawler.crawl_chapter_page(self, skip_save_if_present).await?;
        Ok(Vec::new())
    }
}

/// Processor used for every site without a dedicated one
pub struct DefaultTaskProcessor {
    config: Arc<CrawlerConfig>,
    crawlers: Arc<CrawlerRegistry>,
    store: Arc<dyn TaskStore>,
    cache: Arc<dyn Cache>,
    metrics: MetricsCollector,
}

impl DefaultTaskProcessor {
    pub fn new(
        config: Arc<CrawlerConfig>,
        crawlers: Arc<CrawlerRegistry>,
        store: Arc<dyn TaskStore>,
        cache: Arc<dyn Cache>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            config,
            crawlers,
            store,
            cache,
            metrics,
        }
    }

    /// Run one stage handler on `payload`.
    ///
    /// Returns the processed task and what it forwards downstream, or `None`
    /// when the message was dropped before crawling.
    async fn process<T: StageCrawl>(&self, payload: &str) -> Option<(T, Vec<T::Child>)> {
        let mut run = self.metrics.start(T::KIND);

        let mut task: T = match serde_json::from_str(payload) {
            Ok(task) => task,
            Err(e) => {
                warn!(stage = %T::KIND, "Dropping undecodable task: {}", e);
                return None;
            }
        };

        let site = task.site_name().to_string();
        let url = task.url().to_string();
        let settings = self.config.stage_settings(&site, T::KIND);

        if T::KIND == TaskKind::Novel && self.config.crawler.is_excluded_novel(&url) {
            info!(site = %site, url = %url, "Novel is excluded, skipping");
            run.succeed();
            return None;
        }

        let finished = match self.finished_record::<T>(&url).await {
            Ok(finished) => finished,
            Err(e) => {
                error!(site = %site, url = %url, "Dedup lookup failed: {:#}", e);
                return None;
            }
        };

        if finished && settings.skip_if_present {
            info!(site = %site, url = %url, stage = %T::KIND, "Already finished, skipping");
            run.succeed();
            return None;
        }

        let Some(crawler) = self.crawlers.get(&site) else {
            error!(site = %site, url = %url, "No crawler registered for site");
            return None;
        };

        let existing = match self.store.find_one_by_filter(T::KIND, &TaskFilter::Url(url.clone())).await {
            Ok(found) => found.and_then(T::from_task),
            Err(e) => {
                error!(site = %site, url = %url, "Failed to load stored task: {:#}", e);
                return None;
            }
        };

        let crawled = self
            .crawl_with_backoff(&mut task, crawler.as_ref(), settings.skip_save_if_present)
            .await;
        let succeeded = crawled.is_ok();
        let mut children = match crawled {
            Ok(children) => children,
            Err(e) => {
                warn!(site = %site, url = %url, stage = %T::KIND, "Crawl failed: {:#}", e);
                Vec::new()
            }
        };

        apply_outcome(&mut task, existing.as_ref(), succeeded, Utc::now());
        propagate_attributes(task.attributes(), &mut children);

        let cover_only = T::KIND == TaskKind::Novel && only_cover_image(task.attributes());
        if !settings.enabled || cover_only {
            debug!(site = %site, url = %url, "Discarding {} downstream tasks", children.len());
            children.clear();
        }

        if finished && settings.skip_save_if_present {
            debug!(site = %site, url = %url, "Already finished, not saving");
        } else {
            self.save(&mut task).await;
        }

        if succeeded {
            run.succeed();
        }
        Some((task, children))
    }

    /// Whether a finished record exists for `url`, through the dedup cache
    async fn finished_record<T: StageTask>(&self, url: &str) -> Result<bool> {
        let key = cache_key(T::KIND, url);
        let store = Arc::clone(&self.store);

        let record = get_or_compute(self.cache.as_ref(), &key, || async move {
            let found = store
                .find_one_by_filter(T::KIND, &TaskFilter::Url(url.to_string()))
                .await?;
            Ok(match found {
                Some(task) => Some(task.to_json_value()?.to_string()),
                None => None,
            })
        })
        .await?;

        let Some(record) = record else {
            return Ok(false);
        };

        match serde_json::from_str::<T>(&record) {
            Ok(stored) => Ok(stored.status() == TaskStatus::Finished),
            Err(e) => {
                warn!(url = %url, "Ignoring undecodable cached record: {}", e);
                Ok(false)
            }
        }
    }

    async fn crawl_with_backoff<T: StageCrawl>(
        &self,
        task: &mut T,
        crawler: &dyn SiteCrawler,
        skip_save_if_present: bool,
    ) -> Result<Vec<T::Child>> {
        let rate_limit = &self.config.crawler.rate_limit;
        let mut attempt = 0;

        loop {
            match task.crawl(crawler, skip_save_if_present).await {
                Err(e) if is_rate_limited(&e) && attempt < rate_limit.max_retries => {
                    let delay = rate_limit.delay_for(attempt);
                    warn!(
                        url = %task.url(),
                        "Rate limited, retrying in {:?} ({}/{})",
                        delay,
                        attempt + 1,
                        rate_limit.max_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Persist the task and make the saved state visible to the dedup check
    async fn save<T: StageTask>(&self, task: &mut T) {
        match self.store.save(&task.clone().into_task()).await {
            Ok(id) => task.set_id(id),
            Err(e) => {
                error!(url = %task.url(), "Failed to save task: {:#}", e);
                return;
            }
        }

        match serde_json::to_string(task) {
            Ok(json) => {
                if let Err(e) = self.cache.set(&cache_key(T::KIND, task.url()), &json).await {
                    warn!(url = %task.url(), "Failed to refresh dedup cache: {:#}", e);
                }
            }
            Err(e) => warn!(url = %task.url(), "Failed to serialize saved task: {}", e),
        }
    }
}

#[async_trait]
impl TaskProcessor for DefaultTaskProcessor {
    fn parse_page_urls(&self, site: &str, url: &str) -> Result<Vec<String>, PageUrlError> {
        match self.config.site(site).and_then(|site| site.regex_settings.as_ref()) {
            Some(regex) if !regex.parse_page_regex.is_empty() => {
                expand_page_urls(&regex.parse_page_regex, url, &regex.page_prefix, &regex.page_suffix)
            }
            _ => Ok(vec![url.to_string()]),
        }
    }

    async fn handle_catalog_page_task(&self, payload: String) -> Vec<NovelTask> {
        self.process::<CatalogPageTask>(&payload)
            .await
            .map(|(_, novels)| novels)
            .unwrap_or_default()
    }

    async fn handle_novel_task(&self, payload: String) -> Vec<ChapterTask> {
        self.process::<NovelTask>(&payload)
            .await
            .map(|(_, chapters)| chapters)
            .unwrap_or_default()
    }

    async fn handle_chapter_task(&self, payload: String) -> Option<ChapterTask> {
        self.process::<ChapterTask>(&payload).await.map(|(chapter, _)| chapter)
    }
}

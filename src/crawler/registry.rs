use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::crawler::processor::TaskProcessor;
use crate::crawler::task::{CatalogPageTask, ChapterTask, NovelTask};

/// Errors raised by crawl collaborators that callers branch on
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("too many requests")]
    TooManyRequests,

    #[error("crawl service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("crawl service error: {0}")]
    Remote(String),
}

/// Whether a crawl failed because the site throttled us
pub fn is_rate_limited(err: &anyhow::Error) -> bool {
    if matches!(err.downcast_ref::<CrawlError>(), Some(CrawlError::TooManyRequests)) {
        return true;
    }
    err.chain()
        .any(|cause| cause.to_string().to_lowercase().contains("too many requests"))
}

/// Site-specific extraction logic
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SiteCrawler: Send + Sync {
    async fn crawl_home_page(&self, url: &str) -> Result<()>;

    /// Crawl a catalog page, returning the novels listed on it
    async fn crawl_catalog_page(&self, task: &mut CatalogPageTask) -> Result<Vec<NovelTask>>;

    /// Crawl a novel page, returning its chapters
    async fn crawl_novel_page(&self, task: &mut NovelTask, skip_save_if_present: bool) -> Result<Vec<ChapterTask>>;

    async fn crawl_chapter_page(&self, task: &mut ChapterTask, skip_save_if_present: bool) -> Result<()>;
}

/// Site name to crawler, built once at startup
#[derive(Default)]
pub struct CrawlerRegistry {
    crawlers: HashMap<String, Arc<dyn SiteCrawler>>,
}

impl CrawlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, site: &str, crawler: Arc<dyn SiteCrawler>) {
        self.crawlers.insert(site.trim().to_string(), crawler);
    }

    #[cfg(test)]
    pub fn with_crawler(mut self, site: &str, crawler: Arc<dyn SiteCrawler>) -> Self {
        self.register(site, crawler);
        self
    }

    pub fn get(&self, site: &str) -> Option<Arc<dyn SiteCrawler>> {
        self.crawlers.get(site.trim()).cloned()
    }

    pub fn site_count(&self) -> usize {
        self.crawlers.len()
    }
}

/// Site name to task processor, falling back to a default processor
pub struct ProcessorRegistry {
    default: Arc<dyn TaskProcessor>,
    processors: HashMap<String, Arc<dyn TaskProcessor>>,
}

impl ProcessorRegistry {
    pub fn new(default: Arc<dyn TaskProcessor>) -> Self {
        Self {
            default,
            processors: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn register(&mut self, site: &str, processor: Arc<dyn TaskProcessor>) {
        self.processors.insert(site.trim().to_string(), processor);
    }

    /// Processor of `site`, the default one when none is registered
    pub fn resolve(&self, site: &str) -> Arc<dyn TaskProcessor> {
        self.processors
            .get(site.trim())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::pages::PageUrlError;

    struct NamedProcessor(&'static str);

    #[async_trait]
    impl TaskProcessor for NamedProcessor {
        fn parse_page_urls(&self, _site: &str, _url: &str) -> Result<Vec<String>, PageUrlError> {
            Ok(vec![self.0.to_string()])
        }

        async fn handle_catalog_page_task(&self, _payload: String) -> Vec<NovelTask> {
            Vec::new()
        }

        async fn handle_novel_task(&self, _payload: String) -> Vec<ChapterTask> {
            Vec::new()
        }

        async fn handle_chapter_task(&self, _payload: String) -> Option<ChapterTask> {
            None
        }
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(is_rate_limited(&CrawlError::TooManyRequests.into()));
        assert!(is_rate_limited(&anyhow::anyhow!("HTTP 429 Too Many Requests")));
        assert!(is_rate_limited(
            &anyhow::Error::from(CrawlError::TooManyRequests).context("crawling chapter")
        ));
        assert!(!is_rate_limited(&CrawlError::Status { status: 500, body: String::new() }.into()));
        assert!(!is_rate_limited(&anyhow::anyhow!("connection reset")));
    }

    #[test]
    fn test_crawler_lookup() {
        let registry = CrawlerRegistry::new().with_crawler("nsf ", Arc::new(MockSiteCrawler::new()));

        assert_eq!(registry.site_count(), 1);
        assert!(registry.get("nsf").is_some());
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn test_processor_fallback() {
        let mut registry = ProcessorRegistry::new(Arc::new(NamedProcessor("default")));
        registry.register("nsf", Arc::new(NamedProcessor("nsf")));

        let parse = |site: &str| registry.resolve(site).parse_page_urls(site, "u").unwrap();
        assert_eq!(parse("nsf"), vec!["nsf"]);
        assert_eq!(parse("other"), vec!["default"]);
        assert_eq!(parse(""), vec!["default"]);
    }
}

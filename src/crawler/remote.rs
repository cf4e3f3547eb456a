use anyhow::{Result, Context};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Serialize, Deserialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::crawler::registry::{CrawlError, SiteCrawler};
use crate::crawler::task::{CatalogPageTask, ChapterTask, NovelTask, StageTask};

#[derive(Debug, Clone, Serialize)]
struct HomePageRequest<'a> {
    url: &'a str,
}

/// Reply of the extraction service
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned, C: DeserializeOwned"))]
struct CrawlServiceResponse<T, C> {
    /// Task as updated by the service
    #[serde(default)]
    task: Option<T>,

    /// Tasks discovered for the next stage
    #[serde(default)]
    tasks: Vec<C>,

    #[serde(default)]
    error: Option<String>,
}

/// Extraction service with no downstream tasks to report
#[derive(Debug, Clone, Deserialize)]
struct Unit {}

/// Crawls a site by delegating extraction to a remote HTTP service
pub struct RemoteSiteCrawler {
    client: Client,
    base_url: String,
}

impl RemoteSiteCrawler {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B, T, C>(&self, path: &str, skip_save_if_present: Option<bool>, body: &B) -> Result<CrawlServiceResponse<T, C>>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
        C: DeserializeOwned,
    {
        let endpoint = format!("{}/{}", self.base_url, path);
        let mut request = self.client.post(&endpoint).json(body);
        if let Some(skip) = skip_save_if_present {
            request = request.query(&[("skipSaveIfPresent", skip)]);
        }

        debug!("Sending request to crawl service: {}", endpoint);

        let response = request
            .send()
            .await
            .context(format!("Failed to send request to crawl service: {}", endpoint))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CrawlError::TooManyRequests.into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrawlError::Status { status: status.as_u16(), body }.into());
        }

        let reply = response
            .json::<CrawlServiceResponse<T, C>>()
            .await
            .context("Failed to parse crawl service response")?;

        if let Some(message) = &reply.error {
            error!("Crawl service error: {}", message);
            return Err(CrawlError::Remote(message.clone()).into());
        }

        Ok(reply)
    }

    async fn crawl<T: StageTask, C: DeserializeOwned>(
        &self,
        path: &str,
        task: &mut T,
        skip_save_if_present: Option<bool>,
    ) -> Result<Vec<C>> {
        let reply = self.post::<T, T, C>(path, skip_save_if_present, &*task).await?;

        if let Some(mut updated) = reply.task {
            if updated.id().is_none() {
                if let Some(id) = task.id() {
                    updated.set_id(id);
                }
            }
            *task = updated;
        }

        debug!("Successfully crawled URL: {}", task.url());
        Ok(reply.tasks)
    }
}

#[async_trait]
impl SiteCrawler for RemoteSiteCrawler {
    async fn crawl_home_page(&self, url: &str) -> Result<()> {
        self.post::<_, Unit, Unit>("home", None, &HomePageRequest { url }).await?;
        Ok(())
    }

    async fn crawl_catalog_page(&self, task: &mut CatalogPageTask) -> Result<Vec<NovelTask>> {
        self.crawl("catalog-page", task, None).await
    }

    async fn crawl_novel_page(&self, task: &mut NovelTask, skip_save_if_present: bool) -> Result<Vec<ChapterTask>> {
        self.crawl("novel", task, Some(skip_save_if_present)).await
    }

    async fn crawl_chapter_page(&self, task: &mut ChapterTask, skip_save_if_present: bool) -> Result<()> {
        self.crawl::<_, Unit>("chapter", task, Some(skip_save_if_present)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::registry::is_rate_limited;
    use crate::crawler::task::Resource;
    use mongodb::bson::oid::ObjectId;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn novel() -> NovelTask {
        NovelTask {
            id: Some(ObjectId::new()),
            url: "https://nsf.com/novel/1".to_string(),
            site_name: "nsf".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_novel_page_updates_task_and_returns_chapters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/novel"))
            .and(query_param("skipSaveIfPresent", "false"))
            .and(body_partial_json(json!({ "url": "https://nsf.com/novel/1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task": { "url": "https://nsf.com/novel/1", "siteName": "nsf", "name": "A Novel", "hasChapters": true },
                "tasks": [
                    { "url": "https://nsf.com/novel/1/1", "siteName": "nsf", "order": 1 },
                    { "url": "https://nsf.com/novel/1/2", "siteName": "nsf", "order": 2 }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let crawler = RemoteSiteCrawler::new(&format!("{}/", server.uri())).unwrap();
        let mut task = novel();
        let id = task.id;

        let chapters = crawler.crawl_novel_page(&mut task, false).await.unwrap();

        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1].order, 2);
        assert_eq!(task.name, "A Novel");
        assert!(task.has_chapters);
        assert_eq!(task.id, id);
    }

    #[tokio::test]
    async fn test_too_many_requests_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chapter"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let crawler = RemoteSiteCrawler::new(&server.uri()).unwrap();
        let mut chapter = ChapterTask {
            url: "https://nsf.com/novel/1/1".to_string(),
            ..Default::default()
        };

        let err = crawler.crawl_chapter_page(&mut chapter, true).await.unwrap_err();
        assert!(is_rate_limited(&err));
        assert_eq!(chapter.url(), "https://nsf.com/novel/1/1");
    }

    #[tokio::test]
    async fn test_error_status_and_service_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/catalog-page"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/home"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "error": "selector not found" })))
            .mount(&server)
            .await;

        let crawler = RemoteSiteCrawler::new(&server.uri()).unwrap();

        let mut page = CatalogPageTask::default();
        let err = crawler.crawl_catalog_page(&mut page).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CrawlError>(),
            Some(CrawlError::Status { status: 502, .. })
        ));

        let err = crawler.crawl_home_page("https://nsf.com").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<CrawlError>(), Some(CrawlError::Remote(_))));
    }
}

use anyhow::{Result, Context};
use mongodb::bson::oid::ObjectId;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::config::CrawlerConfig;
use crate::crawler::task::CatalogPageTask;
use crate::crawler::{
    CrawlerRegistry, DefaultTaskProcessor, PipelineController, ProcessorRegistry, RemoteSiteCrawler, TaskProcessor,
};
use crate::storage::queue::MessageBus;
use crate::storage::{MongoTaskStore, RedisCache, RedisStreamBus};
use crate::stream::gen_stream_task_params;
use crate::utils::MetricsCollector;

/// Catalog pages to submit
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub url: String,
    pub site: String,
    pub catalog_id: Option<String>,
    pub attributes: HashMap<String, Value>,
}

/// Connected collaborators shared by the commands
struct Services {
    bus: Arc<dyn MessageBus>,
    processors: Arc<ProcessorRegistry>,
    metrics: MetricsCollector,
}

impl Services {
    async fn connect(config: &Arc<CrawlerConfig>) -> Result<Self> {
        let redis = redis::Client::open(config.storage.redis_url.as_str())
            .context(format!("Invalid Redis URL: {}", config.storage.redis_url))?;

        let bus = Arc::new(RedisStreamBus::new(redis.clone(), &config.streams).await?);
        let cache = Arc::new(RedisCache::new(&redis, config.storage.dedup_cache_ttl).await?);

        let store = Arc::new(MongoTaskStore::new(&config.storage).await?);
        store.ensure_indexes().await;

        let crawlers = Arc::new(build_crawlers(config)?);
        let metrics = MetricsCollector::new();
        let default = Arc::new(DefaultTaskProcessor::new(
            config.clone(),
            crawlers,
            store,
            cache,
            metrics.clone(),
        ));

        Ok(Self {
            bus,
            processors: Arc::new(ProcessorRegistry::new(default)),
            metrics,
        })
    }
}

/// A remote crawler for every site with an extraction endpoint
fn build_crawlers(config: &CrawlerConfig) -> Result<CrawlerRegistry> {
    let mut crawlers = CrawlerRegistry::new();

    for site in &config.web_sites {
        match &site.crawler_endpoint {
            Some(endpoint) => {
                let crawler = RemoteSiteCrawler::new(endpoint)
                    .context(format!("Failed to create crawler for site {}", site.name))?;
                crawlers.register(&site.name, Arc::new(crawler));
            }
            None => warn!("Site {} has no crawler endpoint, its tasks will be dropped", site.name),
        }
    }

    info!("Registered {} site crawlers", crawlers.site_count());
    Ok(crawlers)
}

/// Run the global pipeline and every isolated site pipeline until Ctrl-C
pub async fn serve(config: CrawlerConfig) -> Result<()> {
    let config = Arc::new(config);
    let services = Services::connect(&config).await?;
    let cancel = CancellationToken::new();

    let controller = PipelineController::new(
        config.clone(),
        services.bus.clone(),
        services.processors.clone(),
        cancel.clone(),
    );

    controller.launch_global_pipeline().await?;
    for site in config.web_sites.iter().filter(|site| site.use_separate_space) {
        controller.launch_site_pipeline(&site.name).await?;
    }

    let reporter = spawn_metrics_reporter(
        services.metrics.clone(),
        Duration::from_secs(config.crawler.metrics_interval_secs.max(1)),
        cancel.clone(),
    );

    info!("Pipelines running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    controller.shutdown().await;
    let _ = reporter.await;

    let metrics = services.metrics.get_metrics();
    info!("Final stage metrics: {}", serde_json::to_string(&metrics).unwrap_or_default());
    Ok(())
}

fn spawn_metrics_reporter(metrics: MetricsCollector, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let snapshot = metrics.get_metrics();
                    info!(
                        catalog_page = ?snapshot.catalog_page,
                        novel = ?snapshot.novel,
                        chapter = ?snapshot.chapter,
                        "Stage metrics"
                    );
                }
            }
        }
    })
}

/// Expand the catalog url and publish one catalog page task per page
pub async fn submit(config: CrawlerConfig, request: SubmitRequest) -> Result<()> {
    let config = Arc::new(config);
    let services = Services::connect(&config).await?;
    let processor = services.processors.resolve(&request.site);

    let submitted = submit_catalog_pages(services.bus.as_ref(), processor.as_ref(), &config, &request).await?;
    info!("Submitted {} catalog pages for site {}", submitted, request.site);
    Ok(())
}

async fn submit_catalog_pages(
    bus: &dyn MessageBus,
    processor: &dyn TaskProcessor,
    config: &CrawlerConfig,
    request: &SubmitRequest,
) -> Result<usize> {
    if request.url.trim().is_empty() {
        warn!("Skipping empty catalog url");
        return Ok(0);
    }

    let catalog_id = request
        .catalog_id
        .as_deref()
        .map(ObjectId::parse_str)
        .transpose()
        .context("Invalid catalog id")?;

    let urls = processor
        .parse_page_urls(&request.site, &request.url)
        .context(format!("Failed to expand catalog url {}", request.url))?;

    let stream = gen_stream_task_params(&request.site, config).catalog_page.stream;
    let mut submitted = 0;

    for url in urls {
        if url.trim().is_empty() {
            warn!("Skipping empty page url expanded from {}", request.url);
            continue;
        }

        let task = CatalogPageTask {
            catalog_id,
            url,
            site_name: request.site.clone(),
            attributes: request.attributes.clone(),
            ..Default::default()
        };
        let payload = serde_json::to_string(&task).context("Failed to serialize catalog page task")?;

        bus.publish(&stream, &payload)
            .await
            .context(format!("Failed to submit {}", task.url))?;
        submitted += 1;
    }

    Ok(submitted)
}

/// Show the effective configuration, or write it to `output`
pub fn show_config(config: &CrawlerConfig, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            config.save_to_file(path)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            let contents = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
            println!("Current configuration:");
            println!("{}", contents);
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, error};

use crate::cli::config::CrawlerConfig;
use crate::crawler::registry::ProcessorRegistry;
use crate::crawler::task::TaskKind;
use crate::storage::queue::MessageBus;
use crate::stream::{gen_stream_task_params, Delivery, FlatMap, IgnoreSink, Map, StreamSink, StreamSource, StreamTaskParams};

/// Running stages of one site
pub struct SitePipeline {
    pub site: String,
    pub params: StreamTaskParams,
    stages: Mutex<Vec<JoinHandle<()>>>,
}

/// Builds and owns the per-site pipelines
pub struct PipelineController {
    config: Arc<CrawlerConfig>,
    bus: Arc<dyn MessageBus>,
    processors: Arc<ProcessorRegistry>,
    cancel: CancellationToken,

    /// Launched pipelines, keyed by trimmed site name ("" is the global one)
    pipelines: RwLock<HashMap<String, Arc<SitePipeline>>>,

    /// Serializes pipeline construction
    launching: tokio::sync::Mutex<()>,
}

impl PipelineController {
    pub fn new(
        config: Arc<CrawlerConfig>,
        bus: Arc<dyn MessageBus>,
        processors: Arc<ProcessorRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            bus,
            processors,
            cancel,
            pipelines: RwLock::new(HashMap::new()),
            launching: tokio::sync::Mutex::new(()),
        }
    }

    /// Launch the pipeline over the shared streams
    pub async fn launch_global_pipeline(&self) -> Result<Arc<SitePipeline>> {
        self.launch_site_pipeline("").await
    }

    /// Launch the pipeline of `site`, at most once per controller.
    ///
    /// All three sources are opened before any stage starts, so a failure
    /// leaves nothing running and the site can be launched again later.
    pub async fn launch_site_pipeline(&self, site: &str) -> Result<Arc<SitePipeline>> {
        let site = site.trim();
        if let Some(pipeline) = self.launched(site) {
            return Ok(pipeline);
        }

        let _guard = self.launching.lock().await;
        if let Some(pipeline) = self.launched(site) {
            return Ok(pipeline);
        }

        let params = gen_stream_task_params(site, &self.config);
        let processor = self.processors.resolve(site);
        let streams = &self.config.streams;
        let parallelism = |kind| self.config.crawler.parallelism(kind);

        let failed = || format!("Failed to launch pipeline for site '{}'", site);
        let catalog_page = StreamSource::open(self.bus.clone(), &params.catalog_page, streams)
            .await
            .with_context(failed)?;
        let novel = StreamSource::open(self.bus.clone(), &params.novel, streams)
            .await
            .with_context(failed)?;
        let chapter = StreamSource::open(self.bus.clone(), &params.chapter, streams)
            .await
            .with_context(failed)?;

        let catalog_stage = {
            let processor = processor.clone();
            catalog_page
                .start(self.cancel.clone())
                .via(FlatMap::new(
                    move |delivery: Delivery| {
                        let processor = processor.clone();
                        async move { delivery.process(|payload| processor.handle_catalog_page_task(payload)).await }
                    },
                    parallelism(TaskKind::CatalogPage),
                ))
                .to(StreamSink::new(self.bus.clone(), &params.novel.stream))
        };

        let novel_stage = {
            let processor = processor.clone();
            novel
                .start(self.cancel.clone())
                .via(FlatMap::new(
                    move |delivery: Delivery| {
                        let processor = processor.clone();
                        async move { delivery.process(|payload| processor.handle_novel_task(payload)).await }
                    },
                    parallelism(TaskKind::Novel),
                ))
                .to(StreamSink::new(self.bus.clone(), &params.chapter.stream))
        };

        let chapter_stage = chapter
            .start(self.cancel.clone())
            .via(Map::new(
                move |delivery: Delivery| {
                    let processor = processor.clone();
                    async move { delivery.process(|payload| processor.handle_chapter_task(payload)).await }
                },
                parallelism(TaskKind::Chapter),
            ))
            .to(IgnoreSink);

        let pipeline = Arc::new(SitePipeline {
            site: site.to_string(),
            params,
            stages: Mutex::new(vec![catalog_stage, novel_stage, chapter_stage]),
        });

        let names = &pipeline.params;
        info!(
            "Launched pipeline for {} on {}, {}, {}",
            if site.is_empty() { "global space" } else { site },
            names.catalog_page.stream,
            names.novel.stream,
            names.chapter.stream
        );

        self.pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(site.to_string(), pipeline.clone());

        Ok(pipeline)
    }

    fn launched(&self, site: &str) -> Option<Arc<SitePipeline>> {
        self.pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(site)
            .cloned()
    }

    #[cfg(test)]
    pub fn is_launched(&self, site: &str) -> bool {
        self.launched(site.trim()).is_some()
    }

    /// Stop every source and wait for in-flight handlers to drain
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let pipelines: Vec<Arc<SitePipeline>> = self
            .pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for pipeline in pipelines {
            let stages = std::mem::take(&mut *pipeline.stages.lock().unwrap_or_else(PoisonError::into_inner));
            for stage in stages {
                if let Err(e) = stage.await {
                    error!("Pipeline stage of '{}' failed: {}", pipeline.site, e);
                }
            }
        }

        info!("All pipelines stopped");
    }
}

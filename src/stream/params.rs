use crate::cli::config::CrawlerConfig;

const CATALOG_PAGE_STREAM: &str = "CatalogPageUrlStream";
const NOVEL_STREAM: &str = "NovelUrlStream";
const CHAPTER_STREAM: &str = "ChapterUrlStream";
const CONSUMER_SUFFIX: &str = "Consumer";

/// Stream and consumer-group name of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStream {
    pub stream: String,
    pub group: String,
}

/// Streams a site's pipeline reads from and publishes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTaskParams {
    pub catalog_page: StageStream,
    pub novel: StageStream,
    pub chapter: StageStream,
}

impl StreamTaskParams {
    /// Names shared by every site without its own space
    pub fn global() -> Self {
        Self::with_suffix("")
    }

    fn with_suffix(suffix: &str) -> Self {
        let stage = |base: &str| StageStream {
            stream: format!("{}{}", base, suffix),
            group: format!("{}{}{}", base, CONSUMER_SUFFIX, suffix),
        };

        Self {
            catalog_page: stage(CATALOG_PAGE_STREAM),
            novel: stage(NOVEL_STREAM),
            chapter: stage(CHAPTER_STREAM),
        }
    }
}

/// Resolve the stream names of `site_name`.
///
/// A site configured with `useSeparateSpace` gets every name suffixed with
/// `_<site>`; an empty or unknown site, or one sharing the global space, gets
/// the global names.
pub fn gen_stream_task_params(site_name: &str, config: &CrawlerConfig) -> StreamTaskParams {
    let site_name = site_name.trim();
    if site_name.is_empty() {
        return StreamTaskParams::global();
    }

    match config.site(site_name) {
        Some(site) if site.use_separate_space => StreamTaskParams::with_suffix(&format!("_{}", site_name)),
        _ => StreamTaskParams::global(),
    }
}

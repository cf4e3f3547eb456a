use anyhow::{Result, Context};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use tracing::{info, debug, error};

use crate::crawler::task::TaskKind;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlerConfig {
    pub storage: StorageSettings,
    pub streams: StreamSettings,
    pub crawler: CrawlerSettings,
    pub web_sites: Vec<SiteConfig>,
}

/// Redis and MongoDB connection settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub redis_url: String,
    pub mongo_url: String,
    pub database_name: String,
    pub dedup_cache_ttl: u64, // Lifetime of dedup cache entries in seconds
}

/// Consumer-group read settings shared by every stream source
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    pub consumer_name: String,
    pub read_count: usize,
    pub block_millis: u64,
    pub channel_capacity: usize,
}

/// Pipeline-wide crawler settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlerSettings {
    pub catalog_page_task_parallelism: usize,
    pub novel_task_parallelism: usize,
    pub chapter_task_parallelism: usize,
    pub excluded_novel_urls: Vec<String>,
    pub rate_limit: RateLimitSettings,
    pub metrics_interval_secs: u64,
}

/// Backoff applied when a crawl is rejected for sending too many requests
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub max_retries: u32,
    pub base_delay_millis: u64,
    pub max_delay_millis: u64,
    pub jitter: bool,
}

/// Per-site settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
    pub name: String,

    /// Give this site its own streams and consumer groups
    #[serde(default)]
    pub use_separate_space: bool,

    /// Base URL of the extraction service crawling this site
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_settings: Option<RegexSettings>,

    #[serde(default)]
    pub crawler_settings: SiteCrawlerSettings,
}

/// Pagination rule expanding page-range urls
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RegexSettings {
    pub parse_page_regex: String,
    pub page_prefix: String,
    pub page_suffix: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SiteCrawlerSettings {
    pub catalog_page: StageSettings,
    pub novel: StageSettings,
    pub chapter: StageSettings,
}

/// Dedup and forwarding policy of one stage
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StageSettings {
    /// Do not crawl again when a finished record exists
    #[serde(default = "default_true")]
    pub skip_if_present: bool,

    /// Do not persist again when a finished record exists
    #[serde(default = "default_true")]
    pub skip_save_if_present: bool,

    /// Forward this stage's output downstream
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            skip_if_present: true,
            skip_save_if_present: true,
            enabled: true,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            mongo_url: "mongodb://localhost:27017".to_string(),
            database_name: "crawlers".to_string(),
            dedup_cache_ttl: 86400,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            consumer_name: "crawler-1".to_string(),
            read_count: 10,
            block_millis: 2000,
            channel_capacity: 64,
        }
    }
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            catalog_page_task_parallelism: 1,
            novel_task_parallelism: 4,
            chapter_task_parallelism: 8,
            excluded_novel_urls: vec![],
            rate_limit: RateLimitSettings::default(),
            metrics_interval_secs: 60,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_millis: 3000,
            max_delay_millis: 30000,
            jitter: true,
        }
    }
}

impl CrawlerSettings {
    /// Maximum in-flight handler invocations for a stage
    pub fn parallelism(&self, kind: TaskKind) -> usize {
        match kind {
            TaskKind::CatalogPage => self.catalog_page_task_parallelism,
            TaskKind::Novel => self.novel_task_parallelism,
            TaskKind::Chapter => self.chapter_task_parallelism,
        }
    }

    pub fn is_excluded_novel(&self, url: &str) -> bool {
        self.excluded_novel_urls.iter().any(|excluded| excluded == url)
    }
}

impl RateLimitSettings {
    /// Sleep before retry number `attempt` (zero based): `base * 2^attempt`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let mut millis = self.base_delay_millis.saturating_mul(factor).min(self.max_delay_millis);

        if self.jitter && millis > 0 {
            let scale: f64 = rand::thread_rng().gen_range(0.8..=1.2);
            millis = ((millis as f64) * scale) as u64;
        }

        Duration::from_millis(millis)
    }
}

impl SiteCrawlerSettings {
    pub fn stage(&self, kind: TaskKind) -> StageSettings {
        match kind {
            TaskKind::CatalogPage => self.catalog_page,
            TaskKind::Novel => self.novel,
            TaskKind::Chapter => self.chapter,
        }
    }
}

impl SiteConfig {
    pub fn stage_settings(&self, kind: TaskKind) -> StageSettings {
        self.crawler_settings.stage(kind)
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "crawl-pipeline", "crawl-pipeline") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Load the configuration at `path`, or the default one when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_default()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// Settings of the site called `name`
    pub fn site(&self, name: &str) -> Option<&SiteConfig> {
        self.web_sites.iter().find(|site| site.name == name)
    }

    /// Stage settings of a site, all-default when the site is unknown
    pub fn stage_settings(&self, site: &str, kind: TaskKind) -> StageSettings {
        self.site(site)
            .map(|site| site.stage_settings(kind))
            .unwrap_or_default()
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.storage.redis_url.trim().is_empty() {
            anyhow::bail!("storage.redisUrl must not be empty");
        }
        if self.storage.mongo_url.trim().is_empty() {
            anyhow::bail!("storage.mongoUrl must not be empty");
        }

        for kind in TaskKind::ALL {
            if self.crawler.parallelism(kind) == 0 {
                anyhow::bail!("{} task parallelism must be at least 1", kind);
            }
        }

        if self.streams.channel_capacity == 0 {
            anyhow::bail!("streams.channelCapacity must be at least 1");
        }

        let mut names = HashSet::new();
        for site in &self.web_sites {
            if site.name.trim().is_empty() {
                anyhow::bail!("webSites entries must have a name");
            }
            if !names.insert(site.name.as_str()) {
                anyhow::bail!("Site '{}' is configured more than once", site.name);
            }
            if let Some(regex) = &site.regex_settings {
                regex::Regex::new(&regex.parse_page_regex)
                    .context(format!("Invalid parsePageRegex for site '{}'", site.name))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
storage:
  redisUrl: redis://cache:6379
crawler:
  novelTaskParallelism: 2
  excludedNovelUrls: ["https://nsf.com/novel/banned"]
webSites:
  - name: nsf
    useSeparateSpace: true
    regexSettings: { parsePageRegex: '([^/]+)\.html', pagePrefix: '', pageSuffix: '.html' }
    crawlerSettings:
      novel: { skipIfPresent: false }
      chapter: { enabled: false, skipSaveIfPresent: false }
"#;

    fn sample() -> CrawlerConfig {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = sample();

        assert_eq!(config.storage.redis_url, "redis://cache:6379");
        assert_eq!(config.storage.mongo_url, "mongodb://localhost:27017");
        assert_eq!(config.crawler.parallelism(TaskKind::Novel), 2);
        assert_eq!(config.crawler.parallelism(TaskKind::Chapter), 8);
        assert_eq!(config.crawler.rate_limit.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stage_settings_resolution() {
        let config = sample();

        assert_eq!(config.stage_settings("nsf", TaskKind::CatalogPage), StageSettings::default());

        let novel = config.stage_settings("nsf", TaskKind::Novel);
        assert!(!novel.skip_if_present);
        assert!(novel.skip_save_if_present);
        assert!(novel.enabled);

        let chapter = config.stage_settings("nsf", TaskKind::Chapter);
        assert!(chapter.skip_if_present);
        assert!(!chapter.skip_save_if_present);
        assert!(!chapter.enabled);

        assert_eq!(config.stage_settings("unknown", TaskKind::Novel), StageSettings::default());
    }

    #[test]
    fn test_excluded_novel_urls() {
        let config = sample();
        assert!(config.crawler.is_excluded_novel("https://nsf.com/novel/banned"));
        assert!(!config.crawler.is_excluded_novel("https://nsf.com/novel/other"));
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mut config = sample();
        config.crawler.chapter_task_parallelism = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.web_sites.push(config.web_sites[0].clone());
        assert!(config.validate().is_err());

        let mut config = sample();
        config.web_sites[0].regex_settings = Some(RegexSettings {
            parse_page_regex: "(unclosed".to_string(),
            ..Default::default()
        });
        assert!(config.validate().is_err());

        let mut config = sample();
        config.storage.mongo_url = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let rate_limit = RateLimitSettings {
            max_retries: 5,
            base_delay_millis: 100,
            max_delay_millis: 350,
            jitter: false,
        };

        assert_eq!(rate_limit.delay_for(0), Duration::from_millis(100));
        assert_eq!(rate_limit.delay_for(1), Duration::from_millis(200));
        assert_eq!(rate_limit.delay_for(2), Duration::from_millis(350));
        assert_eq!(rate_limit.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let rate_limit = RateLimitSettings {
            base_delay_millis: 1000,
            max_delay_millis: 1000,
            ..Default::default()
        };

        for _ in 0..20 {
            let delay = rate_limit.delay_for(0).as_millis();
            assert!((800..=1200).contains(&delay), "delay {} out of band", delay);
        }
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir()
            .join(format!("crawl-pipeline-config-{}", std::process::id()))
            .join("config.yaml");

        let config = sample();
        config.save_to_file(&path).unwrap();
        let loaded = CrawlerConfig::load(Some(&path)).unwrap();

        assert_eq!(loaded.web_sites.len(), 1);
        assert_eq!(loaded.web_sites[0].name, "nsf");
        assert!(loaded.web_sites[0].use_separate_space);
        assert!(!loaded.stage_settings("nsf", TaskKind::Chapter).enabled);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}

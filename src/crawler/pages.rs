use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::{NoExpand, Regex};
use thiserror::Error;
use tracing::debug;

/// Errors raised while expanding a page-range URL
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageUrlError {
    #[error("invalid page pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid page parameter '{0}'")]
    InvalidPageParameter(String),
}

/// Compiled page patterns, shared by every caller in the process
fn regex_cache() -> &'static RwLock<HashMap<String, Regex>> {
    static CACHE: OnceLock<RwLock<HashMap<String, Regex>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn compiled(pattern: &str) -> Result<Regex, PageUrlError> {
    if let Ok(cache) = regex_cache().read() {
        if let Some(regex) = cache.get(pattern) {
            return Ok(regex.clone());
        }
    }

    let regex = Regex::new(pattern).map_err(|e| PageUrlError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    if let Ok(mut cache) = regex_cache().write() {
        cache.insert(pattern.to_string(), regex.clone());
    }
    Ok(regex)
}

/// Most pages one expression may expand to
pub const MAX_PAGES: usize = 10_000;

/// Parse `1,2-8` style page expressions into page numbers, ranges ascending
fn parse_pages(spec: &str) -> Result<Vec<u32>, PageUrlError> {
    let invalid = || PageUrlError::InvalidPageParameter(spec.to_string());
    let mut pages = Vec::new();

    for item in spec.split(',') {
        if item.is_empty() {
            return Err(invalid());
        }

        let bounds: Vec<&str> = item.split('-').collect();
        match bounds.as_slice() {
            [single] => {
                if pages.len() >= MAX_PAGES {
                    return Err(invalid());
                }
                pages.push(single.parse::<u32>().map_err(|_| invalid())?);
            }
            [start, end] => {
                let start = start.parse::<u32>().map_err(|_| invalid())?;
                let end = end.parse::<u32>().map_err(|_| invalid())?;
                if start > end || (end - start) as usize >= MAX_PAGES - pages.len() {
                    return Err(invalid());
                }
                pages.extend(start..=end);
            }
            _ => return Err(invalid()),
        }
    }

    Ok(pages)
}

/// Expand the page-range expression captured by `pattern` inside `url`.
///
/// The pattern must have one capturing group around the page expression.
/// When it does not match, `url` is returned unchanged. Otherwise the matched
/// region is replaced by `prefix + page + suffix` for every page, in the order
/// the expression lists them.
pub fn expand_page_urls(
    pattern: &str,
    url: &str,
    prefix: &str,
    suffix: &str,
) -> Result<Vec<String>, PageUrlError> {
    let regex = compiled(pattern)?;

    let spec = match regex.captures(url).and_then(|caps| caps.get(1)) {
        Some(group) => group.as_str(),
        None => return Ok(vec![url.to_string()]),
    };

    let pages = parse_pages(spec)?;
    debug!("Expanding {} into {} page urls", url, pages.len());

    Ok(pages
        .into_iter()
        .map(|page| {
            let replacement = format!("{}{}{}", prefix, page, suffix);
            regex.replace_all(url, NoExpand(&replacement)).into_owned()
        })
        .collect())
}

//! Source adapter contracts and the static (site, domain) registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use otb_core::{Domain, MatchKey, ScrapedRecord, Site, SyncTarget, TournamentMatchStrategy};
use otb_storage::{FetchError, FormTransport};
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cbx;
pub mod fide;
pub mod webforms;

pub use webforms::{DriverOptions, FilterMode, FilterPost, HiddenFields, PageExtraction, PageExtractor, PaginationDriver};

pub const CRATE_NAME: &str = "otb-adapters";

pub const DEFAULT_CBX_BASE_URL: &str = "https://www.cbx.org.br";
pub const DEFAULT_FIDE_BASE_URL: &str = "https://ratings.fide.com";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Filter parameters accepted by the `fetch_raw` entry points. Each adapter reads
/// the subset that applies to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub state: Option<String>,
    pub max_pages: Option<u32>,
    pub limit: Option<usize>,
    pub countries: Vec<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub records: Vec<ScrapedRecord>,
    /// Page identifiers that exhausted their retries. Diagnostic only.
    pub failed_pages: Vec<String>,
    pub row_errors: usize,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn target(&self) -> SyncTarget;

    fn match_keys(&self, record: &ScrapedRecord, strategy: &TournamentMatchStrategy) -> Vec<MatchKey> {
        record.match_keys(strategy)
    }

    /// Fatal only when the source cannot be reached at all; page-level failures
    /// are reported through [`FetchOutcome::failed_pages`].
    async fn fetch_raw(
        &self,
        transport: Arc<dyn FormTransport>,
        request: &FetchRequest,
    ) -> Result<FetchOutcome, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub cbx_base_url: String,
    pub fide_base_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            cbx_base_url: DEFAULT_CBX_BASE_URL.to_string(),
            fide_base_url: DEFAULT_FIDE_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    pub endpoints: Endpoints,
    pub driver: DriverOptions,
}

impl AdapterConfig {
    /// Zero delays; for tests and `--dry-run` against local fixtures.
    pub fn immediate(endpoints: Endpoints) -> Self {
        Self {
            endpoints,
            driver: DriverOptions {
                page_attempts: 3,
                page_retry_delay: Duration::ZERO,
                page_pause: Duration::ZERO,
            },
        }
    }
}

pub fn adapter_for(target: SyncTarget, config: &AdapterConfig) -> Option<Box<dyn SourceAdapter>> {
    let cbx_base = config.endpoints.cbx_base_url.trim_end_matches('/').to_string();
    match (target.site, target.domain) {
        (Site::Cbx, Domain::Tournaments) => Some(Box::new(cbx::CbxTournaments::new(cbx_base, config.driver.clone()))),
        (Site::Cbx, Domain::Players) => Some(Box::new(cbx::CbxPlayers::new(cbx_base, config.driver.clone()))),
        (Site::Cbx, Domain::News) => Some(Box::new(cbx::CbxNews::new(cbx_base, config.driver.clone()))),
        (Site::Cbx, Domain::Announcements) => {
            Some(Box::new(cbx::CbxAnnouncements::new(cbx_base, config.driver.clone())))
        }
        (Site::Fide, Domain::Tournaments) => Some(Box::new(fide::FideTournaments::new(
            config.endpoints.fide_base_url.trim_end_matches('/'),
        ))),
        (Site::Fide, _) => None,
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Trimmed text content with inner whitespace runs collapsed.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

pub(crate) fn select_first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(element_text(n))))
}

pub(crate) fn select_first_attr(scope: ElementRef<'_>, css: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

pub(crate) fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `"ID: 1234"` → `"1234"`. Text without a colon is returned trimmed.
pub fn after_colon(value: &str) -> String {
    match value.split_once(':') {
        Some((_, rest)) => rest.trim().to_string(),
        None => value.trim().to_string(),
    }
}

/// Resolves a site-relative href against `base`. Absolute URLs pass through.
pub fn absolutize(base: &str, href: &str) -> String {
    let href = href.trim();
    let base = base.trim_end_matches('/');
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if let Some(rest) = href.strip_prefix("//") {
        format!("https://{rest}")
    } else if href.starts_with('/') {
        format!("{base}{href}")
    } else {
        format!("{base}/{href}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_colon_strips_the_label() {
        assert_eq!(after_colon("ID: 1234"), "1234");
        assert_eq!(after_colon("Local: Recife: PE"), "Recife: PE");
        assert_eq!(after_colon("  sem rótulo "), "sem rótulo");
    }

    #[test]
    fn absolutize_keeps_absolute_and_joins_relative() {
        let base = "https://www.cbx.org.br/";
        assert_eq!(absolutize(base, "/noticia/1"), "https://www.cbx.org.br/noticia/1");
        assert_eq!(absolutize(base, "noticia/1"), "https://www.cbx.org.br/noticia/1");
        assert_eq!(absolutize(base, "https://x.org/a"), "https://x.org/a");
        assert_eq!(absolutize(base, "//cdn.cbx.org.br/a.pdf"), "https://cdn.cbx.org.br/a.pdf");
    }

    #[test]
    fn registry_resolves_every_supported_target() {
        let config = AdapterConfig::default();
        for domain in Domain::ALL {
            let adapter = adapter_for(SyncTarget::cbx(domain), &config).expect("cbx adapter");
            assert_eq!(adapter.target(), SyncTarget::cbx(domain));
        }
        let fide = adapter_for(SyncTarget::fide_tournaments(), &config).expect("fide adapter");
        assert_eq!(fide.target(), SyncTarget::fide_tournaments());
        assert!(adapter_for(SyncTarget::new(Site::Fide, Domain::News), &config).is_none());
    }
}

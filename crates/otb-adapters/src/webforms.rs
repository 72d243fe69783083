//! ASP.NET WebForms postback protocol: hidden form state, page discovery and the
//! pagination walk shared by every CBX listing.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::LazyLock;
use std::time::Duration;

use otb_core::ScrapedRecord;
use otb_storage::FormTransport;
use regex::Regex;
use scraper::Html;
use tracing::{debug, info, warn};

use crate::{selector, AdapterError, FetchOutcome};

pub const VIEWSTATE: &str = "__VIEWSTATE";
pub const VIEWSTATE_GENERATOR: &str = "__VIEWSTATEGENERATOR";
pub const EVENT_VALIDATION: &str = "__EVENTVALIDATION";
pub const EVENT_TARGET: &str = "__EVENTTARGET";
pub const EVENT_ARGUMENT: &str = "__EVENTARGUMENT";

/// Control that receives `Page$<n>` postbacks on every CBX listing.
pub const GRID_EVENT_TARGET: &str = "ctl00$ContentPlaceHolder1$gdvMain";

static PAGE_LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Page\$(\d+)").expect("valid page-link regex"));

/// Server-issued form state. Only valid for the next postback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HiddenFields {
    pub viewstate: Option<String>,
    pub viewstate_generator: Option<String>,
    pub event_validation: Option<String>,
}

impl HiddenFields {
    /// Missing inputs stay `None`; an input without a value is `Some("")`.
    pub fn extract(document: &Html) -> Result<Self, AdapterError> {
        let inputs = selector("input[type=hidden], input[id^=__]")?;
        let mut fields = HiddenFields::default();
        for input in document.select(&inputs) {
            let element = input.value();
            let key = element.id().or_else(|| element.attr("name"));
            let value = element.attr("value").unwrap_or_default().to_string();
            match key {
                Some(VIEWSTATE) if fields.viewstate.is_none() => fields.viewstate = Some(value),
                Some(VIEWSTATE_GENERATOR) if fields.viewstate_generator.is_none() => {
                    fields.viewstate_generator = Some(value)
                }
                Some(EVENT_VALIDATION) if fields.event_validation.is_none() => {
                    fields.event_validation = Some(value)
                }
                _ => {}
            }
        }
        Ok(fields)
    }

    pub fn form_fields(&self) -> Vec<(String, String)> {
        [
            (VIEWSTATE, &self.viewstate),
            (VIEWSTATE_GENERATOR, &self.viewstate_generator),
            (EVENT_VALIDATION, &self.event_validation),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| (name.to_string(), v.clone())))
        .collect()
    }
}

/// Page indices referenced by `Page$<n>` postback links. The pager only
/// reveals a window around the current page, so this runs on every response.
pub fn discover_pages(document: &Html) -> Result<BTreeSet<u32>, AdapterError> {
    let anchors = selector("a[href]")?;
    Ok(document
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| PAGE_LINK.captures(href))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        .filter(|page| *page > 0)
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// A failed filter post falls back to the unfiltered GET document.
    Optional,
    /// A failed filter post aborts the fetch.
    Required,
}

/// One-time postback applied right after the initial GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPost {
    pub mode: FilterMode,
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
    pub page_attempts: u32,
    /// Multiplied by the attempt number between page retries.
    pub page_retry_delay: Duration,
    /// Courtesy pause after each successful page.
    pub page_pause: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            page_attempts: 3,
            page_retry_delay: Duration::from_secs(2),
            page_pause: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageExtraction {
    pub records: Vec<ScrapedRecord>,
    pub row_errors: usize,
}

/// Pure per-page parser. Never paginates.
pub trait PageExtractor: Send + Sync {
    fn extract(&self, document: &Html, page: u32) -> Result<PageExtraction, AdapterError>;
}

struct ParsedPage {
    hidden: HiddenFields,
    pages: BTreeSet<u32>,
    extraction: PageExtraction,
}

// `Html` is not `Send`; documents are parsed and dropped between awaits.
fn parse_page(body: &str, page: u32, extractor: &dyn PageExtractor) -> Result<ParsedPage, AdapterError> {
    let document = Html::parse_document(body);
    Ok(ParsedPage {
        hidden: HiddenFields::extract(&document)?,
        pages: discover_pages(&document)?,
        extraction: extractor.extract(&document, page)?,
    })
}

fn parse_hidden(body: &str) -> Result<HiddenFields, AdapterError> {
    HiddenFields::extract(&Html::parse_document(body))
}

/// Walks a postback-paginated listing until no unvisited page remains.
pub struct PaginationDriver<'a> {
    transport: &'a dyn FormTransport,
    url: String,
    options: DriverOptions,
}

impl<'a> PaginationDriver<'a> {
    pub fn new(transport: &'a dyn FormTransport, url: impl Into<String>, options: DriverOptions) -> Self {
        Self {
            transport,
            url: url.into(),
            options,
        }
    }

    pub async fn run(
        &self,
        filter: Option<&FilterPost>,
        extractor: &dyn PageExtractor,
        max_pages: Option<u32>,
        limit: Option<usize>,
    ) -> Result<FetchOutcome, AdapterError> {
        let mut body = self.transport.get(&self.url).await?;

        if let Some(filter) = filter {
            let mut fields = parse_hidden(&body)?.form_fields();
            fields.extend(filter.fields.iter().cloned());
            match self.transport.post_form(&self.url, &fields).await {
                Ok(filtered) => body = filtered,
                Err(err) if filter.mode == FilterMode::Optional => {
                    warn!(url = %self.url, error = %err, "filter postback failed, using unfiltered listing");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let first = parse_page(&body, 1, extractor)?;
        drop(body);

        let mut outcome = FetchOutcome::default();
        let mut hidden = first.hidden;
        let mut visited = HashSet::from([1u32]);
        let mut queue: VecDeque<u32> = first
            .pages
            .into_iter()
            .filter(|p| *p != 1 && max_pages.map_or(true, |max| *p <= max))
            .collect();
        outcome.row_errors += first.extraction.row_errors;
        outcome.records.extend(first.extraction.records);
        debug!(url = %self.url, queued = queue.len(), "first page parsed");

        while let Some(page) = queue.pop_front() {
            if limit.is_some_and(|limit| outcome.records.len() >= limit) {
                break;
            }
            if !visited.insert(page) {
                continue;
            }

            let Some(body) = self.post_page(&hidden, page).await else {
                outcome.failed_pages.push(format!("{}?page={page}", self.url));
                continue;
            };
            let parsed = match parse_page(&body, page, extractor) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(url = %self.url, page, error = %err, "page could not be parsed");
                    outcome.failed_pages.push(format!("{}?page={page}", self.url));
                    continue;
                }
            };

            hidden = parsed.hidden;
            outcome.row_errors += parsed.extraction.row_errors;
            outcome.records.extend(parsed.extraction.records);

            if max_pages.is_none() {
                for discovered in parsed.pages {
                    if !visited.contains(&discovered) && !queue.contains(&discovered) {
                        queue.push_back(discovered);
                    }
                }
            }

            if !self.options.page_pause.is_zero() {
                tokio::time::sleep(self.options.page_pause).await;
            }
        }

        if let Some(limit) = limit {
            outcome.records.truncate(limit);
        }
        info!(
            url = %self.url,
            pages = visited.len(),
            records = outcome.records.len(),
            failed_pages = outcome.failed_pages.len(),
            row_errors = outcome.row_errors,
            "listing walk finished"
        );
        Ok(outcome)
    }

    /// `None` once every attempt has failed.
    async fn post_page(&self, hidden: &HiddenFields, page: u32) -> Option<String> {
        let mut fields = hidden.form_fields();
        fields.push((EVENT_TARGET.to_string(), GRID_EVENT_TARGET.to_string()));
        fields.push((EVENT_ARGUMENT.to_string(), format!("Page${page}")));

        let attempts = self.options.page_attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.post_form(&self.url, &fields).await {
                Ok(body) => return Some(body),
                Err(err) => {
                    warn!(url = %self.url, page, attempt, attempts, error = %err, "page postback failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.options.page_retry_delay * attempt).await;
                    }
                }
            }
        }
        warn!(url = %self.url, page, "page skipped after exhausting retries");
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use otb_core::NewsRecord;
    use otb_storage::FetchError;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&[(String, String)]) -> Result<String, FetchError> + Send + Sync>;

    /// Serves one GET body and answers POSTs through `responder`, recording every payload.
    pub(crate) struct ScriptedTransport {
        get_body: String,
        responder: Responder,
        pub(crate) posts: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(
            get_body: String,
            responder: impl Fn(&[(String, String)]) -> Result<String, FetchError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                get_body,
                responder: Box::new(responder),
                posts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn posted(&self) -> Vec<Vec<(String, String)>> {
            self.posts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FormTransport for ScriptedTransport {
        async fn get(&self, _url: &str) -> Result<String, FetchError> {
            Ok(self.get_body.clone())
        }

        async fn post_form(&self, _url: &str, fields: &[(String, String)]) -> Result<String, FetchError> {
            self.posts.lock().unwrap().push(fields.to_vec());
            (self.responder)(fields)
        }

        async fn get_json(
            &self,
            url: &str,
            _query: &[(String, String)],
        ) -> Result<serde_json::Value, FetchError> {
            Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    pub(crate) fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
        fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub(crate) fn requested_page(fields: &[(String, String)]) -> Option<u32> {
        field(fields, EVENT_ARGUMENT)?.strip_prefix("Page$")?.parse().ok()
    }

    pub(crate) fn unavailable() -> FetchError {
        FetchError::HttpStatus {
            status: 503,
            url: "https://www.cbx.org.br/noticias".to_string(),
        }
    }

    /// A listing page with one item per entry in `items`, a pager linking `pages`
    /// and a page-specific viewstate.
    fn listing(viewstate: &str, items: &[&str], pages: &[u32]) -> String {
        let rows: String = items
            .iter()
            .map(|item| format!(r#"<li><a class="item" href="/item/{item}">{item}</a></li>"#))
            .collect();
        let pager: String = pages
            .iter()
            .map(|p| format!(r#"<a href="javascript:__doPostBack('ctl00$ContentPlaceHolder1$gdvMain','Page${p}')">{p}</a>"#))
            .collect();
        format!(
            r#"<html><body><form>
            <input type="hidden" name="__VIEWSTATE" id="__VIEWSTATE" value="{viewstate}" />
            <input type="hidden" name="__VIEWSTATEGENERATOR" id="__VIEWSTATEGENERATOR" value="GEN" />
            <input type="hidden" name="__EVENTVALIDATION" id="__EVENTVALIDATION" value="ev-{viewstate}" />
            <ul>{rows}</ul><div class="pager">{pager}</div></form></body></html>"#
        )
    }

    struct ItemExtractor;

    impl PageExtractor for ItemExtractor {
        fn extract(&self, document: &Html, _page: u32) -> Result<PageExtraction, AdapterError> {
            let items = selector("a.item")?;
            let records = document
                .select(&items)
                .map(|a| {
                    ScrapedRecord::News(NewsRecord {
                        title: a.text().collect(),
                        link: a.value().attr("href").unwrap_or_default().to_string(),
                        ..Default::default()
                    })
                })
                .collect();
            Ok(PageExtraction {
                records,
                row_errors: 0,
            })
        }
    }

    fn window(page: u32, total: u32, radius: u32) -> Vec<u32> {
        (page.saturating_sub(radius).max(1)..=(page + radius).min(total))
            .filter(|p| *p != page)
            .collect()
    }

    fn fast() -> DriverOptions {
        DriverOptions {
            page_attempts: 3,
            page_retry_delay: Duration::ZERO,
            page_pause: Duration::ZERO,
        }
    }

    fn titles(outcome: &FetchOutcome) -> Vec<String> {
        outcome
            .records
            .iter()
            .filter_map(|r| match r {
                ScrapedRecord::News(n) => Some(n.title.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn hidden_fields_tolerate_missing_and_empty_inputs() {
        let document = Html::parse_document(
            r#"<form><input type="hidden" id="__VIEWSTATE" name="__VIEWSTATE" value="abc" />
               <input type="hidden" id="__EVENTVALIDATION" name="__EVENTVALIDATION" /></form>"#,
        );
        let hidden = HiddenFields::extract(&document).expect("hidden");
        assert_eq!(hidden.viewstate.as_deref(), Some("abc"));
        assert_eq!(hidden.viewstate_generator, None);
        assert_eq!(hidden.event_validation.as_deref(), Some(""));
        let names: Vec<String> = hidden.form_fields().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec![VIEWSTATE.to_string(), EVENT_VALIDATION.to_string()]);
    }

    #[test]
    fn discovery_reads_page_postback_links() {
        let document = Html::parse_document(&listing("v", &[], &[2, 3, 7]));
        let pages = discover_pages(&document).expect("pages");
        assert_eq!(pages.into_iter().collect::<Vec<_>>(), vec![2, 3, 7]);
    }

    #[tokio::test]
    async fn every_postback_carries_tokens_from_the_previous_response() {
        let transport = ScriptedTransport::new(listing("vs-1", &["a"], &[2, 3]), |fields| {
            let page = requested_page(fields).expect("page postback");
            Ok(listing(&format!("vs-{page}"), &["x"], &[2, 3]))
        });
        let driver = PaginationDriver::new(&transport, "https://www.cbx.org.br/noticias", fast());
        let outcome = driver.run(None, &ItemExtractor, None, None).await.expect("walk");

        assert_eq!(outcome.records.len(), 3);
        let posts = transport.posted();
        assert_eq!(posts.len(), 2);
        assert_eq!(field(&posts[0], VIEWSTATE), Some("vs-1"));
        assert_eq!(field(&posts[0], EVENT_VALIDATION), Some("ev-vs-1"));
        assert_eq!(field(&posts[1], VIEWSTATE), Some("vs-2"));
        assert_eq!(field(&posts[1], EVENT_VALIDATION), Some("ev-vs-2"));
        assert_eq!(field(&posts[1], EVENT_TARGET), Some(GRID_EVENT_TARGET));
    }

    #[tokio::test]
    async fn sliding_pager_window_still_reaches_every_page_once() {
        let transport = ScriptedTransport::new(listing("vs-1", &["p1"], &window(1, 10, 3)), |fields| {
            let page = requested_page(fields).expect("page postback");
            Ok(listing(&format!("vs-{page}"), &[format!("p{page}").as_str()], &window(page, 10, 3)))
        });
        let driver = PaginationDriver::new(&transport, "https://www.cbx.org.br/noticias", fast());
        let outcome = driver.run(None, &ItemExtractor, None, None).await.expect("walk");

        let mut seen = titles(&outcome);
        seen.sort();
        let mut expected: Vec<String> = (1..=10).map(|p| format!("p{p}")).collect();
        expected.sort();
        assert_eq!(seen, expected);

        let mut requested: Vec<u32> = transport.posted().iter().filter_map(|f| requested_page(f)).collect();
        requested.sort();
        assert_eq!(requested, (2..=10).collect::<Vec<_>>());
        assert!(outcome.failed_pages.is_empty());
    }

    #[tokio::test]
    async fn failing_page_is_reported_and_the_walk_continues() {
        let transport = ScriptedTransport::new(listing("vs-1", &["p1"], &[2, 3, 4, 5]), |fields| {
            match requested_page(fields).expect("page postback") {
                3 => Err(unavailable()),
                page => Ok(listing(&format!("vs-{page}"), &[format!("p{page}").as_str()], &[1, 2, 3, 4, 5])),
            }
        });
        let driver = PaginationDriver::new(&transport, "https://www.cbx.org.br/noticias", fast());
        let outcome = driver.run(None, &ItemExtractor, None, None).await.expect("walk");

        assert_eq!(titles(&outcome), vec!["p1", "p2", "p4", "p5"]);
        assert_eq!(outcome.failed_pages, vec!["https://www.cbx.org.br/noticias?page=3".to_string()]);
        let attempts_on_three = transport
            .posted()
            .iter()
            .filter(|f| requested_page(f) == Some(3))
            .count();
        assert_eq!(attempts_on_three, 3);
    }

    #[tokio::test]
    async fn max_pages_bounds_the_walk_and_suppresses_discovery() {
        let transport = ScriptedTransport::new(listing("vs-1", &["p1"], &[2, 3, 4]), |fields| {
            let page = requested_page(fields).expect("page postback");
            Ok(listing(&format!("vs-{page}"), &[format!("p{page}").as_str()], &[5, 6, 7]))
        });
        let driver = PaginationDriver::new(&transport, "https://www.cbx.org.br/noticias", fast());
        let outcome = driver.run(None, &ItemExtractor, Some(2), None).await.expect("walk");
        assert_eq!(titles(&outcome), vec!["p1", "p2"]);
        assert_eq!(transport.posted().len(), 1);
    }

    #[tokio::test]
    async fn optional_filter_falls_back_to_the_initial_document() {
        let transport = ScriptedTransport::new(listing("vs-1", &["unfiltered"], &[]), |fields| {
            if field(fields, "ctl00$ContentPlaceHolder1$btnBuscar").is_some() {
                Err(unavailable())
            } else {
                Ok(listing("vs-x", &[], &[]))
            }
        });
        let driver = PaginationDriver::new(&transport, "https://www.cbx.org.br/torneios", fast());
        let mut filter = FilterPost {
            mode: FilterMode::Optional,
            fields: vec![("ctl00$ContentPlaceHolder1$btnBuscar".to_string(), "Buscar".to_string())],
        };
        let outcome = driver
            .run(Some(&filter), &ItemExtractor, None, None)
            .await
            .expect("fallback");
        assert_eq!(titles(&outcome), vec!["unfiltered"]);

        filter.mode = FilterMode::Required;
        let err = driver
            .run(Some(&filter), &ItemExtractor, None, None)
            .await
            .expect_err("required filter");
        assert!(matches!(err, AdapterError::Fetch(_)));
    }

    #[tokio::test]
    async fn limit_stops_the_walk_early() {
        let transport = ScriptedTransport::new(listing("vs-1", &["a", "b"], &[2, 3]), |fields| {
            let page = requested_page(fields).expect("page postback");
            Ok(listing(&format!("vs-{page}"), &["c", "d"], &[2, 3]))
        });
        let driver = PaginationDriver::new(&transport, "https://www.cbx.org.br/noticias", fast());
        let outcome = driver.run(None, &ItemExtractor, None, Some(3)).await.expect("walk");
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(transport.posted().len(), 1);
    }
}

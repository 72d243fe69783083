//! CBX (Confederação Brasileira de Xadrez) listings: tournaments, rating list, news
//! and announcements. All four share the WebForms pagination walk.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use otb_core::{
    AnnouncementRecord, Domain, NewsRecord, PlayerRecord, ScrapedRecord, SyncTarget, TournamentRecord,
    CBX_FEDERATION,
};
use otb_storage::FormTransport;
use regex::Regex;
use scraper::{ElementRef, Html};
use tracing::{info_span, warn, Instrument};

use crate::webforms::{
    DriverOptions, FilterMode, FilterPost, PageExtraction, PageExtractor, PaginationDriver, EVENT_ARGUMENT,
    EVENT_TARGET,
};
use crate::{
    absolutize, after_colon, element_text, select_first_attr, select_first_text, selector, AdapterError,
    FetchOutcome, FetchRequest, SourceAdapter,
};

const CONTROL_PREFIX: &str = "ctl00$ContentPlaceHolder1$";
const ELEMENT_PREFIX: &str = "ContentPlaceHolder1_gdvMain_";
pub const DEFAULT_PLAYER_STATE: &str = "SP";

static TITLE_ANCHOR_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ContentPlaceHolder1_gdvMain_hlkTitulo_\d+$").expect("valid title-anchor regex"));

fn control(name: &str) -> String {
    format!("{CONTROL_PREFIX}{name}")
}

fn pair(name: impl Into<String>, value: impl Into<String>) -> (String, String) {
    (name.into(), value.into())
}

// ---------------------------------------------------------------------------
// Tournaments
// ---------------------------------------------------------------------------

pub struct CbxTournaments {
    base_url: String,
    driver: DriverOptions,
}

impl CbxTournaments {
    pub fn new(base_url: impl Into<String>, driver: DriverOptions) -> Self {
        Self {
            base_url: base_url.into(),
            driver,
        }
    }

    pub fn url(&self) -> String {
        format!("{}/torneios", self.base_url)
    }
}

#[async_trait]
impl SourceAdapter for CbxTournaments {
    fn target(&self) -> SyncTarget {
        SyncTarget::cbx(Domain::Tournaments)
    }

    async fn fetch_raw(
        &self,
        transport: Arc<dyn FormTransport>,
        request: &FetchRequest,
    ) -> Result<FetchOutcome, AdapterError> {
        let year = request.year.unwrap_or_else(|| Utc::now().year()).to_string();
        let month = request.month.map(|m| m.to_string()).unwrap_or_default();
        let filter = FilterPost {
            mode: FilterMode::Optional,
            fields: vec![
                pair(control("cboAno"), year.as_str()),
                pair(control("cboMes"), month.as_str()),
                pair(control("btnBuscar"), "Buscar"),
            ],
        };
        let extractor = TournamentExtractor {
            base_url: self.base_url.clone(),
            year: year.clone(),
            month: month.clone(),
        };
        let span = info_span!("cbx_fetch", domain = "tournaments", year = %year, month = %month);
        PaginationDriver::new(transport.as_ref(), self.url(), self.driver.clone())
            .run(Some(&filter), &extractor, request.max_pages, request.limit)
            .instrument(span)
            .await
    }
}

/// One `table.torneios` block per tournament; span ids carry the block index.
pub struct TournamentExtractor {
    pub base_url: String,
    pub year: String,
    pub month: String,
}

impl TournamentExtractor {
    fn row(&self, table: ElementRef<'_>, index: usize, page: u32) -> Result<TournamentRecord, AdapterError> {
        let span = |label: &str| -> Result<String, AdapterError> {
            Ok(select_first_text(table, &format!("span#{ELEMENT_PREFIX}{label}_{index}"))?.unwrap_or_default())
        };

        let name = span("lblNomeTorneio")?;
        let external_id = after_colon(&span("lblIDTorneio")?);
        if name.is_empty() && external_id.is_empty() {
            return Err(AdapterError::Message(format!(
                "tournament block {index} on page {page} has neither name nor id"
            )));
        }

        let observation = select_lines(table, &format!("span#{ELEMENT_PREFIX}lblObs_{index}"))?;
        let regulation = select_first_attr(table, &format!("a#{ELEMENT_PREFIX}hlkTorneio_{index}"), "href")?
            .map(|href| absolutize(&self.base_url, &href))
            .unwrap_or_default();

        Ok(TournamentRecord {
            federation: CBX_FEDERATION.to_string(),
            external_id,
            name,
            status: after_colon(&span("lblStatus")?),
            time_control: after_colon(&span("lblRitmo")?),
            rating: after_colon(&span("lblRating")?),
            total_players: after_colon(&span("lblQtJogadores")?),
            fide_players: after_colon(&span("lblQtJogadoresFIDE")?),
            organizer: after_colon(&span("lblOrganizador")?),
            place: after_colon(&span("lblLocal")?),
            period: after_colon(&span("lblPeriodo")?),
            observation: after_colon(&observation),
            regulation,
            start_date: String::new(),
            year: self.year.clone(),
            month: self.month.clone(),
            page,
        })
    }
}

impl PageExtractor for TournamentExtractor {
    fn extract(&self, document: &Html, page: u32) -> Result<PageExtraction, AdapterError> {
        let tables = selector("table.torneios")?;
        let mut extraction = PageExtraction::default();
        for (index, table) in document.select(&tables).enumerate() {
            match self.row(table, index, page) {
                Ok(record) => extraction.records.push(ScrapedRecord::Tournament(record)),
                Err(err) => {
                    warn!(page, index, error = %err, "skipping tournament block");
                    extraction.row_errors += 1;
                }
            }
        }
        Ok(extraction)
    }
}

/// Text nodes of the first match, one per line. `<br>`-separated notes keep their breaks.
fn select_lines(scope: ElementRef<'_>, css: &str) -> Result<String, AdapterError> {
    let sel = selector(css)?;
    Ok(scope
        .select(&sel)
        .next()
        .map(|n| {
            n.text()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Players (rating list)
// ---------------------------------------------------------------------------

pub struct CbxPlayers {
    base_url: String,
    driver: DriverOptions,
}

impl CbxPlayers {
    pub fn new(base_url: impl Into<String>, driver: DriverOptions) -> Self {
        Self {
            base_url: base_url.into(),
            driver,
        }
    }

    pub fn url(&self) -> String {
        format!("{}/rating", self.base_url)
    }
}

#[async_trait]
impl SourceAdapter for CbxPlayers {
    fn target(&self) -> SyncTarget {
        SyncTarget::cbx(Domain::Players)
    }

    async fn fetch_raw(
        &self,
        transport: Arc<dyn FormTransport>,
        request: &FetchRequest,
    ) -> Result<FetchOutcome, AdapterError> {
        let state = request
            .state
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_PLAYER_STATE)
            .to_uppercase();
        let filter = FilterPost {
            mode: FilterMode::Required,
            fields: vec![
                pair(control("cboUF"), state.as_str()),
                pair(EVENT_TARGET, control("cboUF")),
                pair(EVENT_ARGUMENT, ""),
                pair(control("btnBuscar"), "Buscar"),
            ],
        };
        let extractor = PlayerExtractor {
            base_url: self.base_url.clone(),
        };
        let span = info_span!("cbx_fetch", domain = "players", state = %state);
        PaginationDriver::new(transport.as_ref(), self.url(), self.driver.clone())
            .run(Some(&filter), &extractor, request.max_pages, request.limit)
            .instrument(span)
            .await
    }
}

/// Header-driven grid. Pager rows hold a nested table and are skipped.
pub struct PlayerExtractor {
    pub base_url: String,
}

impl PlayerExtractor {
    fn row(&self, headers: &[String], row: ElementRef<'_>) -> Result<Option<PlayerRecord>, AdapterError> {
        let cells: Vec<ElementRef<'_>> = child_elements(row, "td");
        if cells.is_empty() {
            return Ok(None);
        }
        let values: HashMap<&str, String> = headers
            .iter()
            .map(String::as_str)
            .zip(cells.iter().map(|cell| element_text(*cell)))
            .collect();
        let value = |header: &str| values.get(header).cloned().unwrap_or_default();

        let local_id = select_first_attr(row, "a[href*='/jogador/']", "href")?
            .and_then(|href| profile_id(&href))
            .unwrap_or_else(|| value("ID CBX"));
        if local_id.is_empty() {
            return Err(AdapterError::Message("rating row without a CBX id".to_string()));
        }

        Ok(Some(PlayerRecord {
            local_profile: format!("{}/jogador/{local_id}", self.base_url),
            local_id,
            name: value("Nome"),
            birthday: value("Data Nasc."),
            gender: String::new(),
            country: "Brasil".to_string(),
            state: value("UF"),
            classical: value("Clássico"),
            rapid: value("Rápido"),
            blitz: value("Blitz"),
            fide_id: value("ID FIDE"),
        }))
    }
}

impl PageExtractor for PlayerExtractor {
    fn extract(&self, document: &Html, page: u32) -> Result<PageExtraction, AdapterError> {
        let grids = selector("table.grid, table#ContentPlaceHolder1_gdvMain")?;
        let mut extraction = PageExtraction::default();
        let Some(table) = document.select(&grids).next() else {
            warn!(page, "rating grid not found");
            return Ok(extraction);
        };

        let rows = table_rows(table);
        let Some((header_row, body)) = rows.split_first() else {
            return Ok(extraction);
        };
        let headers: Vec<String> = child_elements(*header_row, "th")
            .into_iter()
            .map(element_text)
            .collect();

        for row in body {
            if row.value().classes().any(|c| c == "grid-pager") {
                continue;
            }
            match self.row(&headers, *row) {
                Ok(Some(record)) => extraction.records.push(ScrapedRecord::Player(record)),
                Ok(None) => {}
                Err(err) => {
                    warn!(page, error = %err, "skipping rating row");
                    extraction.row_errors += 1;
                }
            }
        }
        Ok(extraction)
    }
}

/// `https://www.cbx.org.br/jogador/12345?x=1` → `12345`.
fn profile_id(href: &str) -> Option<String> {
    let (_, rest) = href.split_once("/jogador/")?;
    let id = rest.split(['/', '?', '#']).next()?.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn child_elements<'a>(parent: ElementRef<'a>, tag: &str) -> Vec<ElementRef<'a>> {
    parent
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|e| e.value().name() == tag)
        .collect()
}

/// Rows owned by `table` itself, looking through an optional `thead`/`tbody`.
fn table_rows(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let mut rows = Vec::new();
    for child in table.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => rows.extend(child_elements(child, "tr")),
            _ => {}
        }
    }
    rows
}

// ---------------------------------------------------------------------------
// News and announcements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bulletin {
    News,
    Announcements,
}

impl Bulletin {
    fn path(&self) -> &'static str {
        match self {
            Bulletin::News => "noticias",
            Bulletin::Announcements => "comunicados",
        }
    }

    fn domain(&self) -> Domain {
        match self {
            Bulletin::News => Domain::News,
            Bulletin::Announcements => Domain::Announcements,
        }
    }
}

/// Title anchors `hlkTitulo_<n>` with a sibling `span.date` and body text in the parent's `p`.
pub struct BulletinExtractor {
    base_url: String,
    kind: Bulletin,
}

impl BulletinExtractor {
    pub fn news(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            kind: Bulletin::News,
        }
    }

    pub fn announcements(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            kind: Bulletin::Announcements,
        }
    }

    fn row(&self, anchor: ElementRef<'_>) -> Result<ScrapedRecord, AdapterError> {
        let href = anchor.value().attr("href").map(str::trim).unwrap_or_default();
        if href.is_empty() {
            return Err(AdapterError::Message(format!(
                "{} anchor {} has no href",
                self.kind.path(),
                anchor.value().id().unwrap_or_default()
            )));
        }
        let title = element_text(anchor);
        let link = absolutize(&self.base_url, href);
        let date_text = anchor
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .find(|e| e.value().name() == "span" && e.value().classes().any(|c| c == "date"))
            .map(element_text)
            .unwrap_or_default();
        let body = match anchor.parent().and_then(ElementRef::wrap) {
            Some(parent) => select_first_text(parent, "p")?.unwrap_or_default(),
            None => String::new(),
        };

        Ok(match self.kind {
            Bulletin::News => ScrapedRecord::News(NewsRecord {
                title,
                date_text,
                link,
                summary: body,
            }),
            Bulletin::Announcements => ScrapedRecord::Announcement(AnnouncementRecord {
                title,
                date_text,
                link,
                content: body,
            }),
        })
    }
}

impl PageExtractor for BulletinExtractor {
    fn extract(&self, document: &Html, page: u32) -> Result<PageExtraction, AdapterError> {
        let anchors = selector("a[id]")?;
        let mut extraction = PageExtraction::default();
        for anchor in document
            .select(&anchors)
            .filter(|a| a.value().id().is_some_and(|id| TITLE_ANCHOR_ID.is_match(id)))
        {
            match self.row(anchor) {
                Ok(record) => extraction.records.push(record),
                Err(err) => {
                    warn!(page, error = %err, "skipping {} entry", self.kind.path());
                    extraction.row_errors += 1;
                }
            }
        }
        Ok(extraction)
    }
}

async fn fetch_bulletins(
    kind: Bulletin,
    base_url: &str,
    driver: &DriverOptions,
    transport: Arc<dyn FormTransport>,
    request: &FetchRequest,
) -> Result<FetchOutcome, AdapterError> {
    let extractor = BulletinExtractor {
        base_url: base_url.to_string(),
        kind,
    };
    let url = format!("{base_url}/{}", kind.path());
    let span = info_span!("cbx_fetch", domain = kind.domain().as_str());
    PaginationDriver::new(transport.as_ref(), url, driver.clone())
        .run(None, &extractor, request.max_pages, request.limit)
        .instrument(span)
        .await
}

pub struct CbxNews {
    base_url: String,
    driver: DriverOptions,
}

impl CbxNews {
    pub fn new(base_url: impl Into<String>, driver: DriverOptions) -> Self {
        Self {
            base_url: base_url.into(),
            driver,
        }
    }
}

#[async_trait]
impl SourceAdapter for CbxNews {
    fn target(&self) -> SyncTarget {
        SyncTarget::cbx(Domain::News)
    }

    async fn fetch_raw(
        &self,
        transport: Arc<dyn FormTransport>,
        request: &FetchRequest,
    ) -> Result<FetchOutcome, AdapterError> {
        fetch_bulletins(Bulletin::News, &self.base_url, &self.driver, transport, request).await
    }
}

pub struct CbxAnnouncements {
    base_url: String,
    driver: DriverOptions,
}

impl CbxAnnouncements {
    pub fn new(base_url: impl Into<String>, driver: DriverOptions) -> Self {
        Self {
            base_url: base_url.into(),
            driver,
        }
    }
}

#[async_trait]
impl SourceAdapter for CbxAnnouncements {
    fn target(&self) -> SyncTarget {
        SyncTarget::cbx(Domain::Announcements)
    }

    async fn fetch_raw(
        &self,
        transport: Arc<dyn FormTransport>,
        request: &FetchRequest,
    ) -> Result<FetchOutcome, AdapterError> {
        fetch_bulletins(Bulletin::Announcements, &self.base_url, &self.driver, transport, request).await
    }
}

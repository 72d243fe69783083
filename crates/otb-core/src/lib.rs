//! Core domain model for Over The Board: scraped records, persisted entities and sync jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "otb-core";

pub const CBX_FEDERATION: &str = "cbx";
pub const FIDE_FEDERATION: &str = "fide";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Site {
    Cbx,
    Fide,
}

impl Site {
    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Cbx => CBX_FEDERATION,
            Site::Fide => FIDE_FEDERATION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Tournaments,
    Players,
    News,
    Announcements,
}

impl Domain {
    pub const ALL: [Domain; 4] = [
        Domain::Tournaments,
        Domain::Players,
        Domain::News,
        Domain::Announcements,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Tournaments => "tournaments",
            Domain::Players => "players",
            Domain::News => "news",
            Domain::Announcements => "announcements",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tournaments" => Ok(Domain::Tournaments),
            "players" => Ok(Domain::Players),
            "news" => Ok(Domain::News),
            "announcements" => Ok(Domain::Announcements),
            other => Err(format!("unknown domain `{other}`")),
        }
    }
}

/// A (site, domain) pair: the unit the registry, the sync jobs and the orchestrator work with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncTarget {
    pub site: Site,
    pub domain: Domain,
}

impl SyncTarget {
    pub const fn new(site: Site, domain: Domain) -> Self {
        Self { site, domain }
    }

    pub const fn cbx(domain: Domain) -> Self {
        Self::new(Site::Cbx, domain)
    }

    pub const fn fide_tournaments() -> Self {
        Self::new(Site::Fide, Domain::Tournaments)
    }

    /// Tag written to `sync_jobs.federation`.
    pub fn job_tag(&self) -> String {
        match (self.site, self.domain) {
            (site, Domain::Tournaments) => site.as_str().to_string(),
            (site, domain) => format!("{}_{}", site.as_str(), domain.as_str()),
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site.as_str(), self.domain)
    }
}

/// Flat, string-valued tournament row as scraped. Labels are already stripped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TournamentRecord {
    pub federation: String,
    pub external_id: String,
    pub name: String,
    pub status: String,
    pub time_control: String,
    pub rating: String,
    pub total_players: String,
    pub fide_players: String,
    pub organizer: String,
    pub place: String,
    pub period: String,
    pub observation: String,
    pub regulation: String,
    /// ISO `YYYY-MM-DD` start date when the source publishes one directly.
    pub start_date: String,
    pub year: String,
    pub month: String,
    pub page: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub local_id: String,
    pub name: String,
    pub birthday: String,
    pub gender: String,
    pub country: String,
    pub state: String,
    pub classical: String,
    pub rapid: String,
    pub blitz: String,
    pub fide_id: String,
    pub local_profile: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsRecord {
    pub title: String,
    pub date_text: String,
    pub link: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementRecord {
    pub title: String,
    pub date_text: String,
    pub link: String,
    pub content: String,
}

/// Handoff contract from adapters into the reconciling sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScrapedRecord {
    Tournament(TournamentRecord),
    Player(PlayerRecord),
    News(NewsRecord),
    Announcement(AnnouncementRecord),
}

impl ScrapedRecord {
    pub fn domain(&self) -> Domain {
        match self {
            ScrapedRecord::Tournament(_) => Domain::Tournaments,
            ScrapedRecord::Player(_) => Domain::Players,
            ScrapedRecord::News(_) => Domain::News,
            ScrapedRecord::Announcement(_) => Domain::Announcements,
        }
    }

    /// Candidate keys in priority order. Empty when the record has no usable natural key.
    pub fn match_keys(&self, strategy: &TournamentMatchStrategy) -> Vec<MatchKey> {
        match self {
            ScrapedRecord::Tournament(t) => tournament_match_keys(t, strategy),
            ScrapedRecord::Player(p) => non_empty(&p.local_id)
                .map(|id| vec![MatchKey::PlayerLocalId(id.to_string())])
                .unwrap_or_default(),
            ScrapedRecord::News(n) => non_empty(&n.link)
                .map(|link| vec![MatchKey::NewsLink(link.to_string())])
                .unwrap_or_default(),
            ScrapedRecord::Announcement(a) => non_empty(&a.link)
                .map(|link| vec![MatchKey::AnnouncementLink(link.to_string())])
                .unwrap_or_default(),
        }
    }

    /// Short identifier for log lines.
    pub fn label(&self) -> String {
        match self {
            ScrapedRecord::Tournament(t) => {
                format!("{}:{}", t.federation, non_empty(&t.external_id).unwrap_or(t.name.as_str()))
            }
            ScrapedRecord::Player(p) => format!("player:{}", p.local_id),
            ScrapedRecord::News(n) => format!("news:{}", n.link),
            ScrapedRecord::Announcement(a) => format!("announcement:{}", a.link),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchKey {
    TournamentExternalId {
        federation: String,
        external_id: String,
    },
    TournamentRegulation {
        federation: String,
        regulation: String,
    },
    /// Last-resort heuristic: two distinct events sharing a name in the same month collide.
    TournamentNameYearMonth {
        federation: String,
        name: String,
        year: String,
        month: String,
    },
    PlayerLocalId(String),
    NewsLink(String),
    AnnouncementLink(String),
}

impl MatchKey {
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            MatchKey::TournamentRegulation { .. } | MatchKey::TournamentNameYearMonth { .. }
        )
    }
}

/// Which tournament fallback tiers are consulted after `(federation, external_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TournamentMatchStrategy {
    pub use_regulation: bool,
    pub use_name_fallback: bool,
}

impl Default for TournamentMatchStrategy {
    fn default() -> Self {
        Self {
            use_regulation: true,
            use_name_fallback: true,
        }
    }
}

impl TournamentMatchStrategy {
    pub fn strict() -> Self {
        Self {
            use_regulation: true,
            use_name_fallback: false,
        }
    }
}

fn tournament_match_keys(t: &TournamentRecord, strategy: &TournamentMatchStrategy) -> Vec<MatchKey> {
    let mut keys = Vec::with_capacity(3);
    if let Some(external_id) = non_empty(&t.external_id) {
        keys.push(MatchKey::TournamentExternalId {
            federation: t.federation.clone(),
            external_id: external_id.to_string(),
        });
    }
    if strategy.use_regulation {
        if let Some(regulation) = non_empty(&t.regulation) {
            keys.push(MatchKey::TournamentRegulation {
                federation: t.federation.clone(),
                regulation: regulation.to_string(),
            });
        }
    }
    if strategy.use_name_fallback {
        if let Some(name) = non_empty(&t.name) {
            keys.push(MatchKey::TournamentNameYearMonth {
                federation: t.federation.clone(),
                name: name.to_string(),
                year: t.year.clone(),
                month: t.month.clone(),
            });
        }
    }
    keys
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn key_or(current: &Option<String>, scraped: &str) -> Option<String> {
    non_empty(scraped)
        .map(str::to_string)
        .or_else(|| current.clone())
}

/// Lenient player-count parse: anything that is not a plain integer becomes `None`.
pub fn parse_count(value: &str) -> Option<i32> {
    value.trim().parse().ok()
}

/// Pulls `dd/mm/yyyy` dates out of a period label such as `"01/03/2025 a 02/03/2025"`.
/// A single date is both start and end.
pub fn parse_period(period: &str) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let dates: Vec<NaiveDate> = period
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter_map(|token| NaiveDate::parse_from_str(token.trim(), "%d/%m/%Y").ok())
        .collect();
    (dates.first().copied(), dates.last().copied())
}

pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tournament {
    pub id: i64,
    pub federation: String,
    pub external_id: Option<String>,
    pub name: String,
    pub status: String,
    pub time_control: String,
    pub rating: String,
    pub total_players: Option<i32>,
    pub fide_players: Option<i32>,
    pub organizer: String,
    pub place: String,
    pub period: String,
    pub observation: String,
    pub regulation: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub year: String,
    pub month: String,
    pub created_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

impl Tournament {
    pub fn from_record(id: i64, record: &TournamentRecord, now: DateTime<Utc>) -> Self {
        let mut tournament = Self {
            id,
            federation: record.federation.clone(),
            external_id: None,
            name: "unnamed".to_string(),
            status: String::new(),
            time_control: String::new(),
            rating: String::new(),
            total_players: None,
            fide_players: None,
            organizer: String::new(),
            place: String::new(),
            period: String::new(),
            observation: String::new(),
            regulation: None,
            start_date: None,
            end_date: None,
            year: String::new(),
            month: String::new(),
            created_at: now,
            scraped_at: now,
        };
        tournament.apply(record, now);
        tournament
    }

    /// Overwrites scraped fields in place. Name and keys are never blanked by an empty value.
    pub fn apply(&mut self, record: &TournamentRecord, now: DateTime<Utc>) {
        if let Some(name) = non_empty(&record.name) {
            self.name = name.to_string();
        }
        self.external_id = key_or(&self.external_id, &record.external_id);
        self.regulation = key_or(&self.regulation, &record.regulation);
        self.status = record.status.clone();
        self.time_control = record.time_control.clone();
        self.rating = record.rating.clone();
        self.total_players = parse_count(&record.total_players);
        self.fide_players = parse_count(&record.fide_players);
        self.organizer = record.organizer.clone();
        self.place = record.place.clone();
        self.period = record.period.clone();
        self.observation = record.observation.clone();
        let (start, end) = parse_period(&record.period);
        self.start_date = parse_iso_date(&record.start_date).or(start);
        self.end_date = end.or(self.start_date);
        self.year = record.year.clone();
        self.month = record.month.clone();
        self.scraped_at = now;
    }

    pub fn matches_key(&self, key: &MatchKey) -> bool {
        match key {
            MatchKey::TournamentExternalId {
                federation,
                external_id,
            } => &self.federation == federation && self.external_id.as_deref() == Some(external_id.as_str()),
            MatchKey::TournamentRegulation {
                federation,
                regulation,
            } => &self.federation == federation && self.regulation.as_deref() == Some(regulation.as_str()),
            MatchKey::TournamentNameYearMonth {
                federation,
                name,
                year,
                month,
            } => {
                &self.federation == federation
                    && &self.name == name
                    && &self.year == year
                    && &self.month == month
            }
            _ => false,
        }
    }

    /// A fallback-tier candidate is rejected when both sides carry different external ids.
    pub fn accepts_fallback(&self, record: &TournamentRecord) -> bool {
        match (self.external_id.as_deref(), non_empty(&record.external_id)) {
            (Some(stored), Some(scraped)) => stored == scraped,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: i64,
    pub local_id: String,
    pub name: String,
    pub birthday: String,
    pub gender: String,
    pub country: String,
    pub state: String,
    pub classical: String,
    pub rapid: String,
    pub blitz: String,
    pub fide_id: String,
    pub local_profile: String,
    pub created_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

impl Player {
    pub fn from_record(id: i64, record: &PlayerRecord, now: DateTime<Utc>) -> Self {
        let mut player = Self {
            id,
            local_id: record.local_id.trim().to_string(),
            name: "unknown".to_string(),
            birthday: String::new(),
            gender: String::new(),
            country: String::new(),
            state: String::new(),
            classical: String::new(),
            rapid: String::new(),
            blitz: String::new(),
            fide_id: String::new(),
            local_profile: String::new(),
            created_at: now,
            scraped_at: now,
        };
        player.apply(record, now);
        player
    }

    pub fn apply(&mut self, record: &PlayerRecord, now: DateTime<Utc>) {
        if let Some(name) = non_empty(&record.name) {
            self.name = name.to_string();
        }
        self.birthday = record.birthday.clone();
        self.gender = record.gender.clone();
        self.country = record.country.clone();
        self.state = record.state.clone();
        self.classical = record.classical.clone();
        self.rapid = record.rapid.clone();
        self.blitz = record.blitz.clone();
        self.fide_id = record.fide_id.clone();
        if let Some(profile) = non_empty(&record.local_profile) {
            self.local_profile = profile.to_string();
        }
        self.scraped_at = now;
    }

    pub fn matches_key(&self, key: &MatchKey) -> bool {
        matches!(key, MatchKey::PlayerLocalId(id) if &self.local_id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsItem {
    pub id: i64,
    pub title: String,
    pub date_text: String,
    pub link: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

impl NewsItem {
    pub fn from_record(id: i64, record: &NewsRecord, now: DateTime<Utc>) -> Self {
        let mut item = Self {
            id,
            title: "untitled".to_string(),
            date_text: String::new(),
            link: record.link.trim().to_string(),
            summary: String::new(),
            created_at: now,
            scraped_at: now,
        };
        item.apply(record, now);
        item
    }

    pub fn apply(&mut self, record: &NewsRecord, now: DateTime<Utc>) {
        if let Some(title) = non_empty(&record.title) {
            self.title = title.to_string();
        }
        self.date_text = record.date_text.clone();
        self.summary = record.summary.clone();
        self.scraped_at = now;
    }

    pub fn matches_key(&self, key: &MatchKey) -> bool {
        matches!(key, MatchKey::NewsLink(link) if &self.link == link)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: i64,
    pub title: String,
    pub date_text: String,
    pub link: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

impl Announcement {
    pub fn from_record(id: i64, record: &AnnouncementRecord, now: DateTime<Utc>) -> Self {
        let mut item = Self {
            id,
            title: "untitled".to_string(),
            date_text: String::new(),
            link: record.link.trim().to_string(),
            content: String::new(),
            created_at: now,
            scraped_at: now,
        };
        item.apply(record, now);
        item
    }

    pub fn apply(&mut self, record: &AnnouncementRecord, now: DateTime<Utc>) {
        if let Some(title) = non_empty(&record.title) {
            self.title = title.to_string();
        }
        self.date_text = record.date_text.clone();
        self.content = record.content.clone();
        self.scraped_at = now;
    }

    pub fn matches_key(&self, key: &MatchKey) -> bool {
        matches!(key, MatchKey::AnnouncementLink(link) if &self.link == link)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Started,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Started => "started",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(SyncStatus::Started),
            "success" => Ok(SyncStatus::Success),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status `{other}`")),
        }
    }
}

/// One row per sync run. Written as `started` before any network I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub federation: String,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created: u32,
    pub updated: u32,
    pub error: Option<String>,
}

impl SyncJob {
    pub fn started(id: i64, federation: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            federation: federation.into(),
            status: SyncStatus::Started,
            started_at: now,
            finished_at: None,
            created: 0,
            updated: 0,
            error: None,
        }
    }

    pub fn finish(
        &mut self,
        status: SyncStatus,
        created: u32,
        updated: u32,
        error: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.created = created;
        self.updated = updated;
        self.error = error;
        self.finished_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn record(external_id: &str, name: &str) -> TournamentRecord {
        TournamentRecord {
            federation: CBX_FEDERATION.to_string(),
            external_id: external_id.to_string(),
            name: name.to_string(),
            regulation: "https://www.cbx.org.br/torneio/77".to_string(),
            year: "2025".to_string(),
            month: "3".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn tournament_keys_follow_priority() {
        let keys = ScrapedRecord::Tournament(record("T1", "Open A"))
            .match_keys(&TournamentMatchStrategy::default());
        assert_eq!(keys.len(), 3);
        assert!(matches!(keys[0], MatchKey::TournamentExternalId { .. }));
        assert!(matches!(keys[1], MatchKey::TournamentRegulation { .. }));
        assert!(matches!(keys[2], MatchKey::TournamentNameYearMonth { .. }));

        let strict = ScrapedRecord::Tournament(record("", "Open A"))
            .match_keys(&TournamentMatchStrategy::strict());
        assert_eq!(strict.len(), 1);
        assert!(matches!(strict[0], MatchKey::TournamentRegulation { .. }));
    }

    #[test]
    fn records_without_natural_key_have_no_candidates() {
        let player = ScrapedRecord::Player(PlayerRecord {
            name: "Someone".to_string(),
            ..Default::default()
        });
        assert!(player.match_keys(&TournamentMatchStrategy::default()).is_empty());
        let news = ScrapedRecord::News(NewsRecord {
            title: "Headline".to_string(),
            link: "  ".to_string(),
            ..Default::default()
        });
        assert!(news.match_keys(&TournamentMatchStrategy::default()).is_empty());
    }

    #[test]
    fn apply_keeps_name_and_keys_but_overwrites_descriptive_fields() {
        let mut stored = Tournament::from_record(1, &record("T1", "Open A"), ts());
        stored.place = "Recife".to_string();

        let mut update = record("", "");
        update.regulation = String::new();
        update.total_players = "n/a".to_string();
        stored.apply(&update, ts());

        assert_eq!(stored.name, "Open A");
        assert_eq!(stored.external_id.as_deref(), Some("T1"));
        assert_eq!(stored.regulation.as_deref(), Some("https://www.cbx.org.br/torneio/77"));
        assert_eq!(stored.place, "");
        assert_eq!(stored.total_players, None);
    }

    #[test]
    fn fallback_match_rejects_conflicting_external_ids() {
        let stored = Tournament::from_record(1, &record("T1", "Open A"), ts());
        assert!(stored.accepts_fallback(&record("", "Open A")));
        assert!(stored.accepts_fallback(&record("T1", "Open A")));
        assert!(!stored.accepts_fallback(&record("T2", "Open A")));
    }

    #[test]
    fn period_and_counts_parse_leniently() {
        let (start, end) = parse_period("01/03/2025 a 02/03/2025");
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 3, 1));
        assert_eq!(end, NaiveDate::from_ymd_opt(2025, 3, 2));
        let (single, same) = parse_period("15/06/2024");
        assert_eq!(single, same);
        assert_eq!(parse_period("a definir"), (None, None));

        assert_eq!(parse_count(" 42 "), Some(42));
        assert_eq!(parse_count(""), None);
        assert_eq!(parse_count("12 jogadores"), None);
    }

    #[test]
    fn job_tags_match_sync_job_federations() {
        assert_eq!(SyncTarget::cbx(Domain::Tournaments).job_tag(), "cbx");
        assert_eq!(SyncTarget::cbx(Domain::Players).job_tag(), "cbx_players");
        assert_eq!(SyncTarget::cbx(Domain::Announcements).job_tag(), "cbx_announcements");
        assert_eq!(SyncTarget::fide_tournaments().job_tag(), "fide");
        assert_eq!("News".parse::<Domain>(), Ok(Domain::News));
    }
}

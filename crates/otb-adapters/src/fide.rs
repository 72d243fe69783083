//! FIDE rated-tournaments JSON endpoints. Stateless, so (country, period)
//! requests are all spawned at once; the session's in-flight limit paces them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use otb_core::{parse_iso_date, Domain, ScrapedRecord, Site, SyncTarget, TournamentRecord, FIDE_FEDERATION};
use otb_storage::{FetchError, FormTransport};
use scraper::Html;
use serde_json::Value as JsonValue;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::{collapse_whitespace, selector, AdapterError, FetchOutcome, FetchRequest, SourceAdapter};

const ROW_WIDTH: usize = 6;

pub struct FideTournaments {
    base_url: String,
}

impl FideTournaments {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn countries_url(&self) -> String {
        format!("{}/rated_tournaments.phtml", self.base_url)
    }

    fn periods_url(&self) -> String {
        format!("{}/a_tournaments_panel.php", self.base_url)
    }

    fn data_url(&self) -> String {
        format!("{}/a_tournaments.php", self.base_url)
    }

    async fn country_codes(&self, transport: &dyn FormTransport) -> Result<Vec<String>, AdapterError> {
        let body = transport.get(&self.countries_url()).await?;
        let codes = parse_country_codes(&body)?;
        if codes.is_empty() {
            warn!(url = %self.countries_url(), "country selector not found or empty");
        }
        Ok(codes)
    }
}

#[async_trait]
impl SourceAdapter for FideTournaments {
    fn target(&self) -> SyncTarget {
        SyncTarget::new(Site::Fide, Domain::Tournaments)
    }

    async fn fetch_raw(
        &self,
        transport: Arc<dyn FormTransport>,
        request: &FetchRequest,
    ) -> Result<FetchOutcome, AdapterError> {
        let countries: Vec<String> = if request.countries.is_empty() {
            self.country_codes(transport.as_ref()).await?
        } else {
            request
                .countries
                .iter()
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .collect()
        };
        info!(countries = countries.len(), "fetching FIDE rating periods");

        let mut outcome = FetchOutcome::default();

        let period_requests: Vec<_> = countries
            .iter()
            .map(|country| {
                (
                    country.clone(),
                    vec![
                        ("country".to_string(), country.clone()),
                        ("periods_tab".to_string(), "1".to_string()),
                    ],
                )
            })
            .collect();
        let mut combinations = Vec::new();
        for (country, result) in fetch_all(&transport, self.periods_url(), period_requests).await {
            match result.map_err(AdapterError::from).and_then(|value| parse_periods(&value)) {
                Ok(periods) => {
                    info!(country = %country, periods = periods.len(), "rating periods");
                    combinations.extend(periods.into_iter().map(|period| (country.clone(), period)));
                }
                Err(err) => {
                    warn!(country = %country, error = %err, "rating periods unavailable");
                    outcome.failed_pages.push(format!("periods/{country}"));
                }
            }
        }

        let cache_buster = Utc::now().timestamp_millis().to_string();
        let data_requests: Vec<_> = combinations
            .iter()
            .map(|(country, period)| {
                (
                    (country.clone(), period.clone()),
                    vec![
                        ("country".to_string(), country.clone()),
                        ("period".to_string(), period.clone()),
                        ("_".to_string(), cache_buster.clone()),
                    ],
                )
            })
            .collect();
        for ((country, period), result) in fetch_all(&transport, self.data_url(), data_requests).await {
            let parsed = result
                .map_err(AdapterError::from)
                .and_then(|value| parse_tournament_rows(&value, &country, &period));
            match parsed {
                Ok(rows) => outcome.records.extend(
                    rows.into_iter()
                        .filter(|t| is_within_range(&t.start_date, request.start_date, request.end_date))
                        .map(ScrapedRecord::Tournament),
                ),
                Err(err) => {
                    warn!(country = %country, period = %period, error = %err, "tournament list unavailable");
                    outcome.failed_pages.push(format!("{country}/{period}"));
                }
            }
            if request.limit.is_some_and(|limit| outcome.records.len() >= limit) {
                break;
            }
        }

        if let Some(limit) = request.limit {
            outcome.records.truncate(limit);
        }
        info!(
            records = outcome.records.len(),
            failed = outcome.failed_pages.len(),
            "FIDE fetch finished"
        );
        Ok(outcome)
    }
}

/// Runs every request concurrently and returns the results in request order.
async fn fetch_all<K>(
    transport: &Arc<dyn FormTransport>,
    url: String,
    requests: Vec<(K, Vec<(String, String)>)>,
) -> Vec<(K, Result<JsonValue, FetchError>)>
where
    K: Clone + Send + 'static,
{
    let mut tasks = JoinSet::new();
    let mut keys = Vec::with_capacity(requests.len());
    for (index, (key, query)) in requests.into_iter().enumerate() {
        keys.push(key);
        let transport = Arc::clone(transport);
        let url = url.clone();
        tasks.spawn(async move { (index, transport.get_json(&url, &query).await) });
    }

    let mut slots: Vec<Option<Result<JsonValue, FetchError>>> = keys.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(err) => warn!(error = %err, "FIDE request task aborted"),
        }
    }

    keys.into_iter()
        .zip(slots)
        .map(|(key, slot)| {
            let result = slot.unwrap_or_else(|| {
                Err(FetchError::Json {
                    url: url.clone(),
                    message: "request task aborted".to_string(),
                })
            });
            (key, result)
        })
        .collect()
}

fn parse_country_codes(body: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(body);
    let options = selector("select#select_country option")?;
    Ok(document
        .select(&options)
        .filter_map(|option| option.value().attr("value"))
        .map(str::trim)
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("all"))
        .map(str::to_string)
        .collect())
}

fn parse_periods(value: &JsonValue) -> Result<Vec<String>, AdapterError> {
    let items = value
        .as_array()
        .ok_or_else(|| AdapterError::Message("periods payload is not a list".to_string()))?;
    Ok(items
        .iter()
        .filter_map(|item| item.get("frl_publish"))
        .map(json_text)
        .filter(|period| !period.is_empty())
        .collect())
}

/// `{"data": [[id, name_html, city, s, start, rcvd_html], ...]}`; short rows are padded.
fn parse_tournament_rows(
    value: &JsonValue,
    country: &str,
    period: &str,
) -> Result<Vec<TournamentRecord>, AdapterError> {
    let Some(rows) = value.get("data").and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(cells) = row.as_array() else {
            warn!(country, period, "skipping malformed FIDE row");
            continue;
        };
        let mut cells: Vec<String> = cells.iter().map(json_text).collect();
        cells.resize(ROW_WIDTH.max(cells.len()), String::new());

        let start = cells[4].trim().to_string();
        let (year, month) = parse_iso_date(&start)
            .map(|d| (d.year().to_string(), d.month().to_string()))
            .unwrap_or_default();
        let city = cells[2].trim();
        let place = if city.is_empty() {
            country.to_string()
        } else {
            format!("{city}, {country}")
        };

        records.push(TournamentRecord {
            federation: FIDE_FEDERATION.to_string(),
            external_id: cells[0].trim().to_string(),
            name: fragment_text(&cells[1])?,
            status: cells[3].trim().to_string(),
            place,
            period: period.to_string(),
            observation: fragment_text(&cells[5])?,
            start_date: start,
            year,
            month,
            ..Default::default()
        });
    }
    Ok(records)
}

/// Text of the first `<a>` in an HTML fragment, or the whole fragment's text.
fn fragment_text(html: &str) -> Result<String, AdapterError> {
    if html.trim().is_empty() {
        return Ok(String::new());
    }
    let fragment = Html::parse_fragment(html);
    let anchor = selector("a")?;
    let text = match fragment.select(&anchor).next() {
        Some(a) => a.text().collect::<String>(),
        None => fragment.root_element().text().collect::<String>(),
    };
    Ok(collapse_whitespace(&text))
}

fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Rows without a usable start date are always kept.
pub fn is_within_range(start: &str, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    let Some(date) = parse_iso_date(start) else {
        return true;
    };
    from.map_or(true, |from| date >= from) && to.map_or(true, |to| date <= to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const COUNTRIES_PAGE: &str = r#"<html><body>
        <select id="select_country">
          <option value="all">All countries</option>
          <option value="BRA">Brazil</option>
          <option value="">--</option>
          <option value="ARG">Argentina</option>
        </select></body></html>"#;

    struct FakeFide {
        json: HashMap<(String, String), Result<JsonValue, u16>>,
        queries: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl FakeFide {
        fn new(json: Vec<((&str, &str), Result<JsonValue, u16>)>) -> Self {
            Self {
                json: json
                    .into_iter()
                    .map(|((a, b), v)| ((a.to_string(), b.to_string()), v))
                    .collect(),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FormTransport for FakeFide {
        async fn get(&self, _url: &str) -> Result<String, FetchError> {
            Ok(COUNTRIES_PAGE.to_string())
        }

        async fn post_form(&self, url: &str, _fields: &[(String, String)]) -> Result<String, FetchError> {
            Err(FetchError::HttpStatus {
                status: 405,
                url: url.to_string(),
            })
        }

        async fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<JsonValue, FetchError> {
            self.queries.lock().unwrap().push(query.to_vec());
            let get = |name: &str| {
                query
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default()
            };
            let key = if url.ends_with("a_tournaments_panel.php") {
                (get("country"), "periods".to_string())
            } else {
                (get("country"), get("period"))
            };
            match self.json.get(&key) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(status)) => Err(FetchError::HttpStatus {
                    status: *status,
                    url: url.to_string(),
                }),
                None => Ok(json!({ "data": [] })),
            }
        }
    }

    fn fixture_transport() -> Arc<FakeFide> {
        Arc::new(FakeFide::new(vec![
            (("BRA", "periods"), Ok(json!([{ "frl_publish": "2025-03-01" }, { "frl_publish": "2025-02-01" }]))),
            (("ARG", "periods"), Err(503)),
            (
                ("BRA", "2025-03-01"),
                Ok(json!({ "data": [
                    [401234, "<a href=\"/tournament_information.phtml?event=401234\">Aberto de Natal</a>", "Natal", "s", "2025-02-10", "<a href=\"#\">2025-02-20</a>"],
                    ["401240", "<a href=\"#\">Torneio sem data</a>", "", "", "0000-00-00"],
                    [401300, "Fora da janela", "Recife", "", "2024-12-01", null]
                ]})),
            ),
            (("BRA", "2025-02-01"), Err(500)),
        ]))
    }

    #[tokio::test]
    async fn fetch_maps_rows_and_reports_failed_combinations() {
        let transport = fixture_transport();
        let adapter = FideTournaments::new("https://ratings.fide.com");
        let request = FetchRequest {
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1),
            ..Default::default()
        };
        let outcome = adapter.fetch_raw(transport.clone(), &request).await.expect("fetch");

        assert_eq!(
            outcome.failed_pages,
            vec!["periods/ARG".to_string(), "BRA/2025-02-01".to_string()]
        );
        assert_eq!(outcome.records.len(), 2);

        let ScrapedRecord::Tournament(first) = &outcome.records[0] else {
            panic!("expected a tournament");
        };
        assert_eq!(first.federation, "fide");
        assert_eq!(first.external_id, "401234");
        assert_eq!(first.name, "Aberto de Natal");
        assert_eq!(first.place, "Natal, BRA");
        assert_eq!(first.status, "s");
        assert_eq!(first.observation, "2025-02-20");
        assert_eq!(first.period, "2025-03-01");
        assert_eq!((first.year.as_str(), first.month.as_str()), ("2025", "2"));

        let ScrapedRecord::Tournament(second) = &outcome.records[1] else {
            panic!("expected a tournament");
        };
        assert_eq!(second.external_id, "401240");
        assert_eq!(second.place, "BRA");
        assert_eq!(second.observation, "");
        assert_eq!(second.year, "");
    }

    #[tokio::test]
    async fn explicit_countries_skip_discovery_and_bust_the_cache() {
        let transport = fixture_transport();
        let adapter = FideTournaments::new("https://ratings.fide.com");
        let request = FetchRequest {
            countries: vec![" bra ".to_string()],
            limit: Some(1),
            ..Default::default()
        };
        let outcome = adapter.fetch_raw(transport.clone(), &request).await.expect("fetch");
        assert_eq!(outcome.records.len(), 1);

        let queries = transport.queries.lock().unwrap().clone();
        assert!(queries.iter().all(|q| q.iter().any(|(k, v)| k == "country" && v == "BRA")));
        assert!(queries
            .iter()
            .filter(|q| q.iter().any(|(k, _)| k == "period"))
            .all(|q| q.iter().any(|(k, v)| k == "_" && !v.is_empty())));
    }

    #[test]
    fn country_selector_skips_the_all_option() {
        assert_eq!(parse_country_codes(COUNTRIES_PAGE).expect("codes"), vec!["BRA", "ARG"]);
        assert!(parse_country_codes("<html></html>").expect("codes").is_empty());
    }

    #[test]
    fn date_window_keeps_undated_rows() {
        let from = NaiveDate::from_ymd_opt(2025, 1, 1);
        let to = NaiveDate::from_ymd_opt(2025, 1, 31);
        assert!(is_within_range("2025-01-15", from, to));
        assert!(!is_within_range("2025-02-01", from, to));
        assert!(is_within_range("", from, to));
        assert!(is_within_range("0000-00-00", from, to));
        assert!(is_within_range("2030-01-01", None, None));
    }
}

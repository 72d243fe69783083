//! Postgres-backed [`EntityStore`]: one short transaction per reconciled record.

use async_trait::async_trait;
use chrono::Utc;
use otb_core::{
    Announcement, AnnouncementRecord, MatchKey, NewsItem, NewsRecord, Player, PlayerRecord,
    ScrapedRecord, SyncJob, SyncStatus, Tournament, TournamentRecord, UpsertOutcome,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::info;

use crate::store::{EntityStore, StoreError, WipeScope};

const TOURNAMENT_COLUMNS: &str = "id, federation, external_id, name, status, time_control, rating, \
     total_players, fide_players, organizer, place, period, observation, regulation, start_date, \
     end_date, year, month, created_at, scraped_at";
const PLAYER_COLUMNS: &str = "id, local_id, name, birthday, gender, country, state, classical, \
     rapid, blitz, fide_id, local_profile, created_at, scraped_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn reconcile_tournament(
        &self,
        record: &TournamentRecord,
        keys: &[MatchKey],
        label: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let mut existing = None;
        for key in keys {
            existing = find_tournament(&mut tx, key, record).await?;
            if existing.is_some() {
                break;
            }
        }

        let outcome = match existing {
            Some(mut tournament) => {
                tournament.apply(record, now);
                sqlx::query(
                    r#"
                    UPDATE tournaments
                       SET external_id = $2, name = $3, status = $4, time_control = $5,
                           rating = $6, total_players = $7, fide_players = $8, organizer = $9,
                           place = $10, period = $11, observation = $12, regulation = $13,
                           start_date = $14, end_date = $15, year = $16, month = $17,
                           scraped_at = $18
                     WHERE id = $1
                    "#,
                )
                .bind(tournament.id)
                .bind(&tournament.external_id)
                .bind(&tournament.name)
                .bind(&tournament.status)
                .bind(&tournament.time_control)
                .bind(&tournament.rating)
                .bind(tournament.total_players)
                .bind(tournament.fide_players)
                .bind(&tournament.organizer)
                .bind(&tournament.place)
                .bind(&tournament.period)
                .bind(&tournament.observation)
                .bind(&tournament.regulation)
                .bind(tournament.start_date)
                .bind(tournament.end_date)
                .bind(&tournament.year)
                .bind(&tournament.month)
                .bind(tournament.scraped_at)
                .execute(&mut *tx)
                .await
                .map_err(|err| write_error(err, label))?;
                UpsertOutcome::Updated
            }
            None => {
                let t = Tournament::from_record(0, record, now);
                sqlx::query(
                    r#"
                    INSERT INTO tournaments (
                        federation, external_id, name, status, time_control, rating,
                        total_players, fide_players, organizer, place, period, observation,
                        regulation, start_date, end_date, year, month, created_at, scraped_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                            $16, $17, $18, $19)
                    "#,
                )
                .bind(&t.federation)
                .bind(&t.external_id)
                .bind(&t.name)
                .bind(&t.status)
                .bind(&t.time_control)
                .bind(&t.rating)
                .bind(t.total_players)
                .bind(t.fide_players)
                .bind(&t.organizer)
                .bind(&t.place)
                .bind(&t.period)
                .bind(&t.observation)
                .bind(&t.regulation)
                .bind(t.start_date)
                .bind(t.end_date)
                .bind(&t.year)
                .bind(&t.month)
                .bind(t.created_at)
                .bind(t.scraped_at)
                .execute(&mut *tx)
                .await
                .map_err(|err| write_error(err, label))?;
                UpsertOutcome::Created
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn reconcile_player(
        &self,
        record: &PlayerRecord,
        label: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {PLAYER_COLUMNS} FROM cbx_players WHERE local_id = $1 FOR UPDATE");
        let existing = sqlx::query(&sql)
            .bind(record.local_id.trim())
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| player_from_row(&row))
            .transpose()?;

        let (player, outcome) = match existing {
            Some(mut player) => {
                player.apply(record, now);
                (player, UpsertOutcome::Updated)
            }
            None => (Player::from_record(0, record, now), UpsertOutcome::Created),
        };

        let query = match outcome {
            UpsertOutcome::Updated => sqlx::query(
                r#"
                UPDATE cbx_players
                   SET name = $2, birthday = $3, gender = $4, country = $5, state = $6,
                       classical = $7, rapid = $8, blitz = $9, fide_id = $10,
                       local_profile = $11, scraped_at = $12
                 WHERE local_id = $1
                "#,
            ),
            UpsertOutcome::Created => sqlx::query(
                r#"
                INSERT INTO cbx_players (
                    local_id, name, birthday, gender, country, state, classical, rapid, blitz,
                    fide_id, local_profile, scraped_at, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
                "#,
            ),
        };
        query
            .bind(&player.local_id)
            .bind(&player.name)
            .bind(&player.birthday)
            .bind(&player.gender)
            .bind(&player.country)
            .bind(&player.state)
            .bind(&player.classical)
            .bind(&player.rapid)
            .bind(&player.blitz)
            .bind(&player.fide_id)
            .bind(&player.local_profile)
            .bind(player.scraped_at)
            .execute(&mut *tx)
            .await
            .map_err(|err| write_error(err, label))?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn reconcile_news(&self, record: &NewsRecord, label: &str) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT id, title, date_text, link, summary, created_at, scraped_at \
             FROM cbx_news WHERE link = $1 FOR UPDATE",
        )
        .bind(record.link.trim())
        .fetch_optional(&mut *tx)
        .await?;

        let (item, outcome) = match existing {
            Some(row) => {
                let mut item = NewsItem {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    date_text: row.try_get("date_text")?,
                    link: row.try_get("link")?,
                    summary: row.try_get("summary")?,
                    created_at: row.try_get("created_at")?,
                    scraped_at: row.try_get("scraped_at")?,
                };
                item.apply(record, now);
                (item, UpsertOutcome::Updated)
            }
            None => (NewsItem::from_record(0, record, now), UpsertOutcome::Created),
        };

        upsert_listing(
            &mut tx,
            "cbx_news",
            "summary",
            &item.link,
            &item.title,
            &item.date_text,
            &item.summary,
            item.scraped_at,
            outcome,
        )
        .await
        .map_err(|err| write_error(err, label))?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn reconcile_announcement(
        &self,
        record: &AnnouncementRecord,
        label: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT id, title, date_text, link, content, created_at, scraped_at \
             FROM cbx_announcements WHERE link = $1 FOR UPDATE",
        )
        .bind(record.link.trim())
        .fetch_optional(&mut *tx)
        .await?;

        let (item, outcome) = match existing {
            Some(row) => {
                let mut item = Announcement {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    date_text: row.try_get("date_text")?,
                    link: row.try_get("link")?,
                    content: row.try_get("content")?,
                    created_at: row.try_get("created_at")?,
                    scraped_at: row.try_get("scraped_at")?,
                };
                item.apply(record, now);
                (item, UpsertOutcome::Updated)
            }
            None => (Announcement::from_record(0, record, now), UpsertOutcome::Created),
        };

        upsert_listing(
            &mut tx,
            "cbx_announcements",
            "content",
            &item.link,
            &item.title,
            &item.date_text,
            &item.content,
            item.scraped_at,
            outcome,
        )
        .await
        .map_err(|err| write_error(err, label))?;

        tx.commit().await?;
        Ok(outcome)
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn begin_job(&self, federation: &str) -> Result<SyncJob, StoreError> {
        let started_at = Utc::now();
        let row = sqlx::query(
            "INSERT INTO sync_jobs (federation, status, started_at) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(federation)
        .bind(SyncStatus::Started.as_str())
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(SyncJob::started(row.try_get("id")?, federation, started_at))
    }

    async fn finish_job(&self, job: &SyncJob) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = $2, finished_at = $3, created = $4, updated = $5, error = $6
             WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.finished_at)
        .bind(i64::from(job.created))
        .bind(i64::from(job.updated))
        .bind(&job.error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job.id));
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        record: &ScrapedRecord,
        keys: &[MatchKey],
    ) -> Result<UpsertOutcome, StoreError> {
        let label = record.label();
        if keys.is_empty() {
            return Err(StoreError::MissingKey(label));
        }
        match record {
            ScrapedRecord::Tournament(r) => self.reconcile_tournament(r, keys, &label).await,
            ScrapedRecord::Player(r) => self.reconcile_player(r, &label).await,
            ScrapedRecord::News(r) => self.reconcile_news(r, &label).await,
            ScrapedRecord::Announcement(r) => self.reconcile_announcement(r, &label).await,
        }
    }

    async fn wipe(&self, scope: &WipeScope) -> Result<u64, StoreError> {
        let result = match scope {
            WipeScope::Tournaments { federation } => {
                sqlx::query("DELETE FROM tournaments WHERE federation = $1")
                    .bind(federation)
                    .execute(&self.pool)
                    .await?
            }
            WipeScope::Players => sqlx::query("DELETE FROM cbx_players").execute(&self.pool).await?,
            WipeScope::News => sqlx::query("DELETE FROM cbx_news").execute(&self.pool).await?,
            WipeScope::Announcements => {
                sqlx::query("DELETE FROM cbx_announcements")
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<SyncJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, federation, status, started_at, finished_at, created, updated, error
              FROM sync_jobs
             ORDER BY started_at DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let created: Option<i64> = row.try_get("created")?;
            let updated: Option<i64> = row.try_get("updated")?;
            jobs.push(SyncJob {
                id: row.try_get("id")?,
                federation: row.try_get("federation")?,
                status: status.parse().unwrap_or(SyncStatus::Failed),
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
                created: created.unwrap_or_default().try_into().unwrap_or(u32::MAX),
                updated: updated.unwrap_or_default().try_into().unwrap_or(u32::MAX),
                error: row.try_get("error")?,
            });
        }
        Ok(jobs)
    }
}

async fn find_tournament(
    conn: &mut PgConnection,
    key: &MatchKey,
    record: &TournamentRecord,
) -> Result<Option<Tournament>, sqlx::Error> {
    let guard = "AND (external_id IS NULL OR $3 = '' OR external_id = $3)";
    let row = match key {
        MatchKey::TournamentExternalId {
            federation,
            external_id,
        } => {
            let sql = format!(
                "SELECT {TOURNAMENT_COLUMNS} FROM tournaments \
                 WHERE federation = $1 AND external_id = $2 LIMIT 1 FOR UPDATE"
            );
            sqlx::query(&sql)
                .bind(federation)
                .bind(external_id)
                .fetch_optional(&mut *conn)
                .await?
        }
        MatchKey::TournamentRegulation {
            federation,
            regulation,
        } => {
            let sql = format!(
                "SELECT {TOURNAMENT_COLUMNS} FROM tournaments \
                 WHERE federation = $1 AND regulation = $2 {guard} ORDER BY id LIMIT 1 FOR UPDATE"
            );
            sqlx::query(&sql)
                .bind(federation)
                .bind(regulation)
                .bind(record.external_id.trim())
                .fetch_optional(&mut *conn)
                .await?
        }
        MatchKey::TournamentNameYearMonth {
            federation,
            name,
            year,
            month,
        } => {
            let sql = format!(
                "SELECT {TOURNAMENT_COLUMNS} FROM tournaments \
                 WHERE federation = $1 AND name = $2 {guard} AND year = $4 AND month = $5 \
                 ORDER BY id LIMIT 1 FOR UPDATE"
            );
            sqlx::query(&sql)
                .bind(federation)
                .bind(name)
                .bind(record.external_id.trim())
                .bind(year)
                .bind(month)
                .fetch_optional(&mut *conn)
                .await?
        }
        _ => None,
    };
    row.map(|row| tournament_from_row(&row)).transpose()
}

#[allow(clippy::too_many_arguments)]
async fn upsert_listing(
    conn: &mut PgConnection,
    table: &str,
    body_column: &str,
    link: &str,
    title: &str,
    date_text: &str,
    body: &str,
    scraped_at: chrono::DateTime<Utc>,
    outcome: UpsertOutcome,
) -> Result<(), sqlx::Error> {
    let sql = match outcome {
        UpsertOutcome::Updated => format!(
            "UPDATE {table} SET title = $2, date_text = $3, {body_column} = $4, scraped_at = $5 \
             WHERE link = $1"
        ),
        UpsertOutcome::Created => format!(
            "INSERT INTO {table} (link, title, date_text, {body_column}, scraped_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $5)"
        ),
    };
    sqlx::query(&sql)
        .bind(link)
        .bind(title)
        .bind(date_text)
        .bind(body)
        .bind(scraped_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn tournament_from_row(row: &PgRow) -> Result<Tournament, sqlx::Error> {
    Ok(Tournament {
        id: row.try_get("id")?,
        federation: row.try_get("federation")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        status: row.try_get("status")?,
        time_control: row.try_get("time_control")?,
        rating: row.try_get("rating")?,
        total_players: row.try_get("total_players")?,
        fide_players: row.try_get("fide_players")?,
        organizer: row.try_get("organizer")?,
        place: row.try_get("place")?,
        period: row.try_get("period")?,
        observation: row.try_get("observation")?,
        regulation: row.try_get("regulation")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        year: row.try_get("year")?,
        month: row.try_get("month")?,
        created_at: row.try_get("created_at")?,
        scraped_at: row.try_get("scraped_at")?,
    })
}

fn player_from_row(row: &PgRow) -> Result<Player, sqlx::Error> {
    Ok(Player {
        id: row.try_get("id")?,
        local_id: row.try_get("local_id")?,
        name: row.try_get("name")?,
        birthday: row.try_get("birthday")?,
        gender: row.try_get("gender")?,
        country: row.try_get("country")?,
        state: row.try_get("state")?,
        classical: row.try_get("classical")?,
        rapid: row.try_get("rapid")?,
        blitz: row.try_get("blitz")?,
        fide_id: row.try_get("fide_id")?,
        local_profile: row.try_get("local_profile")?,
        created_at: row.try_get("created_at")?,
        scraped_at: row.try_get("scraped_at")?,
    })
}

fn write_error(err: sqlx::Error, label: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict(label.to_string());
        }
    }
    StoreError::Database(err)
}

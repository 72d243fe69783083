//! Persistence contract for reconciled entities and sync jobs.

use async_trait::async_trait;
use chrono::Utc;
use otb_core::{
    Announcement, Domain, MatchKey, NewsItem, Player, ScrapedRecord, SyncJob, SyncTarget,
    Tournament, UpsertOutcome,
};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("record {0} has no natural key")]
    MissingKey(String),
    #[error("unique constraint violated for {0}")]
    Conflict(String),
    #[error("sync job {0} not found")]
    JobNotFound(i64),
}

/// Rows removed by a full-mode or clean-mode wipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WipeScope {
    Tournaments { federation: String },
    Players,
    News,
    Announcements,
}

impl WipeScope {
    pub fn for_target(target: SyncTarget) -> Self {
        match target.domain {
            Domain::Tournaments => WipeScope::Tournaments {
                federation: target.site.as_str().to_string(),
            },
            Domain::Players => WipeScope::Players,
            Domain::News => WipeScope::News,
            Domain::Announcements => WipeScope::Announcements,
        }
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Persists a `started` job row and returns it with its id.
    async fn begin_job(&self, federation: &str) -> Result<SyncJob, StoreError>;

    async fn finish_job(&self, job: &SyncJob) -> Result<(), StoreError>;

    /// Resolves `keys` in order and updates the first match, otherwise inserts.
    /// Runs in its own transaction; an error leaves the store untouched.
    async fn reconcile(
        &self,
        record: &ScrapedRecord,
        keys: &[MatchKey],
    ) -> Result<UpsertOutcome, StoreError>;

    async fn wipe(&self, scope: &WipeScope) -> Result<u64, StoreError>;

    /// Most recent jobs first.
    async fn recent_jobs(&self, limit: usize) -> Result<Vec<SyncJob>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    tournaments: Vec<Tournament>,
    players: Vec<Player>,
    news: Vec<NewsItem>,
    announcements: Vec<Announcement>,
    jobs: Vec<SyncJob>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process store with the same matching and uniqueness rules as [`crate::PgStore`].
/// Backs `--dry-run` and the sync tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tournaments(&self) -> Vec<Tournament> {
        self.state.lock().await.tournaments.clone()
    }

    pub async fn players(&self) -> Vec<Player> {
        self.state.lock().await.players.clone()
    }

    pub async fn news(&self) -> Vec<NewsItem> {
        self.state.lock().await.news.clone()
    }

    pub async fn announcements(&self) -> Vec<Announcement> {
        self.state.lock().await.announcements.clone()
    }

    pub async fn jobs(&self) -> Vec<SyncJob> {
        self.state.lock().await.jobs.clone()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn begin_job(&self, federation: &str) -> Result<SyncJob, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        let job = SyncJob::started(id, federation, Utc::now());
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn finish_job(&self, job: &SyncJob) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or(StoreError::JobNotFound(job.id))?;
        *slot = job.clone();
        Ok(())
    }

    async fn reconcile(
        &self,
        record: &ScrapedRecord,
        keys: &[MatchKey],
    ) -> Result<UpsertOutcome, StoreError> {
        if keys.is_empty() {
            return Err(StoreError::MissingKey(record.label()));
        }
        let now = Utc::now();
        let mut state = self.state.lock().await;

        match record {
            ScrapedRecord::Tournament(r) => {
                let found = keys.iter().find_map(|key| {
                    state.tournaments.iter().position(|t| {
                        t.matches_key(key) && (!key.is_fallback() || t.accepts_fallback(r))
                    })
                });
                match found {
                    Some(index) => {
                        let mut updated = state.tournaments[index].clone();
                        updated.apply(r, now);
                        let clash = updated.external_id.is_some()
                            && state.tournaments.iter().enumerate().any(|(i, t)| {
                                i != index
                                    && t.federation == updated.federation
                                    && t.external_id == updated.external_id
                            });
                        if clash {
                            return Err(StoreError::Conflict(record.label()));
                        }
                        state.tournaments[index] = updated;
                        Ok(UpsertOutcome::Updated)
                    }
                    None => {
                        let id = state.allocate_id();
                        let created = Tournament::from_record(id, r, now);
                        let clash = created.external_id.is_some()
                            && state.tournaments.iter().any(|t| {
                                t.federation == created.federation
                                    && t.external_id == created.external_id
                            });
                        if clash {
                            return Err(StoreError::Conflict(record.label()));
                        }
                        state.tournaments.push(created);
                        Ok(UpsertOutcome::Created)
                    }
                }
            }
            ScrapedRecord::Player(r) => {
                let found = state
                    .players
                    .iter()
                    .position(|p| keys.iter().any(|k| p.matches_key(k)));
                match found {
                    Some(index) => {
                        state.players[index].apply(r, now);
                        Ok(UpsertOutcome::Updated)
                    }
                    None => {
                        let id = state.allocate_id();
                        state.players.push(Player::from_record(id, r, now));
                        Ok(UpsertOutcome::Created)
                    }
                }
            }
            ScrapedRecord::News(r) => {
                let found = state
                    .news
                    .iter()
                    .position(|n| keys.iter().any(|k| n.matches_key(k)));
                match found {
                    Some(index) => {
                        state.news[index].apply(r, now);
                        Ok(UpsertOutcome::Updated)
                    }
                    None => {
                        let id = state.allocate_id();
                        state.news.push(NewsItem::from_record(id, r, now));
                        Ok(UpsertOutcome::Created)
                    }
                }
            }
            ScrapedRecord::Announcement(r) => {
                let found = state
                    .announcements
                    .iter()
                    .position(|a| keys.iter().any(|k| a.matches_key(k)));
                match found {
                    Some(index) => {
                        state.announcements[index].apply(r, now);
                        Ok(UpsertOutcome::Updated)
                    }
                    None => {
                        let id = state.allocate_id();
                        state
                            .announcements
                            .push(Announcement::from_record(id, r, now));
                        Ok(UpsertOutcome::Created)
                    }
                }
            }
        }
    }

    async fn wipe(&self, scope: &WipeScope) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let removed = match scope {
            WipeScope::Tournaments { federation } => {
                let before = state.tournaments.len();
                state.tournaments.retain(|t| &t.federation != federation);
                before - state.tournaments.len()
            }
            WipeScope::Players => std::mem::take(&mut state.players).len(),
            WipeScope::News => std::mem::take(&mut state.news).len(),
            WipeScope::Announcements => std::mem::take(&mut state.announcements).len(),
        };
        Ok(removed as u64)
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<SyncJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().rev().take(limit).cloned().collect())
    }
}

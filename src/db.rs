use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, Sqlite, SqlitePool, Transaction,
};

use crate::utils;

/// Terminal request states never transition again
pub const TERMINAL_STATUSES: &[RequestStatus] = &[
    RequestStatus::Completed,
    RequestStatus::Cancelled,
    RequestStatus::Failed,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Show,
}

serde_plain::derive_display_from_serialize!(MediaKind);
serde_plain::derive_fromstr_from_deserialize!(MediaKind);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Discovered,
    Matched,
    Unmatched,
}

serde_plain::derive_display_from_serialize!(MediaStatus);
serde_plain::derive_fromstr_from_deserialize!(MediaStatus);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Searching,
    Downloading,
    Downloaded,
    Imported,
    Completed,
    Cancelled,
    Failed,
}

serde_plain::derive_display_from_serialize!(RequestStatus);
serde_plain::derive_fromstr_from_deserialize!(RequestStatus);

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATUSES.contains(self)
    }
}

#[derive(Debug, Clone)]
pub struct Db {
    pub pool: SqlitePool,
}

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY AUTOINCREMENT,
                                    username TEXT NOT NULL UNIQUE,
                                    email TEXT,
                                    password_hash TEXT NOT NULL,
                                    is_admin INTEGER NOT NULL DEFAULT 0,
                                    created_at TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS movies (id INTEGER PRIMARY KEY AUTOINCREMENT,
                                    title TEXT NOT NULL,
                                    year INTEGER,
                                    tmdb_id TEXT,
                                    imdb_id TEXT,
                                    path TEXT NOT NULL UNIQUE,
                                    quality TEXT NOT NULL DEFAULT '',
                                    size INTEGER NOT NULL DEFAULT 0,
                                    overview TEXT NOT NULL DEFAULT '',
                                    poster TEXT,
                                    genres TEXT NOT NULL DEFAULT '',
                                    status TEXT NOT NULL DEFAULT 'discovered',
                                    metadata_blob TEXT,
                                    torrent_hash TEXT,
                                    imported_at TEXT,
                                    created_at TEXT NOT NULL,
                                    updated_at TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS shows (id INTEGER PRIMARY KEY AUTOINCREMENT,
                                    title TEXT NOT NULL,
                                    year INTEGER,
                                    tvdb_id TEXT,
                                    tmdb_id TEXT,
                                    imdb_id TEXT,
                                    path TEXT UNIQUE,
                                    overview TEXT NOT NULL DEFAULT '',
                                    poster TEXT,
                                    genres TEXT NOT NULL DEFAULT '',
                                    status TEXT NOT NULL DEFAULT 'discovered',
                                    metadata_blob TEXT,
                                    created_at TEXT NOT NULL,
                                    updated_at TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS seasons (id INTEGER PRIMARY KEY AUTOINCREMENT,
                                    show_id INTEGER NOT NULL,
                                    number INTEGER NOT NULL,
                                    UNIQUE (show_id, number),
                                    FOREIGN KEY (show_id) REFERENCES shows (id) ON DELETE CASCADE)",
    "CREATE TABLE IF NOT EXISTS episodes (id INTEGER PRIMARY KEY AUTOINCREMENT,
                                    season_id INTEGER NOT NULL,
                                    number INTEGER NOT NULL,
                                    title TEXT NOT NULL DEFAULT '',
                                    file_path TEXT NOT NULL UNIQUE,
                                    quality TEXT NOT NULL DEFAULT '',
                                    size INTEGER NOT NULL DEFAULT 0,
                                    torrent_hash TEXT,
                                    imported_at TEXT,
                                    subtitles_synced INTEGER NOT NULL DEFAULT 0,
                                    UNIQUE (season_id, number),
                                    FOREIGN KEY (season_id) REFERENCES seasons (id) ON DELETE CASCADE)",
    "CREATE TABLE IF NOT EXISTS requests (id INTEGER PRIMARY KEY AUTOINCREMENT,
                                    user_id INTEGER NOT NULL,
                                    media_type TEXT NOT NULL,
                                    external_id TEXT NOT NULL,
                                    title TEXT NOT NULL,
                                    year INTEGER,
                                    seasons TEXT NOT NULL DEFAULT '',
                                    status TEXT NOT NULL DEFAULT 'pending',
                                    reason TEXT,
                                    search_attempts INTEGER NOT NULL DEFAULT 0,
                                    created_at TEXT NOT NULL,
                                    updated_at TEXT NOT NULL,
                                    FOREIGN KEY (user_id) REFERENCES users (id))",
    "CREATE TABLE IF NOT EXISTS request_torrents (id INTEGER PRIMARY KEY AUTOINCREMENT,
                                    request_id INTEGER NOT NULL,
                                    season INTEGER,
                                    info_hash TEXT NOT NULL,
                                    UNIQUE (request_id, season),
                                    FOREIGN KEY (request_id) REFERENCES requests (id) ON DELETE CASCADE)",
    "CREATE TABLE IF NOT EXISTS indexers (id INTEGER PRIMARY KEY AUTOINCREMENT,
                                    name TEXT NOT NULL UNIQUE,
                                    kind TEXT NOT NULL,
                                    enabled INTEGER NOT NULL DEFAULT 1,
                                    base_url TEXT NOT NULL DEFAULT '',
                                    api_key TEXT NOT NULL DEFAULT '',
                                    priority INTEGER NOT NULL DEFAULT 50,
                                    settings TEXT NOT NULL DEFAULT '{}')",
];

/// Columns added after the initial schema shipped. Applied with a
/// table_info guard so reruns are no-ops.
const COLUMN_GUARDS: &[(&str, &str, &str)] = &[
    ("movies", "subtitles_synced", "INTEGER NOT NULL DEFAULT 0"),
    ("shows", "quality", "TEXT NOT NULL DEFAULT ''"),
];

impl Db {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(25)
            .min_connections(5)
            .max_lifetime(Duration::from_secs(5 * 60))
            .connect_with(options)
            .await?;

        for migration in MIGRATIONS {
            sqlx::query(migration).execute(&pool).await?;
        }
        for (table, column, ddl) in COLUMN_GUARDS {
            let exists: Option<i64> = sqlx::query_scalar(&format!(
                "SELECT 1 FROM pragma_table_info('{table}') WHERE name = ?"
            ))
            .bind(column)
            .fetch_optional(&pool)
            .await?;
            if exists.is_none() {
                sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"))
                    .execute(&pool)
                    .await?;
            }
        }

        Ok(Self { pool })
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Delete all media and requests in one transaction. Users, indexers
    /// and the filesystem are untouched.
    pub async fn nuke(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.begin().await?;
        for table in [
            "episodes",
            "seasons",
            "shows",
            "movies",
            "request_torrents",
            "requests",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // Users

    pub async fn insert_user(
        &self,
        username: &str,
        email: Option<&str>,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO users (username, email, password_hash, is_admin, created_at)
            VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(is_admin)
        .bind(utils::now_rfc3339())
        .fetch_one(&self.pool)
        .await
    }

    pub async fn user(&self, id: i64) -> Result<DbUser, sqlx::Error> {
        sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<DbUser>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn admin_exists(&self) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE is_admin = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    // Movies

    /// Insert a scanned movie or reuse the row that already owns its path.
    /// `updated_at` moves only when size or quality actually changed, so
    /// rescanning an unchanged tree leaves rows untouched.
    pub async fn upsert_movie(&self, movie: &NewMovie) -> Result<i64, sqlx::Error> {
        let now = utils::now_rfc3339();
        let updated: Option<i64> = sqlx::query_scalar(
            "INSERT INTO movies (title, year, path, quality, size, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (path) DO UPDATE SET
                quality = excluded.quality,
                size = excluded.size,
                updated_at = excluded.updated_at
            WHERE movies.quality != excluded.quality OR movies.size != excluded.size
            RETURNING id",
        )
        .bind(&movie.title)
        .bind(movie.year)
        .bind(&movie.path)
        .bind(&movie.quality)
        .bind(movie.size)
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;
        match updated {
            Some(id) => Ok(id),
            None => {
                sqlx::query_scalar("SELECT id FROM movies WHERE path = ?")
                    .bind(&movie.path)
                    .fetch_one(&self.pool)
                    .await
            }
        }
    }

    pub async fn movie(&self, id: i64) -> Result<DbMovie, sqlx::Error> {
        sqlx::query_as("SELECT * FROM movies WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn all_movies(&self) -> Result<Vec<DbMovie>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM movies ORDER BY title")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn movies_with_status(
        &self,
        status: MediaStatus,
    ) -> Result<Vec<DbMovie>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM movies WHERE status = ?")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
    }

    pub async fn movie_by_tmdb_id(&self, tmdb_id: &str) -> Result<Option<DbMovie>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM movies WHERE tmdb_id = ?")
            .bind(tmdb_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn set_movie_match(&self, id: i64, m: &MediaMatch) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE movies SET title = ?, year = ?, tmdb_id = ?, imdb_id = ?, overview = ?,
                poster = ?, genres = ?, metadata_blob = ?, status = ?, updated_at = ?
            WHERE id = ?",
        )
        .bind(&m.title)
        .bind(m.year)
        .bind(&m.external_id)
        .bind(&m.imdb_id)
        .bind(&m.overview)
        .bind(&m.poster)
        .bind(&m.genres)
        .bind(&m.metadata_blob)
        .bind(MediaStatus::Matched.to_string())
        .bind(utils::now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_movie_status(&self, id: i64, status: MediaStatus) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE movies SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(utils::now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_movie_imported(&self, id: i64, new_path: &str) -> Result<(), sqlx::Error> {
        let now = utils::now_rfc3339();
        sqlx::query("UPDATE movies SET path = ?, imported_at = ?, updated_at = ? WHERE id = ?")
            .bind(new_path)
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_movie_torrent_hash(&self, id: i64, hash: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE movies SET torrent_hash = ?, updated_at = ? WHERE id = ?")
            .bind(hash)
            .bind(utils::now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn movie_by_torrent_hash(&self, hash: &str) -> Result<Option<DbMovie>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM movies WHERE torrent_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn set_movie_subtitles_synced(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE movies SET subtitles_synced = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn imported_movies_missing_subtitles(&self) -> Result<Vec<DbMovie>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM movies WHERE imported_at IS NOT NULL AND subtitles_synced = 0",
        )
        .fetch_all(&self.pool)
        .await
    }

    // Shows

    pub async fn upsert_show(&self, show: &NewShow) -> Result<i64, sqlx::Error> {
        let now = utils::now_rfc3339();
        let updated: Option<i64> = sqlx::query_scalar(
            "INSERT INTO shows (title, year, path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (path) DO UPDATE SET
                title = excluded.title,
                updated_at = excluded.updated_at
            WHERE shows.title != excluded.title
            RETURNING id",
        )
        .bind(&show.title)
        .bind(show.year)
        .bind(&show.path)
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;
        match updated {
            Some(id) => Ok(id),
            None => {
                sqlx::query_scalar("SELECT id FROM shows WHERE path = ?")
                    .bind(&show.path)
                    .fetch_one(&self.pool)
                    .await
            }
        }
    }

    pub async fn show(&self, id: i64) -> Result<DbShow, sqlx::Error> {
        sqlx::query_as("SELECT * FROM shows WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn all_shows(&self) -> Result<Vec<DbShow>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM shows ORDER BY title")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn shows_with_status(&self, status: MediaStatus) -> Result<Vec<DbShow>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM shows WHERE status = ?")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
    }

    pub async fn show_by_tvdb_id(&self, tvdb_id: &str) -> Result<Option<DbShow>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM shows WHERE tvdb_id = ?")
            .bind(tvdb_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn set_show_match(&self, id: i64, m: &MediaMatch) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE shows SET title = ?, year = ?, tvdb_id = ?, imdb_id = ?, overview = ?,
                poster = ?, genres = ?, metadata_blob = ?, status = ?, updated_at = ?
            WHERE id = ?",
        )
        .bind(&m.title)
        .bind(m.year)
        .bind(&m.external_id)
        .bind(&m.imdb_id)
        .bind(&m.overview)
        .bind(&m.poster)
        .bind(&m.genres)
        .bind(&m.metadata_blob)
        .bind(MediaStatus::Matched.to_string())
        .bind(utils::now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_show_status(&self, id: i64, status: MediaStatus) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE shows SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(utils::now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_show_path(&self, id: i64, path: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE shows SET path = ?, updated_at = ? WHERE id = ?")
            .bind(path)
            .bind(utils::now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_show(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM shows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Seasons and episodes

    pub async fn upsert_season(&self, show_id: i64, number: i64) -> Result<i64, sqlx::Error> {
        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO seasons (show_id, number) VALUES (?, ?)
            ON CONFLICT (show_id, number) DO NOTHING RETURNING id",
        )
        .bind(show_id)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;
        match inserted {
            Some(id) => Ok(id),
            None => {
                sqlx::query_scalar("SELECT id FROM seasons WHERE show_id = ? AND number = ?")
                    .bind(show_id)
                    .bind(number)
                    .fetch_one(&self.pool)
                    .await
            }
        }
    }

    pub async fn seasons_for_show(&self, show_id: i64) -> Result<Vec<DbSeason>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM seasons WHERE show_id = ? ORDER BY number")
            .bind(show_id)
            .fetch_all(&self.pool)
            .await
    }

    /// Insert a scanned episode, reusing the row that owns its path. A
    /// second file for an already occupied (season, number) slot resolves
    /// to the existing row instead of erroring.
    pub async fn upsert_episode(&self, episode: &NewEpisode) -> Result<i64, sqlx::Error> {
        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT OR IGNORE INTO episodes (season_id, number, title, file_path, quality, size)
            VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(episode.season_id)
        .bind(episode.number)
        .bind(&episode.title)
        .bind(&episode.file_path)
        .bind(&episode.quality)
        .bind(episode.size)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = inserted {
            return Ok(id);
        }
        let by_path: Option<i64> = sqlx::query_scalar("SELECT id FROM episodes WHERE file_path = ?")
            .bind(&episode.file_path)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(id) = by_path {
            sqlx::query(
                "UPDATE episodes SET quality = ?, size = ?
                WHERE id = ? AND (quality != ? OR size != ?)",
            )
            .bind(&episode.quality)
            .bind(episode.size)
            .bind(id)
            .bind(&episode.quality)
            .bind(episode.size)
            .execute(&self.pool)
            .await?;
            return Ok(id);
        }
        sqlx::query_scalar("SELECT id FROM episodes WHERE season_id = ? AND number = ?")
            .bind(episode.season_id)
            .bind(episode.number)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn episodes_for_season(&self, season_id: i64) -> Result<Vec<DbEpisode>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM episodes WHERE season_id = ? ORDER BY number")
            .bind(season_id)
            .fetch_all(&self.pool)
            .await
    }

    /// Episodes of a show joined through seasons, with the season number
    pub async fn episodes_for_show(&self, show_id: i64) -> Result<Vec<DbShowEpisode>, sqlx::Error> {
        sqlx::query_as(
            "SELECT episodes.*, seasons.number AS season_number FROM episodes
            JOIN seasons ON seasons.id = episodes.season_id
            WHERE seasons.show_id = ?
            ORDER BY seasons.number, episodes.number",
        )
        .bind(show_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Episode joined up through its season to the owning show
    pub async fn episode_context(&self, id: i64) -> Result<DbEpisodeContext, sqlx::Error> {
        sqlx::query_as(
            "SELECT episodes.id, episodes.season_id, episodes.number, episodes.title,
                episodes.file_path, episodes.quality, episodes.size, episodes.imported_at,
                seasons.number AS season_number,
                shows.id AS show_id, shows.title AS show_title, shows.year AS show_year,
                shows.status AS show_status, shows.imdb_id AS show_imdb_id
            FROM episodes
            JOIN seasons ON seasons.id = episodes.season_id
            JOIN shows ON shows.id = seasons.show_id
            WHERE episodes.id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
    }

    /// Episodes of matched shows that were never imported
    pub async fn episodes_pending_import(&self) -> Result<Vec<DbEpisodeContext>, sqlx::Error> {
        sqlx::query_as(
            "SELECT episodes.id, episodes.season_id, episodes.number, episodes.title,
                episodes.file_path, episodes.quality, episodes.size, episodes.imported_at,
                seasons.number AS season_number,
                shows.id AS show_id, shows.title AS show_title, shows.year AS show_year,
                shows.status AS show_status, shows.imdb_id AS show_imdb_id
            FROM episodes
            JOIN seasons ON seasons.id = episodes.season_id
            JOIN shows ON shows.id = seasons.show_id
            WHERE episodes.imported_at IS NULL AND shows.status = 'matched'
            ORDER BY shows.title, seasons.number, episodes.number",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn set_episode_imported(&self, id: i64, new_path: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE episodes SET file_path = ?, imported_at = ? WHERE id = ?")
            .bind(new_path)
            .bind(utils::now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_episode_torrent_hash(&self, id: i64, hash: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE episodes SET torrent_hash = ? WHERE id = ?")
            .bind(hash)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn episode_by_torrent_hash(
        &self,
        hash: &str,
    ) -> Result<Option<DbEpisode>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM episodes WHERE torrent_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn set_episode_subtitles_synced(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE episodes SET subtitles_synced = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Imported episodes still waiting for subtitles, with show context
    pub async fn episodes_pending_subtitles(
        &self,
    ) -> Result<Vec<DbEpisodeContext>, sqlx::Error> {
        sqlx::query_as(
            "SELECT episodes.id, episodes.season_id, episodes.number, episodes.title,
                episodes.file_path, episodes.quality, episodes.size, episodes.imported_at,
                seasons.number AS season_number,
                shows.id AS show_id, shows.title AS show_title, shows.year AS show_year,
                shows.status AS show_status, shows.imdb_id AS show_imdb_id
            FROM episodes
            JOIN seasons ON seasons.id = episodes.season_id
            JOIN shows ON shows.id = seasons.show_id
            WHERE episodes.imported_at IS NOT NULL AND episodes.subtitles_synced = 0",
        )
        .fetch_all(&self.pool)
        .await
    }

    // Requests

    pub async fn insert_request(&self, request: &NewRequest) -> Result<i64, sqlx::Error> {
        let now = utils::now_rfc3339();
        sqlx::query_scalar(
            "INSERT INTO requests
                (user_id, media_type, external_id, title, year, seasons, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(request.user_id)
        .bind(request.media_type.to_string())
        .bind(&request.external_id)
        .bind(&request.title)
        .bind(request.year)
        .bind(&request.seasons)
        .bind(request.status.to_string())
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn request(&self, id: i64) -> Result<DbRequest, sqlx::Error> {
        sqlx::query_as("SELECT * FROM requests WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        user_id: Option<i64>,
    ) -> Result<Vec<DbRequest>, sqlx::Error> {
        match (status, user_id) {
            (Some(status), Some(user)) => {
                sqlx::query_as(
                    "SELECT * FROM requests WHERE status = ? AND user_id = ? ORDER BY created_at DESC",
                )
                .bind(status.to_string())
                .bind(user)
                .fetch_all(&self.pool)
                .await
            }
            (Some(status), None) => {
                sqlx::query_as("SELECT * FROM requests WHERE status = ? ORDER BY created_at DESC")
                    .bind(status.to_string())
                    .fetch_all(&self.pool)
                    .await
            }
            (None, Some(user)) => {
                sqlx::query_as("SELECT * FROM requests WHERE user_id = ? ORDER BY created_at DESC")
                    .bind(user)
                    .fetch_all(&self.pool)
                    .await
            }
            (None, None) => {
                sqlx::query_as("SELECT * FROM requests ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
    }

    pub async fn non_terminal_requests(&self) -> Result<Vec<DbRequest>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM requests
            WHERE status NOT IN ('completed', 'cancelled', 'failed')
            ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn terminal_requests(&self) -> Result<Vec<DbRequest>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM requests WHERE status IN ('completed', 'cancelled', 'failed')")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn active_requests_for(
        &self,
        media_type: MediaKind,
        external_id: &str,
    ) -> Result<Vec<DbRequest>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM requests
            WHERE media_type = ? AND external_id = ?
                AND status NOT IN ('completed', 'cancelled', 'failed')",
        )
        .bind(media_type.to_string())
        .bind(external_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Move a request to a new status. Rows already in a terminal status are
    /// left alone; the return value tells whether a transition happened.
    pub async fn update_request_status(
        &self,
        id: i64,
        status: RequestStatus,
        reason: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE requests SET status = ?, reason = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'cancelled', 'failed')",
        )
        .bind(status.to_string())
        .bind(reason)
        .bind(utils::now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn bump_search_attempts(&self, id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "UPDATE requests SET search_attempts = search_attempts + 1, updated_at = ?
            WHERE id = ? RETURNING search_attempts",
        )
        .bind(utils::now_rfc3339())
        .bind(id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn delete_request(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM requests WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_request_torrent(
        &self,
        request_id: i64,
        season: Option<i64>,
        info_hash: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO request_torrents (request_id, season, info_hash) VALUES (?, ?, ?)
            ON CONFLICT (request_id, season) DO UPDATE SET info_hash = excluded.info_hash",
        )
        .bind(request_id)
        .bind(season)
        .bind(info_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn request_torrents(
        &self,
        request_id: i64,
    ) -> Result<Vec<DbRequestTorrent>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM request_torrents WHERE request_id = ? ORDER BY season")
            .bind(request_id)
            .fetch_all(&self.pool)
            .await
    }

    // Indexers

    pub async fn enabled_indexers(&self) -> Result<Vec<DbIndexer>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM indexers WHERE enabled = 1 ORDER BY priority ASC, name ASC")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn all_indexers(&self) -> Result<Vec<DbIndexer>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM indexers ORDER BY priority ASC, name ASC")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn seed_indexer(&self, indexer: &DbIndexer) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO indexers (name, kind, enabled, base_url, api_key, priority, settings)
            VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&indexer.name)
        .bind(&indexer.kind)
        .bind(indexer.enabled)
        .bind(&indexer.base_url)
        .bind(&indexer.api_key)
        .bind(indexer.priority)
        .bind(&indexer.settings)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_indexer_enabled(&self, id: i64, enabled: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE indexers SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// Types

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbUser {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    #[serde(skip)]
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbMovie {
    pub id: i64,
    pub title: String,
    pub year: Option<i64>,
    pub tmdb_id: Option<String>,
    pub imdb_id: Option<String>,
    pub path: String,
    pub quality: String,
    pub size: i64,
    pub overview: String,
    pub poster: Option<String>,
    pub genres: String,
    pub status: String,
    pub metadata_blob: Option<String>,
    pub torrent_hash: Option<String>,
    pub imported_at: Option<String>,
    pub subtitles_synced: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbShow {
    pub id: i64,
    pub title: String,
    pub year: Option<i64>,
    pub tvdb_id: Option<String>,
    pub tmdb_id: Option<String>,
    pub imdb_id: Option<String>,
    pub path: Option<String>,
    pub quality: String,
    pub overview: String,
    pub poster: Option<String>,
    pub genres: String,
    pub status: String,
    pub metadata_blob: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbSeason {
    pub id: i64,
    pub show_id: i64,
    pub number: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbEpisode {
    pub id: i64,
    pub season_id: i64,
    pub number: i64,
    pub title: String,
    pub file_path: String,
    pub quality: String,
    pub size: i64,
    pub torrent_hash: Option<String>,
    pub imported_at: Option<String>,
    pub subtitles_synced: bool,
}

/// Episode row augmented with its season number for show-wide listings
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbShowEpisode {
    pub id: i64,
    pub season_id: i64,
    pub season_number: i64,
    pub number: i64,
    pub title: String,
    pub file_path: String,
    pub quality: String,
    pub size: i64,
    pub torrent_hash: Option<String>,
    pub imported_at: Option<String>,
    pub subtitles_synced: bool,
}

/// Episode row joined with its season number and owning show
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbEpisodeContext {
    pub id: i64,
    pub season_id: i64,
    pub number: i64,
    pub title: String,
    pub file_path: String,
    pub quality: String,
    pub size: i64,
    pub imported_at: Option<String>,
    pub season_number: i64,
    pub show_id: i64,
    pub show_title: String,
    pub show_year: Option<i64>,
    pub show_status: String,
    pub show_imdb_id: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbRequest {
    pub id: i64,
    pub user_id: i64,
    pub media_type: String,
    pub external_id: String,
    pub title: String,
    pub year: Option<i64>,
    pub seasons: String,
    pub status: String,
    pub reason: Option<String>,
    pub search_attempts: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl DbRequest {
    pub fn media_kind(&self) -> Option<MediaKind> {
        self.media_type.parse().ok()
    }

    pub fn request_status(&self) -> Option<RequestStatus> {
        self.status.parse().ok()
    }

    pub fn season_numbers(&self) -> Vec<i64> {
        self.seasons
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbRequestTorrent {
    pub id: i64,
    pub request_id: i64,
    pub season: Option<i64>,
    pub info_hash: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbIndexer {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub priority: i64,
    pub settings: String,
}

#[derive(Debug, Clone)]
pub struct NewMovie {
    pub title: String,
    pub year: Option<i64>,
    pub path: String,
    pub quality: String,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct NewShow {
    pub title: String,
    pub year: Option<i64>,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub season_id: i64,
    pub number: i64,
    pub title: String,
    pub file_path: String,
    pub quality: String,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub user_id: i64,
    pub media_type: MediaKind,
    pub external_id: String,
    pub title: String,
    pub year: Option<i64>,
    pub seasons: String,
    pub status: RequestStatus,
}

/// Metadata fields written when a discovered row gets matched
#[derive(Debug, Clone, Default)]
pub struct MediaMatch {
    pub title: String,
    pub year: Option<i64>,
    pub external_id: Option<String>,
    pub imdb_id: Option<String>,
    pub overview: String,
    pub poster: Option<String>,
    pub genres: String,
    pub metadata_blob: Option<String>,
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub async fn test_db() -> Db {
        let mut path = std::env::temp_dir();
        path.push("quartermaster-test");
        std::fs::create_dir_all(&path).unwrap();
        path.push(format!("{}.sqlite", uuid::Uuid::new_v4()));
        let url = format!("sqlite://{}", path.to_string_lossy());
        Db::connect(&url).await.unwrap()
    }

    fn movie(path: &str) -> NewMovie {
        NewMovie {
            title: "Example".into(),
            year: Some(2020),
            path: path.into(),
            quality: "1080p".into(),
            size: 4096,
        }
    }

    pub async fn seed_user(db: &Db) -> i64 {
        db.insert_user("operator", None, "digest", true)
            .await
            .unwrap()
    }

    fn request(external_id: &str) -> NewRequest {
        NewRequest {
            user_id: 1,
            media_type: MediaKind::Movie,
            external_id: external_id.into(),
            title: "Example".into(),
            year: Some(2020),
            seasons: String::new(),
            status: RequestStatus::Pending,
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = test_db().await;
        for migration in MIGRATIONS {
            sqlx::query(migration).execute(&db.pool).await.unwrap();
        }
    }

    #[tokio::test]
    async fn duplicate_movie_path_reuses_row() {
        let db = test_db().await;
        let first = db.upsert_movie(&movie("/media/movies/Example (2020)/a.mkv")).await.unwrap();
        let second = db.upsert_movie(&movie("/media/movies/Example (2020)/a.mkv")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(db.all_movies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rescan_of_unchanged_movie_keeps_updated_at() {
        let db = test_db().await;
        let id = db.upsert_movie(&movie("/m/a.mkv")).await.unwrap();
        let before = db.movie(id).await.unwrap().updated_at;
        db.upsert_movie(&movie("/m/a.mkv")).await.unwrap();
        let after = db.movie(id).await.unwrap().updated_at;
        assert_eq!(before, after);

        let mut changed = movie("/m/a.mkv");
        changed.size = 9999;
        db.upsert_movie(&changed).await.unwrap();
        assert_eq!(db.movie(id).await.unwrap().size, 9999);
    }

    #[tokio::test]
    async fn terminal_request_never_transitions() {
        let db = test_db().await;
        seed_user(&db).await;
        let id = db.insert_request(&request("12345")).await.unwrap();
        assert!(db
            .update_request_status(id, RequestStatus::Cancelled, None)
            .await
            .unwrap());
        let moved = db
            .update_request_status(id, RequestStatus::Searching, None)
            .await
            .unwrap();
        assert!(!moved);
        let row = db.request(id).await.unwrap();
        assert_eq!(row.request_status(), Some(RequestStatus::Cancelled));
    }

    #[tokio::test]
    async fn deleting_show_cascades_to_children() {
        let db = test_db().await;
        let show_id = db
            .upsert_show(&NewShow {
                title: "Example Show".into(),
                year: Some(2019),
                path: "/media/shows/Example Show (2019)".into(),
            })
            .await
            .unwrap();
        let season_id = db.upsert_season(show_id, 1).await.unwrap();
        db.upsert_episode(&NewEpisode {
            season_id,
            number: 1,
            title: String::new(),
            file_path: "/media/shows/Example Show (2019)/Season 01/e1.mkv".into(),
            quality: "720p".into(),
            size: 100,
        })
        .await
        .unwrap();

        db.delete_show(show_id).await.unwrap();
        let seasons = db.seasons_for_show(show_id).await.unwrap();
        assert!(seasons.is_empty());
        let episodes = db.episodes_for_season(season_id).await.unwrap();
        assert!(episodes.is_empty());
    }

    #[tokio::test]
    async fn second_file_for_same_episode_slot_reuses_row() {
        let db = test_db().await;
        let show_id = db
            .upsert_show(&NewShow {
                title: "Example Show".into(),
                year: None,
                path: "/media/shows/Example Show".into(),
            })
            .await
            .unwrap();
        let season_id = db.upsert_season(show_id, 1).await.unwrap();
        let episode = |path: &str| NewEpisode {
            season_id,
            number: 1,
            title: String::new(),
            file_path: path.into(),
            quality: "720p".into(),
            size: 1,
        };
        let first = db.upsert_episode(&episode("/m/a.mkv")).await.unwrap();
        let second = db.upsert_episode(&episode("/m/a.sample.mkv")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(db.episodes_for_season(season_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nuke_clears_media_and_requests_only() {
        let db = test_db().await;
        db.insert_user("operator", None, "digest", true).await.unwrap();
        db.upsert_movie(&movie("/m/a.mkv")).await.unwrap();
        let req = db.insert_request(&request("1")).await.unwrap();
        db.add_request_torrent(req, None, "aaaa").await.unwrap();

        db.nuke().await.unwrap();

        assert!(db.all_movies().await.unwrap().is_empty());
        assert!(db.list_requests(None, None).await.unwrap().is_empty());
        assert!(db.admin_exists().await.unwrap());
    }

    #[tokio::test]
    async fn active_request_lookup_ignores_terminal_rows() {
        let db = test_db().await;
        seed_user(&db).await;
        let id = db.insert_request(&request("12345")).await.unwrap();
        let found = db
            .active_requests_for(MediaKind::Movie, "12345")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        db.update_request_status(id, RequestStatus::Failed, Some("no results"))
            .await
            .unwrap();
        let found = db
            .active_requests_for(MediaKind::Movie, "12345")
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn indexers_order_by_priority_then_name() {
        let db = test_db().await;
        for (name, priority) in [("zeta", 10), ("alpha", 10), ("omega", 5)] {
            db.seed_indexer(&DbIndexer {
                id: 0,
                name: name.into(),
                kind: "builtin".into(),
                enabled: true,
                base_url: String::new(),
                api_key: String::new(),
                priority,
                settings: "{}".into(),
            })
            .await
            .unwrap();
        }
        let ordered: Vec<String> = db
            .enabled_indexers()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(ordered, vec!["omega", "alpha", "zeta"]);
    }
}

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use tokio::{fs, sync::mpsc, sync::Mutex, task::JoinSet};

use crate::{
    app_state::AppError,
    config,
    db::{Db, DbEpisodeContext, DbMovie, MediaStatus},
    utils,
};

/// Import worker pool size for mass operations
pub const IMPORT_WORKERS: usize = 4;
const IMPORT_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub failed: usize,
}

/// Moves matched media from the incoming roots into the curated library.
///
/// Mass imports are guarded by a per-kind try lock so two operators cannot
/// race the same batch; per-item failures are logged and skipped.
#[derive(Debug)]
pub struct Importer {
    db: &'static Db,
    movies_lock: Mutex<()>,
    shows_lock: Mutex<()>,
}

impl Importer {
    pub fn new(db: &'static Db) -> Self {
        Self {
            db,
            movies_lock: Mutex::new(()),
            shows_lock: Mutex::new(()),
        }
    }

    /// `<LibraryRoot>/<Title> (<Year>)/<Title> (<Year>).<ext>`
    pub fn movie_library_path(
        root: &Path,
        title: &str,
        year: Option<i64>,
        extension: &str,
    ) -> PathBuf {
        let base = utils::sanitize_file_name(&match year {
            Some(year) => format!("{title} ({year})"),
            None => title.to_string(),
        });
        root.join(&base).join(format!("{base}.{extension}"))
    }

    /// `<ShowRoot>/<Title> (<Year>)/Season NN/<Title> - SxxEyy - <EpisodeTitle>.<ext>`
    pub fn episode_library_path(
        root: &Path,
        show_title: &str,
        show_year: Option<i64>,
        season: i64,
        episode: i64,
        episode_title: &str,
        extension: &str,
    ) -> PathBuf {
        let show_dir = utils::sanitize_file_name(&match show_year {
            Some(year) => format!("{show_title} ({year})"),
            None => show_title.to_string(),
        });
        let mut file = format!("{show_title} - S{season:02}E{episode:02}");
        if !episode_title.is_empty() {
            file.push_str(&format!(" - {episode_title}"));
        }
        let file = utils::sanitize_file_name(&file);
        root.join(show_dir)
            .join(format!("Season {season:02}"))
            .join(format!("{file}.{extension}"))
    }

    pub async fn import_movie(&self, movie_id: i64) -> Result<PathBuf, AppError> {
        let movie = self.db.movie(movie_id).await?;
        let movies_path: config::MoviesPath = config::CONFIG.get_value();
        let incoming: config::IncomingMoviesPath = config::CONFIG.get_value();
        let library_root = movies_path
            .0
            .ok_or_else(|| AppError::bad_request("movie library root is not configured"))?;
        let incoming_root = incoming.0.unwrap_or_default();
        self.import_movie_row(&movie, &library_root, &incoming_root)
            .await
    }

    /// Move one matched movie into the library. On a store failure after
    /// the move the file is moved back where it came from.
    pub async fn import_movie_row(
        &self,
        movie: &DbMovie,
        library_root: &Path,
        incoming_root: &Path,
    ) -> Result<PathBuf, AppError> {
        if movie.status != MediaStatus::Matched.to_string() {
            return Err(AppError::conflict("movie has no metadata match yet"));
        }
        if movie.imported_at.is_some() {
            return Err(AppError::conflict("movie is already imported"));
        }
        let source = PathBuf::from(&movie.path);
        let extension = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mkv");
        let destination =
            Self::movie_library_path(library_root, &movie.title, movie.year, extension);
        if destination == source {
            return Ok(destination);
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        move_file(&source, &destination).await?;
        carry_subtitles(&source, &destination).await;

        if let Err(e) = self
            .db
            .set_movie_imported(movie.id, &destination.to_string_lossy())
            .await
        {
            tracing::error!("Store rejected import, moving file back: {e}");
            if let Err(undo) = move_file(&destination, &source).await {
                tracing::error!(
                    file = %destination.display(),
                    "Failed to roll back file move: {undo}"
                );
            }
            return Err(e.into());
        }
        remove_empty_parents(source.parent(), incoming_root).await;
        tracing::info!(
            from = %source.display(),
            to = %destination.display(),
            "Imported movie"
        );
        Ok(destination)
    }

    pub async fn import_episode(&self, episode_id: i64) -> Result<PathBuf, AppError> {
        let context = self.db.episode_context(episode_id).await?;
        let shows_path: config::ShowsPath = config::CONFIG.get_value();
        let incoming: config::IncomingShowsPath = config::CONFIG.get_value();
        let library_root = shows_path
            .0
            .ok_or_else(|| AppError::bad_request("show library root is not configured"))?;
        let incoming_root = incoming.0.unwrap_or_default();
        self.import_episode_row(&context, &library_root, &incoming_root)
            .await
    }

    pub async fn import_episode_row(
        &self,
        context: &DbEpisodeContext,
        library_root: &Path,
        incoming_root: &Path,
    ) -> Result<PathBuf, AppError> {
        if context.show_status != MediaStatus::Matched.to_string() {
            return Err(AppError::conflict("show has no metadata match yet"));
        }
        if context.imported_at.is_some() {
            return Err(AppError::conflict("episode is already imported"));
        }
        let source = PathBuf::from(&context.file_path);
        let extension = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mkv");
        let destination = Self::episode_library_path(
            library_root,
            &context.show_title,
            context.show_year,
            context.season_number,
            context.number,
            &context.title,
            extension,
        );
        if destination == source {
            return Ok(destination);
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        move_file(&source, &destination).await?;
        carry_subtitles(&source, &destination).await;

        if let Err(e) = self
            .db
            .set_episode_imported(context.id, &destination.to_string_lossy())
            .await
        {
            tracing::error!("Store rejected import, moving file back: {e}");
            if let Err(undo) = move_file(&destination, &source).await {
                tracing::error!(
                    file = %destination.display(),
                    "Failed to roll back file move: {undo}"
                );
            }
            return Err(e.into());
        }

        // the show row points at its library directory once something is in it
        let show_dir = destination
            .parent()
            .and_then(Path::parent)
            .map(|p| p.to_string_lossy().to_string());
        if let Some(show_dir) = show_dir {
            if let Err(e) = self.db.set_show_path(context.show_id, &show_dir).await {
                tracing::warn!("Failed to point show at its library directory: {e}");
            }
        }
        remove_empty_parents(source.parent(), incoming_root).await;
        tracing::info!(
            from = %source.display(),
            to = %destination.display(),
            "Imported episode"
        );
        Ok(destination)
    }

    /// Import every eligible movie from the incoming root. Refused with a
    /// conflict when a mass movie import is already running.
    pub async fn import_all_movies(&'static self) -> Result<ImportReport, AppError> {
        let Ok(_guard) = self.movies_lock.try_lock() else {
            return Err(AppError::conflict("movie import already in progress"));
        };
        let incoming: config::IncomingMoviesPath = config::CONFIG.get_value();
        let incoming_root = incoming
            .0
            .ok_or_else(|| AppError::bad_request("incoming movie root is not configured"))?;
        let movies = self.db.movies_with_status(MediaStatus::Matched).await?;
        let pending: Vec<i64> = movies
            .into_iter()
            .filter(|m| m.imported_at.is_none() && Path::new(&m.path).starts_with(&incoming_root))
            .map(|m| m.id)
            .collect();
        tracing::info!(count = pending.len(), "Mass movie import started");
        let report = self
            .run_pool(pending, |importer, id| async move {
                importer.import_movie(id).await.map(|_| ())
            })
            .await;
        tracing::info!(
            imported = report.imported,
            failed = report.failed,
            "Mass movie import finished"
        );
        Ok(report)
    }

    /// Import every eligible episode from the incoming root
    pub async fn import_all_shows(&'static self) -> Result<ImportReport, AppError> {
        let Ok(_guard) = self.shows_lock.try_lock() else {
            return Err(AppError::conflict("show import already in progress"));
        };
        let incoming: config::IncomingShowsPath = config::CONFIG.get_value();
        let incoming_root = incoming
            .0
            .ok_or_else(|| AppError::bad_request("incoming show root is not configured"))?;
        let episodes = self.db.episodes_pending_import().await?;
        let pending: Vec<i64> = episodes
            .into_iter()
            .filter(|e| Path::new(&e.file_path).starts_with(&incoming_root))
            .map(|e| e.id)
            .collect();
        tracing::info!(count = pending.len(), "Mass show import started");
        let report = self
            .run_pool(pending, |importer, id| async move {
                importer.import_episode(id).await.map(|_| ())
            })
            .await;
        tracing::info!(
            imported = report.imported,
            failed = report.failed,
            "Mass show import finished"
        );
        Ok(report)
    }

    async fn run_pool<F, Fut>(&'static self, ids: Vec<i64>, work: F) -> ImportReport
    where
        F: Fn(&'static Importer, i64) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = Result<(), AppError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<i64>(IMPORT_QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for _ in 0..IMPORT_WORKERS {
            let rx = rx.clone();
            let work = work.clone();
            workers.spawn(async move {
                let mut report = ImportReport::default();
                loop {
                    let id = { rx.lock().await.recv().await };
                    let Some(id) = id else {
                        break;
                    };
                    match work(self, id).await {
                        Ok(()) => report.imported += 1,
                        Err(e) => {
                            tracing::warn!(item = id, "Import failed, continuing batch: {e}");
                            report.failed += 1;
                        }
                    }
                }
                report
            });
        }
        for id in ids {
            let _ = tx.send(id).await;
        }
        drop(tx);

        let mut total = ImportReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => {
                    total.imported += report.imported;
                    total.failed += report.failed;
                }
                Err(e) => tracing::error!("Import worker panicked: {e}"),
            }
        }
        total
    }
}

/// Rename with a copy + flush + unlink fallback for cross device moves
async fn move_file(source: &Path, destination: &Path) -> Result<(), std::io::Error> {
    match fs::rename(source, destination).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
            tracing::debug!(
                from = %source.display(),
                "Cross device move, falling back to copy"
            );
            fs::copy(source, destination).await?;
            let file = fs::File::open(destination).await?;
            file.sync_all().await?;
            fs::remove_file(source).await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

const fn libc_exdev() -> i32 {
    // EXDEV on every unix we run on
    18
}

/// Bring subtitle files that share the video's stem along with it
async fn carry_subtitles(source: &Path, destination: &Path) {
    let (Some(src_parent), Some(src_stem)) = (
        source.parent(),
        source.file_stem().and_then(|s| s.to_str()),
    ) else {
        return;
    };
    let (Some(dst_parent), Some(dst_stem)) = (
        destination.parent(),
        destination.file_stem().and_then(|s| s.to_str()),
    ) else {
        return;
    };
    let Ok(mut dir) = fs::read_dir(src_parent).await else {
        return;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let path = entry.path();
        if !utils::is_subtitle_file(&path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(src_stem) {
            continue;
        }
        let new_name = format!("{dst_stem}{}", &name[src_stem.len()..]);
        if let Err(e) = move_file(&path, &dst_parent.join(&new_name)).await {
            tracing::warn!(subtitle = name, "Failed to carry subtitle: {e}");
        } else {
            tracing::debug!(subtitle = new_name, "Carried subtitle along");
        }
    }
}

/// Walk from the old file's directory upwards, removing directories that
/// became empty. Stops at the incoming root itself.
async fn remove_empty_parents(start: Option<&Path>, stop_root: &Path) {
    let mut current = start.map(Path::to_path_buf);
    while let Some(dir) = current {
        if dir == stop_root || !dir.starts_with(stop_root) {
            break;
        }
        let empty = match std::fs::read_dir(&dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => break,
        };
        if !empty {
            break;
        }
        if let Err(e) = fs::remove_dir(&dir).await {
            tracing::debug!(dir = %dir.display(), "Stopped empty dir cleanup: {e}");
            break;
        }
        current = dir.parent().map(Path::to_path_buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::db::{MediaMatch, NewEpisode, NewMovie, NewShow};
    use std::fs as std_fs;

    fn temp_tree() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push("quartermaster-test");
        path.push(uuid::Uuid::new_v4().to_string());
        std_fs::create_dir_all(&path).unwrap();
        path
    }

    fn write_file(path: &Path, bytes: usize) {
        std_fs::create_dir_all(path.parent().unwrap()).unwrap();
        std_fs::write(path, vec![1u8; bytes]).unwrap();
    }

    async fn leaked_importer() -> (&'static Importer, &'static Db) {
        let db: &'static Db = Box::leak(Box::new(test_db().await));
        let importer: &'static Importer = Box::leak(Box::new(Importer::new(db)));
        (importer, db)
    }

    #[test]
    fn movie_path_layout() {
        let path = Importer::movie_library_path(
            Path::new("/media/movies"),
            "Example",
            Some(2020),
            "mkv",
        );
        assert_eq!(
            path,
            PathBuf::from("/media/movies/Example (2020)/Example (2020).mkv")
        );
    }

    #[test]
    fn episode_path_layout() {
        let path = Importer::episode_library_path(
            Path::new("/media/shows"),
            "Example Show",
            Some(2019),
            1,
            2,
            "First Steps",
            "mkv",
        );
        assert_eq!(
            path,
            PathBuf::from(
                "/media/shows/Example Show (2019)/Season 01/Example Show - S01E02 - First Steps.mkv"
            )
        );
        let untitled = Importer::episode_library_path(
            Path::new("/media/shows"),
            "Example Show",
            None,
            10,
            11,
            "",
            "mp4",
        );
        assert_eq!(
            untitled,
            PathBuf::from("/media/shows/Example Show/Season 10/Example Show - S10E11.mp4")
        );
    }

    #[tokio::test]
    async fn movie_import_moves_file_and_cleans_up() {
        let (importer, db) = leaked_importer().await;
        let incoming = temp_tree();
        let library = temp_tree();
        let source = incoming
            .join("Example.2020.1080p.WEB-DL")
            .join("Example.2020.1080p.mkv");
        write_file(&source, 100);
        write_file(
            &incoming
                .join("Example.2020.1080p.WEB-DL")
                .join("Example.2020.1080p.en.srt"),
            10,
        );

        let id = db
            .upsert_movie(&NewMovie {
                title: "Example".into(),
                year: Some(2020),
                path: source.to_string_lossy().to_string(),
                quality: "1080p".into(),
                size: 100,
            })
            .await
            .unwrap();
        db.set_movie_match(
            id,
            &MediaMatch {
                title: "Example".into(),
                year: Some(2020),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let movie = db.movie(id).await.unwrap();
        let destination = importer
            .import_movie_row(&movie, &library, &incoming)
            .await
            .unwrap();

        assert_eq!(
            destination,
            library.join("Example (2020)").join("Example (2020).mkv")
        );
        assert!(destination.exists());
        assert!(destination
            .parent()
            .unwrap()
            .join("Example (2020).en.srt")
            .exists());
        assert!(!source.exists());
        // release dir emptied and removed, incoming root still there
        assert!(!incoming.join("Example.2020.1080p.WEB-DL").exists());
        assert!(incoming.exists());

        let row = db.movie(id).await.unwrap();
        assert!(row.imported_at.is_some());
        assert_eq!(row.path, destination.to_string_lossy());

        let _ = std_fs::remove_dir_all(&incoming);
        let _ = std_fs::remove_dir_all(&library);
    }

    #[tokio::test]
    async fn failed_store_update_rolls_the_move_back() {
        let (importer, db) = leaked_importer().await;
        let incoming = temp_tree();
        let library = temp_tree();
        let source = incoming.join("Example (2020)").join("Example (2020).mkv");
        write_file(&source, 50);

        let id = db
            .upsert_movie(&NewMovie {
                title: "Example".into(),
                year: Some(2020),
                path: source.to_string_lossy().to_string(),
                quality: String::new(),
                size: 50,
            })
            .await
            .unwrap();
        db.set_movie_match(
            id,
            &MediaMatch {
                title: "Example".into(),
                year: Some(2020),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let movie = db.movie(id).await.unwrap();

        // break the store out from under the importer
        sqlx::query("ALTER TABLE movies RENAME TO movies_gone")
            .execute(&db.pool)
            .await
            .unwrap();

        let err = importer
            .import_movie_row(&movie, &library, &incoming)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::app_state::AppErrorKind::InternalError);
        // the file is back at its original location
        assert!(source.exists());
        assert!(!library.join("Example (2020)").join("Example (2020).mkv").exists());

        let _ = std_fs::remove_dir_all(&incoming);
        let _ = std_fs::remove_dir_all(&library);
    }

    #[tokio::test]
    async fn episode_import_sets_show_library_path() {
        let (importer, db) = leaked_importer().await;
        let incoming = temp_tree();
        let library = temp_tree();
        let source = incoming
            .join("Example.Show.S01E02.720p")
            .join("Example.Show.S01E02.720p.mkv");
        write_file(&source, 80);

        let show_id = db
            .upsert_show(&NewShow {
                title: "Example Show".into(),
                year: Some(2019),
                path: incoming.join("Example.Show.S01E02.720p").to_string_lossy().to_string(),
            })
            .await
            .unwrap();
        db.set_show_match(
            show_id,
            &MediaMatch {
                title: "Example Show".into(),
                year: Some(2019),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let season_id = db.upsert_season(show_id, 1).await.unwrap();
        let episode_id = db
            .upsert_episode(&NewEpisode {
                season_id,
                number: 2,
                title: String::new(),
                file_path: source.to_string_lossy().to_string(),
                quality: "720p".into(),
                size: 80,
            })
            .await
            .unwrap();

        let context = db.episode_context(episode_id).await.unwrap();
        let destination = importer
            .import_episode_row(&context, &library, &incoming)
            .await
            .unwrap();
        assert_eq!(
            destination,
            library
                .join("Example Show (2019)")
                .join("Season 01")
                .join("Example Show - S01E02.mkv")
        );
        assert!(destination.exists());

        let show = db.show(show_id).await.unwrap();
        assert_eq!(
            show.path.as_deref(),
            Some(library.join("Example Show (2019)").to_string_lossy().as_ref())
        );

        let _ = std_fs::remove_dir_all(&incoming);
        let _ = std_fs::remove_dir_all(&library);
    }

    #[tokio::test]
    async fn second_mass_import_is_refused_while_first_runs() {
        let (importer, _db) = leaked_importer().await;
        let _guard = importer.movies_lock.try_lock().unwrap();
        let err = importer.import_all_movies().await.unwrap_err();
        assert_eq!(err.kind, crate::app_state::AppErrorKind::Conflict);
    }
}

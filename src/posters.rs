use std::path::{Path, PathBuf};

use tokio::{fs, io::AsyncWriteExt};

use crate::{config, db::MediaKind, utils};

/// Filesystem cache for artwork. Posters live under
/// `data/images/{movies,shows}/<id>.<ext>`, ad-hoc fetches under
/// `data/posters/<sanitized-name>`. A file that already exists is a cache
/// hit and no request is made.
#[derive(Debug, Clone)]
pub struct PosterCache {
    root: PathBuf,
}

fn extension_of(url: &str) -> &str {
    let tail = url.rsplit('/').next().unwrap_or_default();
    match tail.rsplit_once('.') {
        Some((_, ext)) if ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => ext,
        _ => "jpg",
    }
}

impl PosterCache {
    pub fn new() -> Self {
        let data: config::DataPath = config::CONFIG.get_value();
        Self { root: data.0 }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn media_poster_path(&self, kind: MediaKind, id: i64, url: &str) -> PathBuf {
        let subdir = match kind {
            MediaKind::Movie => "movies",
            MediaKind::Show => "shows",
        };
        self.root
            .join("images")
            .join(subdir)
            .join(format!("{id}.{}", extension_of(url)))
    }

    pub fn url_cache_path(&self, url: &str) -> PathBuf {
        let name = utils::sanitize_file_name(
            url.trim_start_matches("https://")
                .trim_start_matches("http://"),
        );
        self.root.join("posters").join(name)
    }

    /// Fetch the poster for a library row, going to the network only on a
    /// cache miss. Returns the local path.
    pub async fn cache_media_poster(
        &self,
        kind: MediaKind,
        id: i64,
        url: &str,
    ) -> anyhow::Result<PathBuf> {
        let path = self.media_poster_path(kind, id, url);
        self.fetch_to(url, &path).await?;
        Ok(path)
    }

    /// Generic URL-keyed fetch cache
    pub async fn cache_url(&self, url: &str) -> anyhow::Result<PathBuf> {
        let path = self.url_cache_path(url);
        self.fetch_to(url, &path).await?;
        Ok(path)
    }

    async fn fetch_to(&self, url: &str, path: &Path) -> anyhow::Result<()> {
        use tokio_stream::StreamExt;
        use tokio_util::io::StreamReader;

        if fs::try_exists(path).await.unwrap_or(false) {
            tracing::trace!(url, "Poster cache hit");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let response = reqwest::get(url).await?.error_for_status()?;
        let stream = response
            .bytes_stream()
            .map(|data| data.map_err(std::io::Error::other));
        let mut reader = StreamReader::new(stream);
        let mut file = fs::File::create(path).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(())
    }
}

impl Default for PosterCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poster_paths_are_keyed_by_id_and_kind() {
        let cache = PosterCache::with_root("data");
        let path = cache.media_poster_path(MediaKind::Movie, 42, "https://img.test/a/poster.png");
        assert_eq!(path, PathBuf::from("data/images/movies/42.png"));
        let path = cache.media_poster_path(MediaKind::Show, 7, "https://img.test/no-extension");
        assert_eq!(path, PathBuf::from("data/images/shows/7.jpg"));
    }

    #[test]
    fn url_cache_path_is_sanitized() {
        let cache = PosterCache::with_root("data");
        let path = cache.url_cache_path("https://img.test/a/b.jpg?x=1");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains('/'));
        assert!(!name.contains('?'));
    }
}

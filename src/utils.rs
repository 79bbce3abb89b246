use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "webm", "avi", "m4v"];
pub const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "sub", "ass", "vtt"];

pub fn is_video_file(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_subtitle_file(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SUBTITLE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Reduce an arbitrary string to something safe to use as a file name
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => out.push('_'),
            _ => out.push(ch),
        }
    }
    let trimmed = out.trim().trim_end_matches('.');
    trimmed.to_string()
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .expect("utc timestamp formats")
}

pub fn parse_rfc3339(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}

pub fn walk_recursive<F>(
    folder: &Path,
    filter_fn: Option<F>,
) -> Result<Vec<PathBuf>, std::io::Error>
where
    F: Fn(&Path) -> bool + Copy,
{
    let mut local_paths = Vec::new();
    let dir = std::fs::read_dir(folder)?;
    for file in dir {
        let path = file?.path();
        if path.is_file() {
            if let Some(filter_fn) = filter_fn {
                if filter_fn(&path) {
                    local_paths.push(path);
                }
            } else {
                local_paths.push(path);
            }
        } else if path.is_dir() {
            local_paths.append(walk_recursive(&path, filter_fn)?.as_mut());
        }
    }
    Ok(local_paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_reserved_characters() {
        assert_eq!(sanitize_file_name("Alien: Covenant"), "Alien_ Covenant");
        assert_eq!(sanitize_file_name("what?.. "), "what_..");
        assert_eq!(sanitize_file_name("a/b\\c"), "a_b_c");
    }

    #[test]
    fn video_extension_detection() {
        assert!(is_video_file("Example (2020).MKV"));
        assert!(is_video_file("show.s01e02.mp4"));
        assert!(!is_video_file("poster.jpg"));
        assert!(!is_video_file("noext"));
    }

    #[test]
    fn timestamp_round_trip() {
        let now = now_rfc3339();
        assert!(parse_rfc3339(&now).is_some());
        assert!(parse_rfc3339("yesterday").is_none());
    }

    #[test]
    fn sha256_digest_is_stable() {
        assert_eq!(
            sha256_hex("admin"),
            "8c6976e5b5410415bde908bd4dee15dfb167a9c873fc4bb8a81f6f2ab448a918"
        );
    }
}

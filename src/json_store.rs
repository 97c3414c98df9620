//! Single-file JSON backend.
//!
//! The whole store is one pretty-printed array of videos with their comments
//! embedded. Every mutation rewrites the file, so mutations are serialized
//! behind one lock and land through a temp-file rename.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::metadata::{CommentRecord, VideoRecord, VideoStore, next_like_count};

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Points the store at `path`. A missing file reads as an empty store and
    /// is created on the first write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }
        let store = Self {
            path,
            write_lock: Mutex::new(()),
        };
        // Surface a corrupt file at startup rather than on the first request.
        store.read_all()?;
        Ok(store)
    }

    fn read_all(&self) -> Result<Vec<VideoRecord>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let mut videos: Vec<VideoRecord> = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        for video in &mut videos {
            let comments = video.comments.get_or_insert_with(Vec::new);
            for comment in comments.iter_mut() {
                if comment.video_id.is_empty() {
                    comment.video_id = video.id.clone();
                }
            }
        }
        Ok(videos)
    }

    fn write_all(&self, videos: &[VideoRecord]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, videos).context("serializing videos")?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// Runs one read-modify-write cycle under the write lock. The file is only
    /// rewritten when `apply` reports a change.
    fn update<T>(&self, apply: impl FnOnce(&mut Vec<VideoRecord>) -> (T, bool)) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut videos = self.read_all()?;
        let (result, changed) = apply(&mut videos);
        if changed {
            self.write_all(&videos)?;
        }
        Ok(result)
    }
}

impl VideoStore for JsonFileStore {
    fn list_videos(&self) -> Result<Vec<VideoRecord>> {
        self.read_all()
    }

    fn get_video(&self, id: &str) -> Result<Option<VideoRecord>> {
        Ok(self.read_all()?.into_iter().find(|video| video.id == id))
    }

    fn insert_video(&self, video: &VideoRecord) -> Result<()> {
        let mut stored = video.clone();
        stored.comments.get_or_insert_with(Vec::new);
        self.update(|videos| {
            videos.push(stored);
            ((), true)
        })
    }

    fn increment_likes(&self, id: &str) -> Result<Option<VideoRecord>> {
        self.update(|videos| match videos.iter_mut().find(|video| video.id == id) {
            Some(video) => {
                video.likes = next_like_count(&video.likes);
                (Some(video.clone()), true)
            }
            None => (None, false),
        })
    }

    fn list_comments(&self, video_id: &str) -> Result<Vec<CommentRecord>> {
        Ok(self
            .get_video(video_id)?
            .and_then(|video| video.comments)
            .unwrap_or_default())
    }

    fn insert_comment(&self, comment: &CommentRecord) -> Result<()> {
        let found = self.update(|videos| {
            match videos.iter_mut().find(|video| video.id == comment.video_id) {
                Some(video) => {
                    video
                        .comments
                        .get_or_insert_with(Vec::new)
                        .push(comment.clone());
                    (true, true)
                }
                None => (false, false),
            }
        })?;
        anyhow::ensure!(found, "video {} does not exist", comment.video_id);
        Ok(())
    }

    fn delete_comment(&self, video_id: &str, comment_id: &str) -> Result<bool> {
        self.update(|videos| {
            let removed = videos
                .iter_mut()
                .find(|video| video.id == video_id)
                .and_then(|video| video.comments.as_mut())
                .and_then(|comments| {
                    let index = comments.iter().position(|c| c.id == comment_id)?;
                    comments.remove(index);
                    Some(())
                })
                .is_some();
            (removed, removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::contract;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, JsonFileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("data.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn json_insert_and_fetch() {
        let (_dir, store) = open_store();
        contract::insert_and_fetch(&store);
    }

    #[test]
    fn json_comments_are_scoped() {
        let (_dir, store) = open_store();
        contract::comments_are_scoped(&store);
    }

    #[test]
    fn json_likes_increment() {
        let (_dir, store) = open_store();
        contract::likes_increment(&store);
    }

    #[test]
    fn json_stored_like_counts_keep_their_leading_integer() {
        let (_dir, store) = open_store();
        contract::stored_like_counts_keep_their_leading_integer(&store);
    }

    #[test]
    fn json_concurrent_likes_are_not_lost() {
        let (_dir, store) = open_store();
        contract::concurrent_likes_are_not_lost(Arc::new(store));
    }

    #[test]
    fn reads_legacy_file_with_embedded_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(
            &path,
            r#"[{
                "id": "v1",
                "title": "Legacy",
                "description": "From the old file",
                "channel": "Default Channel",
                "image": "/images/legacy.jpg",
                "views": "10",
                "likes": "2",
                "duration": "1:30",
                "video": "/videos/stream.mp4",
                "timestamp": 1700000000000,
                "comments": [
                    {"id": "c1", "name": "bo", "comment": "hi", "likes": 0, "timestamp": 1700000000001}
                ]
            }]"#,
        )
        .unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        let comments = store.list_comments("v1").unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].video_id, "v1");
        assert_eq!(store.increment_likes("v1").unwrap().unwrap().likes, "3");
    }

    #[test]
    fn missing_and_empty_files_read_as_empty() {
        let (dir, store) = open_store();
        assert!(store.list_videos().unwrap().is_empty());
        fs::write(dir.path().join("data.json"), "\n").unwrap();
        assert!(store.list_videos().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, "{not json").unwrap();
        assert!(JsonFileStore::open(&path).is_err());
    }

    #[test]
    fn comment_for_unknown_video_is_rejected() {
        let (_dir, store) = open_store();
        let orphan = CommentRecord::new("nope", Default::default());
        assert!(store.insert_comment(&orphan).is_err());
    }
}

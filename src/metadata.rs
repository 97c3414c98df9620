//! Metadata persistence layer for minitube.
//!
//! The structs in this module are both the stored shape and the JSON the API
//! hands back to clients. Handlers only ever talk to [`VideoStore`], so the
//! SQLite and JSON-file backends are interchangeable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_CHANNEL: &str = "Default Channel";
pub const DEFAULT_DURATION: &str = "0:00";
pub const DEFAULT_THUMBNAIL: &str = "/images/default-thumbnail.jpg";
pub const DEFAULT_STREAM: &str = "/videos/stream.mp4";

/// A shareable video and the references to its thumbnail and media.
///
/// `views` and `likes` are non-negative integers kept as strings, which is how
/// clients have always received them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub channel: String,
    /// Thumbnail reference: absolute URL or a path relative to the serving host.
    pub image: String,
    pub views: String,
    pub likes: String,
    pub duration: String,
    /// Playable media reference, same rules as `image`.
    pub video: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Present on detail responses, and on listings from stores that embed
    /// comments in the video record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<Vec<CommentRecord>>,
}

/// Fields supplied by an upload. Everything else is defaulted.
#[derive(Debug, Clone, Default)]
pub struct NewVideo {
    pub title: Option<String>,
    pub description: Option<String>,
    pub channel: Option<String>,
    /// Reference returned by the media backend for the attached file.
    pub media: Option<String>,
}

impl VideoRecord {
    /// Builds a fresh record with a new id, zeroed counters and the current time.
    pub fn from_upload(upload: NewVideo) -> Self {
        let (image, video) = match upload.media {
            Some(reference) => (reference.clone(), reference),
            None => (DEFAULT_THUMBNAIL.to_string(), DEFAULT_STREAM.to_string()),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            title: upload.title,
            description: upload.description,
            channel: upload
                .channel
                .filter(|channel| !channel.is_empty())
                .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            image,
            views: "0".to_string(),
            likes: "0".to_string(),
            duration: DEFAULT_DURATION.to_string(),
            video,
            timestamp: Utc::now().timestamp_millis(),
            comments: None,
        }
    }
}

/// Reads the leading integer of a stored like count, the way SQLite's
/// `CAST(.. AS INTEGER)` does, so `"110,985"` counts as 110. Counts with no
/// leading digits or a negative sign count as zero.
pub fn next_like_count(current: &str) -> String {
    let trimmed = current.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let count = if negative {
        0
    } else {
        digits
            .bytes()
            .take_while(u8::is_ascii_digit)
            .fold(0u64, |acc, digit| {
                acc.saturating_mul(10).saturating_add(u64::from(digit - b'0'))
            })
    };
    count.saturating_add(1).to_string()
}

/// A remark attached to exactly one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: String,
    #[serde(default)]
    pub video_id: String,
    pub name: Option<String>,
    pub comment: Option<String>,
    #[serde(default)]
    pub likes: i64,
    pub timestamp: i64,
}

/// Body of a comment submission. Absent fields are stored as null.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewComment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl CommentRecord {
    pub fn new(video_id: &str, submission: NewComment) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            video_id: video_id.to_owned(),
            name: submission.name,
            comment: submission.comment,
            likes: 0,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Capabilities every persistence backend provides.
///
/// Implementations are synchronous; the HTTP layer drives them from
/// `spawn_blocking`.
pub trait VideoStore: Send + Sync {
    /// All videos in store-native order.
    fn list_videos(&self) -> Result<Vec<VideoRecord>>;

    fn get_video(&self, id: &str) -> Result<Option<VideoRecord>>;

    fn insert_video(&self, video: &VideoRecord) -> Result<()>;

    /// Adds one like and returns the updated record, or `None` for an unknown
    /// id. The increment is atomic with respect to other callers.
    fn increment_likes(&self, id: &str) -> Result<Option<VideoRecord>>;

    fn list_comments(&self, video_id: &str) -> Result<Vec<CommentRecord>>;

    fn insert_comment(&self, comment: &CommentRecord) -> Result<()>;

    /// Removes the comment only if it belongs to `video_id`. Returns whether a
    /// comment was removed.
    fn delete_comment(&self, video_id: &str, comment_id: &str) -> Result<bool>;
}

const VIDEO_COLUMNS: &str =
    "id, title, description, channel, image, views, likes, duration, video, timestamp";
const COMMENT_COLUMNS: &str = "id, video_id, name, comment, likes, timestamp";

/// Relational backend. Opens a short-lived connection per operation so the
/// store can be shared freely across blocking tasks.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens (and if necessary creates) the DB and ensures the schema exists.
    /// WAL mode keeps readers from blocking the writer.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("opening video DB {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for video DB")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting video DB synchronous mode")?;
        ensure_tables(&mut conn)?;

        Ok(Self {
            db_path: path.to_path_buf(),
        })
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("opening video DB {}", self.db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        f(&conn)
    }
}

/// Creates the tables in one transaction so a failure leaves the DB untouched.
fn ensure_tables(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            title TEXT,
            description TEXT,
            channel TEXT NOT NULL DEFAULT 'Default Channel',
            image TEXT NOT NULL,
            views TEXT NOT NULL DEFAULT '0',
            likes TEXT NOT NULL DEFAULT '0',
            duration TEXT NOT NULL DEFAULT '0:00',
            video TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS comments (
            id TEXT PRIMARY KEY,
            video_id TEXT NOT NULL REFERENCES videos(id),
            name TEXT,
            comment TEXT,
            likes INTEGER NOT NULL DEFAULT 0,
            timestamp INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_comments_video_id ON comments(video_id);
        "#,
    )
    .context("creating video DB schema")?;

    tx.commit()?;
    Ok(())
}

impl VideoStore for SqliteStore {
    fn list_videos(&self) -> Result<Vec<VideoRecord>> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {VIDEO_COLUMNS} FROM videos ORDER BY rowid"))?;
            let records = stmt
                .query_map([], row_to_video)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("reading videos")?;
            Ok(records)
        })
    }

    fn get_video(&self, id: &str) -> Result<Option<VideoRecord>> {
        self.with_connection(|conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = ?1"),
                    [id],
                    row_to_video,
                )
                .optional()
                .with_context(|| format!("reading video {id}"))?;
            Ok(record)
        })
    }

    fn insert_video(&self, video: &VideoRecord) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO videos (
                    id, title, description, channel, image,
                    views, likes, duration, video, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    video.id,
                    video.title,
                    video.description,
                    video.channel,
                    video.image,
                    video.views,
                    video.likes,
                    video.duration,
                    video.video,
                    video.timestamp,
                ],
            )
            .with_context(|| format!("inserting video {}", video.id))?;
            Ok(())
        })
    }

    fn increment_likes(&self, id: &str) -> Result<Option<VideoRecord>> {
        // Single statement, so concurrent likes serialize on the write lock.
        self.with_connection(|conn| {
            let record = conn
                .query_row(
                    &format!(
                        r#"
                        UPDATE videos
                        SET likes = CAST(MAX(CAST(likes AS INTEGER), 0) + 1 AS TEXT)
                        WHERE id = ?1
                        RETURNING {VIDEO_COLUMNS}
                        "#
                    ),
                    [id],
                    row_to_video,
                )
                .optional()
                .with_context(|| format!("incrementing likes for video {id}"))?;
            Ok(record)
        })
    }

    fn list_comments(&self, video_id: &str) -> Result<Vec<CommentRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {COMMENT_COLUMNS}
                FROM comments
                WHERE video_id = ?1
                ORDER BY timestamp ASC, rowid ASC
                "#
            ))?;
            let comments = stmt
                .query_map([video_id], row_to_comment)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .with_context(|| format!("reading comments for video {video_id}"))?;
            Ok(comments)
        })
    }

    fn insert_comment(&self, comment: &CommentRecord) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO comments (id, video_id, name, comment, likes, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    comment.id,
                    comment.video_id,
                    comment.name,
                    comment.comment,
                    comment.likes,
                    comment.timestamp,
                ],
            )
            .with_context(|| format!("inserting comment {}", comment.id))?;
            Ok(())
        })
    }

    fn delete_comment(&self, video_id: &str, comment_id: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM comments WHERE id = ?1 AND video_id = ?2",
                    params![comment_id, video_id],
                )
                .with_context(|| format!("deleting comment {comment_id}"))?;
            Ok(removed > 0)
        })
    }
}

fn row_to_video(row: &Row<'_>) -> rusqlite::Result<VideoRecord> {
    Ok(VideoRecord {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        channel: row.get("channel")?,
        image: row.get("image")?,
        views: row.get("views")?,
        likes: row.get("likes")?,
        duration: row.get("duration")?,
        video: row.get("video")?,
        timestamp: row.get("timestamp")?,
        comments: None,
    })
}

fn row_to_comment(row: &Row<'_>) -> rusqlite::Result<CommentRecord> {
    Ok(CommentRecord {
        id: row.get("id")?,
        video_id: row.get("video_id")?,
        name: row.get("name")?,
        comment: row.get("comment")?,
        likes: row.get("likes")?,
        timestamp: row.get("timestamp")?,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("nested").join("videos.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn upload_defaults() {
        let record = VideoRecord::from_upload(NewVideo::default());
        assert_eq!(record.channel, DEFAULT_CHANNEL);
        assert_eq!(record.views, "0");
        assert_eq!(record.likes, "0");
        assert_eq!(record.duration, DEFAULT_DURATION);
        assert_eq!(record.image, DEFAULT_THUMBNAIL);
        assert_eq!(record.video, DEFAULT_STREAM);
        assert!(record.title.is_none());
        assert!(record.timestamp > 0);

        let uploaded = VideoRecord::from_upload(NewVideo {
            channel: Some("Cats".into()),
            media: Some("https://cdn.example/clip.mp4".into()),
            ..NewVideo::default()
        });
        assert_eq!(uploaded.channel, "Cats");
        assert_eq!(uploaded.image, "https://cdn.example/clip.mp4");
        assert_eq!(uploaded.video, "https://cdn.example/clip.mp4");
        assert_ne!(uploaded.id, record.id);
    }

    #[test]
    fn like_counts_parse_leniently() {
        assert_eq!(next_like_count("0"), "1");
        assert_eq!(next_like_count(" 41 "), "42");
        assert_eq!(next_like_count("lots"), "1");
        assert_eq!(next_like_count("110,985"), "111");
        assert_eq!(next_like_count("+5"), "6");
        assert_eq!(next_like_count("-3"), "1");
        assert_eq!(next_like_count("-"), "1");
    }

    #[test]
    fn comment_without_fields_serializes_nulls() {
        let comment = CommentRecord::new("v1", NewComment::default());
        let json = serde_json::to_value(&comment).unwrap();
        assert!(json["name"].is_null());
        assert!(json["comment"].is_null());
        assert_eq!(json["likes"], 0);
        assert_eq!(json["video_id"], "v1");
    }

    #[test]
    fn sqlite_insert_and_fetch() {
        let (_dir, store) = open_store();
        contract::insert_and_fetch(&store);
    }

    #[test]
    fn sqlite_comments_are_scoped() {
        let (_dir, store) = open_store();
        contract::comments_are_scoped(&store);
    }

    #[test]
    fn sqlite_likes_increment() {
        let (_dir, store) = open_store();
        contract::likes_increment(&store);
    }

    #[test]
    fn sqlite_concurrent_likes_are_not_lost() {
        let (_dir, store) = open_store();
        contract::concurrent_likes_are_not_lost(Arc::new(store));
    }

    #[test]
    fn sqlite_stored_like_counts_keep_their_leading_integer() {
        let (_dir, store) = open_store();
        contract::stored_like_counts_keep_their_leading_integer(&store);
    }

    #[test]
    fn sqlite_rejects_comment_for_unknown_video() {
        let (_dir, store) = open_store();
        let orphan = CommentRecord::new("nope", NewComment::default());
        assert!(store.insert_comment(&orphan).is_err());
    }

    #[test]
    fn reopening_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("videos.db");
        let video = contract::sample_video("persisted");
        SqliteStore::open(&path).unwrap().insert_video(&video).unwrap();
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get_video(&video.id).unwrap().unwrap(), video);
    }
}

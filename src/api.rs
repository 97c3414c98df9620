//! HTTP surface: routing, the resource handlers and the static file routes.

use std::{
    path::{Component, Path as FsPath, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{
        DefaultBodyLimit, Multipart, Path, Request, State,
        multipart::{Field, MultipartRejection},
    },
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use mime_guess::MimeGuess;
use tokio::{fs, fs::File, task};
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::Config,
    error::{ApiError, ApiResult},
    guard::{AccessGuard, require_api_key},
    media::{IMAGES_SUBDIR, MediaStore, Upload, VIDEOS_SUBDIR},
    metadata::{CommentRecord, NewComment, NewVideo, VideoRecord, VideoStore},
    urls::RequestOrigin,
};

const DOCS_INDEX: &str = "index.html";
const VIDEO_NOT_FOUND: &str = "Video not found";

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn VideoStore>,
    media: Arc<dyn MediaStore>,
    guard: AccessGuard,
    files: Arc<FilePaths>,
    upload_limit_bytes: usize,
}

struct FilePaths {
    /// Holds the `images/` and `videos/` trees served without credentials.
    public: PathBuf,
    docs: PathBuf,
}

impl AppState {
    pub fn new(store: Arc<dyn VideoStore>, media: Arc<dyn MediaStore>, config: &Config) -> Self {
        Self {
            store,
            media,
            guard: AccessGuard::new(config.api_key.clone()),
            files: Arc::new(FilePaths {
                public: config.public_dir.clone(),
                docs: config.docs_dir.clone(),
            }),
            upload_limit_bytes: config.upload_limit_bytes,
        }
    }

    /// Runs a store operation on the blocking pool. Any failure becomes a 500
    /// carrying only `failure` as its message.
    async fn with_store<T, F>(&self, failure: &'static str, op: F) -> ApiResult<T>
    where
        F: FnOnce(&dyn VideoStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|err| ApiError::internal(failure, err))?
            .map_err(|err| ApiError::internal(failure, err))
    }

    async fn store_upload(&self, upload: Upload) -> ApiResult<String> {
        let media = self.media.clone();
        task::spawn_blocking(move || media.store(&upload))
            .await
            .map_err(|err| ApiError::internal("Error creating video", err))?
            .map_err(|err| ApiError::internal("Error creating video", err))
    }
}

pub fn router(state: AppState) -> Router {
    let guarded = Router::new()
        .route("/videos", get(list_videos).post(create_video))
        .route("/videos/{id}", get(get_video))
        .route("/videos/{id}/comments", post(add_comment))
        .route("/videos/{id}/comments/{comment_id}", delete(delete_comment))
        .route("/videos/{id}/like", post(like_video))
        .route_layer(middleware::from_fn_with_state(
            state.guard.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/", get(docs_index))
        .route("/docs/{*path}", get(docs_file))
        .merge(guarded)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            serve_public_media,
        ))
        .layer(DefaultBodyLimit::max(state.upload_limit_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn list_videos(
    State(state): State<AppState>,
    origin: RequestOrigin,
) -> ApiResult<Json<Vec<VideoRecord>>> {
    let mut videos = state
        .with_store("Error fetching videos", |store| store.list_videos())
        .await?;
    for video in &mut videos {
        origin.resolve_video(video);
    }
    Ok(Json(videos))
}

async fn get_video(
    State(state): State<AppState>,
    origin: RequestOrigin,
    Path(id): Path<String>,
) -> ApiResult<Json<VideoRecord>> {
    let found = state
        .with_store("Error fetching video", move |store| {
            let Some(video) = store.get_video(&id)? else {
                return Ok(None);
            };
            let comments = store.list_comments(&video.id)?;
            Ok(Some((video, comments)))
        })
        .await?;

    let (mut video, comments) = found.ok_or_else(|| ApiError::not_found(VIDEO_NOT_FOUND))?;
    video.comments = Some(comments);
    origin.resolve_video(&mut video);
    Ok(Json(video))
}

#[derive(Debug, Default)]
struct VideoSubmission {
    title: Option<String>,
    description: Option<String>,
    channel: Option<String>,
    upload: Option<Upload>,
}

/// Collects the text fields and the attachment (`file`, or `image` from older
/// clients). Unknown fields are skipped.
async fn read_submission(mut multipart: Multipart) -> ApiResult<VideoSubmission> {
    let mut submission = VideoSubmission::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("Invalid multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "title" => submission.title = Some(field_text(field).await?),
            "description" => submission.description = Some(field_text(field).await?),
            "channel" => submission.channel = Some(field_text(field).await?),
            "file" | "image" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(|err| {
                    ApiError::bad_request(format!("Failed to read uploaded file: {err}"))
                })?;
                // Browsers send an empty part when no file was picked.
                if data.is_empty() && file_name.is_empty() {
                    continue;
                }
                submission.upload = Some(Upload {
                    file_name,
                    content_type,
                    data: data.to_vec(),
                });
            }
            _ => {}
        }
    }
    Ok(submission)
}

async fn field_text(field: Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|err| ApiError::bad_request(format!("Invalid multipart field: {err}")))
}

async fn create_video(
    State(state): State<AppState>,
    origin: RequestOrigin,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<VideoRecord>)> {
    let multipart = multipart.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let submission = read_submission(multipart).await?;

    let media = match submission.upload {
        Some(upload) => Some(state.store_upload(upload).await?),
        None => None,
    };
    let video = VideoRecord::from_upload(NewVideo {
        title: submission.title,
        description: submission.description,
        channel: submission.channel,
        media,
    });

    let mut created = video.clone();
    state
        .with_store("Error creating video", move |store| store.insert_video(&video))
        .await?;
    info!(video_id = %created.id, media = %created.video, "created video");

    origin.resolve_video(&mut created);
    Ok((StatusCode::CREATED, Json(created)))
}

/// An empty body counts as a comment with no fields; anything else must be
/// valid JSON.
fn parse_comment_body(body: &[u8]) -> ApiResult<NewComment> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(NewComment::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("Invalid comment body: {err}")))
}

async fn add_comment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<CommentRecord>)> {
    let submission = parse_comment_body(&body)?;
    let created = state
        .with_store("Error adding comment", move |store| {
            if store.get_video(&id)?.is_none() {
                return Ok(None);
            }
            let comment = CommentRecord::new(&id, submission);
            store.insert_comment(&comment)?;
            Ok(Some(comment))
        })
        .await?
        .ok_or_else(|| ApiError::not_found(VIDEO_NOT_FOUND))?;

    info!(video_id = %created.video_id, comment_id = %created.id, "added comment");
    Ok((StatusCode::CREATED, Json(created)))
}

enum DeleteOutcome {
    Deleted,
    VideoMissing,
    CommentMissing,
}

async fn delete_comment(
    State(state): State<AppState>,
    Path((id, comment_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let outcome = state
        .with_store("Error deleting comment", move |store| {
            if store.get_video(&id)?.is_none() {
                return Ok(DeleteOutcome::VideoMissing);
            }
            Ok(if store.delete_comment(&id, &comment_id)? {
                DeleteOutcome::Deleted
            } else {
                DeleteOutcome::CommentMissing
            })
        })
        .await?;

    match outcome {
        DeleteOutcome::Deleted => Ok(StatusCode::NO_CONTENT),
        DeleteOutcome::VideoMissing => Err(ApiError::not_found(VIDEO_NOT_FOUND)),
        DeleteOutcome::CommentMissing => Err(ApiError::not_found("Comment not found")),
    }
}

async fn like_video(
    State(state): State<AppState>,
    origin: RequestOrigin,
    Path(id): Path<String>,
) -> ApiResult<Json<VideoRecord>> {
    let mut video = state
        .with_store("Error liking video", move |store| store.increment_likes(&id))
        .await?
        .ok_or_else(|| ApiError::not_found(VIDEO_NOT_FOUND))?;
    origin.resolve_video(&mut video);
    Ok(Json(video))
}

async fn docs_index(State(state): State<AppState>) -> ApiResult<Response> {
    stream_file(state.files.docs.join(DOCS_INDEX)).await
}

async fn docs_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    let path = safe_join(&state.files.docs, &path)
        .ok_or_else(|| ApiError::not_found("File not found"))?;
    stream_file(path).await
}

async fn not_found() -> ApiError {
    ApiError::not_found("Not found")
}

/// Serves `/images/*` and `/videos/*` straight from the public directory when
/// the file exists; everything else continues to the router, which is how
/// `/videos/{id}` still reaches the guarded API.
async fn serve_public_media(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method();
    if method == Method::GET || method == Method::HEAD {
        if let Some(path) = public_media_path(&state.files.public, request.uri().path()) {
            if is_file(&path).await {
                return match stream_file(path).await {
                    Ok(response) => response,
                    Err(err) => err.into_response(),
                };
            }
        }
    }
    next.run(request).await
}

fn public_media_path(root: &FsPath, uri_path: &str) -> Option<PathBuf> {
    let (subdir, rest) = [IMAGES_SUBDIR, VIDEOS_SUBDIR].iter().find_map(|subdir| {
        uri_path
            .strip_prefix('/')?
            .strip_prefix(subdir)?
            .strip_prefix('/')
            .map(|rest| (*subdir, rest))
    })?;
    let decoded = urlencoding::decode(rest).ok()?;
    safe_join(&root.join(subdir), &decoded)
}

/// Joins a relative path onto `root`, refusing anything but plain segments.
fn safe_join(root: &FsPath, relative: &str) -> Option<PathBuf> {
    let relative = FsPath::new(relative);
    let mut segments = 0;
    for component in relative.components() {
        match component {
            Component::Normal(_) => segments += 1,
            _ => return None,
        }
    }
    (segments > 0).then(|| root.join(relative))
}

async fn is_file(path: &FsPath) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    if !is_file(&path).await {
        return Err(ApiError::not_found("File not found"));
    }
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;

    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first() {
        if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }

    Ok(response)
}

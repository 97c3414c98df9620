//! Rewrites stored media references into absolute URLs for the current request.

use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, request::Parts};
use std::convert::Infallible;
use url::Url;

use crate::metadata::VideoRecord;

const FALLBACK_HOST: &str = "localhost";

/// Scheme and host the client used to reach us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOrigin {
    pub scheme: String,
    pub host: String,
}

impl RequestOrigin {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
        }
    }

    fn from_parts(parts: &Parts) -> Self {
        let scheme = forwarded_value(&parts.headers, "x-forwarded-proto")
            .or_else(|| parts.uri.scheme_str().map(str::to_string))
            .unwrap_or_else(|| "http".to_string());
        let host = forwarded_value(&parts.headers, "x-forwarded-host")
            .or_else(|| header_str(&parts.headers, "host"))
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_else(|| FALLBACK_HOST.to_string());
        Self { scheme, host }
    }

    /// Returns `reference` untouched when it already carries a scheme,
    /// otherwise prefixes it with this origin.
    pub fn resolve(&self, reference: &str) -> String {
        if is_absolute(reference) {
            return reference.to_string();
        }
        let separator = if reference.starts_with('/') { "" } else { "/" };
        format!("{}://{}{}{}", self.scheme, self.host, separator, reference)
    }

    pub fn resolve_video(&self, video: &mut VideoRecord) {
        video.image = self.resolve(&video.image);
        video.video = self.resolve(&video.video);
    }
}

pub fn is_absolute(reference: &str) -> bool {
    Url::parse(reference).is_ok()
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Proxies may append a list; the first entry is the client-facing one.
fn forwarded_value(headers: &HeaderMap, name: &str) -> Option<String> {
    header_str(headers, name)
        .and_then(|value| value.split(',').next().map(|first| first.trim().to_string()))
        .filter(|value| !value.is_empty())
}

impl<S> FromRequestParts<S> for RequestOrigin
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn relative_references_get_the_origin() {
        let origin = RequestOrigin::new("http", "example.test:8080");
        assert_eq!(
            origin.resolve("/images/a.jpg"),
            "http://example.test:8080/images/a.jpg"
        );
        assert_eq!(
            origin.resolve("default-thumbnail-url"),
            "http://example.test:8080/default-thumbnail-url"
        );
    }

    #[test]
    fn absolute_references_pass_through() {
        let origin = RequestOrigin::new("http", "example.test");
        let cdn = "https://res.cloudinary.com/demo/video/upload/clip.mp4";
        assert_eq!(origin.resolve(cdn), cdn);
        assert!(is_absolute("http://a.test/x"));
        assert!(!is_absolute("/videos/stream.mp4"));
    }

    #[test]
    fn origin_prefers_forwarded_headers() {
        let origin = RequestOrigin::from_parts(&parts(
            Request::builder()
                .uri("/videos")
                .header("host", "internal:8080")
                .header("x-forwarded-proto", "https, http")
                .header("x-forwarded-host", "videos.example"),
        ));
        assert_eq!(origin, RequestOrigin::new("https", "videos.example"));
    }

    #[test]
    fn origin_falls_back_to_host_header() {
        let origin = RequestOrigin::from_parts(&parts(
            Request::builder().uri("/videos").header("host", "api.test:3000"),
        ));
        assert_eq!(origin, RequestOrigin::new("http", "api.test:3000"));

        let bare = RequestOrigin::from_parts(&parts(Request::builder().uri("/videos")));
        assert_eq!(bare, RequestOrigin::new("http", FALLBACK_HOST));
    }

    #[test]
    fn resolves_both_references_of_a_video() {
        let mut video = VideoRecord::from_upload(Default::default());
        video.image = "https://cdn.test/thumb.jpg".into();
        RequestOrigin::new("http", "h.test").resolve_video(&mut video);
        assert_eq!(video.image, "https://cdn.test/thumb.jpg");
        assert_eq!(video.video, "http://h.test/videos/stream.mp4");
    }
}

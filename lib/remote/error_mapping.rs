use std::error::Error as StdError;

use super::{FetchError, FetchErrorKind};

/// Maps a non-success HTTP status. 404 never reaches here; it is a `NotFound` response.
pub(super) fn map_status(category: &str, status: u16) -> FetchError {
    match status {
        401 | 403 => FetchError::new(
            FetchErrorKind::Unauthorized,
            format!("upstream refused credentials ({status}) for {category}"),
        ),
        429 => FetchError::new(
            FetchErrorKind::RateLimited,
            format!("upstream rate limited {category}"),
        ),
        400..=499 => FetchError::new(
            FetchErrorKind::Other,
            format!("upstream client error {status} for {category}"),
        ),
        500..=599 => FetchError::new(
            FetchErrorKind::UpstreamUnavailable,
            format!("upstream server error {status} for {category}"),
        ),
        _ => FetchError::new(
            FetchErrorKind::Other,
            format!("unexpected HTTP status {status} for {category}"),
        ),
    }
}

pub(super) fn map_reqwest_error(category: &str, err: reqwest::Error) -> FetchError {
    tracing::debug!(
        event = "remote_request_error",
        category,
        is_timeout = err.is_timeout(),
        is_connect = err.is_connect(),
        is_decode = err.is_decode(),
        error_chain = %render_error_chain(&err),
        "request to upstream failed"
    );

    if let Some(status) = err.status() {
        return map_status(category, status.as_u16());
    }
    if err.is_decode() {
        return FetchError::new(
            FetchErrorKind::MalformedResponse,
            format!("undecodable response body for {category}: {err}"),
        );
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        return FetchError::new(
            FetchErrorKind::Network,
            format!("network error while fetching {category}: {err}"),
        );
    }
    FetchError::new(FetchErrorKind::Other, format!("{err:#}"))
}

fn render_error_chain(error: &reqwest::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(next) = source {
        parts.push(next.to_string());
        source = next.source();
    }
    parts.join(" | caused_by: ")
}

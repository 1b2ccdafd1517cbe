use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use protocol::catalog;

use crate::synthetic::{ByteRange, FillerBlock, SyntheticStream};
use crate::app::AppState;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RangeError {
    Malformed,
    Unsatisfiable,
}

/// Parses a `Range` header value such as `bytes=0-499,1000-` against a file
/// of `size` bytes. End positions past the file are clamped.
pub(crate) fn parse_range(value: &str, size: u64) -> Result<Vec<ByteRange>, RangeError> {
    let byte_ranges = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Malformed)?;
    let mut ranges = Vec::new();
    for part in byte_ranges.split(',') {
        let (start, end) = part.trim().split_once('-').ok_or(RangeError::Malformed)?;
        let (start, end) = (start.trim(), end.trim());
        let range = match (start.is_empty(), end.is_empty()) {
            (true, true) => return Err(RangeError::Malformed),
            (true, false) => {
                let suffix = parse_position(end)?;
                if suffix == 0 || size == 0 {
                    return Err(RangeError::Unsatisfiable);
                }
                ByteRange {
                    start: size.saturating_sub(suffix),
                    end: size - 1,
                }
            }
            (false, open_end) => {
                let start = parse_position(start)?;
                let end = if open_end {
                    size.saturating_sub(1)
                } else {
                    parse_position(end)?
                };
                if start >= size {
                    return Err(RangeError::Unsatisfiable);
                }
                if end < start {
                    return Err(RangeError::Malformed);
                }
                ByteRange {
                    start,
                    end: end.min(size - 1),
                }
            }
        };
        ranges.push(range);
    }
    Ok(ranges)
}

fn parse_position(value: &str) -> Result<u64, RangeError> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(RangeError::Malformed);
    }
    value.parse().map_err(|_| RangeError::Malformed)
}

pub(crate) async fn serve_file(
    Path(file): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let Some(entry) = catalog::lookup(&file) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    build_response(&state.filler, entry.bytes, range)
}

fn build_response(filler: &FillerBlock, size: u64, range: Option<&str>) -> Response {
    let ranges = match range.map(|value| parse_range(value, size)) {
        None | Some(Err(RangeError::Malformed)) => None,
        Some(Err(RangeError::Unsatisfiable)) => {
            tracing::debug!(event = "file.range_unsatisfiable", size, range = ?range);
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{size}"))],
            )
                .into_response();
        }
        Some(Ok(ranges)) => Some(ranges),
    };

    let (status, stream, content_range) = match ranges.as_deref() {
        None => (StatusCode::OK, SyntheticStream::open(filler, size), None),
        Some([single]) => (
            StatusCode::PARTIAL_CONTENT,
            SyntheticStream::open_ranges(filler, &[*single]),
            Some(format!("bytes {}-{}/{size}", single.start, single.end)),
        ),
        Some(many) => (StatusCode::OK, SyntheticStream::open_ranges(filler, many), None),
    };

    let content_length = stream.remaining();
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    if let Some(content_range) = content_range {
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
    response
}

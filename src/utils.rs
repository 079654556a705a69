use reqwest::header::{HeaderMap, HeaderName, CONTENT_RANGE};
use std::path::{Path, PathBuf};
use url::Url;

/// Last non-empty path segment of the URL, or a random `download_<uuid>` name.
pub fn get_filename_from_url(url: &Url) -> String {
    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return filename.to_string();
            }
        }
    }

    format!("download_{}", uuid::Uuid::new_v4())
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// `<dest>.part` for the data, `<dest>.part.json` for the resume record.
pub fn part_paths(destination: &Path) -> (PathBuf, PathBuf) {
    let mut part = destination.as_os_str().to_os_string();
    part.push(".part");
    let mut state = part.clone();
    state.push(".json");
    (PathBuf::from(part), PathBuf::from(state))
}

/// Complete length from a `Content-Range` header (`bytes 0-0/1234` or `bytes */1234`).
pub fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

/// Header value as text, if present and printable.
pub fn header_text(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

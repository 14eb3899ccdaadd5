use bytes::Bytes;
use if_chain::if_chain;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, LOCATION, RANGE};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::shared_types::{ByteCount, ChunkRange};

const MAX_REDIRECTS: u8 = 10;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid redirect target: {0}")]
    BadRedirect(String),
    #[error("Too many redirects while probing {0}")]
    TooManyRedirects(Url),
    #[error("Server answered a range request with {0} instead of 206 Partial Content")]
    NoPartialContent(StatusCode),
}

/// HEAD `url`, following redirects by hand. Returns the final URL and its headers.
#[async_recursion::async_recursion]
pub(crate) async fn get_headers_follow_redirects(
    client: &reqwest::Client,
    url: &Url,
    hops_left: u8,
) -> Result<(Url, HeaderMap), HttpError> {
    let response = client.head(url.as_str()).send().await?;
    if response.status().is_redirection() {
        if let Some(location) = response.headers().get(LOCATION) {
            if hops_left == 0 {
                return Err(HttpError::TooManyRedirects(url.clone()));
            }
            let location = location
                .to_str()
                .map_err(|e| HttpError::BadRedirect(e.to_string()))?;
            let new_url = url
                .join(location)
                .map_err(|e| HttpError::BadRedirect(format!("{location}: {e}")))?;
            debug!("{url} redirects to {new_url}");
            return get_headers_follow_redirects(client, &new_url, hops_left - 1).await;
        }
    }
    let headers = response.error_for_status()?.headers().to_owned();
    Ok((url.clone(), headers))
}

pub(crate) async fn probe(url: &Url) -> Result<(Url, HeaderMap), HttpError> {
    let client = reqwest::Client::builder().redirect(Policy::none()).build()?;
    get_headers_follow_redirects(&client, url, MAX_REDIRECTS).await
}

pub(crate) fn range_header(range: ChunkRange) -> HeaderValue {
    HeaderValue::from_str(&format!("bytes={}-{}", range.start, range.end))
        .expect("range header is always ascii")
}

pub(crate) async fn get_range(
    client: &reqwest::Client,
    url: &Url,
    range: ChunkRange,
) -> Result<Bytes, HttpError> {
    let response = client
        .get(url.to_owned())
        .header(RANGE, range_header(range))
        .send()
        .await?
        .error_for_status()?;
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(HttpError::NoPartialContent(response.status()));
    }
    Ok(response.bytes().await?)
}

pub(crate) fn supports_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
        .unwrap_or(false)
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<ByteCount> {
    if_chain! {
        if let Some(value) = headers.get(CONTENT_LENGTH);
        if let Ok(value) = value.to_str();
        if let Ok(length) = value.trim().parse::<ByteCount>();
        then {
            Some(length)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header() {
        let header = range_header(ChunkRange { start: 4, end: 11 });
        assert_eq!(header, "bytes=4-11");
    }

    #[test]
    fn test_content_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert_eq!(content_length(&headers), Some(0));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1048576"));
        assert_eq!(content_length(&headers), Some(1048576));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert_eq!(content_length(&headers), None);
    }

    #[test]
    fn test_supports_byte_ranges() {
        let mut headers = HeaderMap::new();
        assert!(!supports_byte_ranges(&headers));
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("none"));
        assert!(!supports_byte_ranges(&headers));
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        assert!(supports_byte_ranges(&headers));
    }
}

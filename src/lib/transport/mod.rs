pub mod tls;

pub use tls::*;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::{Cursor, MessageId};

/// Optional publish header carrying the message ttl in seconds.
pub const MESSAGE_TTL_HEADER: &str = "x-message-ttl";
/// Optional publish header pinning the message timestamp (seconds since the epoch).
pub const MESSAGE_TIMESTAMP_HEADER: &str = "x-message-timestamp";

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {header} header {value:?}")]
pub struct ValidatorError {
    pub header: &'static str,
    pub value: String,
}

/// Renders a timestamp as an HTTP date, the form `Last-Modified` is written in.
pub fn format_http_date(timestamp: i64) -> String {
    match DateTime::<Utc>::from_timestamp(timestamp, 0) {
        Some(at) => at.format(HTTP_DATE_FORMAT).to_string(),
        None => timestamp.to_string(),
    }
}

/// Accepts either an HTTP date or plain seconds since the epoch.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Some(secs);
    }
    DateTime::parse_from_rfc2822(raw).ok().map(|at| at.timestamp())
}

/// Accepts `7`, `"7"` and `W/"7"`.
pub fn parse_tag(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.trim_matches('"').parse().ok()
}

/// Response headers naming a message: `Last-Modified` and `ETag`.
pub fn validator_headers(id: MessageId) -> [(HeaderName, HeaderValue); 2] {
    [
        (header::LAST_MODIFIED, header_value(&format_http_date(id.timestamp))),
        (header::ETAG, HeaderValue::from(id.tag)),
    ]
}

/// Request headers resuming from a message: `If-Modified-Since` and `If-None-Match`.
pub fn conditional_headers(id: MessageId) -> [(HeaderName, HeaderValue); 2] {
    [
        (header::IF_MODIFIED_SINCE, header_value(&format_http_date(id.timestamp))),
        (header::IF_NONE_MATCH, HeaderValue::from(id.tag)),
    ]
}

/// Reads the consumer cursor off a request. No `If-Modified-Since` means
/// [`Cursor::Start`]; a missing `If-None-Match` means tag `0`.
pub fn cursor_from_request(headers: &HeaderMap) -> Result<Cursor, ValidatorError> {
    Ok(read_id(headers, header::IF_MODIFIED_SINCE, header::IF_NONE_MATCH)?
        .map_or(Cursor::Start, Cursor::At))
}

/// Reads the identity of a delivered message off a response.
pub fn id_from_response(headers: &HeaderMap) -> Result<Option<MessageId>, ValidatorError> {
    read_id(headers, header::LAST_MODIFIED, header::ETAG)
}

fn read_id(
    headers: &HeaderMap,
    time_header: HeaderName,
    tag_header: HeaderName,
) -> Result<Option<MessageId>, ValidatorError> {
    let Some(time) = header_str(headers, &time_header)? else {
        return Ok(None);
    };
    if time.trim().is_empty() {
        return Ok(None);
    }
    let timestamp = parse_timestamp(time).ok_or_else(|| invalid(&time_header, time))?;
    let tag = match header_str(headers, &tag_header)? {
        Some(raw) if !raw.trim().is_empty() => {
            parse_tag(raw).ok_or_else(|| invalid(&tag_header, raw))?
        }
        _ => 0,
    };
    Ok(Some(MessageId::new(timestamp, tag)))
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &HeaderName,
) -> Result<Option<&'a str>, ValidatorError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| invalid(name, &String::from_utf8_lossy(value.as_bytes())))
        })
        .transpose()
}

fn invalid(name: &HeaderName, value: &str) -> ValidatorError {
    let header = if *name == header::IF_MODIFIED_SINCE {
        "If-Modified-Since"
    } else if *name == header::IF_NONE_MATCH {
        "If-None-Match"
    } else if *name == header::LAST_MODIFIED {
        "Last-Modified"
    } else if *name == header::ETAG {
        "ETag"
    } else {
        "validator"
    };
    ValidatorError {
        header,
        value: value.to_string(),
    }
}

fn header_value(raw: &str) -> HeaderValue {
    HeaderValue::from_str(raw).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(time: &str, tag: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MODIFIED_SINCE, HeaderValue::from_str(time).unwrap());
        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_str(tag).unwrap());
        headers
    }

    #[test]
    fn http_dates_round_trip_through_timestamps() {
        assert_eq!(format_http_date(784111777), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_timestamp("Sun, 06 Nov 1994 08:49:37 GMT"), Some(784111777));
        assert_eq!(parse_timestamp("1200"), Some(1200));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn tags_accept_quoted_forms() {
        assert_eq!(parse_tag("3"), Some(3));
        assert_eq!(parse_tag("\"3\""), Some(3));
        assert_eq!(parse_tag("W/\"3\""), Some(3));
        assert_eq!(parse_tag("x"), None);
    }

    #[test]
    fn no_validators_start_from_the_beginning() {
        assert_eq!(cursor_from_request(&HeaderMap::new()).unwrap(), Cursor::Start);
    }

    #[test]
    fn validators_rebuild_the_cursor() {
        let mut headers = HeaderMap::new();
        headers.extend(conditional_headers(MessageId::new(1_700_000_000, 4)));
        assert_eq!(
            cursor_from_request(&headers).unwrap(),
            Cursor::At(MessageId::new(1_700_000_000, 4))
        );

        let headers = request("1200", "");
        assert_eq!(cursor_from_request(&headers).unwrap(), Cursor::At(MessageId::new(1200, 0)));
    }

    #[test]
    fn malformed_validators_are_rejected() {
        let err = cursor_from_request(&request("soon", "1")).unwrap_err();
        assert_eq!(err.header, "If-Modified-Since");
        let err = cursor_from_request(&request("1200", "abc")).unwrap_err();
        assert_eq!(err.to_string(), "invalid If-None-Match header \"abc\"");
    }

    #[test]
    fn response_headers_name_the_message() {
        let mut headers = HeaderMap::new();
        headers.extend(validator_headers(MessageId::new(1_700_000_000, 2)));
        assert_eq!(headers[header::ETAG], "2");
        assert_eq!(id_from_response(&headers).unwrap(), Some(MessageId::new(1_700_000_000, 2)));
        assert_eq!(id_from_response(&HeaderMap::new()).unwrap(), None);
    }
}

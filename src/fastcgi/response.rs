//! Responder output parsing.
//!
//! STDOUT carries a CGI response: a MIME-style header block terminated by
//! the first blank line, followed by the body. A `Status: <code> <reason>`
//! header sets the status; without it the status is 200.

use std::io::Cursor;

use axum::body::Body;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;

use crate::fastcgi::error::{FcgiError, FcgiResult};

/// A parsed responder reply.
#[derive(Debug, Clone)]
pub struct FcgiResponse {
    /// Numeric status, 200 unless a `Status` header said otherwise.
    pub status: StatusCode,
    /// Reason phrase from the `Status` header, if one was given.
    pub reason: Option<String>,
    /// Response headers, without `Status`.
    pub headers: HeaderMap,
    /// Declared `Content-Length`, if present and numeric.
    pub content_length: Option<u64>,
    /// Declared `Transfer-Encoding` values.
    pub transfer_encoding: Vec<String>,
    body: Bytes,
}

impl FcgiResponse {
    /// Split accumulated STDOUT into headers and body.
    pub fn parse(stdout: Bytes) -> FcgiResult<Self> {
        let (fields, body_start) = split_header_block(&stdout)?;

        let mut headers = HeaderMap::with_capacity(fields.len());
        for (name, value) in fields {
            let name = HeaderName::from_bytes(name).map_err(|_| {
                FcgiError::MalformedResponse(format!(
                    "invalid header name {:?}",
                    String::from_utf8_lossy(name)
                ))
            })?;
            let value = HeaderValue::from_bytes(&value)
                .map_err(|_| FcgiError::MalformedResponse(format!("invalid value for header {name}")))?;
            headers.append(name, value);
        }

        let (status, reason) = match headers.remove("status") {
            Some(value) => parse_status(&value)?,
            None => (StatusCode::OK, None),
        };

        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());

        let transfer_encoding = headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();

        Ok(Self {
            status,
            reason,
            headers,
            content_length,
            transfer_encoding,
            body: stdout.slice(body_start..),
        })
    }

    /// Response body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Take the body out of the response.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// The body as an `AsyncRead` stream.
    pub fn into_reader(self) -> Cursor<Bytes> {
        Cursor::new(self.body)
    }

    /// Convert into the response sent to the HTTP client. Hop-by-hop framing
    /// headers are dropped; `Content-Length` survives only for HEAD, where
    /// there is no body to measure.
    pub fn into_http_response(self, head: bool) -> Response<Body> {
        let mut headers = self.headers;
        headers.remove(TRANSFER_ENCODING);
        headers.remove(CONNECTION);
        let body = if head {
            Body::empty()
        } else {
            headers.remove(CONTENT_LENGTH);
            Body::from(self.body)
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}

/// Collect header fields up to the first blank line. Returns the fields and
/// the offset where the body begins. Output that ends inside the header
/// block has an empty body.
fn split_header_block(data: &[u8]) -> FcgiResult<(Vec<(&[u8], Vec<u8>)>, usize)> {
    let mut fields: Vec<(&[u8], Vec<u8>)> = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let (line, next) = match data[pos..].iter().position(|&b| b == b'\n') {
            Some(i) => (&data[pos..pos + i], pos + i + 1),
            None => (&data[pos..], data.len()),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        pos = next;

        if line.is_empty() {
            return Ok((fields, pos));
        }

        // continuation of the previous field
        if line[0] == b' ' || line[0] == b'\t' {
            let (_, value) = fields.last_mut().ok_or_else(|| {
                FcgiError::MalformedResponse("continuation line before first header".into())
            })?;
            value.push(b' ');
            value.extend_from_slice(line.trim_ascii());
            continue;
        }

        let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
            FcgiError::MalformedResponse(format!(
                "malformed header line {:?}",
                String::from_utf8_lossy(line)
            ))
        })?;
        let name = &line[..colon];
        if name.is_empty() || name.last().is_some_and(u8::is_ascii_whitespace) {
            return Err(FcgiError::MalformedResponse(format!(
                "malformed header name {:?}",
                String::from_utf8_lossy(name)
            )));
        }
        fields.push((name, line[colon + 1..].trim_ascii().to_vec()));
    }

    Ok((fields, data.len()))
}

fn parse_status(value: &HeaderValue) -> FcgiResult<(StatusCode, Option<String>)> {
    let raw = value
        .to_str()
        .map_err(|_| FcgiError::InvalidStatus(String::from_utf8_lossy(value.as_bytes()).into_owned()))?;
    let (code, reason) = match raw.split_once(' ') {
        Some((code, reason)) => (code, Some(reason.trim().to_string())),
        None => (raw, None),
    };
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| FcgiError::InvalidStatus(raw.to_string()))?;
    Ok((status, reason.filter(|r| !r.is_empty())))
}

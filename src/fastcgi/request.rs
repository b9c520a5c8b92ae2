//! One FastCGI transaction.
//!
//! # Responsibilities
//! - Hold the parameter map, optional body and request id for a single call
//! - Write BEGIN_REQUEST, PARAMS and STDIN records in that order
//! - Read response records for its own id until END_REQUEST
//!
//! # Data Flow
//! ```text
//! Built -> BeginSent -> ParamsSent -> StdinSent -> AwaitingResponse -> Complete | Failed
//! ```
//!
//! Setters are ignored once the request has left `Built`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::fastcgi::error::{FcgiError, FcgiResult};
use crate::fastcgi::protocol::{
    self, BeginRequestBody, EndRequestBody, ProtocolStatus, RecordType, HEADER_LEN, MAX_WRITE,
    STDIN_CHUNK,
};
use crate::fastcgi::response::FcgiResponse;

/// Hands out request ids in `1..=65534`, wrapping before the maximum so the
/// reserved management id 0 is never produced.
#[derive(Debug, Default)]
pub struct RequestIdCounter {
    last: Mutex<u16>,
}

impl RequestIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter whose next id is `last + 1`.
    pub fn starting_at(last: u16) -> Self {
        Self {
            last: Mutex::new(last),
        }
    }

    pub fn next_id(&self) -> u16 {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        *last = if *last >= u16::MAX - 1 { 1 } else { *last + 1 };
        *last
    }
}

/// Request body.
pub enum RequestBody {
    Empty,
    /// In-memory body; can be sent again on retry.
    Bytes(Bytes),
    /// One-shot reader with a declared length.
    Stream {
        reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
        length: u64,
        consumed: bool,
    },
}

impl RequestBody {
    fn declared_len(&self) -> u64 {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Bytes(b) => b.len() as u64,
            RequestBody::Stream { length, .. } => *length,
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => write!(f, "Empty"),
            RequestBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            RequestBody::Stream {
                length, consumed, ..
            } => write!(f, "Stream {{ length: {length}, consumed: {consumed} }}"),
        }
    }
}

/// Where a request is in its single use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Built,
    BeginSent,
    ParamsSent,
    StdinSent,
    AwaitingResponse,
    Complete,
    Failed,
}

#[derive(Debug)]
pub struct Request {
    id: u16,
    keep_alive: bool,
    timeout: Option<Duration>,
    params: HashMap<String, String>,
    body: RequestBody,
    state: RequestState,
    /// State the last failed attempt stopped in.
    failed_in: Option<RequestState>,
}

impl Request {
    /// Fresh request with the next id from `ids`.
    pub fn new(ids: &RequestIdCounter) -> Self {
        Self {
            id: ids.next_id(),
            keep_alive: false,
            timeout: None,
            params: HashMap::new(),
            body: RequestBody::Empty,
            state: RequestState::Built,
            failed_in: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    fn editable(&self) -> bool {
        if self.state != RequestState::Built {
            tracing::debug!(request_id = self.id, state = ?self.state, "ignoring change to a sent request");
            return false;
        }
        true
    }

    /// Ask the responder to keep the connection open after this request.
    pub fn keep_alive(&mut self) -> &mut Self {
        if self.editable() {
            self.keep_alive = true;
        }
        self
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        if self.editable() {
            self.params.insert(name.into(), value.into());
        }
        self
    }

    /// Replace the whole parameter map.
    pub fn set_params(&mut self, params: HashMap<String, String>) -> &mut Self {
        if self.editable() {
            self.params = params;
        }
        self
    }

    /// Stream `length` bytes from `reader` as the body.
    pub fn set_body<R>(&mut self, reader: R, length: u64) -> &mut Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        if self.editable() {
            self.body = RequestBody::Stream {
                reader: Box::new(reader),
                length,
                consumed: false,
            };
        }
        self
    }

    pub fn set_body_bytes(&mut self, body: impl Into<Bytes>) -> &mut Self {
        if self.editable() {
            self.body = RequestBody::Bytes(body.into());
        }
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        if self.editable() {
            self.timeout = Some(timeout);
        }
        self
    }

    /// Whether the request can be written again after a failed attempt.
    pub(crate) fn is_replayable(&self) -> bool {
        !matches!(self.body, RequestBody::Stream { consumed: true, .. })
    }

    /// The last attempt failed with records of this request half written,
    /// so the connection it ran on is out of step with the responder.
    pub(crate) fn left_partial_write(&self) -> bool {
        matches!(
            self.failed_in,
            Some(RequestState::BeginSent | RequestState::ParamsSent)
        )
    }

    /// Return to `Built` for a retry on a fresh connection.
    pub(crate) fn rearm(&mut self) {
        self.state = RequestState::Built;
        self.failed_in = None;
    }

    /// Mark an attempt that was cut off from outside as failed.
    pub(crate) fn abandon(&mut self) {
        self.state = RequestState::Failed;
    }

    /// Run the whole exchange on `conn`.
    pub async fn call_on<S>(&mut self, conn: &mut S) -> FcgiResult<FcgiResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.exchange(conn).await;
        if result.is_err() {
            self.failed_in = Some(self.state);
            self.state = RequestState::Failed;
        } else {
            self.state = RequestState::Complete;
        }
        result
    }

    async fn exchange<S>(&mut self, conn: &mut S) -> FcgiResult<FcgiResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.write_to(conn).await?;
        self.state = RequestState::AwaitingResponse;
        let stdout = self.read_response(conn).await?;
        FcgiResponse::parse(stdout)
    }

    async fn write_to<W>(&mut self, conn: &mut W) -> FcgiResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        // everything that can be refused is settled before the first byte
        self.resolve_content_length()?;
        let params = self.encode_params()?;

        let mut out = BytesMut::with_capacity(HEADER_LEN + MAX_WRITE + 8);
        let begin = BeginRequestBody::responder(self.keep_alive).to_bytes();
        send_record(conn, &mut out, RecordType::BeginRequest, self.id, &begin).await?;
        self.state = RequestState::BeginSent;

        for content in &params {
            send_record(conn, &mut out, RecordType::Params, self.id, content).await?;
        }
        send_record(conn, &mut out, RecordType::Params, self.id, &[]).await?;
        self.state = RequestState::ParamsSent;

        self.write_stdin(conn, &mut out).await?;
        conn.flush().await?;
        self.state = RequestState::StdinSent;
        Ok(())
    }

    fn resolve_content_length(&mut self) -> FcgiResult<()> {
        if matches!(self.body, RequestBody::Empty) {
            return Ok(());
        }
        let numeric = self
            .params
            .get("CONTENT_LENGTH")
            .is_some_and(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()));
        if numeric {
            return Ok(());
        }
        match self.body.declared_len() {
            0 => Err(FcgiError::MissingContentLength),
            len => {
                self.params.insert("CONTENT_LENGTH".into(), len.to_string());
                Ok(())
            }
        }
    }

    /// Pack the parameters into PARAMS contents of at most `MAX_WRITE`
    /// bytes each. Pairs never straddle two records.
    fn encode_params(&self) -> FcgiResult<Vec<Bytes>> {
        let mut records = Vec::new();
        let mut content = BytesMut::with_capacity(MAX_WRITE);
        for (name, value) in &self.params {
            let fitted = protocol::fit_value(name.as_bytes(), value.as_bytes())?;
            if fitted.len() < value.len() {
                tracing::warn!(
                    request_id = self.id,
                    param = %name,
                    original = value.len(),
                    kept = fitted.len(),
                    "truncating oversized parameter value"
                );
            }
            if content.len() + protocol::pair_len(name.as_bytes(), fitted) > MAX_WRITE {
                records.push(content.split().freeze());
            }
            protocol::put_name_value(&mut content, name.as_bytes(), fitted);
        }
        if !content.is_empty() {
            records.push(content.freeze());
        }
        Ok(records)
    }

    async fn write_stdin<W>(&mut self, conn: &mut W, out: &mut BytesMut) -> FcgiResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let id = self.id;
        match &mut self.body {
            RequestBody::Empty => {}
            RequestBody::Bytes(body) => {
                for chunk in body.chunks(STDIN_CHUNK) {
                    send_record(conn, out, RecordType::Stdin, id, chunk).await?;
                }
            }
            RequestBody::Stream {
                reader, consumed, ..
            } => {
                let mut chunk = vec![0u8; STDIN_CHUNK];
                loop {
                    *consumed = true;
                    let n = reader
                        .read(&mut chunk)
                        .await
                        .map_err(|e| FcgiError::InvalidRequest(format!("reading request body: {e}")))?;
                    if n == 0 {
                        break;
                    }
                    send_record(conn, out, RecordType::Stdin, id, &chunk[..n]).await?;
                }
            }
        }
        send_record(conn, out, RecordType::Stdin, id, &[]).await
    }

    async fn read_response<R>(&self, conn: &mut R) -> FcgiResult<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        let mut stdout = BytesMut::new();
        let mut stderr = Vec::new();
        let mut content = Vec::with_capacity(MAX_WRITE);

        loop {
            let header = protocol::read_header(conn).await?;
            protocol::read_body(conn, &header, &mut content).await?;

            if header.request_id != self.id {
                tracing::trace!(
                    request_id = self.id,
                    record_id = header.request_id,
                    record_type = header.record_type,
                    "skipping record for another request"
                );
                continue;
            }

            match header.kind() {
                Some(RecordType::Stdout) => stdout.extend_from_slice(&content),
                Some(RecordType::Stderr) => stderr.extend_from_slice(&content),
                Some(RecordType::EndRequest) => {
                    let end = EndRequestBody::from_bytes(&content)?;
                    tracing::debug!(
                        request_id = self.id,
                        app_status = end.app_status,
                        protocol_status = %end.protocol_status,
                        "request ended"
                    );
                    if end.protocol_status != ProtocolStatus::RequestComplete {
                        return Err(FcgiError::Rejected(end.protocol_status));
                    }
                    break;
                }
                _ => tracing::trace!(
                    request_id = self.id,
                    record_type = header.record_type,
                    "ignoring record"
                ),
            }
        }

        if !stderr.is_empty() {
            return Err(FcgiError::Stderr(
                String::from_utf8_lossy(&stderr).trim_end().to_string(),
            ));
        }
        Ok(stdout.freeze())
    }
}

/// Frame `content` into `out` and write it.
async fn send_record<W>(
    conn: &mut W,
    out: &mut BytesMut,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> FcgiResult<()>
where
    W: AsyncWrite + Unpin,
{
    out.clear();
    protocol::put_record(out, record_type, request_id, content)?;
    conn.write_all(out).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastcgi::protocol::{decode_name_values, Header};
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Split a captured byte stream back into records.
    async fn records(mut wire: &[u8]) -> Vec<(Header, Vec<u8>)> {
        let mut out = Vec::new();
        while !wire.is_empty() {
            let header = protocol::read_header(&mut wire).await.unwrap();
            let mut content = Vec::new();
            protocol::read_body(&mut wire, &header, &mut content).await.unwrap();
            out.push((header, content));
        }
        out
    }

    fn of_type(recs: &[(Header, Vec<u8>)], t: RecordType) -> Vec<&Vec<u8>> {
        recs.iter()
            .filter(|(h, _)| h.kind() == Some(t))
            .map(|(_, c)| c)
            .collect()
    }

    fn reply(id: u16, stdout: &[u8], stderr: &[u8], status: ProtocolStatus) -> Vec<u8> {
        let mut buf = BytesMut::new();
        if !stdout.is_empty() {
            protocol::put_record(&mut buf, RecordType::Stdout, id, stdout).unwrap();
        }
        if !stderr.is_empty() {
            protocol::put_record(&mut buf, RecordType::Stderr, id, stderr).unwrap();
        }
        let end = EndRequestBody {
            app_status: 0,
            protocol_status: status,
        };
        protocol::put_record(&mut buf, RecordType::EndRequest, id, &end.to_bytes()).unwrap();
        buf.to_vec()
    }

    #[test]
    fn concurrent_ids_are_unique_and_nonzero() {
        let ids = Arc::new(RequestIdCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert_ne!(id, 0);
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn ids_wrap_before_the_maximum() {
        let ids = RequestIdCounter::starting_at(65533);
        assert_eq!(ids.next_id(), 65534);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[tokio::test]
    async fn records_are_written_in_order() {
        let ids = RequestIdCounter::new();
        let mut req = Request::new(&ids);
        req.keep_alive().set_param("REQUEST_METHOD", "GET");

        let mut wire = Vec::new();
        req.write_to(&mut wire).await.unwrap();
        assert_eq!(req.state(), RequestState::StdinSent);

        let recs = records(&wire).await;
        let kinds: Vec<_> = recs.iter().map(|(h, _)| h.kind().unwrap()).collect();
        assert_eq!(
            kinds,
            [
                RecordType::BeginRequest,
                RecordType::Params,
                RecordType::Params,
                RecordType::Stdin
            ]
        );
        assert!(recs.iter().all(|(h, _)| h.request_id == req.id()));
        assert_eq!(recs[0].1, BeginRequestBody::responder(true).to_bytes());
        assert!(recs[3].1.is_empty());
    }

    #[tokio::test]
    async fn many_params_span_several_records() {
        let ids = RequestIdCounter::new();
        let mut req = Request::new(&ids);
        for i in 0..5000 {
            req.set_param(format!("PARAM_{i:05}"), "v".repeat(20));
        }

        let mut wire = Vec::new();
        req.write_to(&mut wire).await.unwrap();
        let recs = records(&wire).await;
        let params = of_type(&recs, RecordType::Params);

        assert!(params.len() > 2, "expected several PARAMS records");
        assert!(params.iter().all(|c| c.len() <= MAX_WRITE));
        assert!(params.last().unwrap().is_empty());
        assert_eq!(params.iter().filter(|c| c.is_empty()).count(), 1);

        let decoded: usize = params
            .iter()
            .map(|c| decode_name_values(c).unwrap().len())
            .sum();
        assert_eq!(decoded, 5000);
    }

    #[tokio::test]
    async fn content_length_is_derived_from_body() {
        let ids = RequestIdCounter::new();
        let mut req = Request::new(&ids);
        req.set_param("CONTENT_LENGTH", "abc").set_body_bytes("hello");

        let mut wire = Vec::new();
        req.write_to(&mut wire).await.unwrap();
        assert_eq!(req.param("CONTENT_LENGTH"), Some("5"));
    }

    #[tokio::test]
    async fn empty_stream_without_length_is_refused() {
        let ids = RequestIdCounter::new();
        let mut req = Request::new(&ids);
        req.set_body(tokio::io::empty(), 0);

        let mut wire = Vec::new();
        let err = req.write_to(&mut wire).await.unwrap_err();
        assert!(matches!(err, FcgiError::MissingContentLength));
        assert!(wire.is_empty(), "nothing may reach the wire");
        assert_eq!(req.state(), RequestState::Built);
    }

    #[tokio::test]
    async fn refused_request_leaves_the_connection_clean() {
        let ids = RequestIdCounter::new();
        let mut req = Request::new(&ids);
        req.set_body_bytes(Bytes::new());

        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        let err = req.call_on(&mut client).await.unwrap_err();
        assert!(matches!(err, FcgiError::MissingContentLength));
        assert!(!req.left_partial_write());
        drop(client);

        let mut leftover = Vec::new();
        server.read_to_end(&mut leftover).await.unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn failing_body_reader_marks_a_partial_write() {
        struct Broken;
        impl AsyncRead for Broken {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
                _: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("disk gone")))
            }
        }

        let ids = RequestIdCounter::new();
        let mut req = Request::new(&ids);
        req.set_body(Broken, 10);

        let (mut client, _server) = tokio::io::duplex(1 << 16);
        let err = req.call_on(&mut client).await.unwrap_err();
        assert!(matches!(err, FcgiError::InvalidRequest(_)));
        assert!(req.left_partial_write());
        assert_eq!(req.state(), RequestState::Failed);
    }

    #[test]
    fn request_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}

        let ids = RequestIdCounter::new();
        let mut req = Request::new(&ids);
        req.set_body(tokio::io::empty(), 0);
        let (mut conn, _server) = tokio::io::duplex(64);
        let fut = req.call_on(&mut conn);
        assert_send(&fut);
    }

    #[tokio::test]
    async fn body_is_sent_in_small_stdin_records() {
        let ids = RequestIdCounter::new();
        let mut req = Request::new(&ids);
        let body = vec![7u8; 20_000];
        req.set_body(std::io::Cursor::new(body.clone()), body.len() as u64);

        let mut wire = Vec::new();
        req.write_to(&mut wire).await.unwrap();
        assert!(!req.is_replayable());

        let recs = records(&wire).await;
        let stdin = of_type(&recs, RecordType::Stdin);
        assert!(stdin.iter().all(|c| c.len() <= STDIN_CHUNK));
        assert!(stdin.last().unwrap().is_empty());
        let sent: Vec<u8> = stdin.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(sent, body);
    }

    #[tokio::test]
    async fn call_skips_foreign_records() {
        let ids = RequestIdCounter::starting_at(41);
        let mut req = Request::new(&ids);
        req.set_param("REQUEST_METHOD", "GET");
        let id = req.id();

        let (mut client, mut server) = tokio::io::duplex(1 << 20);
        let responder = tokio::spawn(async move {
            let mut content = Vec::new();
            loop {
                let header = protocol::read_header(&mut server).await.unwrap();
                protocol::read_body(&mut server, &header, &mut content).await.unwrap();
                if header.kind() == Some(RecordType::Stdin) && content.is_empty() {
                    break;
                }
            }
            let mut out = BytesMut::new();
            protocol::put_record(&mut out, RecordType::GetValuesResult, 0, b"\x01\x01ab").unwrap();
            protocol::put_record(&mut out, RecordType::Stdout, id + 1, b"stale").unwrap();
            protocol::put_record(&mut out, RecordType::Stdout, id, b"Content-Type: text/plain\r\n\r\n").unwrap();
            out.extend_from_slice(&reply(id, b"1700000000", b"", ProtocolStatus::RequestComplete));
            server.write_all(&out).await.unwrap();
        });

        let resp = req.call_on(&mut client).await.unwrap();
        responder.await.unwrap();

        assert_eq!(req.state(), RequestState::Complete);
        assert_eq!(resp.status, axum::http::StatusCode::OK);
        assert_eq!(resp.headers["content-type"], "text/plain");
        assert_eq!(resp.body().as_ref(), b"1700000000");

        req.set_param("LATE", "ignored");
        assert_eq!(req.param("LATE"), None);
    }

    #[tokio::test]
    async fn stderr_fails_the_call() {
        let ids = RequestIdCounter::new();
        let mut req = Request::new(&ids);
        let id = req.id();

        let mut wire = Vec::new();
        req.write_to(&mut wire).await.unwrap();

        let response = reply(id, b"Status: 200\r\n\r\npartial", b"PHP Warning: boom\n", ProtocolStatus::RequestComplete);
        let err = req.read_response(&mut response.as_slice()).await.unwrap_err();
        match err {
            FcgiError::Stderr(text) => assert_eq!(text, "PHP Warning: boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn overloaded_responder_rejects() {
        let ids = RequestIdCounter::new();
        let req = Request::new(&ids);
        let response = reply(req.id(), b"", b"", ProtocolStatus::Overloaded);
        let err = req.read_response(&mut response.as_slice()).await.unwrap_err();
        assert!(matches!(err, FcgiError::Rejected(ProtocolStatus::Overloaded)));
    }

    #[tokio::test]
    async fn truncated_stream_is_lost_connection() {
        let ids = RequestIdCounter::new();
        let req = Request::new(&ids);
        let response = reply(req.id(), b"Status: 200\r\n\r\nok", b"", ProtocolStatus::RequestComplete);
        let cut = &response[..response.len() - 12];
        let err = req.read_response(&mut &cut[..]).await.unwrap_err();
        assert!(err.is_lost_connection());
    }
}

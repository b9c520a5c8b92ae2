//! Mock FastCGI responder shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use fcgi_gateway::fastcgi::protocol::{
    self, EndRequestBody, ProtocolStatus, RecordType, KEEP_CONN, NULL_REQUEST_ID,
};
use fcgi_gateway::fastcgi::BackendAddr;

/// What the responder received for one request.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub id: u16,
    pub keep_conn: bool,
    pub params: HashMap<String, String>,
    pub stdin: Vec<u8>,
}

/// How the responder answers one request.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// STDOUT with this CGI output, then END_REQUEST.
    Reply(String),
    /// Like `Reply`, then close the connection regardless of KEEP_CONN.
    ReplyAndClose(String),
    /// Close the connection without answering.
    Sever,
    /// STDERR with this text and no output, then END_REQUEST.
    Stderr(String),
    /// Answer with END_REQUEST carrying this protocol status.
    Reject(ProtocolStatus),
    /// Sit on the request.
    Stall(Duration),
    /// Send the first bytes of a reply, then sit on the rest.
    Partial(Duration),
}

type Script = dyn Fn(usize, &Captured) -> Behavior + Send + Sync;

pub struct MockResponder {
    pub addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Captured>>>,
}

impl MockResponder {
    /// Start a responder on a free loopback port. `script` gets the zero-based
    /// request number and the captured request.
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(usize, &Captured) -> Behavior + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let script: Arc<Script> = Arc::new(script);

        let (a, s) = (accepts.clone(), seen.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                a.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(socket, script.clone(), s.clone()));
            }
        });

        Self { addr, accepts, seen }
    }

    /// Echo the script path, method, query and body.
    pub async fn echo() -> Self {
        Self::start(|_, req| Behavior::Reply(echo_output(req))).await
    }

    pub fn backend(&self) -> BackendAddr {
        BackendAddr::tcp(self.addr.to_string())
    }

    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.seen.lock().unwrap().clone()
    }
}

pub fn echo_output(req: &Captured) -> String {
    let param = |name: &str| req.params.get(name).cloned().unwrap_or_default();
    format!(
        "Content-Type: text/plain\r\nX-Script: {}\r\n\r\n{} {} {} {}",
        param("SCRIPT_NAME"),
        param("REQUEST_METHOD"),
        param("SCRIPT_FILENAME"),
        param("QUERY_STRING"),
        String::from_utf8_lossy(&req.stdin),
    )
}

async fn serve_connection(mut socket: TcpStream, script: Arc<Script>, seen: Arc<Mutex<Vec<Captured>>>) {
    loop {
        let Some(req) = read_request(&mut socket).await else {
            return;
        };
        let behavior = {
            let mut seen = seen.lock().unwrap();
            let n = seen.len();
            seen.push(req.clone());
            script(n, &req)
        };

        let mut out = BytesMut::new();
        let mut close = !req.keep_conn;
        match behavior {
            Behavior::Sever => return,
            Behavior::Stall(d) => {
                tokio::time::sleep(d).await;
                return;
            }
            Behavior::Partial(d) => {
                put_reply(&mut out, req.id, None, "Status: 200\r\n\r\nlate", ProtocolStatus::RequestComplete);
                let _ = socket.write_all(&out[..12]).await;
                tokio::time::sleep(d).await;
                return;
            }
            Behavior::Reply(stdout) => put_reply(&mut out, req.id, None, &stdout, ProtocolStatus::RequestComplete),
            Behavior::ReplyAndClose(stdout) => {
                put_reply(&mut out, req.id, None, &stdout, ProtocolStatus::RequestComplete);
                close = true;
            }
            Behavior::Stderr(text) => {
                put_reply(&mut out, req.id, Some(&text), "", ProtocolStatus::RequestComplete)
            }
            Behavior::Reject(status) => put_reply(&mut out, req.id, None, "", status),
        }

        if socket.write_all(&out).await.is_err() || close {
            let _ = socket.shutdown().await;
            return;
        }
    }
}

fn put_reply(out: &mut BytesMut, id: u16, stderr: Option<&str>, stdout: &str, status: ProtocolStatus) {
    if let Some(text) = stderr {
        protocol::put_record(out, RecordType::Stderr, id, text.as_bytes()).unwrap();
    }
    for chunk in stdout.as_bytes().chunks(protocol::MAX_WRITE) {
        protocol::put_record(out, RecordType::Stdout, id, chunk).unwrap();
    }
    protocol::put_record(out, RecordType::Stdout, id, b"").unwrap();
    let end = EndRequestBody {
        app_status: 0,
        protocol_status: status,
    };
    protocol::put_record(out, RecordType::EndRequest, id, &end.to_bytes()).unwrap();
}

/// Read BEGIN, PARAMS and STDIN up to the empty STDIN record. Answers
/// GET_VALUES along the way. `None` once the peer is gone.
async fn read_request(socket: &mut TcpStream) -> Option<Captured> {
    let mut req = Captured::default();
    let mut params = Vec::new();
    let mut body = Vec::new();

    loop {
        let header = protocol::read_header(socket).await.ok()?;
        protocol::read_body(socket, &header, &mut body).await.ok()?;

        match header.kind()? {
            RecordType::BeginRequest => {
                req.id = header.request_id;
                req.keep_conn = body.get(2).is_some_and(|f| f & KEEP_CONN != 0);
            }
            RecordType::Params if body.is_empty() => {
                req.params = protocol::decode_name_values(&params).ok()?.into_iter().collect();
            }
            RecordType::Params => params.extend_from_slice(&body),
            RecordType::Stdin if body.is_empty() => return Some(req),
            RecordType::Stdin => req.stdin.extend_from_slice(&body),
            RecordType::GetValues if header.request_id == NULL_REQUEST_ID => {
                let names = protocol::decode_name_values(&body).ok()?;
                let mut content = BytesMut::new();
                for (name, _) in names {
                    let value = match name.as_str() {
                        "FCGI_MAX_CONNS" => "10",
                        "FCGI_MAX_REQS" => "50",
                        "FCGI_MPXS_CONNS" => "0",
                        _ => continue,
                    };
                    protocol::put_name_value(&mut content, name.as_bytes(), value.as_bytes());
                }
                let mut out = BytesMut::new();
                protocol::put_record(&mut out, RecordType::GetValuesResult, NULL_REQUEST_ID, &content).ok()?;
                socket.write_all(&out).await.ok()?;
            }
            _ => {}
        }
    }
}

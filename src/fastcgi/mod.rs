//! FastCGI client subsystem.
//!
//! # Data Flow
//! ```text
//! Transport::round_trip(http request)
//!     → Pool::acquire()            (lease one Client)
//!     → Client::call(Request)      (lock connection, retry once on disconnect)
//!     → Request::call_on(stream)   (BEGIN_REQUEST, PARAMS*, STDIN*)
//!     → protocol::read_header/body (demultiplex by request id)
//!     → FcgiResponse               (CGI headers + body)
//!     → http response
//! ```
//!
//! # Design Decisions
//! - One request in flight per connection; no multiplexing
//! - RESPONDER role only
//! - Plain TCP or Unix stream to the backend

pub mod client;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod request;
pub mod response;
pub mod stream;
pub mod transport;

pub use client::{Client, ClientOptions};
pub use error::{FcgiError, FcgiResult};
pub use pool::{Pool, PoolOptions, PoolRegistry, PooledClient};
pub use request::{Request, RequestIdCounter};
pub use response::FcgiResponse;
pub use stream::{BackendAddr, Network};
pub use transport::{TlsInfo, Transport, TransportConfig};

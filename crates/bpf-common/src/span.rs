use std::sync::Arc;

use bytes::Bytes;

use crate::filter::ServiceId;

/// One decoded request span, as handed to the external consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Span {
    pub pid: u32,
    pub kind: SpanKind,
    pub method: String,
    pub path: String,
    pub status: u16,
    /// Monotonic timestamps in nanoseconds, as stamped by the kernel programs.
    pub start_monotime_ns: u64,
    pub end_monotime_ns: u64,
    /// Raw trailing payload the decoder chose to preserve (request bodies,
    /// peer addresses). May be empty.
    pub payload: Bytes,
    /// Service this span was attributed to by the PID filter.
    pub service: Option<Arc<ServiceId>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpanKind {
    #[default]
    HttpServer,
    HttpClient,
    GrpcServer,
    GrpcClient,
    Sql,
}

//! Per-bundle ring buffer consumer.
//!
//! Each loaded bundle gets one pump task. It reads kernel records from the
//! bundle's ring buffer, hands them to the bundle's decoder, keeps only
//! events whose PID is in the allow-set, groups the resulting spans into
//! batches and emits the batches on the shared out channel.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use aya::maps::{MapData, RingBuf};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TracerConfig;
use crate::filter::ServiceFilter;
use crate::reporter::Reporter;
use crate::span::Span;

/// What a ring-buffer record decodes into.
#[derive(Debug)]
pub enum Decoded {
    /// An instrumentation event, subject to PID filtering and batching.
    Span { pid: u32, netns: u32, span: Span },
    /// A print statement from a debug build of the kernel programs. Never
    /// produces a span.
    Log {
        pid: u32,
        comm: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("record too short: got {got} bytes, need {need}")]
    TooShort { got: usize, need: usize },
    #[error("unknown event kind {0}")]
    UnknownKind(u8),
    #[error("malformed record: {0}")]
    Malformed(&'static str),
}

/// Decoding belongs to whoever compiled the kernel programs; the pump only
/// drives it.
pub trait EventDecoder: Send + Sync + 'static {
    fn decode(&self, record: &[u8]) -> Result<Decoded, DecodeError>;
}

/// Groups spans into batches of a fixed maximum length, preserving the order
/// they were pushed in.
struct SpanBatcher {
    buf: Vec<Span>,
    limit: usize,
}

impl SpanBatcher {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.max(1)),
            limit: limit.max(1),
        }
    }

    /// Push a span; returns the completed batch once the limit is reached.
    fn push(&mut self, span: Span) -> Option<Vec<Span>> {
        self.buf.push(span);
        (self.buf.len() >= self.limit).then(|| self.take())
    }

    /// The pending partial batch, if any.
    fn flush(&mut self) -> Option<Vec<Span>> {
        (!self.buf.is_empty()).then(|| self.take())
    }

    fn take(&mut self) -> Vec<Span> {
        std::mem::replace(&mut self.buf, Vec::with_capacity(self.limit))
    }
}

pub struct EventPump {
    name: &'static str,
    decoder: Arc<dyn EventDecoder>,
    filter: Arc<dyn ServiceFilter>,
    reporter: Arc<dyn Reporter>,
    batcher: SpanBatcher,
    batch_timeout: Duration,
}

impl EventPump {
    pub fn new(
        name: &'static str,
        decoder: Arc<dyn EventDecoder>,
        filter: Arc<dyn ServiceFilter>,
        reporter: Arc<dyn Reporter>,
        cfg: &TracerConfig,
    ) -> Self {
        Self {
            name,
            decoder,
            filter,
            reporter,
            batcher: SpanBatcher::new(cfg.batch_length),
            batch_timeout: cfg.batch_timeout(),
        }
    }

    /// Decode one record, apply the PID filter and batch the span. Returns a
    /// batch when this record completed one.
    fn handle_record(&mut self, record: &[u8]) -> Option<Vec<Span>> {
        match self.decoder.decode(record) {
            Ok(Decoded::Span { pid, netns, mut span }) => {
                let service = self.filter.lookup(pid, netns)?;
                span.service = Some(service);
                self.batcher.push(span)
            }
            Ok(Decoded::Log { pid, comm, message }) => {
                log::debug!("{}: {message} pid={pid} comm={comm}", self.name);
                None
            }
            Err(err) => {
                self.reporter.tracer_decode_error(&err.to_string());
                None
            }
        }
    }

    /// Emit a batch. Blocks on a full channel; cancellation unblocks and
    /// discards the in-flight batch. Returns false once cancelled.
    async fn emit(
        &self,
        out: &mpsc::Sender<Vec<Span>>,
        batch: Vec<Span>,
        cancel: &CancellationToken,
    ) -> bool {
        self.reporter.tracer_flush(batch.len());
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = out.send(batch) => sent.is_ok(),
        }
    }

    /// Final flush after cancellation. The batch must not block, so a full
    /// or closed channel discards it.
    fn drain(&mut self, out: &mpsc::Sender<Vec<Span>>) {
        if let Some(batch) = self.batcher.flush() {
            self.reporter.tracer_flush(batch.len());
            if let Err(err) = out.try_send(batch) {
                log::debug!("{}: dropping final batch on shutdown: {err}", self.name);
            }
        }
    }

    pub async fn run(
        mut self,
        ring: RingBuf<MapData>,
        cancel: CancellationToken,
        out: mpsc::Sender<Vec<Span>>,
    ) {
        let mut ring = match AsyncFd::new(ring) {
            Ok(fd) => fd,
            Err(err) => {
                crate::log_error("registering ring buffer with the reactor", err);
                return;
            }
        };
        let mut flush_tick = tokio::time::interval(self.batch_timeout);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        log::debug!("{}: event pump started", self.name);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = flush_tick.tick() => {
                    if let Some(batch) = self.batcher.flush() {
                        if !self.emit(&out, batch, &cancel).await {
                            break;
                        }
                    }
                }
                readable = ring.readable_mut() => {
                    let mut guard = match readable {
                        Ok(guard) => guard,
                        Err(err) if transient_read_error(&err) => {
                            log::warn!("{}: ring buffer read failed: {err}", self.name);
                            continue;
                        }
                        Err(err) => {
                            log::warn!("{}: ring buffer closed: {err}", self.name);
                            break;
                        }
                    };
                    let mut completed = Vec::new();
                    {
                        let ring = guard.get_inner_mut();
                        while let Some(record) = ring.next() {
                            if let Some(batch) = self.handle_record(&record) {
                                completed.push(batch);
                            }
                        }
                    }
                    guard.clear_ready();
                    let mut cancelled = false;
                    for batch in completed {
                        if !self.emit(&out, batch, &cancel).await {
                            cancelled = true;
                            break;
                        }
                    }
                    if cancelled {
                        break;
                    }
                }
            }
        }

        self.drain(&out);
        log::debug!("{}: event pump finished", self.name);
    }
}

fn transient_read_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

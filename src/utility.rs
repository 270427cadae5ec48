//! One-shot loader for bundles which only need kernel-global probes.
//!
//! A utility tracer shares the load path of the process tracers (same lock,
//! same fallback, same error taxonomy), attaches nothing but kprobes and
//! tracepoints, and consumes its own ring buffer: decoded records go to an
//! internal handler instead of the span channel. There is no discovery
//! feeding an allow-set here, so spans pass through an identity filter which
//! stamps them with the empty service.

use std::sync::Arc;

use bpf_common::bundle::ProgramBundle;
use bpf_common::filter::{IdentityFilter, ServiceFilter};
use bpf_common::load::{self, LoadContext};
use bpf_common::pump::Decoded;
use bpf_common::TracerConfig;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::instrument::Instrumenter;
use crate::tracer::TracerError;

pub struct UtilityTracer {
    cfg: TracerConfig,
    ctx: LoadContext,
    bundle: ProgramBundle,
    instrumenter: Instrumenter,
    filter: Arc<dyn ServiceFilter>,
    handler: Box<dyn FnMut(Decoded) + Send>,
    initialized: bool,
}

impl UtilityTracer {
    pub fn new(
        cfg: TracerConfig,
        ctx: LoadContext,
        bundle: ProgramBundle,
        handler: impl FnMut(Decoded) + Send + 'static,
    ) -> Self {
        Self {
            cfg,
            ctx,
            bundle,
            instrumenter: Instrumenter::global(),
            filter: Arc::new(IdentityFilter::new()),
            handler: Box::new(handler),
            initialized: false,
        }
    }

    pub fn init(&mut self) -> Result<(), TracerError> {
        if self.initialized {
            return Err(TracerError::AlreadyInitialized);
        }
        log::debug!("loading independent eBPF bundle {}", self.bundle.name());
        let guard = load::load_lock();
        load::load_bundle(&guard, &self.ctx, &mut self.bundle, self.cfg.bpf_debug)?;
        self.bundle.setup_tail_calls()?;
        self.bundle.setup_tc()?;

        self.instrumenter
            .attach_kprobes(&mut self.bundle)
            .and_then(|()| self.instrumenter.attach_tracepoints(&mut self.bundle))
            .map_err(|source| TracerError::Attach {
                scope: "global".to_string(),
                source,
            })?;
        self.initialized = true;
        Ok(())
    }

    /// Spawn the main loop. The tracer, and with it every attachment, lives
    /// as long as the returned task; cancellation ends it.
    pub fn run(mut self, cancel: CancellationToken) -> Result<JoinHandle<()>, TracerError> {
        let ring = self.bundle.take_events_map()?;
        let decoder = self.bundle.decoder();
        let name = self.bundle.name();

        Ok(tokio::spawn(async move {
            let mut ring = match AsyncFd::new(ring) {
                Ok(fd) => fd,
                Err(err) => {
                    bpf_common::log_error("registering ring buffer with the reactor", err);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    readable = ring.readable_mut() => {
                        let mut guard = match readable {
                            Ok(guard) => guard,
                            Err(err) => {
                                log::warn!("{name}: ring buffer read failed: {err}");
                                break;
                            }
                        };
                        let ring = guard.get_inner_mut();
                        while let Some(record) = ring.next() {
                            match decoder.decode(&record) {
                                Ok(decoded) => {
                                    forward(self.filter.as_ref(), &mut self.handler, decoded)
                                }
                                Err(err) => log::debug!("{name}: {err}"),
                            }
                        }
                        guard.clear_ready();
                    }
                }
            }
            // Going out of scope here releases the attachments and the
            // collection itself.
            drop(self);
        }))
    }
}

/// Attribute span records through the filter before the handler sees them;
/// log records pass straight through.
fn forward(
    filter: &dyn ServiceFilter,
    handler: &mut (dyn FnMut(Decoded) + Send),
    decoded: Decoded,
) {
    match decoded {
        Decoded::Span { pid, netns, mut span } => {
            let Some(service) = filter.lookup(pid, netns) else {
                return;
            };
            span.service = Some(service);
            handler(Decoded::Span { pid, netns, span });
        }
        log_record => handler(log_record),
    }
}

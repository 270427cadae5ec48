//! Orchestrator for kernel-resident tracing programs.
//!
//! A [`ProcessTracer`] loads its program bundles exactly once, attaches the
//! kernel-global probes, and then multiplexes discovered executables onto
//! the loaded programs: one [`Instrumenter`] per executable inode. Events
//! flow out through one pump task per bundle.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bpf_common::bundle::ProgramBundle;
use bpf_common::filter::ServiceFilter;
use bpf_common::load::{self, LoadContext, LoadError};
use bpf_common::offsets::{FileInfo, Instrumentable};
use bpf_common::pump::EventPump;
use bpf_common::reporter::Reporter;
use bpf_common::span::Span;
use bpf_common::{bpf_fs, TracerConfig};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::instrument::{AttachError, Instrumenter};

/// Label distinguishing tracer flavors in log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerKind {
    /// Uprobe-based tracing of Go binaries.
    Go,
    /// Kernel-side tracing applicable to any process.
    Generic,
}

impl fmt::Display for TracerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TracerKind::Go => write!(f, "go"),
            TracerKind::Generic => write!(f, "generic"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TracerError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("attaching probes for {scope}")]
    Attach {
        scope: String,
        #[source]
        source: AttachError,
    },
    #[error("tracer already initialized")]
    AlreadyInitialized,
}

pub struct ProcessTracer {
    kind: TracerKind,
    cfg: TracerConfig,
    ctx: LoadContext,
    bundles: Vec<ProgramBundle>,
    /// Holds the kernel-global attachments for the whole tracer lifetime.
    global: Instrumenter,
    instrumentables: HashMap<u64, Instrumenter>,
    filter: Arc<dyn ServiceFilter>,
    reporter: Arc<dyn Reporter>,
    initialized: bool,
}

impl ProcessTracer {
    pub fn new(
        kind: TracerKind,
        cfg: TracerConfig,
        ctx: LoadContext,
        bundles: Vec<ProgramBundle>,
        filter: Arc<dyn ServiceFilter>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            kind,
            cfg,
            ctx,
            bundles,
            global: Instrumenter::global(),
            instrumentables: HashMap::new(),
            filter,
            reporter,
            initialized: false,
        }
    }

    pub fn kind(&self) -> TracerKind {
        self.kind
    }

    /// Forward a discovery decision to the shared PID filter.
    pub fn allow_pid(&self, pid: u32, netns: u32, service: bpf_common::ServiceId) {
        self.filter.allow(pid, netns, service);
    }

    pub fn block_pid(&self, pid: u32, netns: u32) {
        self.filter.block(pid, netns);
    }

    /// Load every bundle into the kernel and attach the global probes.
    /// Kernel state only mutates under the process-wide load lock.
    pub fn init(&mut self) -> Result<(), TracerError> {
        if self.initialized {
            return Err(TracerError::AlreadyInitialized);
        }
        let guard = load::load_lock();
        for bundle in &mut self.bundles {
            log::debug!("({}) loading eBPF bundle {}", self.kind, bundle.name());
            load::load_bundle(&guard, &self.ctx, bundle, self.cfg.bpf_debug)?;
            bundle.setup_tail_calls()?;
            bundle.setup_tc()?;

            self.global
                .attach_kprobes(bundle)
                .and_then(|()| self.global.attach_tracepoints(bundle))
                .and_then(|()| self.global.attach_sockfilters(bundle))
                .map_err(|source| TracerError::Attach {
                    scope: "global".to_string(),
                    source,
                })?;
        }
        self.initialized = true;
        Ok(())
    }

    /// Instrument a newly discovered executable: goprobes first, then
    /// uprobes, against every bundle.
    ///
    /// On failure the partially attached instrumenter is kept, so its
    /// handles stay reachable; the caller decides whether to unlink.
    pub fn new_executable(&mut self, ie: &Instrumentable) -> Result<(), TracerError> {
        let info = &ie.file_info;
        if self.instrumentables.contains_key(&info.ino) {
            log::warn!(
                "({}) inode {} already instrumented, attaching new instance pid={}",
                self.kind,
                info.ino,
                info.pid
            );
            return self.new_executable_instance(ie);
        }

        log::debug!(
            "({}) instrumenting {} ino={} pid={}",
            self.kind,
            info.cmd_exe_path.display(),
            info.ino,
            info.pid
        );
        let mut instrumenter = Instrumenter::for_executable(info, ie.offsets.clone());
        let pid = (!self.cfg.system_wide).then_some(info.pid);
        let mut failure = None;
        for bundle in &mut self.bundles {
            bundle.register_offsets(info, &ie.offsets);
            let attached = instrumenter
                .attach_goprobes(bundle)
                .and_then(|()| instrumenter.attach_uprobes(pid, bundle));
            if let Err(source) = attached {
                failure = Some(source);
                break;
            }
        }
        self.instrumentables.insert(info.ino, instrumenter);

        match failure {
            Some(source) => Err(TracerError::Attach {
                scope: info.exec_name(),
                source,
            }),
            None => {
                if let Some(instrumenter) = self.instrumentables.get_mut(&info.ino) {
                    instrumenter.mark_reported();
                }
                self.reporter.instrument_process(&info.exec_name());
                Ok(())
            }
        }
    }

    /// A second process appeared for an already-instrumented binary: only
    /// the pid-scoped uprobes need attaching, goprobes are inode-scoped and
    /// already in place.
    pub fn new_executable_instance(&mut self, ie: &Instrumentable) -> Result<(), TracerError> {
        let info = &ie.file_info;
        let pid = (!self.cfg.system_wide).then_some(info.pid);
        let Some(instrumenter) = self.instrumentables.get_mut(&info.ino) else {
            log::warn!(
                "({}) attempted to update non-existent tracer path={} pid={}",
                self.kind,
                info.cmd_exe_path.display(),
                info.pid
            );
            return Ok(());
        };
        for bundle in &mut self.bundles {
            instrumenter
                .attach_uprobes(pid, bundle)
                .map_err(|source| TracerError::Attach {
                    scope: info.exec_name(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Tear down everything attached for an executable: release its
    /// closables in reverse order and signal module teardown to every
    /// bundle. Unknown inodes are a warning, never a panic.
    pub fn unlink_executable(&mut self, info: &FileInfo) {
        match self.instrumentables.remove(&info.ino) {
            Some(instrumenter) => {
                log::debug!(
                    "({}) unlinking {} ino={}",
                    self.kind,
                    info.exec_name(),
                    info.ino
                );
                let reported = instrumenter.reported();
                instrumenter.unlink(&mut self.bundles);
                if reported {
                    self.reporter.uninstrument_process(&info.exec_name());
                }
            }
            None => log::warn!(
                "({}) unable to find executable to unlink ino={} path={}",
                self.kind,
                info.ino,
                info.cmd_exe_path.display()
            ),
        }
    }

    pub fn instrumented_inodes(&self) -> impl Iterator<Item = u64> + '_ {
        self.instrumentables.keys().copied()
    }

    /// Spawn one event pump per bundle plus a cancellation watcher, then
    /// return. Cancelling `cancel` makes every pump drain and exit.
    pub fn run(
        &mut self,
        cancel: CancellationToken,
        out: mpsc::Sender<Vec<Span>>,
    ) -> Result<(), TracerError> {
        log::debug!("({}) starting process tracer", self.kind);
        for bundle in &mut self.bundles {
            let ring = bundle.take_events_map()?;
            let pump = EventPump::new(
                bundle.name(),
                bundle.decoder(),
                self.filter.clone(),
                self.reporter.clone(),
                &self.cfg,
            );
            tokio::spawn(pump.run(ring, cancel.clone(), out.clone()));
        }

        let kind = self.kind;
        let watcher = cancel.clone();
        tokio::spawn(async move {
            watcher.cancelled().await;
            log::debug!("({kind}) tracer cancelled, event pumps are draining");
        });
        Ok(())
    }
}

impl Drop for ProcessTracer {
    fn drop(&mut self) {
        // Attachment handles and programs go before the pin directory, so
        // nothing is resident when the pinned maps disappear.
        self.instrumentables.clear();
        self.global.release();
        self.bundles.clear();
        if let Err(err) = bpf_fs::remove_pin_dir(self.ctx.pin_path()) {
            log::debug!(
                "unable to remove pin path {}: {err}",
                self.ctx.pin_path().display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use bpf_common::bundle::BundleArtifacts;
    use bpf_common::offsets::{FuncOffsets, Offsets};
    use bpf_common::pump::{DecodeError, Decoded, EventDecoder};
    use bpf_common::reporter::AccountingReporter;
    use bpf_common::PidFilter;

    struct NullDecoder;

    impl EventDecoder for NullDecoder {
        fn decode(&self, _record: &[u8]) -> Result<Decoded, DecodeError> {
            Err(DecodeError::Malformed("unused"))
        }
    }

    fn go_bundle() -> ProgramBundle {
        ProgramBundle::new(
            "go",
            BundleArtifacts::single(&[]),
            Arc::new(Offsets::default()),
            Arc::new(NullDecoder),
        )
        .goprobe("runtime.newproc1", Some("uprobe_proc_newproc1"), None)
    }

    fn tracer(bundles: Vec<ProgramBundle>) -> (ProcessTracer, Arc<AccountingReporter>) {
        let reporter = Arc::new(AccountingReporter::default());
        let base = std::env::temp_dir().join(format!("tracer-test-{}", std::process::id()));
        let tracer = ProcessTracer::new(
            TracerKind::Go,
            TracerConfig {
                bpf_base_dir: base,
                ..Default::default()
            },
            LoadContext::new(&std::env::temp_dir()),
            bundles,
            Arc::new(PidFilter::new()),
            reporter.clone(),
        );
        (tracer, reporter)
    }

    fn instrumentable(ino: u64, pid: i32) -> Instrumentable {
        let mut offsets = Offsets::default();
        offsets.functions.insert(
            "runtime.newproc1".to_string(),
            FuncOffsets {
                entry: 0x1000,
                returns: vec![0x10f0],
                module: None,
            },
        );
        Instrumentable {
            file_info: FileInfo {
                ino,
                pid,
                cmd_exe_path: PathBuf::from("/opt/app/server"),
            },
            offsets: Arc::new(offsets),
        }
    }

    #[test]
    fn init_is_one_shot() {
        let (mut tracer, _) = tracer(Vec::new());
        tracer.init().unwrap();
        assert!(matches!(
            tracer.init(),
            Err(TracerError::AlreadyInitialized)
        ));
    }

    #[test]
    fn instrumented_processes_move_the_gauge() {
        let (mut tracer, reporter) = tracer(Vec::new());
        tracer.init().unwrap();

        tracer.new_executable(&instrumentable(100, 42)).unwrap();
        assert_eq!(
            reporter.snapshot().instrumented.get("server"),
            Some(&1),
        );

        tracer.unlink_executable(&instrumentable(100, 42).file_info);
        assert_eq!(
            reporter.snapshot().instrumented.get("server"),
            Some(&0),
        );
    }

    #[test]
    fn failed_attachment_keeps_partial_state_for_unlink() {
        // The bundle is never loaded, so goprobe attachment fails.
        let (mut tracer, reporter) = tracer(vec![go_bundle()]);
        let ie = instrumentable(7, 42);

        let err = tracer.new_executable(&ie).unwrap_err();
        assert!(matches!(err, TracerError::Attach { .. }));
        // The partial instrumenter is registered anyway.
        assert!(tracer.instrumented_inodes().any(|ino| ino == 7));
        // No gauge movement for a failed executable.
        assert!(reporter.snapshot().instrumented.is_empty());

        // The caller decides to unlink; the entry disappears and the gauge,
        // never incremented for this executable, is not decremented either.
        tracer.unlink_executable(&ie.file_info);
        assert!(tracer.instrumented_inodes().next().is_none());
        assert!(reporter.snapshot().instrumented.is_empty());
    }

    #[test]
    fn duplicate_inode_is_routed_to_the_instance_path() {
        let (mut tracer, reporter) = tracer(Vec::new());
        tracer.new_executable(&instrumentable(5, 10)).unwrap();
        // Second arrival of the same inode must not clobber the existing
        // instrumenter, nor double-count the process.
        tracer.new_executable(&instrumentable(5, 11)).unwrap();
        assert_eq!(tracer.instrumented_inodes().count(), 1);
        assert_eq!(reporter.snapshot().instrumented.get("server"), Some(&1));
    }

    #[test]
    fn instance_for_unknown_inode_is_a_noop() {
        let (mut tracer, _) = tracer(Vec::new());
        tracer
            .new_executable_instance(&instrumentable(9, 3))
            .unwrap();
        assert!(tracer.instrumented_inodes().next().is_none());
    }

    #[test]
    fn unlink_is_idempotent_and_never_panics() {
        let (mut tracer, reporter) = tracer(Vec::new());
        let ie = instrumentable(3, 1);
        tracer.new_executable(&ie).unwrap();

        tracer.unlink_executable(&ie.file_info);
        // A second unlink of the same inode is a warning, not a panic, and
        // does not move the gauge again.
        tracer.unlink_executable(&ie.file_info);
        assert_eq!(reporter.snapshot().instrumented.get("server"), Some(&0));
    }
}

//! Scoped holder of kernel attachment handles, bound to one executable or to
//! the global (kernel-probe) scope.
//!
//! Every successful attachment registers a closable. Closables are only ever
//! released together, in reverse insertion order, when the executable is
//! unlinked; a failed batch leaves the already-registered handles in place.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aya::programs::{KProbe, ProgramError, SocketFilter, TracePoint, UProbe};
use bpf_common::bundle::{extract_program, ProbeKind, ProgramBundle};
use bpf_common::load::LoadError;
use bpf_common::offsets::{FileInfo, Offsets};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("attaching {kind} {symbol}")]
    Probe {
        kind: ProbeKind,
        symbol: String,
        #[source]
        source: ProgramError,
    },
    #[error("function {0} declares an end program but has no return offsets")]
    NoReturnOffsets(String),
    #[error("no offsets available for user probes")]
    MissingOffsets,
    #[error("opening raw packet socket")]
    Socket(#[source] nix::Error),
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// A handle which keeps one kernel resource alive: an attachment link or the
/// socket backing a filter. Dropping it releases the resource.
pub struct Closable {
    label: &'static str,
    _handle: Box<dyn Any + Send>,
}

impl Closable {
    pub fn new(label: &'static str, handle: impl Any + Send) -> Self {
        Self {
            label,
            _handle: Box::new(handle),
        }
    }
}

impl fmt::Debug for Closable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "closable({})", self.label)
    }
}

pub struct Instrumenter {
    exe_path: Option<PathBuf>,
    offsets: Option<Arc<Offsets>>,
    closables: Vec<Closable>,
    modules: HashSet<u64>,
    /// Whether this scope was counted in the instrumented-process gauge,
    /// which only happens once every attachment succeeded.
    reported: bool,
}

impl Instrumenter {
    /// Instrumenter for kernel-global probes: kprobes, tracepoints and
    /// socket filters need no executable.
    pub fn global() -> Self {
        Self {
            exe_path: None,
            offsets: None,
            closables: Vec::new(),
            modules: HashSet::new(),
            reported: false,
        }
    }

    pub fn for_executable(info: &FileInfo, offsets: Arc<Offsets>) -> Self {
        Self {
            exe_path: Some(info.cmd_exe_path.clone()),
            offsets: Some(offsets),
            closables: Vec::new(),
            modules: HashSet::new(),
            reported: false,
        }
    }

    pub(crate) fn mark_reported(&mut self) {
        self.reported = true;
    }

    pub(crate) fn reported(&self) -> bool {
        self.reported
    }

    /// Register an externally created release handle, kept alive until this
    /// scope is unlinked.
    pub fn add_closable(&mut self, closable: Closable) {
        self.closables.push(closable);
    }

    pub fn closable_count(&self) -> usize {
        self.closables.len()
    }

    pub fn modules(&self) -> &HashSet<u64> {
        &self.modules
    }

    pub fn attach_kprobes(&mut self, bundle: &mut ProgramBundle) -> Result<(), AttachError> {
        for spec in bundle.active_probes()?.kprobes {
            let ebpf = bundle.objects_mut()?;
            let program: &mut KProbe = extract_program(ebpf, spec.program)?;
            let link_id = match program.attach(spec.symbol, 0) {
                Ok(link_id) => link_id,
                Err(err) if missing_symbol(&err) => {
                    log::warn!("kernel symbol {} not found, skipping kprobe", spec.symbol);
                    continue;
                }
                Err(source) => {
                    return Err(attach_failure(ProbeKind::KProbe, spec.symbol, source))
                }
            };
            let link = program
                .take_link(link_id)
                .map_err(|source| attach_failure(ProbeKind::KProbe, spec.symbol, source))?;
            self.closables.push(Closable::new("kprobe", link));
        }
        Ok(())
    }

    pub fn attach_tracepoints(&mut self, bundle: &mut ProgramBundle) -> Result<(), AttachError> {
        for spec in bundle.active_probes()?.tracepoints {
            let name = format!("{}/{}", spec.category, spec.name);
            let ebpf = bundle.objects_mut()?;
            let program: &mut TracePoint = extract_program(ebpf, spec.program)?;
            let link_id = match program.attach(spec.category, spec.name) {
                Ok(link_id) => link_id,
                Err(err) if missing_symbol(&err) => {
                    log::warn!("tracepoint {name} not found, skipping");
                    continue;
                }
                Err(source) => {
                    return Err(attach_failure(ProbeKind::Tracepoint, &name, source))
                }
            };
            let link = program
                .take_link(link_id)
                .map_err(|source| attach_failure(ProbeKind::Tracepoint, &name, source))?;
            self.closables.push(Closable::new("tracepoint", link));
        }
        Ok(())
    }

    pub fn attach_sockfilters(&mut self, bundle: &mut ProgramBundle) -> Result<(), AttachError> {
        for spec in bundle.active_probes()?.sockfilters {
            let sock = open_packet_socket().map_err(AttachError::Socket)?;
            let ebpf = bundle.objects_mut()?;
            let program: &mut SocketFilter = extract_program(ebpf, spec.program)?;
            let link_id = program
                .attach(&sock)
                .map_err(|source| attach_failure(ProbeKind::SocketFilter, spec.program, source))?;
            let link = program
                .take_link(link_id)
                .map_err(|source| attach_failure(ProbeKind::SocketFilter, spec.program, source))?;
            // Release order matters: the link detaches before its socket closes.
            self.closables.push(Closable::new("packet socket", sock));
            self.closables.push(Closable::new("socket filter", link));
        }
        Ok(())
    }

    /// Attach entry uprobes for runtimes which preclude kernel uretprobes.
    /// End programs attach at every recorded return site of the function.
    pub fn attach_goprobes(&mut self, bundle: &mut ProgramBundle) -> Result<(), AttachError> {
        let table = bundle.active_probes()?;
        if table.goprobes.is_empty() {
            return Ok(());
        }
        let offsets = self.offsets.clone().ok_or(AttachError::MissingOffsets)?;
        let exe_path = self.exe_path.clone().ok_or(AttachError::MissingOffsets)?;

        for spec in table.goprobes {
            let Some(func) = offsets.functions.get(spec.symbol) else {
                log::debug!("symbol {} not present in binary, skipping", spec.symbol);
                continue;
            };
            if let Some(start) = spec.start_program {
                self.attach_uprobe_at(
                    bundle,
                    ProbeKind::GoProbe,
                    start,
                    spec.symbol,
                    &exe_path,
                    func.entry,
                    None,
                )?;
            }
            if let Some(end) = spec.end_program {
                if func.returns.is_empty() {
                    return Err(AttachError::NoReturnOffsets(spec.symbol.to_string()));
                }
                for &ret_offset in &func.returns {
                    self.attach_uprobe_at(
                        bundle,
                        ProbeKind::GoProbe,
                        end,
                        spec.symbol,
                        &exe_path,
                        ret_offset,
                        None,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Attach ordinary uprobes (and uretprobes where an end program is
    /// declared). Shared modules are attached at most once per inode.
    pub fn attach_uprobes(
        &mut self,
        pid: Option<i32>,
        bundle: &mut ProgramBundle,
    ) -> Result<(), AttachError> {
        let table = bundle.active_probes()?;
        if table.uprobes.is_empty() {
            return Ok(());
        }
        let offsets = self.offsets.clone().ok_or(AttachError::MissingOffsets)?;
        let exe_path = self.exe_path.clone().ok_or(AttachError::MissingOffsets)?;

        for spec in table.uprobes {
            let Some(func) = offsets.functions.get(spec.symbol) else {
                log::debug!("symbol {} not present in binary, skipping", spec.symbol);
                continue;
            };
            match &func.module {
                Some(module) => {
                    if !self.module_needs_instrumentation(bundle, module.ino) {
                        log::debug!(
                            "module {} already instrumented, skipping {}",
                            module.ino,
                            spec.symbol
                        );
                        continue;
                    }
                    for program in spec.start_program.into_iter().chain(spec.end_program) {
                        self.attach_uprobe_at(
                            bundle,
                            ProbeKind::UProbe,
                            program,
                            spec.symbol,
                            &module.path,
                            func.entry,
                            None,
                        )?;
                    }
                    bundle.record_instrumented_lib(module.ino);
                    self.modules.insert(module.ino);
                }
                None => {
                    for program in spec.start_program.into_iter().chain(spec.end_program) {
                        self.attach_uprobe_at(
                            bundle,
                            ProbeKind::UProbe,
                            program,
                            spec.symbol,
                            &exe_path,
                            func.entry,
                            pid,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn attach_uprobe_at(
        &mut self,
        bundle: &mut ProgramBundle,
        kind: ProbeKind,
        program_name: &'static str,
        symbol: &str,
        target: &Path,
        offset: u64,
        pid: Option<i32>,
    ) -> Result<(), AttachError> {
        let ebpf = bundle.objects_mut()?;
        let program: &mut UProbe = extract_program(ebpf, program_name)?;
        let link_id = program
            .attach(None, offset, target, pid)
            .map_err(|source| attach_failure(kind, symbol, source))?;
        let link = program
            .take_link(link_id)
            .map_err(|source| attach_failure(kind, symbol, source))?;
        self.closables.push(Closable::new("uprobe", link));
        Ok(())
    }

    /// Whether a shared module still needs its uprobes: neither this scope
    /// nor the bundle has instrumented the inode yet.
    pub(crate) fn module_needs_instrumentation(
        &self,
        bundle: &ProgramBundle,
        ino: u64,
    ) -> bool {
        !self.modules.contains(&ino) && !bundle.already_instrumented_lib(ino)
    }

    #[cfg(test)]
    pub(crate) fn record_module(&mut self, ino: u64) {
        self.modules.insert(ino);
    }

    /// Drop every attachment handle, newest first.
    pub fn release(&mut self) {
        while let Some(closable) = self.closables.pop() {
            log::debug!("releasing {closable:?}");
        }
    }

    /// Release all handles, then signal every recorded module to every
    /// bundle for per-module teardown.
    pub fn unlink(mut self, bundles: &mut [ProgramBundle]) {
        self.release();
        for ino in std::mem::take(&mut self.modules) {
            for bundle in bundles.iter_mut() {
                if !bundle.unlink_instrumented_lib(ino) {
                    log::debug!("bundle {} had no state for module {ino}", bundle.name());
                }
            }
        }
    }
}

fn attach_failure(kind: ProbeKind, symbol: &str, source: ProgramError) -> AttachError {
    log::error!("{}", bpf_common::error_chain(&source));
    AttachError::Probe {
        kind,
        symbol: symbol.to_string(),
        source,
    }
}

/// A missing attachment site surfaces as ENOENT somewhere in the chain:
/// perf_event_open for probes, the tracefs lookup for tracepoints.
fn missing_symbol(err: &ProgramError) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(source) = current {
        if let Some(io_err) = source.downcast_ref::<std::io::Error>() {
            if io_err.kind() == std::io::ErrorKind::NotFound {
                return true;
            }
        }
        current = source.source();
    }
    false
}

fn open_packet_socket() -> Result<OwnedFd, nix::Error> {
    socket(
        AddressFamily::Packet,
        SockType::Raw,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        Some(SockProtocol::EthAll),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bpf_common::bundle::BundleArtifacts;
    use bpf_common::pump::{DecodeError, Decoded, EventDecoder};

    struct NullDecoder;

    impl EventDecoder for NullDecoder {
        fn decode(&self, _record: &[u8]) -> Result<Decoded, DecodeError> {
            Err(DecodeError::Malformed("unused"))
        }
    }

    fn bundle(name: &'static str) -> ProgramBundle {
        ProgramBundle::new(
            name,
            BundleArtifacts::single(&[]),
            Arc::new(Offsets::default()),
            Arc::new(NullDecoder),
        )
    }

    fn file_info(ino: u64, pid: i32) -> FileInfo {
        FileInfo {
            ino,
            pid,
            cmd_exe_path: PathBuf::from("/opt/app/server"),
        }
    }

    /// Records its id when dropped, so release order is observable.
    struct DropRecorder {
        id: usize,
        order: Arc<Mutex<Vec<usize>>>,
    }

    impl Drop for DropRecorder {
        fn drop(&mut self) {
            self.order.lock().unwrap().push(self.id);
        }
    }

    #[test]
    fn closables_release_in_reverse_insertion_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut instrumenter =
            Instrumenter::for_executable(&file_info(1, 42), Arc::new(Offsets::default()));
        for id in 0..4 {
            instrumenter.add_closable(Closable::new(
                "test",
                DropRecorder {
                    id,
                    order: order.clone(),
                },
            ));
        }
        assert_eq!(instrumenter.closable_count(), 4);

        instrumenter.release();
        assert_eq!(instrumenter.closable_count(), 0);
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn unlink_signals_each_module_to_every_bundle_once() {
        let mut bundles = vec![bundle("one"), bundle("two")];
        let mut instrumenter =
            Instrumenter::for_executable(&file_info(1, 42), Arc::new(Offsets::default()));
        for ino in [10, 11] {
            instrumenter.record_module(ino);
            for b in &mut bundles {
                b.record_instrumented_lib(ino);
            }
        }

        instrumenter.unlink(&mut bundles);
        for b in &bundles {
            assert!(!b.already_instrumented_lib(10));
            assert!(!b.already_instrumented_lib(11));
        }
    }

    #[test]
    fn shared_modules_are_instrumented_once_across_scopes() {
        let mut b = bundle("shared");
        let first = Instrumenter::for_executable(&file_info(1, 10), Arc::new(Offsets::default()));
        let second = Instrumenter::for_executable(&file_info(2, 11), Arc::new(Offsets::default()));
        let module = 77;

        assert!(first.module_needs_instrumentation(&b, module));
        // First scope attaches and records the module.
        b.record_instrumented_lib(module);
        // The second scope then observes it and skips.
        assert!(!second.module_needs_instrumentation(&b, module));
    }

    #[test]
    fn own_modules_are_not_reattached() {
        let b = bundle("own");
        let mut instrumenter =
            Instrumenter::for_executable(&file_info(1, 10), Arc::new(Offsets::default()));
        instrumenter.record_module(5);
        assert!(!instrumenter.module_needs_instrumentation(&b, 5));
        assert!(instrumenter.module_needs_instrumentation(&b, 6));
    }

    #[test]
    fn attachment_requires_a_loaded_bundle() {
        let mut b = bundle("go");
        let mut global = Instrumenter::global();
        assert!(matches!(
            global.attach_goprobes(&mut b),
            Err(AttachError::Load(LoadError::NotLoaded("go")))
        ));
    }
}

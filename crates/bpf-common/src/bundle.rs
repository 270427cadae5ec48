//! A program bundle is one compiled eBPF collection plus the probe table it
//! declares: which programs attach where, which constants must be patched in
//! before load, and which setup steps run after load.
//!
//! Bundle capabilities are plain data. A bundle without tail calls has an
//! empty step list, a bundle without goprobes an empty goprobe table.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use aya::maps::{MapData, ProgramArray, RingBuf};
use aya::programs::{tc, KProbe, SchedClassifier, SocketFilter, TcAttachType, TracePoint, UProbe};
use aya::Ebpf;

use crate::load::LoadError;
use crate::offsets::{FileInfo, Offsets};
use crate::pump::EventDecoder;

/// Sentinel patched in for optional offsets the provider could not resolve.
/// Kernel code recognizes the all-ones value as "absent".
pub const MISSING_OFFSET: u64 = u64::MAX;

/// Which of the four compiled artifacts of a bundle to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleVariant {
    pub debug: bool,
    pub context_propagation: bool,
}

/// The four compiled artifacts of one bundle. Selection is deterministic in
/// the variant.
#[derive(Debug, Clone, Copy)]
pub struct BundleArtifacts {
    pub base: &'static [u8],
    pub debug: &'static [u8],
    pub context_propagation: &'static [u8],
    pub context_propagation_debug: &'static [u8],
}

impl BundleArtifacts {
    /// A bundle compiled only once, for tracers without debug or
    /// context-propagation builds.
    pub fn single(bytecode: &'static [u8]) -> Self {
        Self {
            base: bytecode,
            debug: bytecode,
            context_propagation: bytecode,
            context_propagation_debug: bytecode,
        }
    }

    pub fn select(&self, variant: BundleVariant) -> &'static [u8] {
        match (variant.context_propagation, variant.debug) {
            (false, false) => self.base,
            (false, true) => self.debug,
            (true, false) => self.context_propagation,
            (true, true) => self.context_propagation_debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    KProbe,
    Tracepoint,
    SocketFilter,
    UProbe,
    GoProbe,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::KProbe => write!(f, "kprobe"),
            ProbeKind::Tracepoint => write!(f, "tracepoint"),
            ProbeKind::SocketFilter => write!(f, "socket filter"),
            ProbeKind::UProbe => write!(f, "uprobe"),
            ProbeKind::GoProbe => write!(f, "goprobe"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KProbeSpec {
    pub symbol: &'static str,
    pub program: &'static str,
}

#[derive(Debug, Clone)]
pub struct TracepointSpec {
    pub category: &'static str,
    pub name: &'static str,
    pub program: &'static str,
}

#[derive(Debug, Clone)]
pub struct SocketFilterSpec {
    pub program: &'static str,
}

/// Some registrations only care about one edge of a call, so both programs
/// are optional; a registration with neither is meaningless and skipped.
#[derive(Debug, Clone)]
pub struct UProbeSpec {
    pub symbol: &'static str,
    pub start_program: Option<&'static str>,
    pub end_program: Option<&'static str>,
    /// Only active while context propagation is enabled.
    pub context_propagation: bool,
}

/// Uprobe variant for runtimes whose stacks can move under a kernel
/// uretprobe: the end program attaches as entry probes on every return site.
#[derive(Debug, Clone)]
pub struct GoProbeSpec {
    pub symbol: &'static str,
    pub start_program: Option<&'static str>,
    pub end_program: Option<&'static str>,
    pub context_propagation: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProbeTable {
    pub kprobes: Vec<KProbeSpec>,
    pub tracepoints: Vec<TracepointSpec>,
    pub sockfilters: Vec<SocketFilterSpec>,
    pub uprobes: Vec<UProbeSpec>,
    pub goprobes: Vec<GoProbeSpec>,
}

impl ProbeTable {
    /// The probe table with context-propagation probes removed when the
    /// capability is unavailable.
    pub fn active(&self, context_propagation: bool) -> ProbeTable {
        ProbeTable {
            kprobes: self.kprobes.clone(),
            tracepoints: self.tracepoints.clone(),
            sockfilters: self.sockfilters.clone(),
            uprobes: self
                .uprobes
                .iter()
                .filter(|u| context_propagation || !u.context_propagation)
                .cloned()
                .collect(),
            goprobes: self
                .goprobes
                .iter()
                .filter(|g| context_propagation || !g.context_propagation)
                .cloned()
                .collect(),
        }
    }
}

/// Constants patched into the collection before the kernel sees it.
#[derive(Debug, Clone, Default)]
pub struct ConstantSpec {
    /// Field offsets which must be present in the provider output.
    pub required: &'static [&'static str],
    /// Field offsets replaced by [`MISSING_OFFSET`] when absent.
    pub optional: &'static [&'static str],
    /// Values known without the provider (buffer sizes, wakeup thresholds).
    pub fixed: Vec<(&'static str, u64)>,
}

impl ConstantSpec {
    pub fn resolve(&self, offsets: &Offsets) -> Result<Vec<(&'static str, u64)>, LoadError> {
        let mut constants = Vec::with_capacity(
            self.required.len() + self.optional.len() + self.fixed.len(),
        );
        for &name in self.required {
            let value = offsets
                .fields
                .get(name)
                .copied()
                .ok_or(LoadError::ConstantRewrite { name })?;
            constants.push((name, value));
        }
        for &name in self.optional {
            let value = offsets.fields.get(name).copied().unwrap_or(MISSING_OFFSET);
            constants.push((name, value));
        }
        constants.extend(self.fixed.iter().copied());
        Ok(constants)
    }
}

/// Setup executed once after load, before any attachment.
#[derive(Debug, Clone)]
pub enum PostLoadStep {
    /// Populate a slot of a program-array jump table.
    TailCall {
        map: &'static str,
        slot: u32,
        program: &'static str,
        kind: ProbeKind,
    },
    /// Attach a traffic-control classifier to an interface.
    TrafficControl {
        interface: &'static str,
        program: &'static str,
        egress: bool,
    },
}

struct LoadedBundle {
    variant: BundleVariant,
    ebpf: Ebpf,
}

pub struct ProgramBundle {
    name: &'static str,
    artifacts: BundleArtifacts,
    constants: ConstantSpec,
    probes: ProbeTable,
    post_load: Vec<PostLoadStep>,
    offsets: Arc<Offsets>,
    decoder: Arc<dyn EventDecoder>,
    events_map: &'static str,
    wants_context_propagation: bool,
    loaded: Option<LoadedBundle>,
    tail_calls_done: bool,
    tc_done: bool,
    instrumented_libs: HashSet<u64>,
}

impl ProgramBundle {
    pub fn new(
        name: &'static str,
        artifacts: BundleArtifacts,
        offsets: Arc<Offsets>,
        decoder: Arc<dyn EventDecoder>,
    ) -> Self {
        Self {
            name,
            artifacts,
            constants: ConstantSpec::default(),
            probes: ProbeTable::default(),
            post_load: Vec::new(),
            offsets,
            decoder,
            events_map: "events",
            wants_context_propagation: false,
            loaded: None,
            tail_calls_done: false,
            tc_done: false,
            instrumented_libs: HashSet::new(),
        }
    }

    pub fn constants(mut self, constants: ConstantSpec) -> Self {
        self.constants = constants;
        self
    }

    /// Declare that this bundle has context-propagation builds, used unless
    /// the integrity override is in effect.
    pub fn with_context_propagation(mut self) -> Self {
        self.wants_context_propagation = true;
        self
    }

    pub fn events_map(mut self, name: &'static str) -> Self {
        self.events_map = name;
        self
    }

    pub fn kprobe(mut self, symbol: &'static str, program: &'static str) -> Self {
        self.probes.kprobes.push(KProbeSpec { symbol, program });
        self
    }

    pub fn tracepoint(
        mut self,
        category: &'static str,
        name: &'static str,
        program: &'static str,
    ) -> Self {
        self.probes.tracepoints.push(TracepointSpec {
            category,
            name,
            program,
        });
        self
    }

    pub fn sockfilter(mut self, program: &'static str) -> Self {
        self.probes.sockfilters.push(SocketFilterSpec { program });
        self
    }

    pub fn uprobe(
        mut self,
        symbol: &'static str,
        start_program: Option<&'static str>,
        end_program: Option<&'static str>,
    ) -> Self {
        self.probes.uprobes.push(UProbeSpec {
            symbol,
            start_program,
            end_program,
            context_propagation: false,
        });
        self
    }

    pub fn goprobe(
        mut self,
        symbol: &'static str,
        start_program: Option<&'static str>,
        end_program: Option<&'static str>,
    ) -> Self {
        self.probes.goprobes.push(GoProbeSpec {
            symbol,
            start_program,
            end_program,
            context_propagation: false,
        });
        self
    }

    pub fn context_propagation_goprobe(
        mut self,
        symbol: &'static str,
        start_program: Option<&'static str>,
        end_program: Option<&'static str>,
    ) -> Self {
        self.probes.goprobes.push(GoProbeSpec {
            symbol,
            start_program,
            end_program,
            context_propagation: true,
        });
        self
    }

    pub fn tail_call(
        mut self,
        map: &'static str,
        slot: u32,
        program: &'static str,
        kind: ProbeKind,
    ) -> Self {
        self.post_load.push(PostLoadStep::TailCall {
            map,
            slot,
            program,
            kind,
        });
        self
    }

    pub fn traffic_control(
        mut self,
        interface: &'static str,
        program: &'static str,
        egress: bool,
    ) -> Self {
        self.post_load.push(PostLoadStep::TrafficControl {
            interface,
            program,
            egress,
        });
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The probe table as declared, regardless of load state.
    pub fn probe_table(&self) -> &ProbeTable {
        &self.probes
    }

    pub fn artifacts(&self) -> &BundleArtifacts {
        &self.artifacts
    }

    pub fn constant_spec(&self) -> &ConstantSpec {
        &self.constants
    }

    pub fn offsets(&self) -> &Arc<Offsets> {
        &self.offsets
    }

    pub fn decoder(&self) -> Arc<dyn EventDecoder> {
        self.decoder.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Variant to load given the configured debug switch and the current
    /// state of the integrity override.
    pub fn variant(&self, debug: bool, integrity_override: bool) -> BundleVariant {
        BundleVariant {
            debug,
            context_propagation: self.wants_context_propagation && !integrity_override,
        }
    }

    /// Store the kernel-resident collection. A bundle is loaded at most once
    /// per tracer lifetime.
    pub(crate) fn install(&mut self, variant: BundleVariant, ebpf: Ebpf) -> Result<(), LoadError> {
        if self.loaded.is_some() {
            return Err(LoadError::AlreadyLoaded(self.name));
        }
        self.loaded = Some(LoadedBundle { variant, ebpf });
        Ok(())
    }

    pub fn objects_mut(&mut self) -> Result<&mut Ebpf, LoadError> {
        match self.loaded.as_mut() {
            Some(loaded) => Ok(&mut loaded.ebpf),
            None => Err(LoadError::NotLoaded(self.name)),
        }
    }

    /// The declared probe table, minus context-propagation probes when the
    /// loaded variant has them disabled.
    pub fn active_probes(&self) -> Result<ProbeTable, LoadError> {
        let loaded = self.loaded.as_ref().ok_or(LoadError::NotLoaded(self.name))?;
        Ok(self.probes.active(loaded.variant.context_propagation))
    }

    /// Load every program the active probe table and the tail-call steps
    /// reference. Programs shared between probes load once.
    pub(crate) fn load_programs(&mut self) -> Result<(), LoadError> {
        let table = self.active_probes()?;
        let steps = self.post_load.clone();
        let ebpf = self.objects_mut()?;

        let mut seen: HashSet<&'static str> = HashSet::new();
        let mut load = |name: &'static str, kind: ProbeKind| -> Result<(), LoadError> {
            if !seen.insert(name) {
                return Ok(());
            }
            let result = match kind {
                ProbeKind::KProbe => {
                    extract_program::<KProbe>(ebpf, name)?.load()
                }
                ProbeKind::Tracepoint => {
                    extract_program::<TracePoint>(ebpf, name)?.load()
                }
                ProbeKind::SocketFilter => {
                    extract_program::<SocketFilter>(ebpf, name)?.load()
                }
                ProbeKind::UProbe | ProbeKind::GoProbe => {
                    extract_program::<UProbe>(ebpf, name)?.load()
                }
            };
            result.map_err(|source| LoadError::ProgramLoad {
                program: name.to_string(),
                source: Box::new(source),
            })
        };

        for p in &table.kprobes {
            load(p.program, ProbeKind::KProbe)?;
        }
        for p in &table.tracepoints {
            load(p.program, ProbeKind::Tracepoint)?;
        }
        for p in &table.sockfilters {
            load(p.program, ProbeKind::SocketFilter)?;
        }
        for p in &table.uprobes {
            for program in p.start_program.into_iter().chain(p.end_program) {
                load(program, ProbeKind::UProbe)?;
            }
        }
        for p in &table.goprobes {
            for program in p.start_program.into_iter().chain(p.end_program) {
                load(program, ProbeKind::GoProbe)?;
            }
        }
        for step in &steps {
            if let PostLoadStep::TailCall { program, kind, .. } = step {
                load(program, *kind)?;
            }
        }
        Ok(())
    }

    /// Populate declared tail-call jump tables. No-op when called again.
    pub fn setup_tail_calls(&mut self) -> Result<(), LoadError> {
        if self.tail_calls_done {
            return Ok(());
        }
        let steps = self.post_load.clone();
        for step in steps {
            let PostLoadStep::TailCall {
                map, slot, program, ..
            } = step
            else {
                continue;
            };
            let ebpf = self.objects_mut()?;
            let fd = ebpf
                .program(program)
                .ok_or_else(|| LoadError::ProgramNotFound(program.to_string()))?
                .fd()
                .map_err(|source| LoadError::PostLoad {
                    step: "tail call",
                    source: source.into(),
                })?
                .try_clone()
                .map_err(|source| LoadError::PostLoad {
                    step: "tail call",
                    source: source.into(),
                })?;
            let mut jump_table = ProgramArray::try_from(
                ebpf.map_mut(map)
                    .ok_or_else(|| LoadError::MapNotFound(map.to_string()))?,
            )?;
            jump_table
                .set(slot, &fd, 0)
                .map_err(|source| LoadError::PostLoad {
                    step: "tail call",
                    source: anyhow::Error::from(source),
                })?;
        }
        self.tail_calls_done = true;
        Ok(())
    }

    /// Attach declared traffic-control classifiers. No-op when called again.
    pub fn setup_tc(&mut self) -> Result<(), LoadError> {
        if self.tc_done {
            return Ok(());
        }
        let steps = self.post_load.clone();
        for step in steps {
            let PostLoadStep::TrafficControl {
                interface,
                program,
                egress,
            } = step
            else {
                continue;
            };
            // The clsact qdisc may already exist; that is fine.
            let _ = tc::qdisc_add_clsact(interface);
            let ebpf = self.objects_mut()?;
            let classifier: &mut SchedClassifier = extract_program(ebpf, program)?;
            let attach_type = if egress {
                TcAttachType::Egress
            } else {
                TcAttachType::Ingress
            };
            classifier
                .load()
                .and_then(|()| classifier.attach(interface, attach_type).map(|_| ()))
                .map_err(|source| LoadError::PostLoad {
                    step: "traffic control",
                    source: anyhow::Error::from(source),
                })?;
        }
        self.tc_done = true;
        Ok(())
    }

    /// Take the ring-buffer map the event pump reads from.
    pub fn take_events_map(&mut self) -> Result<RingBuf<MapData>, LoadError> {
        let name = self.events_map;
        let ebpf = self.objects_mut()?;
        let map = ebpf
            .take_map(name)
            .ok_or_else(|| LoadError::MapNotFound(name.to_string()))?;
        RingBuf::try_from(map).map_err(LoadError::from)
    }

    /// Register a newly discovered executable with this bundle. The
    /// collection was loaded with constants resolved from the first
    /// executable's layout; a later executable whose field offsets diverge
    /// would have its events decoded against the wrong layout, which
    /// deserves a loud warning.
    pub fn register_offsets(&self, info: &FileInfo, offsets: &Offsets) {
        for field in self.divergent_fields(offsets) {
            log::warn!(
                "{}: field offset {field} of {} does not match the loaded \
                 constants, its events may decode incorrectly",
                self.name,
                info.cmd_exe_path.display()
            );
        }
    }

    /// Constant-table fields whose offset in `offsets` disagrees with the
    /// offsets this bundle resolved its constants from. Fields absent on
    /// either side are not divergent, just unused there.
    fn divergent_fields(&self, offsets: &Offsets) -> Vec<&'static str> {
        self.constants
            .required
            .iter()
            .chain(self.constants.optional.iter())
            .filter(|&&field| {
                matches!(
                    (self.offsets.fields.get(field), offsets.fields.get(field)),
                    (Some(loaded), Some(incoming)) if loaded != incoming
                )
            })
            .copied()
            .collect()
    }

    pub fn record_instrumented_lib(&mut self, ino: u64) {
        self.instrumented_libs.insert(ino);
    }

    pub fn already_instrumented_lib(&self, ino: u64) -> bool {
        self.instrumented_libs.contains(&ino)
    }

    /// Drop per-module state. Returns whether anything was recorded for the
    /// inode, so a second signal can be told apart from the first.
    pub fn unlink_instrumented_lib(&mut self, ino: u64) -> bool {
        self.instrumented_libs.remove(&ino)
    }
}

impl fmt::Debug for ProgramBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramBundle")
            .field("name", &self.name)
            .field("loaded", &self.loaded.is_some())
            .finish_non_exhaustive()
    }
}

pub fn extract_program<'a, T>(ebpf: &'a mut Ebpf, program: &str) -> Result<&'a mut T, LoadError>
where
    T: 'a,
    &'a mut T: TryFrom<&'a mut aya::programs::Program>,
{
    ebpf.program_mut(program)
        .ok_or_else(|| LoadError::ProgramNotFound(program.to_string()))?
        .try_into()
        .map_err(|_err| LoadError::ProgramType(program.to_string()))
}

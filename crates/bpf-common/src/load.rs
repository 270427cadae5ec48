//! One-shot loading of program bundles into the kernel.
//!
//! Loading mutates shared kernel BTF state, so it is serialized across every
//! tracer in the process by a single mutex. Attachment of already-loaded
//! programs is not serialized.

use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use aya::{Btf, EbpfError, EbpfLoader};
use thiserror::Error;

use crate::bpf_fs;
use crate::bundle::ProgramBundle;

static LOAD_MUTEX: Mutex<()> = Mutex::new(());

/// Diagnostic emitted by kernels which cannot write user memory from eBPF,
/// either because of lockdown mode or a missing capability.
const MISSING_HELPER_DIAG: &str = "unknown func bpf_probe_write_user";

/// Evidence that the caller holds the process-wide load lock.
pub struct LoadGuard(#[allow(dead_code)] MutexGuard<'static, ()>);

/// Acquire the process-wide load lock. Every call that installs a collection
/// or loads programs into the kernel happens under this guard.
pub fn load_lock() -> LoadGuard {
    LoadGuard(LOAD_MUTEX.lock().unwrap_or_else(|poison| poison.into_inner()))
}

/// Process-wide switch disabling features that need the user-memory write
/// helper. Set once by the load fallback, never cleared; a fresh
/// [`LoadContext`] starts with it cleared.
#[derive(Clone, Default)]
pub struct IntegrityOverride(Arc<AtomicBool>);

impl IntegrityOverride {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Shared settings for every bundle one tracer instance loads: the pin path
/// (unique per orchestrator process), the BTF parsed once at startup, and
/// the integrity override.
#[derive(Clone)]
pub struct LoadContext {
    pin_path: Arc<PathBuf>,
    btf: Option<Arc<Btf>>,
    integrity_override: IntegrityOverride,
}

impl LoadContext {
    pub fn new(bpf_base_dir: &Path) -> Self {
        // Parsed once per process. Kernels without BTF can still load
        // bundles compiled against their exact layout.
        let btf = match Btf::from_sys_fs() {
            Ok(btf) => Some(Arc::new(btf)),
            Err(err) => {
                log::warn!("kernel BTF unavailable: {err}");
                None
            }
        };
        Self {
            pin_path: Arc::new(bpf_base_dir.join(format!("tracery-{}", std::process::id()))),
            btf,
            integrity_override: IntegrityOverride::default(),
        }
    }

    pub fn pin_path(&self) -> &Path {
        &self.pin_path
    }

    pub fn integrity_override(&self) -> bool {
        self.integrity_override.get()
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("parsing eBPF collection spec for bundle {name}")]
    SpecParse {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("missing required constant {name}")]
    ConstantRewrite { name: &'static str },
    #[error("loading eBPF collection for bundle {name} into the kernel")]
    KernelLoad {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("bundle {0} already loaded")]
    AlreadyLoaded(&'static str),
    #[error("bundle {0} not loaded")]
    NotLoaded(&'static str),
    #[error("loading program {program}")]
    ProgramLoad {
        program: String,
        #[source]
        source: Box<aya::programs::ProgramError>,
    },
    #[error("program {0} not found in collection")]
    ProgramNotFound(String),
    #[error("program {0} has an unexpected type")]
    ProgramType(String),
    #[error("map {0} not found in collection")]
    MapNotFound(String),
    #[error(transparent)]
    Map(#[from] aya::maps::MapError),
    #[error("post-load {step} setup failed")]
    PostLoad {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("creating pin directory {path}")]
    PinPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Load a bundle into the kernel: resolve its constants, patch them in, load
/// the collection with maps pinned under the context's pin path, load every
/// declared program and run the post-load steps.
///
/// On a kernel-load failure caused by the missing user-memory write helper,
/// the integrity override is set and the load retried once with the
/// non-propagation variant. Any other failure, and a failure of the retry,
/// is fatal for the bundle.
pub fn load_bundle(
    _guard: &LoadGuard,
    ctx: &LoadContext,
    bundle: &mut ProgramBundle,
    debug: bool,
) -> Result<(), LoadError> {
    if bundle.is_loaded() {
        return Err(LoadError::AlreadyLoaded(bundle.name()));
    }
    bpf_fs::ensure_pin_dir(ctx.pin_path()).map_err(|source| LoadError::PinPath {
        path: ctx.pin_path().to_path_buf(),
        source,
    })?;

    let loaded = load_with_fallback(&ctx.integrity_override, bundle.name(), |integrity_override| {
        let variant = bundle.variant(debug, integrity_override);
        log::debug!(
            "loading eBPF bundle {} (debug={}, context_propagation={}) pinned at {}",
            bundle.name(),
            variant.debug,
            variant.context_propagation,
            ctx.pin_path().display()
        );
        try_load(ctx, bundle, variant).map(|ebpf| (variant, ebpf))
    })?;

    let (variant, ebpf) = loaded;
    bundle.install(variant, ebpf)?;
    bundle.load_programs().inspect_err(log_verifier_diagnostics)?;
    Ok(())
}

/// Run `attempt` once; when it fails for lack of the user-memory write
/// helper, flip the override and retry exactly once. The override is the
/// only state this mutates, and only in that direction.
fn load_with_fallback<T, F>(
    integrity_override: &IntegrityOverride,
    name: &'static str,
    mut attempt: F,
) -> Result<T, LoadError>
where
    F: FnMut(bool) -> Result<T, LoadError>,
{
    match attempt(integrity_override.get()) {
        Err(err) if !integrity_override.get() && is_missing_helper(&err) => {
            log::warn!(
                "kernel cannot write user memory from eBPF; disabling \
                 context propagation for bundle {name} and all later loads. \
                 Mount /sys/kernel/security and grant CAP_SYS_ADMIN to avoid this."
            );
            integrity_override.set();
            attempt(true).inspect_err(log_verifier_diagnostics)
        }
        Err(err) => {
            log_verifier_diagnostics(&err);
            Err(err)
        }
        ok => ok,
    }
}

fn try_load(
    ctx: &LoadContext,
    bundle: &ProgramBundle,
    variant: crate::bundle::BundleVariant,
) -> Result<aya::Ebpf, LoadError> {
    let name = bundle.name();
    let bytecode = bundle.artifacts().select(variant);
    let constants = bundle.constant_spec().resolve(bundle.offsets())?;

    let mut loader = EbpfLoader::new();
    loader.btf(ctx.btf.as_deref()).map_pin_path(ctx.pin_path());
    for (constant, value) in &constants {
        loader.set_global(constant, value, true);
    }
    loader.load(bytecode).map_err(|err| match err {
        EbpfError::MapError(_) | EbpfError::ProgramError(_) => LoadError::KernelLoad {
            name,
            source: anyhow::Error::from(err),
        },
        parse => LoadError::SpecParse {
            name,
            source: anyhow::Error::from(parse),
        },
    })
}

/// Whether a load failure is the kernel rejecting the user-memory write
/// helper. The diagnostic can sit anywhere in the source chain.
fn is_missing_helper(err: &LoadError) -> bool {
    if !matches!(err, LoadError::KernelLoad { .. }) {
        return false;
    }
    error_chain_contains(err, MISSING_HELPER_DIAG)
}

fn error_chain_contains(err: &(dyn StdError + 'static), needle: &str) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = current {
        if err.to_string().contains(needle) {
            return true;
        }
        current = err.source();
    }
    false
}

/// Kernel-load failures carry the verifier output in their source chain, and
/// it is only readable in full. Write the whole chain to the diagnostic
/// stream before the error propagates.
fn log_verifier_diagnostics(err: &LoadError) {
    log::error!("{}", crate::error_chain(err));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_helper_error() -> LoadError {
        LoadError::KernelLoad {
            name: "test",
            source: anyhow::anyhow!(
                "program uprobe_write_subset: {MISSING_HELPER_DIAG}#36"
            ),
        }
    }

    fn verifier_error() -> LoadError {
        LoadError::KernelLoad {
            name: "test",
            source: anyhow::anyhow!("R1 invalid mem access 'scalar'"),
        }
    }

    #[test]
    fn fallback_retries_once_and_sets_the_override() {
        let flag = IntegrityOverride::default();
        let mut calls = Vec::new();
        let result = load_with_fallback(&flag, "test", |integrity_override| {
            calls.push(integrity_override);
            if integrity_override {
                Ok(())
            } else {
                Err(missing_helper_error())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, vec![false, true]);
        assert!(flag.get());
    }

    #[test]
    fn fallback_failure_is_fatal() {
        let flag = IntegrityOverride::default();
        let mut calls = 0;
        let result: Result<(), _> = load_with_fallback(&flag, "test", |_| {
            calls += 1;
            Err(missing_helper_error())
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
        assert!(flag.get());
    }

    #[test]
    fn unrelated_errors_do_not_trigger_the_fallback() {
        let flag = IntegrityOverride::default();
        let mut calls = 0;
        let result: Result<(), _> = load_with_fallback(&flag, "test", |_| {
            calls += 1;
            Err(verifier_error())
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert!(!flag.get());
    }

    #[test]
    fn later_loads_observe_the_override() {
        let flag = IntegrityOverride::default();
        let _ = load_with_fallback(&flag, "first", |integrity_override| {
            if integrity_override {
                Ok(())
            } else {
                Err(missing_helper_error())
            }
        });
        assert!(flag.get());

        // A bundle loaded afterwards starts with the override already set
        // and never retries.
        let mut calls = Vec::new();
        let result = load_with_fallback(&flag, "second", |integrity_override| {
            calls.push(integrity_override);
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(calls, vec![true]);
    }

    #[test]
    fn a_fresh_context_starts_cleared() {
        let flag = IntegrityOverride::default();
        flag.set();
        assert!(flag.get());
        assert!(!IntegrityOverride::default().get());
    }

    #[test]
    fn helper_detection_walks_the_source_chain() {
        assert!(is_missing_helper(&missing_helper_error()));
        assert!(!is_missing_helper(&verifier_error()));
        assert!(!is_missing_helper(&LoadError::ConstantRewrite {
            name: "url_ptr_pos"
        }));

        let nested = LoadError::KernelLoad {
            name: "test",
            source: anyhow::anyhow!("outer").context("loading"),
        };
        assert!(!is_missing_helper(&nested));
    }
}

//! Data types produced by the DWARF/ELF offset provider.
//!
//! The provider inspects an on-disk binary and reports, for every recognized
//! function symbol, its entry offset, the offsets of its return instructions
//! and the struct-field offsets used as load-time constants. This crate only
//! consumes that output.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Executable identity as reported by process discovery.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Inode of the binary, the key executables are tracked by.
    pub ino: u64,
    pub pid: i32,
    pub cmd_exe_path: PathBuf,
}

impl FileInfo {
    /// Short name used for log context and the instrumented-process gauge.
    pub fn exec_name(&self) -> String {
        self.cmd_exe_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.cmd_exe_path.display().to_string())
    }
}

/// Shared object a symbol lives in. `None` on [`FuncOffsets::module`] means
/// the symbol is in the main executable.
#[derive(Debug, Clone)]
pub struct ModuleRef {
    pub ino: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct FuncOffsets {
    /// Offset of the function entry within the containing object.
    pub entry: u64,
    /// Offsets of every RET instruction. Required for return-probe emulation
    /// on runtimes whose stacks can move under a kernel uretprobe.
    pub returns: Vec<u64>,
    pub module: Option<ModuleRef>,
}

/// Everything the offset provider found in one binary.
#[derive(Debug, Clone, Default)]
pub struct Offsets {
    pub functions: HashMap<String, FuncOffsets>,
    /// Named struct-field offsets, patched into the programs as constants.
    /// Optional offsets the provider could not resolve are simply absent.
    pub fields: HashMap<String, u64>,
}

/// An executable to instrument: identity plus the provider's findings.
#[derive(Debug, Clone)]
pub struct Instrumentable {
    pub file_info: FileInfo,
    pub offsets: Arc<Offsets>,
}

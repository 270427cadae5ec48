//! BPF file system management: the mount itself and the per-instance pin
//! directories created underneath it.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use procfs::process::{MountInfo, Process};
use sys_mount::{Mount, MountFlags};

const BPF_FS_PATH: &str = "/sys/fs/bpf";
const BPF: &str = "bpf";

/// Make sure exactly one BPF file system is mounted at the conventional
/// path, mounting it when absent. Embedding daemons call this once at
/// startup, before any tracer loads.
pub fn check_or_mount_bpf_fs() -> Result<()> {
    let mounts = bpf_mounts()?;
    match mounts.as_slice() {
        [] => mount_bpf_fs(),
        [mount] if mount.fs_type == BPF => Ok(()),
        [mount] => bail!(
            "{BPF_FS_PATH} is mounted, but as {} instead of {BPF}",
            mount.fs_type
        ),
        _ => bail!("multiple mounts found at {BPF_FS_PATH}"),
    }
}

fn bpf_mounts() -> Result<Vec<MountInfo>> {
    let myself = Process::myself().context("accessing /proc/self")?;
    let mount_info = myself.mountinfo().context("reading mount info")?;
    Ok(mount_info
        .into_iter()
        .filter(|mount| mount.root == "/" && mount.mount_point == Path::new(BPF_FS_PATH))
        .collect())
}

fn mount_bpf_fs() -> Result<()> {
    let mount_point = Path::new(BPF_FS_PATH);
    if !mount_point.exists() {
        DirBuilder::new()
            .mode(0o755)
            .recursive(true)
            .create(mount_point)
            .with_context(|| format!("creating {BPF_FS_PATH}"))?;
    } else if !mount_point.is_dir() {
        bail!("{BPF_FS_PATH} exists but is not a directory");
    }

    log::debug!("mounting BPF file system at {BPF_FS_PATH}");
    Mount::builder()
        .fstype(sys_mount::FilesystemType::Manual(BPF))
        .flags(MountFlags::empty())
        .mount(BPF, mount_point)
        .context("mounting the BPF file system")?;
    Ok(())
}

/// Create the pin directory of one tracer instance. Maps pinned under it
/// stay visible until [`remove_pin_dir`].
pub fn ensure_pin_dir(path: &Path) -> io::Result<()> {
    DirBuilder::new().mode(0o700).recursive(true).create(path)
}

/// Remove a pin directory. Only called once every program pinned under it
/// has been dropped.
pub fn remove_pin_dir(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

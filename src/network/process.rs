use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

/// Display value for a process that could not be resolved.
pub const PROCESS_UNAVAILABLE: &str = "N/A";

/// Kernel truncates `comm` to this many bytes.
const COMM_MAX_LEN: usize = 15;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    /// `None` when the process is unavailable.
    pub name: Option<String>,
}

impl ProcessInfo {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(PROCESS_UNAVAILABLE)
    }
}

/// Best-effort pid to name lookup. Implementations never fail: an absent
/// pid, an exited process or a permission error all yield `None`.
pub trait ProcessResolver: Send + Sync {
    fn resolve(&self, pid: Option<u32>) -> Option<String>;

    fn process_info(&self, pid: Option<u32>) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: self.resolve(pid),
        }
    }
}

pub struct ProcfsProcessResolver {
    root: PathBuf,
}

impl ProcfsProcessResolver {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn read_name(&self, pid: u32) -> std::io::Result<String> {
        let proc_dir = self.root.join(pid.to_string());
        let comm = fs::read_to_string(proc_dir.join("comm"))?;
        let comm = comm.trim_end_matches('\n').to_string();

        if comm.len() >= COMM_MAX_LEN {
            if let Some(full) = self.cmdline_basename(&proc_dir) {
                if full.starts_with(&comm) {
                    return Ok(full);
                }
            }
        }

        Ok(comm)
    }

    fn cmdline_basename(&self, proc_dir: &Path) -> Option<String> {
        let raw = fs::read(proc_dir.join("cmdline")).ok()?;
        let argv0 = raw.split(|&b| b == 0).next()?;
        let argv0 = String::from_utf8_lossy(argv0);
        let base = argv0.rsplit('/').next()?;
        if base.is_empty() {
            None
        } else {
            Some(base.to_string())
        }
    }
}

impl ProcessResolver for ProcfsProcessResolver {
    fn resolve(&self, pid: Option<u32>) -> Option<String> {
        let pid = pid?;

        match self.read_name(pid) {
            Ok(name) if !name.is_empty() => Some(name),
            Ok(_) => None,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("Process {} exited before it could be resolved", pid);
                None
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                log::debug!("Permission denied resolving process {}", pid);
                None
            }
            Err(e) => {
                log::debug!("Failed to resolve process {}: {}", pid, e);
                None
            }
        }
    }
}

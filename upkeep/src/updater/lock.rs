use std::{fmt, str::FromStr, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Process-wide exclusive deployment lock. Acquisition never waits; a held lock means another deployment is running.
#[derive(Debug, Clone, Default)]
pub struct DeploymentLock(Arc<Mutex<()>>);

/// Releases the deployment lock when dropped, on every exit path.
#[derive(Debug)]
pub struct DeploymentGuard(#[allow(dead_code)] OwnedMutexGuard<()>);

impl DeploymentLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<DeploymentGuard> {
        self.0.clone().try_lock_owned().ok().map(DeploymentGuard)
    }

    pub fn is_held(&self) -> bool {
        self.0.try_lock().is_err()
    }
}

/// The process a deployment record belongs to. Persisted with the record so a later process can tell whether an
/// `in_progress` row still has a live owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub host: String,

    /// Changes on every reboot; empty where the kernel does not expose one.
    pub boot_id: String,

    pub pid: u32,
}

impl Owner {
    pub fn current() -> Self {
        Self {
            host: hostname(),
            boot_id: std::fs::read_to_string(BOOT_ID_PATH)
                .map(|id| id.trim().to_string())
                .unwrap_or_default(),
            pid: std::process::id(),
        }
    }

    /// Whether this owner is still running, as seen from `local`. Returns None when it cannot be known, which is
    /// the case for owners on other hosts.
    pub fn is_alive(&self, local: &Owner) -> Option<bool> {
        if self.host != local.host {
            return None;
        }

        if !self.boot_id.is_empty() && !local.boot_id.is_empty() && self.boot_id != local.boot_id {
            return Some(false);
        }

        Some(process_exists(self.pid))
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.host, self.boot_id, self.pid)
    }
}

impl FromStr for Owner {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // Host names never contain '/', but split from the right anyway so the pid is always last.
        let mut parts = value.rsplitn(3, '/');

        let pid = parts
            .next()
            .and_then(|pid| pid.parse::<u32>().ok())
            .ok_or_else(|| format!("owner '{value}' has no valid pid"))?;
        let boot_id = parts
            .next()
            .ok_or_else(|| format!("owner '{value}' has no boot id"))?;
        let host = parts
            .next()
            .ok_or_else(|| format!("owner '{value}' has no host"))?;

        Ok(Self {
            host: host.into(),
            boot_id: boot_id.into(),
            pid,
        })
    }
}

fn hostname() -> String {
    let mut buffer = [0u8; 256];

    let result = unsafe { libc::gethostname(buffer.as_mut_ptr() as *mut libc::c_char, buffer.len()) };
    if result != 0 {
        return String::new();
    }

    let end = buffer.iter().position(|byte| *byte == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}

fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };

    if pid <= 0 {
        return false;
    }

    // Signal 0 performs the permission and existence checks without delivering anything.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }

    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

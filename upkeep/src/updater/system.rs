use std::{ffi::CString, fmt::Debug, io, os::unix::ffi::OsStrExt, path::Path};
use uuid::Uuid;

/// Host level facts consulted before a deployment touches anything.
pub trait SystemProbe: Debug + Send + Sync + 'static {
    /// Bytes available to unprivileged users on the filesystem holding `path`.
    fn free_space(&self, path: &Path) -> io::Result<u64>;

    /// Whether the process can create files inside `path`.
    fn is_writable(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct LocalSystemProbe;

impl SystemProbe for LocalSystemProbe {
    fn free_space(&self, path: &Path) -> io::Result<u64> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };

        unsafe {
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        #[allow(clippy::unnecessary_cast)]
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    // Permission bits do not tell the whole story (read-only mounts, ACLs), so actually try to write.
    fn is_writable(&self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }

        let probe = path.join(format!(".upkeep-write-probe-{}", Uuid::now_v7()));

        match std::fs::File::create(&probe) {
            Ok(_) => {
                let _ = std::fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        }
    }
}

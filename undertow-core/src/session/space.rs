//! Free disk space queries.

use std::path::{Path, PathBuf};

/// Reports free bytes on the volume holding a path.
pub trait DiskSpace: Send + Sync {
    /// # Errors
    ///
    /// - `std::io::Error` - No mounted volume contains `path`
    fn available_space(&self, path: &Path) -> Result<u64, std::io::Error>;
}

/// Queries mounted disks through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoDiskSpace;

impl DiskSpace for SysinfoDiskSpace {
    fn available_space(&self, path: &Path) -> Result<u64, std::io::Error> {
        let path = resolve_existing(path);
        let disks = sysinfo::Disks::new_with_refreshed_list();

        // Longest mount point that prefixes the path wins.
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no mounted volume contains {}", path.display()),
                )
            })
    }
}

/// Canonicalizes the deepest existing ancestor of `path`.
fn resolve_existing(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    absolute
        .ancestors()
        .find_map(|ancestor| ancestor.canonicalize().ok())
        .unwrap_or(absolute)
}

/// Fixed answer, for simulations and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskSpace(pub u64);

impl DiskSpace for FixedDiskSpace {
    fn available_space(&self, _path: &Path) -> Result<u64, std::io::Error> {
        Ok(self.0)
    }
}

/// Bytes that must be free before a download may continue.
///
/// Archives need room for the extracted output as well.
pub fn required_space(remaining: u64, is_archive: bool) -> u64 {
    if is_archive {
        remaining.saturating_mul(2)
    } else {
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_space_doubles_for_archives() {
        assert_eq!(required_space(5_000, false), 5_000);
        assert_eq!(required_space(5_000, true), 10_000);
        assert_eq!(required_space(u64::MAX, true), u64::MAX);
    }

    #[test]
    fn test_resolve_existing_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("not/yet/created");
        let resolved = resolve_existing(&missing);
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_fixed_disk_space() {
        assert_eq!(
            FixedDiskSpace(42).available_space(Path::new("/")).unwrap(),
            42
        );
    }
}

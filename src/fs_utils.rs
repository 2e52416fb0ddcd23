use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

/// Create `dir` (with parents) and restrict it to the owner.
pub fn secure_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// Open `path` with the given options, forcing owner-only mode whether
/// the file is being created or already exists.
pub fn open_secure(path: &Path, options: &mut OpenOptions) -> io::Result<File> {
    #[cfg(unix)]
    options.mode(0o600);
    let file = options.open(path)?;
    restrict_to_owner(&file)?;
    Ok(file)
}

/// Re-apply owner-only permissions to an existing file.
pub fn restrict_permissions(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().read(true).open(path)?;
    restrict_to_owner(&file)
}

fn restrict_to_owner(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        let mut permissions = file.metadata()?.permissions();
        permissions.set_mode(0o600);
        file.set_permissions(permissions)?;
    }
    #[cfg(not(unix))]
    {
        let _ = file;
    }
    Ok(())
}

/// Write `bytes` to `path` atomically: an owner-only temp file in the
/// same directory is synced to disk, then renamed over the destination.
/// A crash mid-write leaves the previous contents intact.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = sibling_path(path, ".tmp");
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    let mut file = open_secure(&tmp, &mut options)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

/// `keys.json` -> `keys.json<suffix>`, staying in the same directory so
/// a rename over the original cannot cross filesystems.
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

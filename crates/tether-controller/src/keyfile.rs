use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use zeroize::Zeroizing;

/// Length of generated session secrets.
pub const SECRET_LEN: usize = 32;

#[cfg(unix)]
const KEY_FILE_PERMS: u32 = 0o600;

/// Writes a fresh random session secret to `path`, readable only by the
/// owner. Refuses to overwrite an existing file.
///
/// # Errors
///
/// Returns an error if the file exists or file I/O fails.
pub fn generate_secret_file(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists, not overwriting", path.display());
    }

    let mut secret = Zeroizing::new([0u8; SECRET_LEN]);
    OsRng.fill_bytes(secret.as_mut());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Create file with restrictive permissions atomically
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(KEY_FILE_PERMS);
    }
    let mut file = options.open(path)?;
    file.write_all(secret.as_ref())?;
    file.sync_all()?;
    Ok(())
}

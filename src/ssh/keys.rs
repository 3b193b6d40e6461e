use anyhow::{Context, Result};
use russh::keys::{Algorithm, PrivateKey};
use std::path::Path;
use tracing::info;

/// Load the proxy's host key, creating an Ed25519 key at `path` on first start.
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        return load_host_key(path);
    }
    let key = generate_host_key()?;
    write_host_key(&key, path)?;
    info!(
        path = %path.display(),
        fingerprint = %crate::ssh::interface::key_fingerprint(key.public_key()),
        "Generated new host key"
    );
    Ok(key)
}

/// Write a fresh host key to `path`. Refuses to replace an existing file unless
/// `force` is set.
pub fn generate_host_key_file(path: &Path, force: bool) -> Result<PrivateKey> {
    if path.exists() && !force {
        anyhow::bail!(
            "host key already exists: {} (use --force to replace it)",
            path.display()
        );
    }
    let key = generate_host_key()?;
    write_host_key(&key, path)?;
    Ok(key)
}

pub fn load_host_key(path: &Path) -> Result<PrivateKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("reading host key: {}", path.display()))?;
    russh::keys::decode_secret_key(&pem, None)
        .map_err(|e| anyhow::anyhow!("decoding host key {}: {}", path.display(), e))
}

fn generate_host_key() -> Result<PrivateKey> {
    PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| anyhow::anyhow!("Ed25519 key generation failed: {}", e))
}

fn write_host_key(key: &PrivateKey, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory: {}", parent.display()))?;
    }

    let mut pem = Vec::new();
    russh::keys::encode_pkcs8_pem(key, &mut pem)
        .map_err(|e| anyhow::anyhow!("encoding host key: {}", e))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut file| file.write_all(&pem))
            .with_context(|| format!("writing host key: {}", path.display()))?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, &pem).with_context(|| format!("writing host key: {}", path.display()))?;

    Ok(())
}

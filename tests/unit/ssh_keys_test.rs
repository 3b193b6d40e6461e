use sshproxy::ssh::interface::key_fingerprint;
use sshproxy::ssh::keys;
use tempfile::tempdir;

/// Generate a key to a temp file, then load it back and verify it is the same key.
#[test]
fn generate_and_load_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host_key");

    let key1 = keys::load_or_generate_host_key(&path).unwrap();
    let key2 = keys::load_or_generate_host_key(&path).unwrap();

    assert!(key1.algorithm().is_ed25519(), "generated key should be Ed25519");
    assert_eq!(
        key_fingerprint(key1.public_key()),
        key_fingerprint(key2.public_key()),
        "reloading must not regenerate the key"
    );
}

/// Missing parent directories are created on first start.
#[test]
fn load_or_generate_creates_parent_dirs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("keys").join("nested").join("host_key");

    keys::load_or_generate_host_key(&path).unwrap();

    assert!(path.exists(), "key file should have been created");
    assert!(std::fs::metadata(&path).unwrap().len() > 0);
}

#[test]
fn generate_refuses_to_overwrite_without_force() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host_key");

    let original = keys::generate_host_key_file(&path, false).unwrap();
    let err = keys::generate_host_key_file(&path, false).unwrap_err();
    assert!(err.to_string().contains("already exists"));

    let reloaded = keys::load_host_key(&path).unwrap();
    assert_eq!(
        key_fingerprint(original.public_key()),
        key_fingerprint(reloaded.public_key())
    );
}

#[test]
fn generate_with_force_replaces_key() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host_key");

    let first = keys::generate_host_key_file(&path, false).unwrap();
    let second = keys::generate_host_key_file(&path, true).unwrap();
    let loaded = keys::load_host_key(&path).unwrap();

    assert_ne!(
        key_fingerprint(first.public_key()),
        key_fingerprint(second.public_key())
    );
    assert_eq!(
        key_fingerprint(second.public_key()),
        key_fingerprint(loaded.public_key())
    );
}

#[test]
fn load_rejects_garbage() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host_key");
    std::fs::write(&path, "not a key").unwrap();

    let err = keys::load_host_key(&path).unwrap_err();
    assert!(err.to_string().contains("decoding host key"));
}

/// On Unix, the generated key file must have mode 0o600 (owner read/write only).
#[cfg(unix)]
#[test]
fn permissions_are_restrictive() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let path = dir.path().join("host_key");
    keys::load_or_generate_host_key(&path).unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600, "host key must be owner read/write only");
}

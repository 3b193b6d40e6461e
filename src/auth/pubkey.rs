use anyhow::Result;
use russh::keys::PublicKey;
use tracing::warn;

/// Parse an OpenSSH authorized_keys line (`<type> <base64> [comment]`)
pub fn parse_authorized_key(line: &str) -> Result<PublicKey> {
    let encoded = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("invalid authorized_key format: {}", line))?;
    russh::keys::parse_public_key_base64(encoded)
        .map_err(|e| anyhow::anyhow!("failed to parse public key: {}", e))
}

/// Parse all configured authorized keys. Invalid lines are logged and skipped.
pub fn parse_authorized_keys(key_lines: &[String]) -> Vec<PublicKey> {
    key_lines
        .iter()
        .filter_map(|line| match parse_authorized_key(line) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, key_line = %line, "Skipping unparsable authorized key");
                None
            }
        })
        .collect()
}

pub fn key_matches_parsed(presented: &PublicKey, authorized_keys: &[PublicKey]) -> bool {
    authorized_keys.iter().any(|k| presented == k)
}

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use anyhow::{Context, Result};

/// Nonce size for AES-256-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Encrypt data using AES-256-GCM.
///
/// Returns `[12-byte nonce][ciphertext+tag]`.
/// Key must be exactly 32 bytes (256 bits).
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != 32 {
        anyhow::bail!("AES-256-GCM key must be 32 bytes, got {}", key.len());
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

    // Format: [nonce][ciphertext+tag]
    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt data encrypted with AES-256-GCM.
///
/// Input format: `[12-byte nonce][ciphertext+tag]`.
/// Key must be exactly 32 bytes (256 bits).
pub fn decrypt(encrypted: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != 32 {
        anyhow::bail!("AES-256-GCM key must be 32 bytes, got {}", key.len());
    }

    if encrypted.len() < NONCE_SIZE + 16 {
        anyhow::bail!(
            "Encrypted data too short: {} bytes (minimum {})",
            encrypted.len(),
            NONCE_SIZE + 16
        );
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("Decryption failed: authentication tag mismatch"))
}

/// Encrypt a snapshot file in-place.
///
/// Reads plaintext from `path`, encrypts it, writes to `path.enc`,
/// then removes the plaintext file.
pub fn encrypt_snapshot_file(path: &str, key: &[u8]) -> Result<String> {
    let enc_path = format!("{}.enc", path);

    let plaintext = crate::infra::shell::run_in_vm_stdout(&format!("base64 {} 2>/dev/null", path))
        .with_context(|| format!("Failed to read snapshot file: {}", path))?;

    let raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, plaintext.trim())
        .with_context(|| "Failed to decode snapshot file content")?;

    let encrypted = encrypt(&raw, key)?;

    let enc_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &encrypted);

    crate::infra::shell::run_in_vm(&format!(
        "echo '{}' | base64 -d > {} && chmod 0600 {} && rm -f {}",
        enc_b64, enc_path, enc_path, path
    ))
    .with_context(|| format!("Failed to write encrypted snapshot: {}", enc_path))?;

    Ok(enc_path)
}

/// Decrypt a snapshot file.
///
/// Reads encrypted data from `enc_path`, decrypts it, writes plaintext
/// to `out_path`. The encrypted file is NOT removed (caller decides).
pub fn decrypt_snapshot_file(enc_path: &str, out_path: &str, key: &[u8]) -> Result<()> {
    let enc_b64 =
        crate::infra::shell::run_in_vm_stdout(&format!("base64 {} 2>/dev/null", enc_path))
            .with_context(|| format!("Failed to read encrypted snapshot: {}", enc_path))?;

    let encrypted =
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, enc_b64.trim())
            .with_context(|| "Failed to decode encrypted snapshot content")?;

    let plaintext = decrypt(&encrypted, key)?;

    let plain_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &plaintext);

    crate::infra::shell::run_in_vm(&format!(
        "echo '{}' | base64 -d > {} && chmod 0600 {}",
        plain_b64, out_path, out_path
    ))
    .with_context(|| format!("Failed to write decrypted snapshot: {}", out_path))?;

    Ok(())
}

//! Field-level sealing for the protected column.
//!
//! Sealed values are `pcqenc1:` followed by hex of `nonce || ciphertext`. The record
//! id is bound as associated data so a sealed value cannot be moved to another row.

use anyhow::{anyhow, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use pcq_core::{FieldKey, PcqError, PcqId};
use rand::RngCore;

const SEALED_FIELD_PREFIX: &str = "pcqenc1:";
const NONCE_LEN: usize = 24;

pub(crate) fn seal_field(key: &FieldKey, pcq_id: &PcqId, plaintext: &str) -> Result<String> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut nonce_bytes = [0_u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let payload = Payload {
        msg: plaintext.as_bytes(),
        aad: pcq_id.as_str().as_bytes(),
    };
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), payload)
        .map_err(|err| anyhow!("failed to seal protected field: {err}"))?;

    let mut out = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(format!("{SEALED_FIELD_PREFIX}{}", hex::encode(out)))
}

pub(crate) fn open_field(key: &FieldKey, pcq_id: &PcqId, sealed: &str) -> Result<String, PcqError> {
    let failed = || PcqError::DecryptionFailed(pcq_id.to_string());

    let Some(encoded) = sealed.strip_prefix(SEALED_FIELD_PREFIX) else {
        return Err(failed());
    };
    let bytes = hex::decode(encoded).map_err(|_| failed())?;
    if bytes.len() <= NONCE_LEN {
        return Err(failed());
    }

    let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let payload = Payload {
        msg: ciphertext,
        aad: pcq_id.as_str().as_bytes(),
    };
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), payload)
        .map_err(|_| failed())?;
    String::from_utf8(plaintext).map_err(|_| failed())
}

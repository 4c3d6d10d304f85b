//! HMAC-signed opaque tokens.
//!
//! Format: `mgt1.<expiry-hex>.<nonce-hex>.<mac-hex>` where the MAC is
//! HMAC-SHA256 over `expiry || nonce || user_id` with the server secret.
//! A valid signature proves the gateway minted the token; revocation and
//! eviction are decided by the auth manager's store, not here.

use crate::error::{ProtoError, ProtoResult};
use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};

const PREFIX: &str = "mgt1";
const NONCE_LEN: usize = 16;

/// Mint a token for `user_id` expiring `ttl_secs` from now.
pub fn mint(secret: &[u8], user_id: &str, ttl_secs: u64) -> String {
    let expiry = now_secs() + ttl_secs;
    let nonce = random_nonce();
    let mac = sign(secret, expiry, &nonce, user_id);
    format!(
        "{PREFIX}.{:016x}.{}.{}",
        expiry,
        hex::encode(nonce),
        hex::encode(mac)
    )
}

/// Verify signature and embedded expiry, returning the expiry timestamp
/// (seconds). For stateless checks where the minted lifetime is final.
pub fn verify(secret: &[u8], user_id: &str, token: &str) -> ProtoResult<u64> {
    let expiry = verify_signature(secret, user_id, token)?;
    if now_secs() > expiry {
        return Err(ProtoError::Token("token expired".into()));
    }
    Ok(expiry)
}

/// Verify the signature alone, returning the embedded expiry timestamp.
/// Callers whose store tracks token lifetime (sliding renewal, revocation)
/// use this so the store stays authoritative for expiry.
pub fn verify_signature(secret: &[u8], user_id: &str, token: &str) -> ProtoResult<u64> {
    let mut parts = token.split('.');
    let (prefix, expiry_hex, nonce_hex, mac_hex) = match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some(p), Some(e), Some(n), Some(m), None) => (p, e, n, m),
        _ => return Err(ProtoError::Token("malformed token".into())),
    };
    if prefix != PREFIX {
        return Err(ProtoError::Token("unknown token prefix".into()));
    }
    let expiry = u64::from_str_radix(expiry_hex, 16)
        .map_err(|_| ProtoError::Token("bad expiry field".into()))?;
    let nonce = hex::decode(nonce_hex).map_err(|_| ProtoError::Token("bad nonce field".into()))?;
    if nonce.len() != NONCE_LEN {
        return Err(ProtoError::Token("bad nonce length".into()));
    }
    let mac = hex::decode(mac_hex).map_err(|_| ProtoError::Token("bad mac field".into()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut data = Vec::with_capacity(8 + NONCE_LEN + user_id.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(&nonce);
    data.extend_from_slice(user_id.as_bytes());
    hmac::verify(&key, &data, &mac).map_err(|_| ProtoError::Token("invalid signature".into()))?;

    Ok(expiry)
}

/// Generate a random 32-byte server secret.
pub fn generate_secret() -> Vec<u8> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret).expect("RNG failure");
    secret
}

fn sign(secret: &[u8], expiry: u64, nonce: &[u8], user_id: &str) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut data = Vec::with_capacity(8 + nonce.len() + user_id.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(nonce);
    data.extend_from_slice(user_id.as_bytes());
    hmac::sign(&key, &data).as_ref().to_vec()
}

fn random_nonce() -> [u8; NONCE_LEN] {
    use rand::RngCore;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

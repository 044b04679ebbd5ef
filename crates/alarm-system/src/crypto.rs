//! PIN storage
//!
//! PIN codes are stored as PHC strings of the form
//! `$scrypt$N=1024$r=8$p=16$<salt>$<b64url hash>` with a random 16-byte
//! salt and a 64-byte derived key. Verification re-hashes with the stored
//! salt and parameters; the system fails closed when scrypt is unavailable
//! for the given parameters.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use scrypt::Params;

const SCRYPT_N: u32 = 1024;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 16;
const SCRYPT_KEY_LEN: usize = 64;

/// Parameters parsed back out of a PHC string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScryptParameters {
    pub n: u32,
    pub r: u32,
    pub p: u32,
    pub salt: String,
}

/// A cryptographically random 16-byte salt, base64url without padding.
#[must_use]
pub fn generate_salt() -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    URL_SAFE_NO_PAD.encode(salt)
}

fn derive(password: &str, salt: &str, n: u32, r: u32, p: u32) -> Option<Vec<u8>> {
    let log_n = n.checked_ilog2()? as u8;
    if 1u32 << log_n != n {
        return None;
    }

    let params = Params::new(log_n, r, p, SCRYPT_KEY_LEN).ok()?;
    let mut output = vec![0u8; SCRYPT_KEY_LEN];
    scrypt::scrypt(password.as_bytes(), salt.as_bytes(), &params, &mut output).ok()?;
    Some(output)
}

/// Hashes \p password with \p salt into a PHC string. Returns an empty
/// string on failure so callers can fail closed.
#[must_use]
pub fn scrypt_password(password: &str, salt: &str) -> String {
    match derive(password, salt, SCRYPT_N, SCRYPT_R, SCRYPT_P) {
        Some(hash) => format!(
            "$scrypt$N={SCRYPT_N}$r={SCRYPT_R}$p={SCRYPT_P}${salt}${}",
            URL_SAFE_NO_PAD.encode(hash)
        ),
        None => String::new(),
    }
}

/// Parses the parameters out of a PHC scrypt string.
#[must_use]
pub fn parse_phc_parameters(phc: &str) -> Option<(ScryptParameters, String)> {
    let mut parts = phc.split('$');

    if !parts.next()?.is_empty() {
        return None; // must start with '$'
    }
    if parts.next()? != "scrypt" {
        return None;
    }

    let n = parts.next()?.strip_prefix("N=")?.parse().ok()?;
    let r = parts.next()?.strip_prefix("r=")?.parse().ok()?;
    let p = parts.next()?.strip_prefix("p=")?.parse().ok()?;
    let salt = parts.next()?.to_string();
    let hash = parts.next()?.to_string();

    if parts.next().is_some() || salt.is_empty() || hash.is_empty() {
        return None;
    }

    Some((ScryptParameters { n, r, p, salt }, hash))
}

/// Verifies \p password against a stored PHC string.
#[must_use]
pub fn scrypt_verify(phc: &str, password: &str) -> bool {
    let Some((params, stored_hash)) = parse_phc_parameters(phc) else {
        return false;
    };

    let Some(computed) = derive(password, &params.salt, params.n, params.r, params.p) else {
        return false;
    };

    let Ok(stored) = URL_SAFE_NO_PAD.decode(stored_hash) else {
        return false;
    };

    // constant-ish time compare; length mismatch is an immediate fail
    stored.len() == computed.len()
        && stored
            .iter()
            .zip(&computed)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_lifecycle() {
        let salt = generate_salt();
        let phc = scrypt_password("12345", &salt);

        assert!(phc.starts_with("$scrypt$N=1024$r=8$p=16$"));
        assert!(scrypt_verify(&phc, "12345"));
        assert!(!scrypt_verify(&phc, "54321"));
    }

    #[test]
    fn phc_parameters_roundtrip() {
        let phc = scrypt_password("secret", "c2FsdHNhbHQ");
        let (params, _) = parse_phc_parameters(&phc).unwrap();
        assert_eq!(
            params,
            ScryptParameters { n: 1024, r: 8, p: 16, salt: "c2FsdHNhbHQ".into() }
        );
    }

    #[test]
    fn salts_are_unique_and_unpadded() {
        let a = generate_salt();
        let b = generate_salt();
        assert_ne!(a, b);
        assert!(!a.contains('='));
        // 16 bytes -> 22 base64url characters
        assert_eq!(a.len(), 22);
    }

    #[test]
    fn malformed_phc_fails_closed() {
        assert!(!scrypt_verify("", "1234"));
        assert!(!scrypt_verify("$argon2$x", "1234"));
        assert!(!scrypt_verify("$scrypt$N=0$r=8$p=16$salt$aGFzaA", "1234"));
    }
}

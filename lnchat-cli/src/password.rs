//! Argon2id password hashes for `server.pwdhash`.

use anyhow::Result;
use argon2::password_hash::{PasswordHash, PasswordHasher, SaltString};
use argon2::Argon2;
use rand::RngCore;

/// Hash `password` into a PHC string with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt)
        .map_err(|e| anyhow::anyhow!("Salt encoding failed: {}", e))?;

    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

/// Reject anything that does not parse as a PHC string.
pub fn check_phc(phc: &str) -> Result<()> {
    PasswordHash::new(phc).map_err(|e| anyhow::anyhow!("Invalid PHC string: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::PasswordVerifier;

    fn verify_password(password: &str, phc: &str) -> Result<bool> {
        let hash = PasswordHash::new(phc).map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok())
    }

    #[test]
    fn test_hash_is_argon2id_phc() {
        let phc = hash_password("correct horse").unwrap();
        assert!(phc.starts_with("$argon2id$"));
        check_phc(&phc).unwrap();
    }

    #[test]
    fn test_verify() {
        let phc = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &phc).unwrap());
        assert!(!verify_password("battery staple", &phc).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(hash_password("x").unwrap(), hash_password("x").unwrap());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(check_phc("").is_err());
        assert!(check_phc("plaintext").is_err());
        assert!(verify_password("x", "plaintext").is_err());
    }
}

//! argon2id password hashes in PHC string form.

use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

use crate::error::{RegistryError, RegistryResult};

fn argon2_instance() -> Argon2<'static> {
    #[cfg(test)]
    {
        // cheap parameters keep the test suite fast
        match argon2::Params::new(256, 1, 1, None) {
            Ok(params) => Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params),
            Err(_) => Argon2::default(),
        }
    }
    #[cfg(not(test))]
    {
        Argon2::default()
    }
}

/// Hash `password` with a fresh salt.
pub fn hash(password: &str) -> RegistryResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    argon2_instance()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| RegistryError::Internal(format!("hash password: {err}")))
}

/// Whether `password` matches the stored `hash`. A malformed hash never matches.
pub fn verify(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        tracing::warn!("stored password hash is malformed");
        return false;
    };
    argon2_instance()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

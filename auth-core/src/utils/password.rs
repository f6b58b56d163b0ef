use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use std::fmt;

/// Newtype for password to prevent accidental logging
#[derive(Clone)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(****)")
    }
}

/// Newtype for password hash
#[derive(Debug, Clone)]
pub struct PasswordHashString(String);

impl PasswordHashString {
    pub fn new(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Argon2id hashing and verification at a configured cost.
///
/// Verification never errors: a malformed stored hash is indistinguishable
/// from a wrong password.
#[derive(Clone)]
pub struct CredentialVerifier {
    argon2: Argon2<'static>,
    params: Params,
    dummy_hash: String,
}

impl CredentialVerifier {
    /// Argon2id v19 with the crate's recommended parameters (19 MiB, t=2, p=1).
    pub fn new() -> Result<Self, anyhow::Error> {
        Self::with_params(Params::default())
    }

    pub fn with_params(params: Params) -> Result<Self, anyhow::Error> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone());
        let salt = SaltString::generate(&mut OsRng);
        let dummy_hash = argon2
            .hash_password(salt.as_str().as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("Failed to build dummy hash: {}", e))?
            .to_string();

        Ok(Self {
            argon2,
            params,
            dummy_hash,
        })
    }

    /// Hash a password. Salt is generated and embedded in the PHC string.
    pub fn hash(&self, password: &Password) -> Result<PasswordHashString, anyhow::Error> {
        let salt = SaltString::generate(&mut OsRng);

        let password_hash = self
            .argon2
            .hash_password(password.as_str().as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
            .to_string();

        Ok(PasswordHashString::new(password_hash))
    }

    /// Verify using the parameters recorded in the stored hash.
    pub fn verify(&self, password: &Password, password_hash: &str) -> bool {
        let Ok(parsed_hash) = PasswordHash::new(password_hash) else {
            return false;
        };

        self.argon2
            .verify_password(password.as_str().as_bytes(), &parsed_hash)
            .is_ok()
    }

    /// Burn one verification for callers with nothing to verify against.
    pub fn verify_dummy(&self, password: &Password) {
        let _ = self.verify(password, &self.dummy_hash);
    }

    /// True when the hash is not Argon2id v19 or any cost parameter is below
    /// the configured one. Unparseable hashes also need upgrading.
    pub fn needs_upgrade(&self, password_hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(password_hash) else {
            return true;
        };

        if parsed.algorithm != Algorithm::Argon2id.ident() {
            return true;
        }
        if parsed.version != Some(u32::from(Version::V0x13)) {
            return true;
        }

        match Params::try_from(&parsed) {
            Ok(stored) => {
                stored.m_cost() < self.params.m_cost()
                    || stored.t_cost() < self.params.t_cost()
                    || stored.p_cost() < self.params.p_cost()
            }
            Err(_) => true,
        }
    }
}

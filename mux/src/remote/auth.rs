//! Password authentication for the control surface: SHA-256, with a
//! constant-time digest comparison.

use failure::{bail, Error};
use sha2::{Digest, Sha256};

pub struct Authenticator {
    /// Hex digest of the password; None disables authentication.
    hash: Option<String>,
}

impl Authenticator {
    pub fn disabled() -> Self {
        Authenticator { hash: None }
    }

    pub fn with_password(password: &str) -> Self {
        Authenticator { hash: Some(hash_password(password)) }
    }

    /// Accepts the configuration form "sha256:<hex digest>".
    pub fn with_hash(hash: &str) -> Result<Self, Error> {
        let digest = match hash.strip_prefix("sha256:") {
            Some(d) => d,
            None => bail!("password hash must be of the form sha256:<hex>"),
        };
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("malformed sha256 digest in password hash");
        }
        Ok(Authenticator { hash: Some(digest.to_ascii_lowercase()) })
    }

    pub fn is_enabled(&self) -> bool {
        self.hash.is_some()
    }

    /// True when `candidate` matches, or when auth is disabled. The
    /// comparison runs over every byte regardless of mismatch position.
    pub fn verify(&self, candidate: Option<&str>) -> bool {
        let expected = match &self.hash {
            Some(h) => h,
            None => return true,
        };
        let candidate = match candidate {
            Some(c) => hash_password(c),
            None => return false,
        };
        constant_time_eq(candidate.as_bytes(), expected.as_bytes())
    }
}

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// The configuration representation of a password.
pub fn generate_password_hash(password: &str) -> String {
    format!("sha256:{}", hash_password(password))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_accepts_anything() {
        let a = Authenticator::disabled();
        assert!(!a.is_enabled());
        assert!(a.verify(None));
        assert!(a.verify(Some("whatever")));
    }

    #[test]
    fn password_round_trip() {
        let a = Authenticator::with_password("s3cret");
        assert!(a.is_enabled());
        assert!(a.verify(Some("s3cret")));
        assert!(!a.verify(Some("wrong")));
        assert!(!a.verify(None));
    }

    #[test]
    fn hash_form() {
        let h = generate_password_hash("password");
        assert!(h.starts_with("sha256:"));
        let a = Authenticator::with_hash(&h).unwrap();
        assert!(a.verify(Some("password")));
        assert!(!a.verify(Some("Password")));
        assert!(Authenticator::with_hash("md5:abc").is_err());
        assert!(Authenticator::with_hash("sha256:xyz").is_err());
    }

    #[test]
    fn known_digest() {
        // sha256("password"), a fixed vector.
        assert_eq!(
            hash_password("password"),
            "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8"
        );
    }
}

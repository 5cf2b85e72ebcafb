//! Proof Key for Code Exchange (RFC 7636) verification.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use super::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeMethod {
    S256,
    Plain,
}

impl ChallengeMethod {
    /// A missing method means `plain`.
    pub fn parse(value: Option<&str>) -> Result<Self, AuthError> {
        match value {
            None | Some("plain") => Ok(ChallengeMethod::Plain),
            Some("S256") => Ok(ChallengeMethod::S256),
            Some(other) => Err(AuthError::Validation(format!(
                "Unsupported code_challenge_method: {}",
                other
            ))),
        }
    }
}

pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub fn verify(method: ChallengeMethod, challenge: &str, verifier: &str) -> bool {
    match method {
        ChallengeMethod::S256 => s256_challenge(verifier) == challenge,
        ChallengeMethod::Plain => verifier == challenge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s256_matches_rfc7636_example() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            s256_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
        assert!(verify(
            ChallengeMethod::S256,
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM",
            verifier
        ));
    }

    #[test]
    fn method_parsing() {
        assert_eq!(ChallengeMethod::parse(None).unwrap(), ChallengeMethod::Plain);
        assert_eq!(
            ChallengeMethod::parse(Some("S256")).unwrap(),
            ChallengeMethod::S256
        );
        assert!(ChallengeMethod::parse(Some("S512")).is_err());
        assert!(!verify(ChallengeMethod::Plain, "abc", "abd"));
    }
}

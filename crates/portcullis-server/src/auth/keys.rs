//! Signing key management.
//!
//! Keys are P-256 pairs stored as PKCS#8 PEM. The newest non-revoked
//! certificate signs new tokens. Rotation appends a new certificate and
//! revokes the rest; revoked certificates stay in the published JWKS until
//! the cache-clearance horizon has passed.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse,
};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use super::AuthError;
use crate::model::SigningCertificate;
use crate::store::CertificateStore;

/// Generate a fresh P-256 signing certificate.
pub fn generate_certificate() -> Result<SigningCertificate, AuthError> {
    let signing_key = SigningKey::random(&mut p256::elliptic_curve::rand_core::OsRng);

    let private_key = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AuthError::Crypto(format!("Failed to encode private key: {}", e)))?;
    let public_key = signing_key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AuthError::Crypto(format!("Failed to encode public key: {}", e)))?;

    Ok(SigningCertificate {
        kid: uuid::Uuid::new_v4().simple().to_string(),
        public_key,
        private_key: private_key.to_string(),
        created_at: Utc::now(),
        revoked_at: None,
    })
}

/// Public JWK for a certificate.
pub fn certificate_jwk(cert: &SigningCertificate) -> Result<Jwk, AuthError> {
    let public_key = p256::PublicKey::from_public_key_pem(&cert.public_key)
        .map_err(|e| AuthError::Crypto(format!("Invalid public key for {}: {}", cert.kid, e)))?;
    let point = public_key.to_encoded_point(false);
    let (x, y) = match (point.x(), point.y()) {
        (Some(x), Some(y)) => (URL_SAFE_NO_PAD.encode(x), URL_SAFE_NO_PAD.encode(y)),
        _ => {
            return Err(AuthError::Crypto(format!(
                "Public key for {} is not an uncompressed point",
                cert.kid
            )))
        }
    };

    Ok(Jwk {
        common: CommonParameters {
            public_key_use: Some(PublicKeyUse::Signature),
            key_algorithm: Some(KeyAlgorithm::ES256),
            key_id: Some(cert.kid.clone()),
            ..Default::default()
        },
        algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
            key_type: EllipticCurveKeyType::EC,
            curve: EllipticCurve::P256,
            x,
            y,
        }),
    })
}

pub struct KeyManager {
    store: Arc<dyn CertificateStore>,
    retention: Duration,
    horizon: Duration,
    rotation: Mutex<()>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn CertificateStore>, retention: Duration, horizon: Duration) -> Self {
        Self {
            store,
            retention,
            horizon,
            rotation: Mutex::new(()),
        }
    }

    fn newest_active(certs: Vec<SigningCertificate>) -> Option<SigningCertificate> {
        certs.into_iter().rev().find(|c| c.revoked_at.is_none())
    }

    /// The certificate used for new signatures.
    pub async fn active(&self) -> Result<SigningCertificate, AuthError> {
        Self::newest_active(self.store.list_certificates().await?)
            .ok_or_else(|| AuthError::Internal("no active signing certificate".to_string()))
    }

    /// Returns the active certificate, creating the first one if needed.
    pub async fn ensure_active(&self) -> Result<SigningCertificate, AuthError> {
        let _guard = self.rotation.lock().await;
        if let Some(cert) = Self::newest_active(self.store.list_certificates().await?) {
            return Ok(cert);
        }
        let cert = generate_certificate()?;
        self.store.insert_certificate(&cert).await?;
        info!(kid = %cert.kid, "Created initial signing certificate");
        Ok(cert)
    }

    #[instrument(skip(self))]
    pub async fn rotate(&self) -> Result<SigningCertificate, AuthError> {
        let _guard = self.rotation.lock().await;
        self.rotate_locked().await
    }

    async fn rotate_locked(&self) -> Result<SigningCertificate, AuthError> {
        let cert = generate_certificate()?;
        self.store.insert_certificate(&cert).await?;
        let revoked = self
            .store
            .revoke_certificates_except(&cert.kid, cert.created_at)
            .await?;
        info!(kid = %cert.kid, revoked, "Rotated signing certificate");
        Ok(cert)
    }

    /// Rotates when the active certificate is older than the retention
    /// window, or when there is none.
    pub async fn rotate_if_due(&self) -> Result<Option<SigningCertificate>, AuthError> {
        let _guard = self.rotation.lock().await;
        let due = match Self::newest_active(self.store.list_certificates().await?) {
            Some(active) => Utc::now() - active.created_at >= self.retention,
            None => true,
        };
        if !due {
            return Ok(None);
        }
        self.rotate_locked().await.map(Some)
    }

    /// Published key set at `now`: every certificate that is not revoked or
    /// was revoked within the cache-clearance horizon.
    pub async fn jwks_at(&self, now: DateTime<Utc>) -> Result<JwkSet, AuthError> {
        let cutoff = now - self.horizon;
        let mut keys = Vec::new();
        for cert in self.store.list_certificates().await?.iter().rev() {
            match cert.revoked_at {
                Some(revoked_at) if revoked_at <= cutoff => continue,
                _ => keys.push(certificate_jwk(cert)?),
            }
        }
        Ok(JwkSet { keys })
    }

    pub async fn jwks(&self) -> Result<JwkSet, AuthError> {
        self.jwks_at(Utc::now()).await
    }
}

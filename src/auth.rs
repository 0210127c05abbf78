// Session Token Verification
//
// Devices present a compact signed token in the WebSocket URL. A token is
// `base64url(claims_json) . base64url(hmac_sha256(secret, claims_b64))`,
// where the claims embed the device id and an expiry. Token issuance lives
// outside this service; `issue()` exists for operators and tests. The
// verifier checks the signature, the expiry, and that the embedded `cpe_id`
// matches the id the connection claims - a mismatch is a policy violation,
// not a retryable failure.

use base64::prelude::*;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::DomainError;

type HmacSha256 = Hmac<Sha256>;

/// Claims embedded in a session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Device the token was issued to
    pub cpe_id: String,
    /// Expiry, unix seconds
    pub exp: i64,
}

/// Verifies (and locally mints) session tokens
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Mint a token for a device. Issuance proper is an external concern;
    /// this helper backs the CLI and the test suite.
    pub fn issue(&self, cpe_id: &str, ttl: Duration) -> Result<String, DomainError> {
        let claims = TokenClaims {
            cpe_id: cpe_id.to_string(),
            exp: (Utc::now() + ttl).timestamp(),
        };
        let payload = serde_json::to_vec(&claims).map_err(|e| DomainError::Auth {
            reason: format!("claims encoding failed: {}", e),
        })?;
        let payload_b64 = BASE64_URL_SAFE_NO_PAD.encode(payload);
        let signature = self.sign(payload_b64.as_bytes())?;
        Ok(format!(
            "{}.{}",
            payload_b64,
            BASE64_URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Verify a token and check its embedded device id against the claimed one.
    ///
    /// Every rejection reason is logged at warn; callers close the session
    /// with a policy-violation code and do not retry.
    pub fn verify(&self, token: &str, claimed_cpe_id: &str) -> Result<TokenClaims, DomainError> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or_else(|| {
            tracing::warn!("Token rejected: not in payload.signature form");
            DomainError::Auth {
                reason: "malformed token".to_string(),
            }
        })?;

        let signature = BASE64_URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| {
                tracing::warn!("Token rejected: signature is not base64url");
                DomainError::Auth {
                    reason: "malformed token signature".to_string(),
                }
            })?;

        let mut mac = self.mac()?;
        mac.update(payload_b64.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            tracing::warn!("Token rejected: bad signature");
            return Err(DomainError::Auth {
                reason: "invalid token signature".to_string(),
            });
        }

        let payload = BASE64_URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| {
            tracing::warn!("Token rejected: payload is not base64url");
            DomainError::Auth {
                reason: "malformed token payload".to_string(),
            }
        })?;
        let claims: TokenClaims = serde_json::from_slice(&payload).map_err(|_| {
            tracing::warn!("Token rejected: unparseable claims");
            DomainError::Auth {
                reason: "malformed token claims".to_string(),
            }
        })?;

        if claims.exp < Utc::now().timestamp() {
            tracing::warn!(cpe_id = %claims.cpe_id, "Token rejected: expired");
            return Err(DomainError::Auth {
                reason: "token expired".to_string(),
            });
        }

        if claims.cpe_id != claimed_cpe_id {
            tracing::warn!(
                token_cpe_id = %claims.cpe_id,
                claimed_cpe_id = %claimed_cpe_id,
                "Token rejected: device id mismatch"
            );
            return Err(DomainError::Auth {
                reason: "token device id does not match connection".to_string(),
            });
        }

        Ok(claims)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, DomainError> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn mac(&self) -> Result<HmacSha256, DomainError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| DomainError::Auth {
            reason: "invalid signing key".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new("unit-test-secret".as_bytes().to_vec())
    }

    #[test]
    fn test_round_trip() {
        let v = verifier();
        let token = v.issue("cpe-1", Duration::hours(1)).unwrap();
        let claims = v.verify(&token, "cpe-1").unwrap();
        assert_eq!(claims.cpe_id, "cpe-1");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn test_mismatched_device_id_rejected() {
        let v = verifier();
        let token = v.issue("cpe-1", Duration::hours(1)).unwrap();
        let err = v.verify(&token, "cpe-2").unwrap_err();
        assert!(matches!(err, DomainError::Auth { .. }));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = verifier().issue("cpe-1", Duration::hours(1)).unwrap();
        let other = TokenVerifier::new("a-different-secret".as_bytes().to_vec());
        assert!(other.verify(&token, "cpe-1").is_err());
    }

    #[test]
    fn test_expired_rejected() {
        let v = verifier();
        let token = v.issue("cpe-1", Duration::seconds(-10)).unwrap();
        assert!(v.verify(&token, "cpe-1").is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        let v = verifier();
        assert!(v.verify("garbage", "cpe-1").is_err());
        assert!(v.verify("a.b", "cpe-1").is_err());
        assert!(v.verify("", "cpe-1").is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let v = verifier();
        let token = v.issue("cpe-1", Duration::hours(1)).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged_claims = serde_json::to_vec(&TokenClaims {
            cpe_id: "cpe-2".to_string(),
            exp: (Utc::now() + Duration::hours(1)).timestamp(),
        })
        .unwrap();
        let forged = format!("{}.{}", BASE64_URL_SAFE_NO_PAD.encode(forged_claims), sig);
        assert!(v.verify(&forged, "cpe-2").is_err());
    }
}

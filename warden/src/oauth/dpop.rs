//! DPoP proof verification
//!
//! A proof is a JWS with `typ: dpop+jwt`, an embedded public JWK, and claims
//! binding it to one HTTP request. Verification checks the header, the
//! claims (method, URI, freshness, optional access-token hash and nonce),
//! the signature against the embedded key, and finally derives the RFC 7638
//! key thumbprint used for token binding.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::clock::Clock;
use crate::error::{Error, OAuthError, Result};

/// Result of a verified proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpopProof {
    /// RFC 7638 thumbprint of the embedded key
    pub thumbprint: String,
}

#[derive(Debug, Deserialize)]
struct ProofClaims {
    #[allow(dead_code)]
    jti: Option<String>,
    htm: String,
    htu: String,
    iat: i64,
    ath: Option<String>,
    nonce: Option<String>,
}

/// Verifier configured with the accepted algorithms and freshness window
#[derive(Clone)]
pub struct DpopVerifier {
    algorithms: Vec<Algorithm>,
    max_age_secs: i64,
    clock: Arc<dyn Clock>,
}

impl DpopVerifier {
    /// Create a verifier accepting `algorithms` (names per JWA: ES256, RS256)
    pub fn new(algorithms: &[String], max_age_secs: i64, clock: Arc<dyn Clock>) -> Self {
        let algorithms = algorithms
            .iter()
            .filter_map(|name| match name.as_str() {
                "ES256" => Some(Algorithm::ES256),
                "RS256" => Some(Algorithm::RS256),
                _ => None,
            })
            .collect();
        Self {
            algorithms,
            max_age_secs,
            clock,
        }
    }

    /// Verify `proof` against the request it claims to cover
    ///
    /// `access_token` triggers the `ath` check; `nonce` the nonce check.
    /// Returns the key thumbprint for binding.
    pub fn verify(
        &self,
        proof: &str,
        method: &str,
        uri: &str,
        access_token: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<DpopProof> {
        let header = decode_header(proof)
            .map_err(|e| invalid(format!("unparseable proof header: {}", e)))?;

        if header.typ.as_deref() != Some("dpop+jwt") {
            return Err(invalid("proof typ must be dpop+jwt"));
        }
        if !self.algorithms.contains(&header.alg) {
            return Err(invalid("proof algorithm not accepted"));
        }
        let Some(jwk) = header.jwk else {
            return Err(invalid("proof must embed its public key"));
        };

        let claims = self.decode_claims(proof, header.alg)?;
        check_claims(
            &claims,
            method,
            uri,
            access_token,
            nonce,
            self.clock.now_ms() / 1_000,
            self.max_age_secs,
        )?;

        // Signature last: the embedded key itself is what signs the proof.
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| invalid(format!("unusable embedded key: {}", e)))?;
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        decode::<ProofClaims>(proof, &key, &validation)
            .map_err(|e| invalid(format!("signature verification failed: {}", e)))?;

        Ok(DpopProof {
            thumbprint: thumbprint(&jwk)?,
        })
    }

    /// Decode claims without signature verification; the signature is
    /// checked separately once the claims are known to be well-formed
    fn decode_claims(&self, proof: &str, alg: Algorithm) -> Result<ProofClaims> {
        let mut validation = Validation::new(alg);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        let data = decode::<ProofClaims>(proof, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| invalid(format!("unparseable proof payload: {}", e)))?;
        Ok(data.claims)
    }
}

fn invalid(description: impl Into<String>) -> Error {
    Error::OAuth(OAuthError::invalid_dpop_proof(description))
}

fn check_claims(
    claims: &ProofClaims,
    method: &str,
    uri: &str,
    access_token: Option<&str>,
    nonce: Option<&str>,
    now_secs: i64,
    max_age_secs: i64,
) -> Result<()> {
    if claims.htm != method {
        return Err(invalid("htm does not match request method"));
    }
    if claims.htu != uri {
        return Err(invalid("htu does not match request uri"));
    }
    if (now_secs - claims.iat).abs() > max_age_secs {
        return Err(invalid("proof iat outside the acceptance window"));
    }
    if let Some(token) = access_token {
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()));
        let presented = claims.ath.as_deref().unwrap_or("");
        let matches: bool = presented.as_bytes().ct_eq(expected.as_bytes()).into();
        if !matches {
            return Err(invalid("ath does not match the access token"));
        }
    }
    if let Some(expected_nonce) = nonce {
        if claims.nonce.as_deref() != Some(expected_nonce) {
            return Err(invalid("nonce mismatch"));
        }
    }
    Ok(())
}

/// RFC 7638 thumbprint: base64url SHA-256 over the canonical JSON of the
/// key's required members, in lexicographic order
pub fn thumbprint(jwk: &Jwk) -> Result<String> {
    let canonical = canonical_members(jwk)?;
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
}

fn canonical_members(jwk: &Jwk) -> Result<String> {
    match &jwk.algorithm {
        AlgorithmParameters::EllipticCurve(params) => {
            let curve = match params.curve {
                EllipticCurve::P256 => "P-256",
                EllipticCurve::P384 => "P-384",
                EllipticCurve::P521 => "P-521",
                _ => return Err(invalid("unsupported elliptic curve")),
            };
            Ok(format!(
                "{{\"crv\":\"{}\",\"kty\":\"EC\",\"x\":\"{}\",\"y\":\"{}\"}}",
                curve, params.x, params.y
            ))
        }
        AlgorithmParameters::RSA(params) => Ok(format!(
            "{{\"e\":\"{}\",\"kty\":\"RSA\",\"n\":\"{}\"}}",
            params.e, params.n
        )),
        _ => Err(invalid("unsupported key type for thumbprint")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use jsonwebtoken::jwk::{CommonParameters, EllipticCurveKeyParameters, EllipticCurveKeyType};

    fn ec_jwk(x: &str, y: &str) -> Jwk {
        Jwk {
            common: CommonParameters::default(),
            algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                key_type: EllipticCurveKeyType::EC,
                curve: EllipticCurve::P256,
                x: x.to_string(),
                y: y.to_string(),
            }),
        }
    }

    fn claims(htm: &str, htu: &str, iat: i64) -> ProofClaims {
        ProofClaims {
            jti: Some("j1".to_string()),
            htm: htm.to_string(),
            htu: htu.to_string(),
            iat,
            ath: None,
            nonce: None,
        }
    }

    #[test]
    fn canonical_members_are_lexicographic() {
        let jwk = ec_jwk("xval", "yval");
        let canonical = canonical_members(&jwk).unwrap();
        assert_eq!(
            canonical,
            "{\"crv\":\"P-256\",\"kty\":\"EC\",\"x\":\"xval\",\"y\":\"yval\"}"
        );

        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()));
        assert_eq!(thumbprint(&jwk).unwrap(), expected);
    }

    #[test]
    fn htm_and_htu_must_match_exactly() {
        let c = claims("POST", "https://as.example/token", 1_000);
        assert!(check_claims(&c, "POST", "https://as.example/token", None, None, 1_000, 300).is_ok());
        assert!(check_claims(&c, "GET", "https://as.example/token", None, None, 1_000, 300).is_err());
        assert!(check_claims(&c, "POST", "https://as.example/other", None, None, 1_000, 300).is_err());
    }

    #[test]
    fn iat_window_boundary() {
        let c = claims("POST", "https://as.example/token", 1_000);
        // Exactly 300s old: accepted.
        assert!(check_claims(&c, "POST", "https://as.example/token", None, None, 1_300, 300).is_ok());
        // 301s old: rejected.
        assert!(check_claims(&c, "POST", "https://as.example/token", None, None, 1_301, 300).is_err());
        // Clock skew into the future is bounded the same way.
        assert!(check_claims(&c, "POST", "https://as.example/token", None, None, 700, 300).is_ok());
        assert!(check_claims(&c, "POST", "https://as.example/token", None, None, 699, 300).is_err());
    }

    #[test]
    fn ath_binds_the_access_token() {
        let token = "token-value";
        let ath = URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()));
        let mut c = claims("GET", "https://rs.example/data", 50);
        c.ath = Some(ath);
        assert!(check_claims(&c, "GET", "https://rs.example/data", Some(token), None, 50, 300).is_ok());
        assert!(
            check_claims(&c, "GET", "https://rs.example/data", Some("other"), None, 50, 300)
                .is_err()
        );
    }

    #[test]
    fn nonce_must_match_when_required() {
        let mut c = claims("POST", "https://as.example/token", 10);
        c.nonce = Some("n-123".to_string());
        assert!(
            check_claims(&c, "POST", "https://as.example/token", None, Some("n-123"), 10, 300)
                .is_ok()
        );
        assert!(
            check_claims(&c, "POST", "https://as.example/token", None, Some("n-999"), 10, 300)
                .is_err()
        );
    }

    #[test]
    fn garbage_proof_is_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let verifier = DpopVerifier::new(
            &["ES256".to_string(), "RS256".to_string()],
            300,
            clock,
        );
        let err = verifier
            .verify("not-a-jwt", "POST", "https://as.example/token", None, None)
            .unwrap_err();
        assert_eq!(
            err.oauth_kind(),
            Some(crate::error::OAuthErrorKind::InvalidDpopProof)
        );
    }

    #[test]
    fn unknown_algorithms_are_filtered_out() {
        let clock = Arc::new(ManualClock::new(0));
        let verifier = DpopVerifier::new(&["HS256".to_string(), "ES256".to_string()], 300, clock);
        assert_eq!(verifier.algorithms, vec![Algorithm::ES256]);
    }
}

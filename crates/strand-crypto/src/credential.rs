//! Signed node credentials.
//!
//! The control plane issues each node a credential binding its user id,
//! peer id and virtual address to an expiry time. Relay servers verify it
//! during the handshake using the control plane's RSA public key.
//!
//! ## Wire Format
//!
//! ```text
//! +----------+----------+-------------+--------+---------+-----------------+
//! | user_id  | peer_id  | expiry_unix | ip_len |   ip    |   signature     |
//! | u64 BE   | u64 BE   | u64 BE      | u8     | ip_len  | RSA PKCS#1 v1.5 |
//! +----------+----------+-------------+--------+---------+-----------------+
//! |<-------------------- signed (SHA-256) ------------->|
//! ```

use crate::CryptoError;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use rsa::pkcs1::LineEnding;

/// Size of the fixed credential header (ids, expiry, ip length).
pub const HEADER_SIZE: usize = 25;

/// Minimum length of a credential that can possibly be valid.
const MIN_CREDENTIAL_LEN: usize = HEADER_SIZE + 4;

/// Current time as unix seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The identity a credential attests to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialClaims {
    /// Owner of the node
    pub user_id: u64,
    /// Node identifier
    pub peer_id: u64,
    /// Virtual address assigned to the node
    pub ip: IpAddr,
    /// Expiry as unix seconds
    pub expires_at: u64,
}

impl CredentialClaims {
    /// Claims expiring at an absolute unix time.
    #[must_use]
    pub fn new(user_id: u64, peer_id: u64, ip: IpAddr, expires_at: u64) -> Self {
        Self {
            user_id,
            peer_id,
            ip,
            expires_at,
        }
    }

    /// Claims valid for `lease` from now.
    #[must_use]
    pub fn with_lease(user_id: u64, peer_id: u64, ip: IpAddr, lease: Duration) -> Self {
        Self::new(user_id, peer_id, ip, unix_now().saturating_add(lease.as_secs()))
    }

    /// Whether the claims have expired at `now` (unix seconds).
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let ip: Vec<u8> = match self.ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        let mut data = Vec::with_capacity(HEADER_SIZE + ip.len());
        data.extend_from_slice(&self.user_id.to_be_bytes());
        data.extend_from_slice(&self.peer_id.to_be_bytes());
        data.extend_from_slice(&self.expires_at.to_be_bytes());
        data.push(ip.len() as u8);
        data.extend_from_slice(&ip);
        data
    }
}

fn digest(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Issues credentials. Held by the control plane (and test harnesses).
#[derive(Clone)]
pub struct CredentialSigner {
    key: RsaPrivateKey,
}

impl CredentialSigner {
    /// Generate a fresh RSA signing key of `bits` size.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let key = RsaPrivateKey::new(&mut rand_core::OsRng, bits)?;
        Ok(Self { key })
    }

    /// Load a PKCS#1 PEM encoded private key.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM cannot be decoded.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| CryptoError::SigningKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Export the private key as PKCS#1 PEM.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        let pem = self
            .key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CryptoError::SigningKey(e.to_string()))?;
        Ok(pem.to_string())
    }

    /// Verifier matching this signer.
    #[must_use]
    pub fn verifier(&self) -> CredentialVerifier {
        CredentialVerifier {
            key: self.key.to_public_key(),
        }
    }

    /// Sign `claims` into a credential blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the RSA signature cannot be produced.
    pub fn issue(&self, claims: &CredentialClaims) -> Result<Vec<u8>, CryptoError> {
        let mut data = claims.signed_bytes();
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest(&data))?;
        data.extend_from_slice(&signature);
        Ok(data)
    }
}

impl std::fmt::Debug for CredentialSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialSigner")
    }
}

/// Verifies credentials. Held by relay servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialVerifier {
    key: RsaPublicKey,
}

impl CredentialVerifier {
    /// Load a PEM encoded public key, either PKCS#1 (`RSA PUBLIC KEY`) or
    /// SubjectPublicKeyInfo (`PUBLIC KEY`).
    ///
    /// # Errors
    ///
    /// Returns an error if neither encoding matches.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPublicKey::from_public_key_pem(pem))
            .map_err(|e| CryptoError::SigningKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Export the public key as PKCS#1 PEM.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CryptoError::SigningKey(e.to_string()))
    }

    /// Verify a credential against the current time.
    ///
    /// # Errors
    ///
    /// See [`CredentialVerifier::verify_at`].
    pub fn verify(&self, credential: &[u8]) -> Result<CredentialClaims, CryptoError> {
        self.verify_at(credential, unix_now())
    }

    /// Verify a credential as of `now` (unix seconds).
    ///
    /// # Errors
    ///
    /// - [`CryptoError::MalformedCredential`] if the blob is truncated or the
    ///   address length is not 4 or 16
    /// - [`CryptoError::InvalidSignature`] if the signature does not match
    /// - [`CryptoError::CredentialExpired`] if `now` is past the expiry
    pub fn verify_at(&self, credential: &[u8], now: u64) -> Result<CredentialClaims, CryptoError> {
        if credential.len() <= MIN_CREDENTIAL_LEN {
            return Err(CryptoError::MalformedCredential("too short"));
        }

        let ip_len = usize::from(credential[HEADER_SIZE - 1]);
        let signed_len = HEADER_SIZE + ip_len;
        if signed_len >= credential.len() {
            return Err(CryptoError::MalformedCredential("address overruns credential"));
        }

        let (signed, signature) = credential.split_at(signed_len);
        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest(signed), signature)
            .map_err(|_| CryptoError::InvalidSignature)?;

        let read_u64 = |offset: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&signed[offset..offset + 8]);
            u64::from_be_bytes(buf)
        };

        let expires_at = read_u64(16);
        if now > expires_at {
            return Err(CryptoError::CredentialExpired {
                expired_at: expires_at,
            });
        }

        let ip_bytes = &signed[HEADER_SIZE..];
        let ip = match ip_len {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(ip_bytes);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(ip_bytes);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(CryptoError::MalformedCredential("unsupported address length")),
        };

        Ok(CredentialClaims {
            user_id: read_u64(0),
            peer_id: read_u64(8),
            ip,
            expires_at,
        })
    }
}

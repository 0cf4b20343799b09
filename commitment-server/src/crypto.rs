//! Hashing and key material used by the verification engine.
//!
//! The engine only needs two things from cryptography: a slow one-way hash it
//! can compare candidate secrets against, and a pair of opaque key references
//! handed back to the prover and the verifier. Both sit behind traits so tests
//! can swap in cheap or failing implementations.

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{SECRET_KEY_LENGTH, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{CommitmentError, Result};

/// Key references longer than this are truncated before they are stored or
/// handed out. Clients compare references byte for byte, so the cap is part of
/// the wire format.
pub const MAX_KEY_REF_LEN: usize = 200;

pub const DEFAULT_HASH_ITERATIONS: u32 = 10_000;
pub const MIN_HASH_ITERATIONS: u32 = 1_000;

const HASH_SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const OUTPUT_LEN: usize = 32;
const PEM_LINE_WIDTH: usize = 64;

/// Cost-parameterized one-way hash over secrets.
pub trait SecretHasher: Send + Sync {
    fn hash(&self, secret: &str) -> Result<String>;

    /// Returns `true` only when `secret` hashes to `hash`. A hash that cannot
    /// be parsed never matches.
    fn verify(&self, secret: &str, hash: &str) -> bool;
}

/// PBKDF2-HMAC-SHA256 with a random salt per secret.
///
/// The encoded form carries the iteration count, so hashes produced with one
/// cost setting still verify after the setting changes.
#[derive(Debug, Clone)]
pub struct Pbkdf2Hasher {
    iterations: u32,
}

impl Pbkdf2Hasher {
    pub fn new(iterations: u32) -> Result<Self> {
        if iterations < MIN_HASH_ITERATIONS {
            return Err(CommitmentError::CryptoFailure(format!(
                "hash iterations must be at least {MIN_HASH_ITERATIONS}, got {iterations}"
            )));
        }
        Ok(Self { iterations })
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl Default for Pbkdf2Hasher {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_HASH_ITERATIONS,
        }
    }
}

impl SecretHasher for Pbkdf2Hasher {
    fn hash(&self, secret: &str) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|err| CommitmentError::CryptoFailure(err.to_string()))?;

        let derived = pbkdf2_sha256(secret.as_bytes(), &salt, self.iterations)?;
        Ok(format!(
            "${HASH_SCHEME}$i={}${}${}",
            self.iterations,
            hex::encode(salt),
            hex::encode(derived)
        ))
    }

    fn verify(&self, secret: &str, hash: &str) -> bool {
        let Some(parsed) = ParsedHash::parse(hash) else {
            return false;
        };
        match pbkdf2_sha256(secret.as_bytes(), &parsed.salt, parsed.iterations) {
            Ok(derived) => derived.as_slice().ct_eq(parsed.derived.as_slice()).into(),
            Err(_) => false,
        }
    }
}

struct ParsedHash {
    iterations: u32,
    salt: Vec<u8>,
    derived: Vec<u8>,
}

impl ParsedHash {
    // `$pbkdf2-sha256$i=<iterations>$<salt hex>$<hash hex>`
    fn parse(encoded: &str) -> Option<Self> {
        let mut parts = encoded.split('$');
        if !parts.next()?.is_empty() || parts.next()? != HASH_SCHEME {
            return None;
        }
        let iterations = parts.next()?.strip_prefix("i=")?.parse().ok()?;
        let salt = hex::decode(parts.next()?).ok()?;
        let derived = hex::decode(parts.next()?).ok()?;
        if parts.next().is_some() || iterations == 0 || derived.len() != OUTPUT_LEN {
            return None;
        }
        Some(Self {
            iterations,
            salt,
            derived,
        })
    }
}

/// Single-block PBKDF2: the output length equals the SHA-256 digest size.
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; OUTPUT_LEN]> {
    let prf = Hmac::<Sha256>::new_from_slice(password)
        .map_err(|err| CommitmentError::CryptoFailure(err.to_string()))?;

    // U_1 = PRF(password, salt || INT(1))
    let mut mac = prf.clone();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u = [0u8; OUTPUT_LEN];
    u.copy_from_slice(&mac.finalize().into_bytes());
    let mut result = u;

    // U_n = PRF(password, U_{n-1}), folded into the result with xor
    for _ in 1..iterations {
        let mut mac = prf.clone();
        mac.update(&u);
        u.copy_from_slice(&mac.finalize().into_bytes());
        for (res_byte, u_byte) in result.iter_mut().zip(u.iter()) {
            *res_byte ^= u_byte;
        }
    }

    Ok(result)
}

/// The two opaque capability tokens returned from a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReferences {
    pub prover: String,
    pub verifier: String,
}

impl KeyReferences {
    /// Flattens PEM text into single-line references capped at
    /// [`MAX_KEY_REF_LEN`] characters.
    pub fn from_pem(prover_pem: &str, verifier_pem: &str) -> Self {
        Self {
            prover: flatten_key_ref(prover_pem),
            verifier: flatten_key_ref(verifier_pem),
        }
    }
}

fn flatten_key_ref(pem: &str) -> String {
    pem.chars()
        .filter(|c| !matches!(c, '\n' | '\r'))
        .take(MAX_KEY_REF_LEN)
        .collect()
}

/// Source of fresh asymmetric key material.
pub trait KeyPairGenerator: Send + Sync {
    fn generate(&self) -> Result<KeyReferences>;
}

/// Ed25519 key pairs: the PKCS#8 private key becomes the prover reference and
/// the SPKI public key becomes the verifier reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519KeyGenerator;

impl KeyPairGenerator for Ed25519KeyGenerator {
    fn generate(&self) -> Result<KeyReferences> {
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|err| CommitmentError::CryptoFailure(err.to_string()))?;
        let signing_key = SigningKey::from_bytes(&seed);

        let prover_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| CommitmentError::CryptoFailure(err.to_string()))?;
        let verifier_pem = encode_verifier_pem(&signing_key.verifying_key())?;

        let refs = KeyReferences::from_pem(&prover_pem, &verifier_pem);
        validate_key_refs(&refs)?;
        Ok(refs)
    }
}

fn encode_verifier_pem(verifying_key: &VerifyingKey) -> Result<String> {
    verifying_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|err| CommitmentError::CryptoFailure(err.to_string()))
}

/// Decodes a prover reference back into the signing key it was made from.
pub fn decode_prover_key_ref(key_ref: &str) -> Result<SigningKey> {
    let pem = restore_pem(key_ref)?;
    SigningKey::from_pkcs8_pem(&pem)
        .map_err(|err| CommitmentError::CryptoFailure(err.to_string()))
}

/// Decodes a verifier reference back into its public key.
pub fn decode_verifier_key_ref(key_ref: &str) -> Result<VerifyingKey> {
    let pem = restore_pem(key_ref)?;
    VerifyingKey::from_public_key_pem(&pem)
        .map_err(|err| CommitmentError::CryptoFailure(err.to_string()))
}

/// Both references must decode, and the prover key must derive the verifier
/// key, before a pair is handed out.
fn validate_key_refs(refs: &KeyReferences) -> Result<()> {
    let signing_key = decode_prover_key_ref(&refs.prover)?;
    let verifying_key = decode_verifier_key_ref(&refs.verifier)?;
    let derived = flatten_key_ref(&encode_verifier_pem(&signing_key.verifying_key())?);

    if signing_key.verifying_key() != verifying_key || derived != refs.verifier {
        return Err(CommitmentError::CryptoFailure(
            "key references do not form a pair".to_string(),
        ));
    }
    Ok(())
}

/// Puts the line breaks a flattened reference lost back into PEM armor,
/// wrapping the body at 64 columns.
fn restore_pem(key_ref: &str) -> Result<String> {
    let malformed = || CommitmentError::CryptoFailure("malformed key reference".to_string());

    let rest = key_ref.strip_prefix("-----BEGIN ").ok_or_else(malformed)?;
    let label_end = rest.find("-----").ok_or_else(malformed)?;
    let label = &rest[..label_end];
    let footer = format!("-----END {label}-----");
    let body = rest[label_end + "-----".len()..]
        .strip_suffix(footer.as_str())
        .ok_or_else(malformed)?;
    if body.is_empty() {
        return Err(malformed());
    }

    let chars: Vec<char> = body.chars().collect();
    let lines: Vec<String> = chars
        .chunks(PEM_LINE_WIDTH)
        .map(|line| line.iter().collect())
        .collect();
    Ok(format!(
        "-----BEGIN {label}-----\n{}\n{footer}\n",
        lines.join("\n")
    ))
}

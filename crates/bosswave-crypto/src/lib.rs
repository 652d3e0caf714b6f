//! Ed25519 and SHA-256 primitives shared by every BOSSWAVE object.
//!
//! All identities on the bus are 32-byte Ed25519 verifying keys and every
//! signed object carries a 64-byte signature over the bytes preceding it.
//! This crate wraps `ed25519-dalek` and `sha2` behind the small fixed-size
//! types the codec and capability engine work with.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use rand::CryptoRng;
use rand::RngCore;
use sha2::Digest;
use sha2::Sha256;

/// Length of a verifying key in bytes.
pub const VK_LEN: usize = 32;
/// Length of a signing key in bytes.
pub const SK_LEN: usize = 32;
/// Length of a signature in bytes.
pub const SIG_LEN: usize = 64;
/// Length of a SHA-256 hash in bytes.
pub const HASH_LEN: usize = 32;

/// A 32-byte Ed25519 verifying key naming an identity or a namespace.
///
/// The default value is the all-zero [`EVERYBODY`] sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Vk(pub [u8; VK_LEN]);

/// The all-zero "everybody" VK: an open-grant receiver sentinel.
pub const EVERYBODY: Vk = Vk([0u8; VK_LEN]);

impl Vk {
    /// Interpret a byte slice as a VK. Returns `None` unless it is exactly
    /// 32 bytes.
    pub fn from_slice(b: &[u8]) -> Option<Vk> {
        let arr: [u8; VK_LEN] = b.try_into().ok()?;
        Some(Vk(arr))
    }

    /// True if this is the all-zero everybody sentinel.
    pub fn is_everybody(&self) -> bool {
        *self == EVERYBODY
    }

    pub fn as_bytes(&self) -> &[u8; VK_LEN] {
        &self.0
    }

    /// Render in the base64url form used in topics and logs.
    pub fn to_base64(&self) -> String {
        URL_SAFE.encode(self.0)
    }

    /// Parse the base64url form.
    pub fn from_base64(s: &str) -> Option<Vk> {
        let bytes = URL_SAFE.decode(s).ok()?;
        Vk::from_slice(&bytes)
    }
}

impl std::fmt::Debug for Vk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Vk({})", self.to_base64())
    }
}

impl std::fmt::Display for Vk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// A 32-byte SHA-256 digest identifying a DOT or a chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjHash(pub [u8; HASH_LEN]);

impl ObjHash {
    pub fn from_slice(b: &[u8]) -> Option<ObjHash> {
        let arr: [u8; HASH_LEN] = b.try_into().ok()?;
        Some(ObjHash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE.encode(self.0)
    }
}

impl std::fmt::Debug for ObjHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjHash({})", self.to_base64())
    }
}

impl std::fmt::Display for ObjHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// SHA-256 of a byte slice.
pub fn sha256(data: &[u8]) -> ObjHash {
    let digest = Sha256::digest(data);
    ObjHash(digest.into())
}

/// Sign `data` with the secret key `sk` (whose public half must be `vk`).
///
/// Returns the 64-byte signature, or `None` if `sk` does not produce `vk` —
/// signing with a mismatched pair would mint unverifiable objects.
pub fn sign_blob(sk: &[u8; SK_LEN], vk: &Vk, data: &[u8]) -> Option<[u8; SIG_LEN]> {
    let signing = SigningKey::from_bytes(sk);
    if signing.verifying_key().to_bytes() != vk.0 {
        return None;
    }
    Some(signing.sign(data).to_bytes())
}

/// Verify a signature over `data` with the given VK.
///
/// Any failure (malformed key, bad signature) is reported as `false`;
/// untrusted wire input must never panic the verifier.
pub fn verify_blob(vk: &Vk, sig: &[u8], data: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(&vk.0) else {
        return false;
    };
    let Ok(sig) = <[u8; SIG_LEN]>::try_from(sig) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig);
    key.verify(data, &sig).is_ok()
}

/// An Ed25519 keypair held by a local signing entity.
#[derive(Clone)]
pub struct Keypair {
    sk: [u8; SK_LEN],
    vk: Vk,
}

impl Keypair {
    /// Generate a fresh keypair from the given RNG.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Keypair {
        let signing = SigningKey::generate(rng);
        Keypair {
            sk: signing.to_bytes(),
            vk: Vk(signing.verifying_key().to_bytes()),
        }
    }

    /// Reconstruct a keypair from a stored secret key, checking that it
    /// produces the expected VK.
    pub fn from_parts(sk: [u8; SK_LEN], vk: Vk) -> Option<Keypair> {
        let signing = SigningKey::from_bytes(&sk);
        if signing.verifying_key().to_bytes() != vk.0 {
            return None;
        }
        Some(Keypair { sk, vk })
    }

    pub fn vk(&self) -> Vk {
        self.vk
    }

    pub fn sk(&self) -> &[u8; SK_LEN] {
        &self.sk
    }

    /// Sign `data` with this keypair.
    pub fn sign(&self, data: &[u8]) -> [u8; SIG_LEN] {
        SigningKey::from_bytes(&self.sk).sign(data).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak the secret half.
        f.debug_struct("Keypair").field("vk", &self.vk).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn keypair() -> Keypair {
        Keypair::generate(&mut StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = keypair();
        let sig = kp.sign(b"hello bus");
        assert!(verify_blob(&kp.vk(), &sig, b"hello bus"));
        assert!(!verify_blob(&kp.vk(), &sig, b"hello bu5"));
    }

    #[test]
    fn test_sign_blob_rejects_mismatched_pair() {
        let kp = keypair();
        let other = Keypair::generate(&mut StdRng::seed_from_u64(8));
        assert!(sign_blob(kp.sk(), &other.vk(), b"data").is_none());
        assert!(sign_blob(kp.sk(), &kp.vk(), b"data").is_some());
    }

    #[test]
    fn test_verify_malformed_inputs() {
        let kp = keypair();
        // Short signature.
        assert!(!verify_blob(&kp.vk(), &[0u8; 10], b"data"));
        // Signature of zeros.
        assert!(!verify_blob(&kp.vk(), &[0u8; 64], b"data"));
    }

    #[test]
    fn test_vk_base64_roundtrip() {
        let kp = keypair();
        let s = kp.vk().to_base64();
        assert_eq!(Vk::from_base64(&s), Some(kp.vk()));
    }

    #[test]
    fn test_everybody_sentinel() {
        assert!(EVERYBODY.is_everybody());
        assert!(!keypair().vk().is_everybody());
    }

    #[test]
    fn test_sha256_stable() {
        let h1 = sha256(b"abc");
        let h2 = sha256(b"abc");
        assert_eq!(h1, h2);
        assert_ne!(h1, sha256(b"abd"));
    }
}

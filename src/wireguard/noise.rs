//! Cryptographic building blocks of Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s
//!
//! BLAKE2s hashing and keyed MACs, the HMAC-based KDF, ChaCha20-Poly1305
//! for handshake and transport payloads, XChaCha20-Poly1305 for cookies,
//! and X25519. [`SymmetricState`] carries the chaining key and transcript
//! hash through a handshake.

use blake2::digest::{consts::U16, FixedOutput, Mac};
use blake2::{Blake2s256, Blake2sMac, Digest};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};
use hmac::SimpleHmac;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";
pub const LABEL_MAC1: &[u8] = b"mac1----";
pub const LABEL_COOKIE: &[u8] = b"cookie--";

pub const KEY_LEN: usize = 32;
pub const HASH_LEN: usize = 32;
pub const MAC_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const XNONCE_LEN: usize = 24;

type HmacBlake2s = SimpleHmac<Blake2s256>;

/// BLAKE2s-256 over the concatenation of `parts`
pub fn hash(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

/// Keyed BLAKE2s with a 16-byte output. Used for MAC1 (32-byte key) and
/// MAC2 (16-byte cookie as key).
pub fn mac(key: &[u8], data: &[u8]) -> Result<[u8; MAC_LEN], CryptoError> {
    let mut mac = <Blake2sMac<U16> as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    Mac::update(&mut mac, data);
    Ok(mac.finalize_fixed().into())
}

fn hmac(key: &[u8], parts: &[&[u8]]) -> Result<[u8; HASH_LEN], CryptoError> {
    let mut mac =
        <HmacBlake2s as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    for part in parts {
        Mac::update(&mut mac, part);
    }
    Ok(mac.finalize_fixed().into())
}

/// HKDF over HMAC-BLAKE2s producing `N` chained outputs.
///
/// `T0 = HMAC(key, input)`, `T1 = HMAC(T0, 0x1)`,
/// `Ti = HMAC(T0, T(i-1) || i)`.
pub fn kdf<const N: usize>(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> Result<[[u8; HASH_LEN]; N], CryptoError> {
    let prk = hmac(key, &[input])?;
    let mut out = [[0u8; HASH_LEN]; N];
    for i in 0..N {
        let counter = [(i + 1) as u8];
        out[i] = if i == 0 {
            hmac(&prk, &[&counter])?
        } else {
            hmac(&prk, &[&out[i - 1], &counter])?
        };
    }
    Ok(out)
}

fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// ChaCha20-Poly1305 with the 64-bit little-endian counter as nonce
pub fn seal(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);
    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

pub fn open(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}

/// XChaCha20-Poly1305 decryption, used for cookie replies
pub fn xopen(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}

/// Public half of an X25519 private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    PublicKey::from(&StaticSecret::from(*private_key)).to_bytes()
}

/// Fresh X25519 key pair from the OS RNG
pub fn ephemeral_keypair() -> (StaticSecret, [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    (secret, public)
}

/// X25519 Diffie-Hellman. Low-order peer points are rejected.
pub fn dh(secret: &StaticSecret, peer_public: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN], CryptoError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    if !shared.was_contributory() {
        return Err(CryptoError::WeakPublicKey);
    }
    Ok(shared.to_bytes())
}

/// Chaining key and transcript hash of a handshake in progress
#[derive(Clone)]
pub struct SymmetricState {
    pub chaining_key: [u8; HASH_LEN],
    pub hash: [u8; HASH_LEN],
}

impl SymmetricState {
    /// Both sides start from the responder's static public key
    pub fn new(responder_public: &[u8; KEY_LEN]) -> Self {
        let chaining_key = hash(&[CONSTRUCTION]);
        let hash_value = hash(&[&hash(&[&chaining_key, IDENTIFIER]), responder_public]);
        Self {
            chaining_key,
            hash: hash_value,
        }
    }

    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = hash(&[&self.hash, data]);
    }

    /// Absorb an ephemeral public key into both the transcript and the
    /// chaining key
    pub fn mix_ephemeral(&mut self, ephemeral_public: &[u8; KEY_LEN]) -> Result<(), CryptoError> {
        self.mix_hash(ephemeral_public);
        let [ck] = kdf::<1>(&self.chaining_key, ephemeral_public)?;
        self.chaining_key = ck;
        Ok(())
    }

    pub fn mix_key(&mut self, input: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let [ck, key] = kdf::<2>(&self.chaining_key, input)?;
        self.chaining_key = ck;
        Ok(key)
    }

    /// Pre-shared key step: `(ck, tau, k) = KDF3(ck, psk)`, `h = HASH(h || tau)`
    pub fn mix_key_and_hash(&mut self, psk: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN], CryptoError> {
        let [ck, tau, key] = kdf::<3>(&self.chaining_key, psk)?;
        self.chaining_key = ck;
        self.mix_hash(&tau);
        Ok(key)
    }

    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; KEY_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = seal(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; KEY_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = open(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Split the final chaining key into (initiator→responder,
    /// responder→initiator) transport keys
    pub fn split(&self) -> Result<([u8; KEY_LEN], [u8; KEY_LEN]), CryptoError> {
        let [first, second] = kdf::<2>(&self.chaining_key, &[])?;
        Ok((first, second))
    }
}

/// `HASH(LABEL_MAC1 || public_key)`
pub fn mac1_key(public_key: &[u8; KEY_LEN]) -> [u8; HASH_LEN] {
    hash(&[LABEL_MAC1, public_key])
}

/// `HASH(LABEL_COOKIE || public_key)`
pub fn cookie_key(public_key: &[u8; KEY_LEN]) -> [u8; HASH_LEN] {
    hash(&[LABEL_COOKIE, public_key])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_concatenates_parts() {
        assert_eq!(hash(&[b"hello", b"world"]), hash(&[b"helloworld"]));
        assert_ne!(hash(&[b"hello"]), hash(&[b"world"]));
    }

    #[test]
    fn test_initial_chaining_key() {
        // Well-known value of HASH("Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s")
        let state = SymmetricState::new(&[0u8; 32]);
        assert_eq!(
            hex::encode(state.chaining_key),
            "60e26daef327efc02ec335e2a025d2d016eb4206f87277f52d38d1988b78cd36"
        );
    }

    #[test]
    fn test_mac_accepts_cookie_sized_key() {
        assert!(mac(&[7u8; 16], b"data").is_ok());
        assert!(mac(&[7u8; 32], b"data").is_ok());
        assert!(mac(&[7u8; 33], b"data").is_err());
    }

    #[test]
    fn test_kdf_first_output_is_shared() {
        let key = [3u8; 32];
        let [one] = kdf::<1>(&key, b"input").unwrap();
        let [two_a, two_b] = kdf::<2>(&key, b"input").unwrap();
        let [three_a, three_b, three_c] = kdf::<3>(&key, b"input").unwrap();

        assert_eq!(one, two_a);
        assert_eq!(two_a, three_a);
        assert_eq!(two_b, three_b);
        assert_ne!(three_b, three_c);
    }

    #[test]
    fn test_seal_open() {
        let key = [9u8; 32];
        let sealed = seal(&key, 7, b"payload", b"aad").unwrap();
        assert_eq!(sealed.len(), 7 + TAG_LEN);
        assert_eq!(open(&key, 7, &sealed, b"aad").unwrap(), b"payload");
        assert!(open(&key, 8, &sealed, b"aad").is_err());
        assert!(open(&key, 7, &sealed, b"other").is_err());
        assert!(open(&key, 7, &sealed[..4], b"aad").is_err());
    }

    #[test]
    fn test_dh_agrees() {
        let (a, a_pub) = ephemeral_keypair();
        let (b, b_pub) = ephemeral_keypair();
        assert_eq!(dh(&a, &b_pub).unwrap(), dh(&b, &a_pub).unwrap());
    }

    #[test]
    fn test_dh_rejects_zero_point() {
        let (a, _) = ephemeral_keypair();
        assert!(matches!(dh(&a, &[0u8; 32]), Err(CryptoError::WeakPublicKey)));
    }

    #[test]
    fn test_public_key_matches_keypair() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let expected = PublicKey::from(&secret).to_bytes();
        assert_eq!(public_key(&secret.to_bytes()), expected);
    }

    #[test]
    fn test_encrypt_decrypt_and_hash_keep_transcripts_equal() {
        let mut a = SymmetricState::new(&[1u8; 32]);
        let mut b = a.clone();
        let key = [5u8; 32];

        let ciphertext = a.encrypt_and_hash(&key, b"static").unwrap();
        assert_eq!(b.decrypt_and_hash(&key, &ciphertext).unwrap(), b"static");
        assert_eq!(a.hash, b.hash);
    }
}

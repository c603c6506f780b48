//! Elliptic curve and randomness capabilities consumed by the handshake.
//!
//! Both are traits so deterministic implementations can be injected.

use crate::{errors::ECIESError, util::*};
use aes::cipher::{KeyIvInit, StreamCipher};
use byteorder::{BigEndian, ByteOrder};
use ethereum_types::{H256, H520};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256};
use std::{fmt::Debug, ops::Range, sync::Arc};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

const PUBLIC_KEY_LEN: usize = 65;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Bytes an ECIES message adds on top of its plaintext, excluding the size prefix.
pub const ECIES_OVERHEAD: usize = PUBLIC_KEY_LEN + IV_LEN + TAG_LEN;

pub trait RandomSource: Debug + Send + Sync {
    fn random_bytes(&self, len: usize) -> Vec<u8>;
    /// Uniform value from `range`, which must not be empty.
    fn random_range(&self, range: Range<usize>) -> usize;
    fn random_key(&self) -> SigningKey;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0_u8; len];
        OsRng.fill_bytes(&mut out);
        out
    }

    fn random_range(&self, range: Range<usize>) -> usize {
        OsRng.gen_range(range)
    }

    fn random_key(&self) -> SigningKey {
        SigningKey::random(&mut OsRng)
    }
}

pub trait Crypto: Debug + Send + Sync {
    /// X coordinate of the ECDH shared point.
    fn ecdh_agree(&self, secret_key: &SigningKey, public_key: &VerifyingKey) -> H256;

    /// Recoverable signature over a prehashed 32-byte message, `r ‖ s ‖ v`.
    fn sign(&self, secret_key: &SigningKey, message: H256) -> Result<H520, ECIESError>;

    fn recover(&self, signature: &H520, message: H256) -> Result<VerifyingKey, ECIESError>;

    /// Size-prefixed ECIES encryption to `public_key`.
    fn ecies_encrypt(
        &self,
        public_key: &VerifyingKey,
        data: &[u8],
        random: &dyn RandomSource,
    ) -> Result<Vec<u8>, ECIESError>;

    /// Reverses [`Crypto::ecies_encrypt`]. `data` includes the two-byte size prefix.
    fn ecies_decrypt(&self, secret_key: &SigningKey, data: &[u8]) -> Result<Vec<u8>, ECIESError>;
}

/// The crypto and randomness providers a session is built with.
#[derive(Clone, Debug)]
pub struct CryptoContext {
    pub crypto: Arc<dyn Crypto>,
    pub random: Arc<dyn RandomSource>,
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self {
            crypto: Arc::new(Secp256k1Crypto),
            random: Arc::new(OsRandom),
        }
    }
}

fn kdf(secret: H256, s1: &[u8], dest: &mut [u8]) {
    // NIST SP 800-56 concatenation KDF with a 4-byte counter.
    let mut ctr = 1_u32;
    let mut written = 0_usize;
    while written < dest.len() {
        let mut hasher = Sha256::default();
        hasher.update(ctr.to_be_bytes());
        hasher.update(secret.as_bytes());
        hasher.update(s1);
        let d = hasher.finalize();
        let take = (dest.len() - written).min(d.len());
        dest[written..written + take].copy_from_slice(&d[..take]);
        written += take;
        ctr += 1;
    }
}

fn derive_keys(shared: H256) -> ([u8; 16], H256) {
    let mut key = [0_u8; 32];
    kdf(shared, &[], &mut key);
    let mut enc_key = [0_u8; 16];
    enc_key.copy_from_slice(&key[..16]);
    (enc_key, sha256(&key[16..32]))
}

/// secp256k1 backed by `k256`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Secp256k1Crypto;

impl Crypto for Secp256k1Crypto {
    fn ecdh_agree(&self, secret_key: &SigningKey, public_key: &VerifyingKey) -> H256 {
        let shared = k256::ecdh::diffie_hellman(secret_key.as_nonzero_scalar(), public_key.as_affine());
        H256::from_slice(shared.raw_secret_bytes())
    }

    fn sign(&self, secret_key: &SigningKey, message: H256) -> Result<H520, ECIESError> {
        let (signature, recovery_id) = secret_key.sign_prehash_recoverable(message.as_bytes())?;
        let mut out = H520::zero();
        out.as_bytes_mut()[..64].copy_from_slice(&signature.to_bytes());
        out.as_bytes_mut()[64] = recovery_id.to_byte();
        Ok(out)
    }

    fn recover(&self, signature: &H520, message: H256) -> Result<VerifyingKey, ECIESError> {
        let recovery_id = RecoveryId::from_byte(signature[64]).ok_or(ECIESError::InvalidAuthData)?;
        let signature = Signature::from_slice(&signature[..64])?;
        Ok(VerifyingKey::recover_from_prehash(
            message.as_bytes(),
            &signature,
            recovery_id,
        )?)
    }

    fn ecies_encrypt(
        &self,
        public_key: &VerifyingKey,
        data: &[u8],
        random: &dyn RandomSource,
    ) -> Result<Vec<u8>, ECIESError> {
        let total = data.len() + ECIES_OVERHEAD;
        let size = u16::try_from(total).map_err(|_| ECIESError::MessageTooLarge(total))?;
        let mut prefix = [0_u8; 2];
        BigEndian::write_u16(&mut prefix, size);

        let ephemeral_key = random.random_key();
        let (enc_key, mac_key) = derive_keys(self.ecdh_agree(&ephemeral_key, public_key));

        let iv = random.random_bytes(IV_LEN);
        let mut encrypted = data.to_vec();
        let mut encryptor = Aes128Ctr::new((&enc_key[..]).into(), iv.as_slice().into());
        encryptor.apply_keystream(&mut encrypted);

        let tag = hmac_sha256(mac_key.as_bytes(), &[iv.as_slice(), encrypted.as_slice()], &prefix);

        let mut out = Vec::with_capacity(2 + total);
        out.extend_from_slice(&prefix);
        out.extend_from_slice(ephemeral_key.verifying_key().to_encoded_point(false).as_bytes());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&encrypted);
        out.extend_from_slice(tag.as_bytes());
        Ok(out)
    }

    fn ecies_decrypt(&self, secret_key: &SigningKey, data: &[u8]) -> Result<Vec<u8>, ECIESError> {
        if data.len() < 2 + ECIES_OVERHEAD {
            return Err(ECIESError::TagCheckFailed);
        }
        let (prefix, encrypted) = data.split_at(2);
        if usize::from(BigEndian::read_u16(prefix)) != encrypted.len() {
            return Err(ECIESError::TagCheckFailed);
        }

        let public_key = VerifyingKey::from_sec1_bytes(&encrypted[..PUBLIC_KEY_LEN])
            .map_err(|_| ECIESError::InvalidPublicKey)?;
        let iv = &encrypted[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + IV_LEN];
        let cipher = &encrypted[PUBLIC_KEY_LEN + IV_LEN..encrypted.len() - TAG_LEN];
        let tag = H256::from_slice(&encrypted[encrypted.len() - TAG_LEN..]);

        let (enc_key, mac_key) = derive_keys(self.ecdh_agree(secret_key, &public_key));
        if hmac_sha256(mac_key.as_bytes(), &[iv, cipher], prefix) != tag {
            return Err(ECIESError::TagCheckFailed);
        }

        let mut decrypted = cipher.to_vec();
        let mut decryptor = Aes128Ctr::new((&enc_key[..]).into(), iv.into());
        decryptor.apply_keystream(&mut decrypted);
        Ok(decrypted)
    }
}

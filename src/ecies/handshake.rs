use super::mac::MAC;
use crate::{
    crypto::CryptoContext,
    errors::ECIESError,
    rlp::{self, Decodable, DecoderError, Encodable, RlpElement, RlpStream},
    types::PeerId,
    util::{id2pk, keccak256, keccak256_concat, pk2id},
};
use derivative::Derivative;
use ethereum_types::{H256, H520};
use k256::ecdsa::{SigningKey, VerifyingKey};
use std::{ops::Range, sync::Arc};
use tracing::*;

const NONCE_LEN: usize = 32;
const HANDSHAKE_VERSION: u64 = 4;
const PADDING_LEN: Range<usize> = 100..300;

/// Plaintext of the initiator's first handshake message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthMessage {
    pub signature: H520,
    pub public_key: PeerId,
    pub nonce: H256,
    pub version: u64,
}

impl Encodable for AuthMessage {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.signature);
        s.append(&self.public_key);
        s.append(&self.nonce);
        s.append(&self.version);
    }
}

impl Decodable for AuthMessage {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        Ok(Self {
            signature: rlp.val_at(0)?,
            public_key: rlp.val_at(1)?,
            nonce: rlp.val_at(2)?,
            version: rlp.val_at(3)?,
        })
    }
}

/// Plaintext of the recipient's reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthAckMessage {
    pub ephemeral_public_key: PeerId,
    pub nonce: H256,
    pub version: u64,
}

impl Encodable for AuthAckMessage {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.ephemeral_public_key);
        s.append(&self.nonce);
        s.append(&self.version);
    }
}

impl Decodable for AuthAckMessage {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        Ok(Self {
            ephemeral_public_key: rlp.val_at(0)?,
            nonce: rlp.val_at(1)?,
            version: rlp.val_at(2)?,
        })
    }
}

/// Session keys and the two MAC streams derived by a finished handshake.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Secrets {
    #[derivative(Debug = "ignore")]
    pub aes: H256,
    #[derivative(Debug = "ignore")]
    pub mac: H256,
    #[derivative(Debug = "ignore")]
    pub token: H256,
    pub egress_mac: MAC,
    pub ingress_mac: MAC,
}

/// One side of the RLPx ECIES handshake.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct EncryptionHandshake {
    context: CryptoContext,
    initiator: bool,

    #[derivative(Debug = "ignore")]
    secret_key: Arc<SigningKey>,
    #[derivative(Debug = "ignore")]
    ephemeral_key: SigningKey,
    nonce: H256,

    remote_id: Option<PeerId>,
    remote_public_key: Option<VerifyingKey>,
    remote_ephemeral_public_key: Option<VerifyingKey>,
    remote_nonce: Option<H256>,

    #[derivative(Debug = "ignore")]
    init_msg: Option<Vec<u8>>,
    #[derivative(Debug = "ignore")]
    remote_init_msg: Option<Vec<u8>>,
}

impl EncryptionHandshake {
    /// Initiator side, dialing `remote_id`.
    pub fn new_client(
        context: CryptoContext,
        secret_key: Arc<SigningKey>,
        remote_id: PeerId,
    ) -> Result<Self, ECIESError> {
        let remote_public_key = id2pk(remote_id).map_err(|_| ECIESError::InvalidPublicKey)?;
        let mut handshake = Self::new(context, secret_key, true);
        handshake.remote_id = Some(remote_id);
        handshake.remote_public_key = Some(remote_public_key);
        Ok(handshake)
    }

    /// Recipient side, waiting for an auth message.
    pub fn new_server(context: CryptoContext, secret_key: Arc<SigningKey>) -> Self {
        Self::new(context, secret_key, false)
    }

    fn new(context: CryptoContext, secret_key: Arc<SigningKey>, initiator: bool) -> Self {
        let ephemeral_key = context.random.random_key();
        let nonce = H256::from_slice(&context.random.random_bytes(NONCE_LEN));
        Self {
            context,
            initiator,
            secret_key,
            ephemeral_key,
            nonce,
            remote_id: None,
            remote_public_key: None,
            remote_ephemeral_public_key: None,
            remote_nonce: None,
            init_msg: None,
            remote_init_msg: None,
        }
    }

    pub const fn remote_id(&self) -> Option<PeerId> {
        self.remote_id
    }

    pub const fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Builds, pads and encrypts the auth message. The returned bytes are
    /// retained to seed the egress MAC.
    pub fn create_auth_message(&mut self) -> Result<Vec<u8>, ECIESError> {
        let remote_public_key = self
            .remote_public_key
            .clone()
            .ok_or(ECIESError::InvalidPublicKey)?;

        let shared = self
            .context
            .crypto
            .ecdh_agree(&self.secret_key, &remote_public_key);
        let signature = self
            .context
            .crypto
            .sign(&self.ephemeral_key, shared ^ self.nonce)?;

        let message = AuthMessage {
            signature,
            public_key: pk2id(self.secret_key.verifying_key()),
            nonce: self.nonce,
            version: HANDSHAKE_VERSION,
        };
        trace!("auth message: {:?}", message);

        let encrypted = self.encrypt_padded(rlp::encode(&message), &remote_public_key)?;
        self.init_msg = Some(encrypted.clone());
        Ok(encrypted)
    }

    /// Decrypts the recipient's ack and derives the session secrets.
    pub fn extract_secrets(&mut self, ack: &[u8]) -> Result<Secrets, ECIESError> {
        let decrypted = self.context.crypto.ecies_decrypt(&self.secret_key, ack)?;
        let message = rlp::decode_val::<AuthAckMessage>(&decrypted)?;
        let remote_ephemeral_public_key =
            id2pk(message.ephemeral_public_key).map_err(|_| ECIESError::InvalidAckData)?;

        self.remote_ephemeral_public_key = Some(remote_ephemeral_public_key);
        self.remote_nonce = Some(message.nonce);
        self.remote_init_msg = Some(ack.to_vec());

        self.secrets()
    }

    /// Decrypts an initiator's auth message and recovers its ephemeral key.
    pub fn parse_auth(&mut self, auth: &[u8]) -> Result<PeerId, ECIESError> {
        let decrypted = self.context.crypto.ecies_decrypt(&self.secret_key, auth)?;
        let message = rlp::decode_val::<AuthMessage>(&decrypted)?;
        let remote_public_key =
            id2pk(message.public_key).map_err(|_| ECIESError::InvalidAuthData)?;

        let shared = self
            .context
            .crypto
            .ecdh_agree(&self.secret_key, &remote_public_key);
        let remote_ephemeral_public_key = self
            .context
            .crypto
            .recover(&message.signature, shared ^ message.nonce)?;

        self.remote_id = Some(message.public_key);
        self.remote_public_key = Some(remote_public_key);
        self.remote_ephemeral_public_key = Some(remote_ephemeral_public_key);
        self.remote_nonce = Some(message.nonce);
        self.remote_init_msg = Some(auth.to_vec());

        Ok(message.public_key)
    }

    /// Builds the encrypted ack for a parsed auth and derives the session secrets.
    pub fn create_ack(&mut self) -> Result<(Vec<u8>, Secrets), ECIESError> {
        let remote_public_key = self
            .remote_public_key
            .clone()
            .ok_or(ECIESError::InvalidAuthData)?;

        let message = AuthAckMessage {
            ephemeral_public_key: pk2id(self.ephemeral_key.verifying_key()),
            nonce: self.nonce,
            version: HANDSHAKE_VERSION,
        };
        let encrypted = self.encrypt_padded(rlp::encode(&message), &remote_public_key)?;
        self.init_msg = Some(encrypted.clone());

        Ok((encrypted, self.secrets()?))
    }

    fn encrypt_padded(
        &self,
        mut encoded: Vec<u8>,
        remote_public_key: &VerifyingKey,
    ) -> Result<Vec<u8>, ECIESError> {
        let random = &*self.context.random;
        let padding = random.random_range(PADDING_LEN);
        encoded.extend_from_slice(&random.random_bytes(padding));
        self.context
            .crypto
            .ecies_encrypt(remote_public_key, &encoded, random)
    }

    fn secrets(&self) -> Result<Secrets, ECIESError> {
        let missing = if self.initiator {
            ECIESError::InvalidAckData
        } else {
            ECIESError::InvalidAuthData
        };
        let (remote_ephemeral_public_key, remote_nonce, init_msg, remote_init_msg) = match (
            &self.remote_ephemeral_public_key,
            self.remote_nonce,
            &self.init_msg,
            &self.remote_init_msg,
        ) {
            (Some(key), Some(nonce), Some(init), Some(remote_init)) => {
                (key, nonce, init, remote_init)
            }
            _ => return Err(missing),
        };

        let ephemeral_shared = self
            .context
            .crypto
            .ecdh_agree(&self.ephemeral_key, remote_ephemeral_public_key);

        let (initiator_nonce, recipient_nonce) = if self.initiator {
            (self.nonce, remote_nonce)
        } else {
            (remote_nonce, self.nonce)
        };
        let nonces = keccak256_concat(&[recipient_nonce.as_bytes(), initiator_nonce.as_bytes()]);
        let shared = keccak256_concat(&[ephemeral_shared.as_bytes(), nonces.as_bytes()]);
        let aes = keccak256_concat(&[ephemeral_shared.as_bytes(), shared.as_bytes()]);
        let mac = keccak256_concat(&[ephemeral_shared.as_bytes(), aes.as_bytes()]);
        let token = keccak256(shared.as_bytes());

        let mut egress_mac = MAC::new(mac);
        egress_mac.update((mac ^ remote_nonce).as_bytes());
        egress_mac.update(init_msg);

        let mut ingress_mac = MAC::new(mac);
        ingress_mac.update((mac ^ self.nonce).as_bytes());
        ingress_mac.update(remote_init_msg);

        debug!("session secrets derived");
        Ok(Secrets {
            aes,
            mac,
            token,
            egress_mac,
            ingress_mac,
        })
    }
}

use aes::{
    cipher::{BlockEncrypt, KeyInit},
    Aes256, Block,
};
use derivative::Derivative;
use ethereum_types::{H128, H256};
use sha3::{Digest, Keccak256};

/// Running Keccak sponge whose digest authenticates one direction of a session.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct MAC {
    #[derivative(Debug = "ignore")]
    secret: H256,
    #[derivative(Debug = "ignore")]
    hasher: Keccak256,
}

impl MAC {
    pub fn new(secret: H256) -> Self {
        Self {
            secret,
            hasher: Keccak256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Absorbs an encrypted frame header and returns the header MAC.
    pub fn update_header(&mut self, data: &[u8]) -> H128 {
        self.update_mac(data)
    }

    /// Absorbs an encrypted frame body and returns the body MAC.
    pub fn update_body(&mut self, data: &[u8]) -> H128 {
        self.hasher.update(data);
        let seed = self.digest();
        self.update_mac(seed.as_bytes())
    }

    /// Encrypts the current digest under the MAC secret, XORs it with `seed`,
    /// absorbs the result and returns the new digest.
    pub fn update_mac(&mut self, seed: &[u8]) -> H128 {
        let mut block = Block::clone_from_slice(self.digest().as_bytes());
        Aes256::new(self.secret.as_bytes().into()).encrypt_block(&mut block);
        for (b, s) in block.iter_mut().zip(seed) {
            *b ^= s;
        }
        self.hasher.update(block);
        self.digest()
    }

    pub fn digest(&self) -> H128 {
        H128::from_slice(&self.hasher.clone().finalize()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::keccak256;

    #[test]
    fn digest_is_keccak_prefix() {
        let mut mac = MAC::new(H256::repeat_byte(1));
        mac.update(b"seed");
        mac.update(b"data");
        assert_eq!(
            mac.digest(),
            H128::from_slice(&keccak256(b"seeddata")[..16])
        );
    }

    #[test]
    fn both_sides_agree() {
        let mut egress = MAC::new(H256::repeat_byte(9));
        let mut ingress = egress.clone();

        let header = [0x42_u8; 16];
        assert_eq!(egress.update_header(&header), ingress.update_header(&header));
        let body = [0x17_u8; 48];
        assert_eq!(egress.update_body(&body), ingress.update_body(&body));

        let mut diverged = ingress.clone();
        diverged.update_header(&[0_u8; 16]);
        assert_ne!(diverged.digest(), egress.digest());
    }
}

//! Multi-recipient IES used to ship secret-key shares inside a contribution.
//!
//! One ephemeral scalar `r` is drawn per contribution. Recipient `i` derives
//! its blob key from `pk_i * r` (sender side) or `R * sk_i` (recipient side)
//! through HKDF-SHA256, and the blob is sealed with ChaCha20-Poly1305.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use group::Curve;
use hkdf::Hkdf;
use rand_core::RngCore;
use sha2::Sha256;

use crate::bls::{PublicKey, SecretKey};
use crate::encoding::{Reader, Writer};
use crate::types::{Error, Wire};

const SALT_IES: &[u8] = b"QUORUM-DKG-IES-V1";
const NONCE_LEN: usize = 12;
const SEALED_SHARE_LEN: usize = 32 + 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedContributions {
    pub ephemeral: PublicKey,
    pub iv_seed: [u8; 32],
    pub blobs: Vec<Vec<u8>>,
}

impl EncryptedContributions {
    /// Seals `shares[i]` to `recipients[i]`.
    pub fn encrypt<R: RngCore + ?Sized>(
        recipients: &[PublicKey],
        shares: &[SecretKey],
        rng: &mut R,
    ) -> Result<Self, Error> {
        if recipients.len() != shares.len() {
            return Err(Error::InvalidParams(format!(
                "{} recipients for {} shares",
                recipients.len(),
                shares.len()
            )));
        }
        let r = SecretKey::random(rng);
        let ephemeral = r.public_key();
        let mut iv_seed = [0u8; 32];
        rng.fill_bytes(&mut iv_seed);

        let mut blobs = Vec::with_capacity(shares.len());
        for (index, (pk, share)) in recipients.iter().zip(shares.iter()).enumerate() {
            let shared = PublicKey::from_point(*pk.point() * r.scalar());
            let cipher = blob_cipher(&shared, &ephemeral, index)?;
            let nonce = blob_nonce(&iv_seed, index);
            let blob = cipher.encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &share.to_bytes(),
                    aad: &(index as u32).to_be_bytes(),
                },
            )
            .map_err(|_| Error::CryptoError)?;
            blobs.push(blob);
        }
        Ok(Self {
            ephemeral,
            iv_seed,
            blobs,
        })
    }

    pub fn decrypt(&self, index: usize, recipient: &SecretKey) -> Result<SecretKey, Error> {
        let blob = self.blobs.get(index).ok_or(Error::DecryptionFailed)?;
        let shared = PublicKey::from_point(*self.ephemeral.point() * recipient.scalar());
        let cipher = blob_cipher(&shared, &self.ephemeral, index)?;
        let nonce = blob_nonce(&self.iv_seed, index);
        let plain = cipher.decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: blob,
                aad: &(index as u32).to_be_bytes(),
            },
        )?;
        SecretKey::from_bytes(&plain).map_err(|_| Error::DecryptionFailed)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

fn blob_cipher(
    shared: &PublicKey,
    ephemeral: &PublicKey,
    index: usize,
) -> Result<ChaCha20Poly1305, Error> {
    let ikm = shared.point().to_affine().to_compressed();
    let hk = Hkdf::<Sha256>::new(Some(SALT_IES), &ikm);
    let mut info = Vec::with_capacity(96 + 4);
    info.extend_from_slice(&ephemeral.to_bytes());
    info.extend_from_slice(&(index as u32).to_be_bytes());
    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&okm)))
}

fn blob_nonce(iv_seed: &[u8; 32], index: usize) -> [u8; NONCE_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(iv_seed);
    hasher.update(&(index as u32).to_be_bytes());
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&hasher.finalize().as_bytes()[..NONCE_LEN]);
    nonce
}

impl Wire for EncryptedContributions {
    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.raw(&self.ephemeral.to_bytes()).raw(&self.iv_seed);
        w.len(self.blobs.len());
        for blob in &self.blobs {
            w.bytes(blob);
        }
        w.finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(bytes);
        let ephemeral = PublicKey::from_bytes(r.take(96)?)?;
        let iv_seed = r.array::<32>()?;
        let n = r.len(4)?;
        let mut blobs = Vec::with_capacity(n);
        for _ in 0..n {
            let blob = r.bytes()?;
            // Sealed shares have a fixed size; anything else cannot decrypt.
            if blob.len() != SEALED_SHARE_LEN {
                return Err(Error::InvalidEncoding);
            }
            blobs.push(blob);
        }
        r.finish()?;
        Ok(Self {
            ephemeral,
            iv_seed,
            blobs,
        })
    }
}

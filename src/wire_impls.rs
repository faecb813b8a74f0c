use crate::bls::{PublicKey, SecretKey, Signature};
use crate::encoding::{Reader, Writer};
use crate::types::{Error, QuorumParams, Wire};

impl Wire for SecretKey {
    fn encode(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        SecretKey::from_bytes(bytes)
    }
}

impl Wire for PublicKey {
    fn encode(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        PublicKey::from_bytes(bytes)
    }
}

impl Wire for Signature {
    fn encode(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Signature::from_bytes(bytes)
    }
}

impl Wire for QuorumParams {
    fn encode(&self) -> Vec<u8> {
        Writer::new()
            .u8(self.llmq_type)
            .bytes(self.name.as_bytes())
            .len(self.size)
            .len(self.min_size)
            .len(self.threshold)
            .len(self.bad_votes_threshold)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(bytes);
        let llmq_type = r.u8()?;
        let name = String::from_utf8(r.bytes()?).map_err(|_| Error::InvalidEncoding)?;
        let params = QuorumParams {
            llmq_type,
            name,
            size: r.u32()? as usize,
            min_size: r.u32()? as usize,
            threshold: r.u32()? as usize,
            bad_votes_threshold: r.u32()? as usize,
        };
        r.finish()?;
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    #[test]
    fn params_decode_rejects_trailing_bytes() {
        let mut bytes = QuorumParams::llmq_test().encode();
        assert_eq!(
            QuorumParams::decode(&bytes).expect("decode"),
            QuorumParams::llmq_test()
        );
        bytes.push(0);
        assert!(QuorumParams::decode(&bytes).is_err());
    }

    #[test]
    fn point_decoding_checks_length() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let pk = SecretKey::random(&mut rng).public_key();
        let bytes = pk.encode();
        assert!(PublicKey::decode(&bytes[..95]).is_err());
        assert!(Signature::decode(&bytes[..48]).is_err());
    }
}

//! Payload generation for signature cases.

use cryptoki_sys::{CK_ULONG, CKM_ECDSA};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha512};

use crate::mechanism::SignatureInfo;

/// Random bytes of random length in `[0, limit)`.
pub fn random_payload<R: Rng>(rng: &mut R, limit: usize) -> Vec<u8> {
    if limit == 0 {
        return Vec::new();
    }
    let len = rng.gen_range(0..limit);
    let mut payload = vec![0u8; len];
    rng.fill_bytes(&mut payload);
    payload
}

/// SHA-512 of a random payload. Raw ECDSA signs a precomputed digest.
pub fn ecdsa_digest<R: Rng>(rng: &mut R, limit: usize) -> Vec<u8> {
    Sha512::digest(random_payload(rng, limit)).to_vec()
}

pub fn payload_for<R: Rng>(
    info: &SignatureInfo,
    modulus_bits: CK_ULONG,
    rng: &mut R,
) -> Vec<u8> {
    let limit = info.max_data(modulus_bits);
    if info.mechanism == CKM_ECDSA {
        ecdsa_digest(rng, limit)
    } else {
        random_payload(rng, limit)
    }
}

/// Fixed-length random bytes.
pub fn random_bytes<R: RngCore>(rng: &mut R, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

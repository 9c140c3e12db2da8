//! Signature mechanisms exercised by the suite.
//!
//! The catalog maps a parameter label (`SHA256-RSA`) onto the PKCS#11
//! mechanism, the kind of key it needs and how much random payload a single
//! signing call may carry.

use std::ptr;

use cryptoki_sys::*;

/// A mechanism plus its (possibly empty) parameter block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    pub mechanism: CK_MECHANISM_TYPE,
    pub parameter: Vec<u8>,
}

impl Mechanism {
    pub fn new(mechanism: CK_MECHANISM_TYPE) -> Self {
        Self {
            mechanism,
            parameter: Vec::new(),
        }
    }

    /// Raw view for FFI. The returned struct borrows `self.parameter`.
    pub fn to_raw(&self) -> CK_MECHANISM {
        let parameter = if self.parameter.is_empty() {
            ptr::null_mut()
        } else {
            self.parameter.as_ptr() as CK_VOID_PTR
        };
        CK_MECHANISM {
            mechanism: self.mechanism,
            pParameter: parameter,
            ulParameterLen: self.parameter.len() as CK_ULONG,
        }
    }

    pub fn name(&self) -> String {
        mechanism_name(self.mechanism)
    }
}

/// Key family a signature mechanism operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Ec,
}

/// Exclusive upper bound on the random payload length for one signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLimit {
    Bytes(usize),
    /// `modulus_bits / 8` minus a fixed padding overhead.
    ModulusMinusPadding(usize),
}

impl DataLimit {
    pub fn limit(self, modulus_bits: CK_ULONG) -> usize {
        match self {
            DataLimit::Bytes(n) => n,
            DataLimit::ModulusMinusPadding(overhead) => {
                (modulus_bits as usize / 8).saturating_sub(overhead).max(1)
            }
        }
    }
}

/// One entry of the signature catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureInfo {
    pub name: &'static str,
    pub mechanism: CK_MECHANISM_TYPE,
    pub key: KeyKind,
    pub limit: DataLimit,
    /// Whether the mechanism digests its input and so supports
    /// C_SignUpdate/C_SignFinal.
    pub multipart: bool,
}

impl SignatureInfo {
    pub fn mechanism(&self) -> Mechanism {
        Mechanism::new(self.mechanism)
    }

    pub fn max_data(&self, modulus_bits: CK_ULONG) -> usize {
        self.limit.limit(modulus_bits)
    }
}

/// PKCS#1 v1.5 padding takes at least 11 bytes of the modulus.
const PKCS1_OVERHEAD: usize = 11;

pub static SIGNATURE_MECHANISMS: [SignatureInfo; 7] = [
    SignatureInfo {
        name: "RSA",
        mechanism: CKM_RSA_PKCS,
        key: KeyKind::Rsa,
        limit: DataLimit::ModulusMinusPadding(PKCS1_OVERHEAD),
        multipart: false,
    },
    SignatureInfo {
        name: "MD5-RSA",
        mechanism: CKM_MD5_RSA_PKCS,
        key: KeyKind::Rsa,
        limit: DataLimit::Bytes(1024),
        multipart: true,
    },
    SignatureInfo {
        name: "SHA1-RSA",
        mechanism: CKM_SHA1_RSA_PKCS,
        key: KeyKind::Rsa,
        limit: DataLimit::Bytes(1024),
        multipart: true,
    },
    SignatureInfo {
        name: "SHA256-RSA",
        mechanism: CKM_SHA256_RSA_PKCS,
        key: KeyKind::Rsa,
        limit: DataLimit::Bytes(1024),
        multipart: true,
    },
    SignatureInfo {
        name: "SHA384-RSA",
        mechanism: CKM_SHA384_RSA_PKCS,
        key: KeyKind::Rsa,
        limit: DataLimit::Bytes(1024),
        multipart: true,
    },
    SignatureInfo {
        name: "SHA512-RSA",
        mechanism: CKM_SHA512_RSA_PKCS,
        key: KeyKind::Rsa,
        limit: DataLimit::Bytes(1024),
        multipart: true,
    },
    SignatureInfo {
        name: "ECDSA",
        mechanism: CKM_ECDSA,
        key: KeyKind::Ec,
        limit: DataLimit::Bytes(1024),
        multipart: false,
    },
];

/// Look up a catalog entry by its parameter label.
pub fn signature_info(name: &str) -> Option<&'static SignatureInfo> {
    SIGNATURE_MECHANISMS.iter().find(|info| info.name == name)
}

/// Look up a catalog entry by mechanism type.
pub fn signature_info_for(mechanism: CK_MECHANISM_TYPE) -> Option<&'static SignatureInfo> {
    SIGNATURE_MECHANISMS
        .iter()
        .find(|info| info.mechanism == mechanism)
}

macro_rules! mechanism_names {
    ($($name:ident),* $(,)?) => {
        fn known_mechanism_name(mechanism: CK_MECHANISM_TYPE) -> Option<&'static str> {
            match mechanism {
                $( $name => Some(stringify!($name)), )*
                _ => None,
            }
        }
    };
}

mechanism_names![
    CKM_RSA_PKCS_KEY_PAIR_GEN,
    CKM_RSA_PKCS,
    CKM_RSA_9796,
    CKM_RSA_X_509,
    CKM_MD5_RSA_PKCS,
    CKM_SHA1_RSA_PKCS,
    CKM_RSA_PKCS_OAEP,
    CKM_RSA_PKCS_PSS,
    CKM_SHA1_RSA_PKCS_PSS,
    CKM_SHA256_RSA_PKCS,
    CKM_SHA384_RSA_PKCS,
    CKM_SHA512_RSA_PKCS,
    CKM_SHA224_RSA_PKCS,
    CKM_SHA256_RSA_PKCS_PSS,
    CKM_SHA384_RSA_PKCS_PSS,
    CKM_SHA512_RSA_PKCS_PSS,
    CKM_MD5,
    CKM_SHA_1,
    CKM_SHA256,
    CKM_SHA384,
    CKM_SHA512,
    CKM_EC_KEY_PAIR_GEN,
    CKM_ECDSA,
    CKM_ECDSA_SHA1,
    CKM_ECDSA_SHA224,
    CKM_ECDSA_SHA256,
    CKM_ECDSA_SHA384,
    CKM_ECDSA_SHA512,
    CKM_ECDH1_DERIVE,
    CKM_AES_KEY_GEN,
    CKM_AES_CBC,
    CKM_AES_CBC_PAD,
    CKM_AES_GCM,
];

/// Symbolic name of a mechanism, hex for ones outside the table.
pub fn mechanism_name(mechanism: CK_MECHANISM_TYPE) -> String {
    match known_mechanism_name(mechanism) {
        Some(name) => name.to_string(),
        None => format!("CKM_0x{mechanism:08X}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_rsa_limit_tracks_modulus() {
        let rsa = signature_info("RSA").expect("RSA entry");
        assert_eq!(rsa.max_data(1024), 117);
        assert_eq!(rsa.max_data(2048), 245);
        let sha = signature_info("SHA256-RSA").expect("SHA256 entry");
        assert_eq!(sha.max_data(1024), 1024);
        assert_eq!(sha.max_data(4096), 1024);
    }

    #[test]
    fn only_digesting_mechanisms_are_multipart() {
        for info in SIGNATURE_MECHANISMS.iter() {
            let raw = info.mechanism == CKM_RSA_PKCS || info.mechanism == CKM_ECDSA;
            assert_eq!(info.multipart, !raw, "{}", info.name);
        }
    }

    #[test]
    fn only_ecdsa_uses_ec_keys() {
        for info in SIGNATURE_MECHANISMS.iter() {
            let expected = if info.mechanism == CKM_ECDSA {
                KeyKind::Ec
            } else {
                KeyKind::Rsa
            };
            assert_eq!(info.key, expected, "{}", info.name);
        }
    }

    #[test]
    fn names_resolve() {
        assert_eq!(mechanism_name(CKM_SHA384_RSA_PKCS), "CKM_SHA384_RSA_PKCS");
        assert_eq!(mechanism_name(0x8000_0001), "CKM_0x80000001");
        assert_eq!(
            signature_info_for(CKM_ECDSA).map(|info| info.name),
            Some("ECDSA")
        );
    }

    #[test]
    fn raw_mechanism_has_no_parameter() {
        let raw = Mechanism::new(CKM_SHA1_RSA_PKCS).to_raw();
        assert!(raw.pParameter.is_null());
        assert_eq!(raw.ulParameterLen, 0);
    }
}

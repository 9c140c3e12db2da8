//! Named elliptic curves used for EC keypair generation.

use yasna::models::ObjectIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Curve {
    pub name: &'static str,
    pub oid: &'static [u64],
    /// Size of a field element (and of r and s) in bytes.
    pub field_bytes: usize,
}

impl Curve {
    /// DER encoding of the curve OID, the value carried by `CKA_EC_PARAMS`.
    pub fn ec_params(&self) -> Vec<u8> {
        let oid = ObjectIdentifier::from_slice(self.oid);
        yasna::construct_der(|writer| writer.write_oid(&oid))
    }

    /// Length of a raw `r || s` ECDSA signature.
    pub fn signature_len(&self) -> usize {
        2 * self.field_bytes
    }
}

pub static CURVES: [Curve; 5] = [
    Curve {
        name: "NIST-SECP192R1",
        oid: &[1, 2, 840, 10045, 3, 1, 1],
        field_bytes: 24,
    },
    Curve {
        name: "NIST-SECP224R1",
        oid: &[1, 3, 132, 0, 33],
        field_bytes: 28,
    },
    Curve {
        name: "NIST-SECP256R1",
        oid: &[1, 2, 840, 10045, 3, 1, 7],
        field_bytes: 32,
    },
    Curve {
        name: "NIST-SECP384R1",
        oid: &[1, 3, 132, 0, 34],
        field_bytes: 48,
    },
    Curve {
        name: "NIST-SECP521R1",
        oid: &[1, 3, 132, 0, 35],
        field_bytes: 66,
    },
];

pub fn curve(name: &str) -> Option<&'static Curve> {
    CURVES.iter().find(|curve| curve.name == name)
}

/// Find the curve whose `CKA_EC_PARAMS` encoding is `der`.
pub fn curve_for_params(der: &[u8]) -> Option<&'static Curve> {
    let oid = yasna::parse_der(der, |reader| reader.read_oid()).ok()?;
    CURVES
        .iter()
        .find(|curve| oid.components().as_slice() == curve.oid)
}

//! Keypair lifecycle fixture.

use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_INVALID_HANDLE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_ULONG,
    CKA_EC_PARAMS, CKA_LABEL, CKA_MODULUS_BITS, CKA_PUBLIC_EXPONENT, CKA_TOKEN, CKM_EC_KEY_PAIR_GEN,
    CKM_RSA_PKCS_KEY_PAIR_GEN,
};
use tracing::{debug, warn};

use crate::attribute::Template;
use crate::backend::Cryptoki;
use crate::mechanism::Mechanism;
use crate::rv::ReturnCode;

const PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];
const PUBLIC_LABEL: &str = "p11test-public";
const PRIVATE_LABEL: &str = "p11test-private";

/// A session keypair that is destroyed when dropped.
///
/// Generation failure is not an error here: the pair is simply invalid and
/// the status is kept so a case can decide to skip.
pub struct KeyPair<'a> {
    backend: &'a dyn Cryptoki,
    session: CK_SESSION_HANDLE,
    rv: ReturnCode,
    public: CK_OBJECT_HANDLE,
    private: CK_OBJECT_HANDLE,
}

impl<'a> KeyPair<'a> {
    pub fn rsa(
        backend: &'a dyn Cryptoki,
        session: CK_SESSION_HANDLE,
        modulus_bits: CK_ULONG,
        public_attrs: &[CK_ATTRIBUTE_TYPE],
        private_attrs: &[CK_ATTRIBUTE_TYPE],
    ) -> Self {
        let public = base_template(PUBLIC_LABEL)
            .with_ulong(CKA_MODULUS_BITS, modulus_bits)
            .with_bytes(CKA_PUBLIC_EXPONENT, PUBLIC_EXPONENT)
            .with_flags(public_attrs);
        let private = base_template(PRIVATE_LABEL).with_flags(private_attrs);
        Self::generate(
            backend,
            session,
            Mechanism::new(CKM_RSA_PKCS_KEY_PAIR_GEN),
            &public,
            &private,
        )
    }

    pub fn ec(
        backend: &'a dyn Cryptoki,
        session: CK_SESSION_HANDLE,
        ec_params: Vec<u8>,
        public_attrs: &[CK_ATTRIBUTE_TYPE],
        private_attrs: &[CK_ATTRIBUTE_TYPE],
    ) -> Self {
        let public = base_template(PUBLIC_LABEL)
            .with_bytes(CKA_EC_PARAMS, ec_params)
            .with_flags(public_attrs);
        let private = base_template(PRIVATE_LABEL).with_flags(private_attrs);
        Self::generate(
            backend,
            session,
            Mechanism::new(CKM_EC_KEY_PAIR_GEN),
            &public,
            &private,
        )
    }

    fn generate(
        backend: &'a dyn Cryptoki,
        session: CK_SESSION_HANDLE,
        mechanism: Mechanism,
        public_template: &Template,
        private_template: &Template,
    ) -> Self {
        let result =
            backend.generate_key_pair(session, &mechanism, public_template, private_template);
        let (rv, public, private) = match result {
            Ok((public, private)) => (ReturnCode::OK, public, private),
            Err(rv) => {
                debug!(mechanism = %mechanism.name(), %rv, "keypair generation failed");
                (rv, CK_INVALID_HANDLE, CK_INVALID_HANDLE)
            }
        };
        Self {
            backend,
            session,
            rv,
            public,
            private,
        }
    }

    pub fn valid(&self) -> bool {
        self.rv.is_ok()
    }

    pub fn generation_rv(&self) -> ReturnCode {
        self.rv
    }

    pub fn public_handle(&self) -> CK_OBJECT_HANDLE {
        self.public
    }

    pub fn private_handle(&self) -> CK_OBJECT_HANDLE {
        self.private
    }
}

impl Drop for KeyPair<'_> {
    fn drop(&mut self) {
        if !self.valid() {
            return;
        }
        for handle in [self.public, self.private] {
            if let Err(rv) = self.backend.destroy_object(self.session, handle) {
                warn!(%rv, handle, "C_DestroyObject failed during teardown");
            }
        }
    }
}

fn base_template(label: &str) -> Template {
    Template::new()
        .with_bool(CKA_TOKEN, false)
        .with_string(CKA_LABEL, label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curves::curve;
    use crate::session::{SessionSettings, UserSession};
    use crate::simulated::{Fault, SimulatedToken};
    use cryptoki_sys::{CKA_SIGN, CKA_VERIFY, CKR_FUNCTION_FAILED};

    fn settings() -> SessionSettings {
        SessionSettings {
            slot: None,
            user_pin: "1234".to_string(),
        }
    }

    #[test]
    fn keys_are_destroyed_on_drop() {
        let token = SimulatedToken::new();
        let session = UserSession::open(&token, &settings()).expect("session");
        {
            let pair = KeyPair::rsa(&token, session.handle(), 1024, &[CKA_VERIFY], &[CKA_SIGN]);
            assert!(pair.valid());
            assert_ne!(pair.public_handle(), pair.private_handle());
            assert_eq!(token.live_objects(), 2);
        }
        assert_eq!(token.live_objects(), 0);
    }

    #[test]
    fn ec_pair_uses_curve_params() {
        let token = SimulatedToken::new();
        let session = UserSession::open(&token, &settings()).expect("session");
        let params = curve("NIST-SECP256R1").expect("curve").ec_params();
        let pair = KeyPair::ec(&token, session.handle(), params, &[CKA_VERIFY], &[CKA_SIGN]);
        assert!(pair.valid());
    }

    #[test]
    fn failed_generation_is_invalid_and_not_destroyed() {
        let token = SimulatedToken::builder()
            .with_fault(Fault::FailKeyGeneration)
            .build();
        let session = UserSession::open(&token, &settings()).expect("session");
        let pair = KeyPair::rsa(&token, session.handle(), 1024, &[], &[]);
        assert!(!pair.valid());
        assert_eq!(pair.generation_rv().raw(), CKR_FUNCTION_FAILED);
        assert_eq!(pair.public_handle(), CK_INVALID_HANDLE);
    }
}

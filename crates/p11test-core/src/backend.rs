//! The call surface the conformance cases drive.
//!
//! A [`Cryptoki`] implementation is either a dynamically loaded module
//! ([`crate::module::Pkcs11Module`]) or the in-process
//! [`crate::simulated::SimulatedToken`]. Output-producing calls take
//! `Option<&mut [u8]>`: `None` is the PKCS#11 length query and the returned
//! count is the required size, `Some` receives the output and the count is
//! the number of bytes written.

use cryptoki_sys::{
    CK_FLAGS, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CK_USER_TYPE,
};
use serde::Serialize;

use crate::attribute::Template;
use crate::mechanism::Mechanism;
use crate::rv::CkResult;

/// Library information as reported by C_GetInfo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub cryptoki_version: (u8, u8),
    pub manufacturer: String,
    pub description: String,
    pub library_version: (u8, u8),
}

/// Trait for a PKCS#11 module under test
pub trait Cryptoki {
    fn initialize(&self) -> CkResult<()>;

    fn finalize(&self) -> CkResult<()>;

    fn module_info(&self) -> CkResult<ModuleInfo>;

    fn slot_list(&self, token_present: bool) -> CkResult<Vec<CK_SLOT_ID>>;

    fn mechanism_list(&self, slot: CK_SLOT_ID) -> CkResult<Vec<CK_MECHANISM_TYPE>>;

    fn open_session(&self, slot: CK_SLOT_ID, flags: CK_FLAGS) -> CkResult<CK_SESSION_HANDLE>;

    fn close_session(&self, session: CK_SESSION_HANDLE) -> CkResult<()>;

    fn login(&self, session: CK_SESSION_HANDLE, user_type: CK_USER_TYPE, pin: &[u8])
        -> CkResult<()>;

    fn logout(&self, session: CK_SESSION_HANDLE) -> CkResult<()>;

    /// Generate a keypair, returning `(public, private)` handles.
    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        public_template: &Template,
        private_template: &Template,
    ) -> CkResult<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE)>;

    fn destroy_object(&self, session: CK_SESSION_HANDLE, object: CK_OBJECT_HANDLE)
        -> CkResult<()>;

    // s11.11 signing

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()>;

    fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        signature: Option<&mut [u8]>,
    ) -> CkResult<usize>;

    fn sign_update(&self, session: CK_SESSION_HANDLE, part: &[u8]) -> CkResult<()>;

    fn sign_final(&self, session: CK_SESSION_HANDLE, signature: Option<&mut [u8]>)
        -> CkResult<usize>;

    fn sign_recover_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()>;

    fn sign_recover(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        signature: Option<&mut [u8]>,
    ) -> CkResult<usize>;

    // s11.12 verification

    fn verify_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()>;

    fn verify(&self, session: CK_SESSION_HANDLE, data: &[u8], signature: &[u8]) -> CkResult<()>;

    fn verify_update(&self, session: CK_SESSION_HANDLE, part: &[u8]) -> CkResult<()>;

    fn verify_final(&self, session: CK_SESSION_HANDLE, signature: &[u8]) -> CkResult<()>;

    fn verify_recover_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()>;

    fn verify_recover(
        &self,
        session: CK_SESSION_HANDLE,
        signature: &[u8],
        data: Option<&mut [u8]>,
    ) -> CkResult<usize>;
}

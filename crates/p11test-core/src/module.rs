//! Dynamically loaded PKCS#11 modules.
//!
//! The module is opened with `libloading`, `C_GetFunctionList` is resolved
//! once, and every call afterwards goes through the returned function table.
//! A table entry that is `NULL` reports `CKR_FUNCTION_NOT_SUPPORTED`.

use std::path::{Path, PathBuf};
use std::ptr;

use cryptoki_sys::*;
use libloading::Library;
use tracing::{debug, info};

use crate::attribute::Template;
use crate::backend::{Cryptoki, ModuleInfo};
use crate::error::{HarnessError, HarnessResult};
use crate::mechanism::Mechanism;
use crate::rv::{CkResult, ReturnCode};

type GetFunctionList = unsafe extern "C" fn(*mut *mut CK_FUNCTION_LIST) -> CK_RV;

macro_rules! call {
    ($self:ident, $name:ident ( $($arg:expr),* $(,)? )) => {{
        let function = $self
            .functions()
            .$name
            .ok_or(ReturnCode(CKR_FUNCTION_NOT_SUPPORTED))?;
        let rv = unsafe { function($($arg),*) };
        debug!(call = stringify!($name), rv = %ReturnCode(rv), "pkcs11 call");
        ReturnCode::check(rv)
    }};
}

/// A PKCS#11 shared library and its function table.
pub struct Pkcs11Module {
    path: PathBuf,
    functions: *const CK_FUNCTION_LIST,
    // Keeps the shared object mapped while `functions` is in use.
    _library: Library,
}

impl std::fmt::Debug for Pkcs11Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs11Module")
            .field("path", &self.path)
            .field("functions", &self.functions)
            .finish()
    }
}

impl Pkcs11Module {
    /// Load the module at `path` and fetch its function list.
    pub fn load(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref().to_path_buf();
        let library = unsafe { Library::new(&path) }.map_err(|err| HarnessError::Load {
            path: path.clone(),
            reason: err.to_string(),
        })?;

        let get_function_list: GetFunctionList = unsafe {
            *library
                .get::<GetFunctionList>(b"C_GetFunctionList\0")
                .map_err(|_| HarnessError::MissingSymbol("C_GetFunctionList"))?
        };

        let mut functions: *mut CK_FUNCTION_LIST = ptr::null_mut();
        let rv = unsafe { get_function_list(&mut functions) };
        ReturnCode::check(rv).map_err(|rv| HarnessError::pkcs11("C_GetFunctionList", rv))?;
        if functions.is_null() {
            return Err(HarnessError::MissingSymbol("CK_FUNCTION_LIST"));
        }

        let version = unsafe { (*functions).version };
        info!(
            "loaded PKCS#11 module {} (function list v{}.{})",
            path.display(),
            version.major,
            version.minor
        );
        Ok(Self {
            path,
            functions,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn functions(&self) -> &CK_FUNCTION_LIST {
        // Non-null is checked in `load` and the table lives as long as the
        // library mapping we own.
        unsafe { &*self.functions }
    }
}

fn out_buffer(buffer: Option<&mut [u8]>) -> (CK_BYTE_PTR, CK_ULONG) {
    match buffer {
        Some(buffer) => (buffer.as_mut_ptr(), buffer.len() as CK_ULONG),
        None => (ptr::null_mut(), 0),
    }
}

fn in_ptr(data: &[u8]) -> CK_BYTE_PTR {
    data.as_ptr() as CK_BYTE_PTR
}

/// Blank-padded PKCS#11 string to an owned, trimmed `String`.
fn padded_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c| c == ' ' || c == '\0')
        .to_string()
}

impl Cryptoki for Pkcs11Module {
    fn initialize(&self) -> CkResult<()> {
        let mut args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        call!(self, C_Initialize(&mut args as *mut CK_C_INITIALIZE_ARGS as CK_VOID_PTR))
    }

    fn finalize(&self) -> CkResult<()> {
        call!(self, C_Finalize(ptr::null_mut()))
    }

    fn module_info(&self) -> CkResult<ModuleInfo> {
        let mut info: CK_INFO = unsafe { std::mem::zeroed() };
        call!(self, C_GetInfo(&mut info))?;
        Ok(ModuleInfo {
            cryptoki_version: (info.cryptokiVersion.major, info.cryptokiVersion.minor),
            manufacturer: padded_string(&info.manufacturerID),
            description: padded_string(&info.libraryDescription),
            library_version: (info.libraryVersion.major, info.libraryVersion.minor),
        })
    }

    fn slot_list(&self, token_present: bool) -> CkResult<Vec<CK_SLOT_ID>> {
        let present = CK_BBOOL::from(token_present);
        let mut count: CK_ULONG = 0;
        call!(self, C_GetSlotList(present, ptr::null_mut(), &mut count))?;
        let mut slots: Vec<CK_SLOT_ID> = vec![0; count as usize];
        call!(self, C_GetSlotList(present, slots.as_mut_ptr(), &mut count))?;
        slots.truncate(count as usize);
        Ok(slots)
    }

    fn mechanism_list(&self, slot: CK_SLOT_ID) -> CkResult<Vec<CK_MECHANISM_TYPE>> {
        let mut count: CK_ULONG = 0;
        call!(self, C_GetMechanismList(slot, ptr::null_mut(), &mut count))?;
        let mut mechanisms: Vec<CK_MECHANISM_TYPE> = vec![0; count as usize];
        call!(self, C_GetMechanismList(slot, mechanisms.as_mut_ptr(), &mut count))?;
        mechanisms.truncate(count as usize);
        Ok(mechanisms)
    }

    fn open_session(&self, slot: CK_SLOT_ID, flags: CK_FLAGS) -> CkResult<CK_SESSION_HANDLE> {
        let mut session: CK_SESSION_HANDLE = CK_INVALID_HANDLE;
        call!(self, C_OpenSession(slot, flags, ptr::null_mut(), None, &mut session))?;
        Ok(session)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> CkResult<()> {
        call!(self, C_CloseSession(session))
    }

    fn login(
        &self,
        session: CK_SESSION_HANDLE,
        user_type: CK_USER_TYPE,
        pin: &[u8],
    ) -> CkResult<()> {
        call!(self, C_Login(session, user_type, in_ptr(pin), pin.len() as CK_ULONG))
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> CkResult<()> {
        call!(self, C_Logout(session))
    }

    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        public_template: &Template,
        private_template: &Template,
    ) -> CkResult<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE)> {
        let mut raw_mechanism = mechanism.to_raw();
        let mut public = public_template.to_raw();
        let mut private = private_template.to_raw();
        let mut public_key: CK_OBJECT_HANDLE = CK_INVALID_HANDLE;
        let mut private_key: CK_OBJECT_HANDLE = CK_INVALID_HANDLE;
        call!(
            self,
            C_GenerateKeyPair(
                session,
                &mut raw_mechanism,
                public.as_mut_ptr(),
                public.count(),
                private.as_mut_ptr(),
                private.count(),
                &mut public_key,
                &mut private_key,
            )
        )?;
        Ok((public_key, private_key))
    }

    fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> CkResult<()> {
        call!(self, C_DestroyObject(session, object))
    }

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()> {
        let mut raw = mechanism.to_raw();
        call!(self, C_SignInit(session, &mut raw, key))
    }

    fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        signature: Option<&mut [u8]>,
    ) -> CkResult<usize> {
        let (out, mut out_len) = out_buffer(signature);
        call!(
            self,
            C_Sign(session, in_ptr(data), data.len() as CK_ULONG, out, &mut out_len)
        )?;
        Ok(out_len as usize)
    }

    fn sign_update(&self, session: CK_SESSION_HANDLE, part: &[u8]) -> CkResult<()> {
        call!(self, C_SignUpdate(session, in_ptr(part), part.len() as CK_ULONG))
    }

    fn sign_final(
        &self,
        session: CK_SESSION_HANDLE,
        signature: Option<&mut [u8]>,
    ) -> CkResult<usize> {
        let (out, mut out_len) = out_buffer(signature);
        call!(self, C_SignFinal(session, out, &mut out_len))?;
        Ok(out_len as usize)
    }

    fn sign_recover_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()> {
        let mut raw = mechanism.to_raw();
        call!(self, C_SignRecoverInit(session, &mut raw, key))
    }

    fn sign_recover(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        signature: Option<&mut [u8]>,
    ) -> CkResult<usize> {
        let (out, mut out_len) = out_buffer(signature);
        call!(
            self,
            C_SignRecover(session, in_ptr(data), data.len() as CK_ULONG, out, &mut out_len)
        )?;
        Ok(out_len as usize)
    }

    fn verify_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()> {
        let mut raw = mechanism.to_raw();
        call!(self, C_VerifyInit(session, &mut raw, key))
    }

    fn verify(&self, session: CK_SESSION_HANDLE, data: &[u8], signature: &[u8]) -> CkResult<()> {
        call!(
            self,
            C_Verify(
                session,
                in_ptr(data),
                data.len() as CK_ULONG,
                in_ptr(signature),
                signature.len() as CK_ULONG,
            )
        )
    }

    fn verify_update(&self, session: CK_SESSION_HANDLE, part: &[u8]) -> CkResult<()> {
        call!(self, C_VerifyUpdate(session, in_ptr(part), part.len() as CK_ULONG))
    }

    fn verify_final(&self, session: CK_SESSION_HANDLE, signature: &[u8]) -> CkResult<()> {
        call!(
            self,
            C_VerifyFinal(session, in_ptr(signature), signature.len() as CK_ULONG)
        )
    }

    fn verify_recover_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()> {
        let mut raw = mechanism.to_raw();
        call!(self, C_VerifyRecoverInit(session, &mut raw, key))
    }

    fn verify_recover(
        &self,
        session: CK_SESSION_HANDLE,
        signature: &[u8],
        data: Option<&mut [u8]>,
    ) -> CkResult<usize> {
        let (out, mut out_len) = out_buffer(data);
        call!(
            self,
            C_VerifyRecover(
                session,
                in_ptr(signature),
                signature.len() as CK_ULONG,
                out,
                &mut out_len,
            )
        )?;
        Ok(out_len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_a_load_error() {
        let err = Pkcs11Module::load("/nonexistent/libp11test-missing.so").unwrap_err();
        match err {
            HarnessError::Load { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/libp11test-missing.so"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn padded_strings_are_trimmed() {
        let mut field = [b' '; 32];
        field[..7].copy_from_slice(b"SoftHSM");
        assert_eq!(padded_string(&field), "SoftHSM");
    }

    #[test]
    fn length_query_passes_null_buffer() {
        let (ptr, len) = out_buffer(None);
        assert!(ptr.is_null());
        assert_eq!(len, 0);
        let mut buffer = [0u8; 16];
        let (ptr, len) = out_buffer(Some(&mut buffer));
        assert!(!ptr.is_null());
        assert_eq!(len, 16);
    }
}

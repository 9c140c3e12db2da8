//! PKCS#11 return codes.
//!
//! Every call into a module yields a `CK_RV`. The suite keeps the raw value
//! around (instead of folding it into a coarse error type) because the
//! conformance cases assert on exact codes such as `CKR_SIGNATURE_INVALID`.

use std::fmt;

use cryptoki_sys::*;

/// Result of a single PKCS#11 call. `CKR_OK` is `Ok`, anything else is `Err`.
pub type CkResult<T> = Result<T, ReturnCode>;

/// A raw PKCS#11 status word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReturnCode(pub CK_RV);

impl ReturnCode {
    pub const OK: ReturnCode = ReturnCode(CKR_OK);

    /// Convert a raw status into a result.
    pub fn check(rv: CK_RV) -> CkResult<()> {
        if rv == CKR_OK {
            Ok(())
        } else {
            Err(ReturnCode(rv))
        }
    }

    pub fn raw(self) -> CK_RV {
        self.0
    }

    pub fn is_ok(self) -> bool {
        self.0 == CKR_OK
    }

    pub fn name(self) -> Option<&'static str> {
        rv_name(self.0)
    }
}

impl From<CK_RV> for ReturnCode {
    fn from(rv: CK_RV) -> Self {
        ReturnCode(rv)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

impl fmt::Debug for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Recover the status a call produced, `CKR_OK` for success.
pub fn rv_of<T>(result: &CkResult<T>) -> ReturnCode {
    match result {
        Ok(_) => ReturnCode::OK,
        Err(rv) => *rv,
    }
}

macro_rules! rv_names {
    ($($name:ident),* $(,)?) => {
        /// Symbolic name of a return code, if it is one the suite knows.
        pub fn rv_name(rv: CK_RV) -> Option<&'static str> {
            match rv {
                $( $name => Some(stringify!($name)), )*
                _ => None,
            }
        }
    };
}

rv_names![
    CKR_OK,
    CKR_CANCEL,
    CKR_HOST_MEMORY,
    CKR_SLOT_ID_INVALID,
    CKR_GENERAL_ERROR,
    CKR_FUNCTION_FAILED,
    CKR_ARGUMENTS_BAD,
    CKR_ATTRIBUTE_READ_ONLY,
    CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_ATTRIBUTE_VALUE_INVALID,
    CKR_DATA_INVALID,
    CKR_DATA_LEN_RANGE,
    CKR_DEVICE_ERROR,
    CKR_DEVICE_MEMORY,
    CKR_DEVICE_REMOVED,
    CKR_FUNCTION_CANCELED,
    CKR_FUNCTION_NOT_PARALLEL,
    CKR_FUNCTION_NOT_SUPPORTED,
    CKR_KEY_HANDLE_INVALID,
    CKR_KEY_SIZE_RANGE,
    CKR_KEY_TYPE_INCONSISTENT,
    CKR_KEY_FUNCTION_NOT_PERMITTED,
    CKR_MECHANISM_INVALID,
    CKR_MECHANISM_PARAM_INVALID,
    CKR_OBJECT_HANDLE_INVALID,
    CKR_OPERATION_ACTIVE,
    CKR_OPERATION_NOT_INITIALIZED,
    CKR_PIN_INCORRECT,
    CKR_PIN_LOCKED,
    CKR_SESSION_CLOSED,
    CKR_SESSION_COUNT,
    CKR_SESSION_HANDLE_INVALID,
    CKR_SESSION_PARALLEL_NOT_SUPPORTED,
    CKR_SESSION_READ_ONLY,
    CKR_SIGNATURE_INVALID,
    CKR_SIGNATURE_LEN_RANGE,
    CKR_TEMPLATE_INCOMPLETE,
    CKR_TEMPLATE_INCONSISTENT,
    CKR_TOKEN_NOT_PRESENT,
    CKR_TOKEN_NOT_RECOGNIZED,
    CKR_USER_ALREADY_LOGGED_IN,
    CKR_USER_NOT_LOGGED_IN,
    CKR_USER_PIN_NOT_INITIALIZED,
    CKR_USER_TYPE_INVALID,
    CKR_BUFFER_TOO_SMALL,
    CKR_CRYPTOKI_NOT_INITIALIZED,
    CKR_CRYPTOKI_ALREADY_INITIALIZED,
    CKR_DOMAIN_PARAMS_INVALID,
    CKR_CURVE_NOT_SUPPORTED,
];

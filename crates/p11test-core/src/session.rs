//! Library and session fixtures.
//!
//! Both are RAII guards: setup happens in the constructor and teardown in
//! `Drop`, so a case that stops early still leaves the module clean.

use cryptoki_sys::{
    CK_SESSION_HANDLE, CK_SLOT_ID, CKF_SERIAL_SESSION, CKR_CRYPTOKI_ALREADY_INITIALIZED, CKU_USER,
};
use tracing::{debug, warn};

use crate::backend::Cryptoki;
use crate::error::{HarnessError, HarnessResult};

/// Keeps the module initialized for as long as the guard lives.
pub struct Library<'a> {
    backend: &'a dyn Cryptoki,
    owned: bool,
}

impl<'a> Library<'a> {
    pub fn open(backend: &'a dyn Cryptoki) -> HarnessResult<Self> {
        match backend.initialize() {
            Ok(()) => Ok(Self {
                backend,
                owned: true,
            }),
            Err(rv) if rv.raw() == CKR_CRYPTOKI_ALREADY_INITIALIZED => {
                debug!("module already initialized, leaving finalize to its owner");
                Ok(Self {
                    backend,
                    owned: false,
                })
            }
            Err(rv) => Err(HarnessError::pkcs11("C_Initialize", rv)),
        }
    }

    pub fn backend(&self) -> &'a dyn Cryptoki {
        self.backend
    }

    /// Slot to run against: the configured one, else the first with a token.
    pub fn resolve_slot(&self, configured: Option<CK_SLOT_ID>) -> HarnessResult<CK_SLOT_ID> {
        if let Some(slot) = configured {
            return Ok(slot);
        }
        let slots = self
            .backend
            .slot_list(true)
            .map_err(|rv| HarnessError::pkcs11("C_GetSlotList", rv))?;
        slots.first().copied().ok_or(HarnessError::NoSlot)
    }
}

impl Drop for Library<'_> {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Err(rv) = self.backend.finalize() {
            warn!(%rv, "C_Finalize failed during teardown");
        }
    }
}

/// Where and as whom a [`UserSession`] logs in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSettings {
    pub slot: Option<CK_SLOT_ID>,
    pub user_pin: String,
}

/// A read-only session logged in as the normal user.
pub struct UserSession<'a> {
    handle: CK_SESSION_HANDLE,
    slot: CK_SLOT_ID,
    logged_in: bool,
    library: Library<'a>,
}

impl<'a> UserSession<'a> {
    pub fn open(backend: &'a dyn Cryptoki, settings: &SessionSettings) -> HarnessResult<Self> {
        let library = Library::open(backend)?;
        let slot = library.resolve_slot(settings.slot)?;
        let handle = backend
            .open_session(slot, CKF_SERIAL_SESSION)
            .map_err(|rv| HarnessError::pkcs11("C_OpenSession", rv))?;
        let mut session = Self {
            handle,
            slot,
            logged_in: false,
            library,
        };
        backend
            .login(handle, CKU_USER, settings.user_pin.as_bytes())
            .map_err(|rv| HarnessError::pkcs11("C_Login", rv))?;
        session.logged_in = true;
        debug!(slot, session = handle, "user session ready");
        Ok(session)
    }

    pub fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    pub fn slot(&self) -> CK_SLOT_ID {
        self.slot
    }

    pub fn backend(&self) -> &'a dyn Cryptoki {
        self.library.backend()
    }
}

impl Drop for UserSession<'_> {
    fn drop(&mut self) {
        let backend = self.library.backend();
        if self.logged_in {
            if let Err(rv) = backend.logout(self.handle) {
                warn!(%rv, session = self.handle, "C_Logout failed during teardown");
            }
        }
        if let Err(rv) = backend.close_session(self.handle) {
            warn!(%rv, session = self.handle, "C_CloseSession failed during teardown");
        }
    }
}

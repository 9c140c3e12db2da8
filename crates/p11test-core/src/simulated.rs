//! In-process simulated token.
//!
//! `SimulatedToken` follows the PKCS#11 state machine (library, session,
//! login and operation state) closely enough to drive every conformance case,
//! but it is not a cryptographic implementation: signatures are HMAC-SHA256
//! keystreams sized like the real algorithm's output. The builder can remove
//! capabilities or inject faults so the suite's own failure detection can be
//! tested.

use std::collections::{BTreeSet, HashMap};

use cryptoki_sys::*;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use tracing::debug;

use crate::attribute::Template;
use crate::backend::{Cryptoki, ModuleInfo};
use crate::curves::{CURVES, Curve, curve_for_params};
use crate::mechanism::{KeyKind, Mechanism, SIGNATURE_MECHANISMS, SignatureInfo, signature_info_for};
use crate::rv::{CkResult, ReturnCode};

/// The only slot the simulated token exposes.
pub const SIMULATED_SLOT: CK_SLOT_ID = 0;

const DEFAULT_USER_PIN: &str = "1234";
const PKCS1_OVERHEAD: usize = 11;
const RECOVERY_TAG_LEN: usize = 8;
const MIN_MODULUS_BITS: CK_ULONG = 512;
const MAX_MODULUS_BITS: CK_ULONG = 8192;

type HmacSha256 = Hmac<Sha256>;

fn rv(code: CK_RV) -> ReturnCode {
    ReturnCode(code)
}

/// Deliberate misbehaviour, used to prove the suite catches broken modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// C_Verify and C_VerifyFinal accept every signature.
    AcceptAnySignature,
    /// Wrong-length signatures report CKR_SIGNATURE_INVALID instead of
    /// CKR_SIGNATURE_LEN_RANGE.
    IgnoreSignatureLength,
    /// C_GenerateKeyPair always fails.
    FailKeyGeneration,
    /// C_Sign and C_SignFinal fill a short buffer with a truncated signature
    /// and return CKR_OK.
    IgnoreShortBuffer,
    /// A C_Sign length query reports one byte less than the signature.
    UnderstateSignatureLength,
    /// C_VerifyRecover flips a bit in the recovered data.
    CorruptRecoveredData,
    /// C_VerifyRecover drops the last recovered byte.
    TruncateRecoveredData,
}

#[derive(Debug, Clone)]
struct TokenConfig {
    user_pin: String,
    mechanisms: BTreeSet<CK_MECHANISM_TYPE>,
    curves: Vec<&'static Curve>,
    sign_recover: bool,
    multipart: bool,
    faults: Vec<Fault>,
}

impl TokenConfig {
    fn has(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    fn supports(&self, mechanism: CK_MECHANISM_TYPE) -> bool {
        self.mechanisms.contains(&mechanism)
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        let mut mechanisms: BTreeSet<CK_MECHANISM_TYPE> =
            SIGNATURE_MECHANISMS.iter().map(|info| info.mechanism).collect();
        mechanisms.insert(CKM_RSA_PKCS_KEY_PAIR_GEN);
        mechanisms.insert(CKM_EC_KEY_PAIR_GEN);
        Self {
            user_pin: DEFAULT_USER_PIN.to_string(),
            mechanisms,
            curves: CURVES.iter().collect(),
            sign_recover: true,
            multipart: true,
            faults: Vec::new(),
        }
    }
}

/// Builder for [`SimulatedToken`].
#[derive(Debug, Clone, Default)]
pub struct SimulatedTokenBuilder {
    config: TokenConfig,
}

impl SimulatedTokenBuilder {
    pub fn user_pin(mut self, pin: impl Into<String>) -> Self {
        self.config.user_pin = pin.into();
        self
    }

    pub fn without_mechanism(mut self, mechanism: CK_MECHANISM_TYPE) -> Self {
        self.config.mechanisms.remove(&mechanism);
        self
    }

    pub fn without_curve(mut self, name: &str) -> Self {
        self.config.curves.retain(|curve| curve.name != name);
        self
    }

    pub fn without_sign_recover(mut self) -> Self {
        self.config.sign_recover = false;
        self
    }

    pub fn without_multipart(mut self) -> Self {
        self.config.multipart = false;
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.config.faults.push(fault);
        self
    }

    pub fn build(self) -> SimulatedToken {
        SimulatedToken {
            config: self.config,
            state: Mutex::new(TokenState::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyClass {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Sign,
    Verify,
    SignRecover,
    VerifyRecover,
}

#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    sign: bool,
    verify: bool,
    sign_recover: bool,
    verify_recover: bool,
}

#[derive(Debug, Clone)]
struct KeyObject {
    session: CK_SESSION_HANDLE,
    class: KeyClass,
    kind: KeyKind,
    secret: [u8; 32],
    signature_len: usize,
    usage: Usage,
}

impl KeyObject {
    fn permits(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Sign => self.class == KeyClass::Private && self.usage.sign,
            OperationKind::SignRecover => {
                self.class == KeyClass::Private && self.usage.sign_recover
            }
            OperationKind::Verify => self.class == KeyClass::Public && self.usage.verify,
            OperationKind::VerifyRecover => {
                self.class == KeyClass::Public && self.usage.verify_recover
            }
        }
    }
}

/// Snapshot of everything an operation needs, taken at init time.
#[derive(Debug, Clone)]
struct ActiveOperation {
    kind: OperationKind,
    info: &'static SignatureInfo,
    secret: [u8; 32],
    signature_len: usize,
    buffer: Vec<u8>,
    multipart: bool,
}

#[derive(Debug, Clone)]
struct SessionState {
    flags: CK_FLAGS,
    operation: Option<ActiveOperation>,
}

#[derive(Debug)]
struct TokenState {
    initialized: bool,
    logged_in: bool,
    sessions: HashMap<CK_SESSION_HANDLE, SessionState>,
    objects: HashMap<CK_OBJECT_HANDLE, KeyObject>,
    next_session: CK_SESSION_HANDLE,
    next_object: CK_OBJECT_HANDLE,
}

impl Default for TokenState {
    fn default() -> Self {
        Self {
            initialized: false,
            logged_in: false,
            sessions: HashMap::new(),
            objects: HashMap::new(),
            next_session: 1,
            next_object: 1000,
        }
    }
}

impl TokenState {
    fn ensure_initialized(&self) -> CkResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(rv(CKR_CRYPTOKI_NOT_INITIALIZED))
        }
    }

    fn session_mut(&mut self, session: CK_SESSION_HANDLE) -> CkResult<&mut SessionState> {
        self.ensure_initialized()?;
        self.sessions
            .get_mut(&session)
            .ok_or(rv(CKR_SESSION_HANDLE_INVALID))
    }

    fn take_operation(
        &mut self,
        session: CK_SESSION_HANDLE,
        kind: OperationKind,
    ) -> CkResult<ActiveOperation> {
        let slot = &mut self.session_mut(session)?.operation;
        match slot.take() {
            Some(operation) if operation.kind == kind => Ok(operation),
            other => {
                *slot = other;
                Err(rv(CKR_OPERATION_NOT_INITIALIZED))
            }
        }
    }

    fn restore_operation(&mut self, session: CK_SESSION_HANDLE, operation: ActiveOperation) {
        if let Some(state) = self.sessions.get_mut(&session) {
            state.operation = Some(operation);
        }
    }

    fn insert_object(&mut self, object: KeyObject) -> CK_OBJECT_HANDLE {
        let handle = self.next_object;
        self.next_object += 1;
        self.objects.insert(handle, object);
        handle
    }
}

/// A software token implementing [`Cryptoki`] without native code.
#[derive(Debug)]
pub struct SimulatedToken {
    config: TokenConfig,
    state: Mutex<TokenState>,
}

impl Default for SimulatedToken {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedToken {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SimulatedTokenBuilder {
        SimulatedTokenBuilder::default()
    }

    /// Number of key objects currently held by the token.
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    fn signature_mechanism(
        &self,
        mechanism: &Mechanism,
        kind: OperationKind,
    ) -> CkResult<&'static SignatureInfo> {
        let recover = matches!(
            kind,
            OperationKind::SignRecover | OperationKind::VerifyRecover
        );
        if recover && !self.config.sign_recover {
            return Err(rv(CKR_FUNCTION_NOT_SUPPORTED));
        }
        if !self.config.supports(mechanism.mechanism) {
            return Err(rv(CKR_MECHANISM_INVALID));
        }
        if !mechanism.parameter.is_empty() {
            return Err(rv(CKR_MECHANISM_PARAM_INVALID));
        }
        let info = signature_info_for(mechanism.mechanism).ok_or(rv(CKR_MECHANISM_INVALID))?;
        if recover && info.mechanism != CKM_RSA_PKCS {
            return Err(rv(CKR_MECHANISM_INVALID));
        }
        Ok(info)
    }

    fn init_operation(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
        kind: OperationKind,
    ) -> CkResult<()> {
        let mut state = self.state.lock();
        if state.session_mut(session)?.operation.is_some() {
            return Err(rv(CKR_OPERATION_ACTIVE));
        }
        let info = self.signature_mechanism(mechanism, kind)?;
        let object = state.objects.get(&key).ok_or(rv(CKR_KEY_HANDLE_INVALID))?;
        if object.kind != info.key {
            return Err(rv(CKR_KEY_TYPE_INCONSISTENT));
        }
        if !object.permits(kind) {
            return Err(rv(CKR_KEY_FUNCTION_NOT_PERMITTED));
        }
        let operation = ActiveOperation {
            kind,
            info,
            secret: object.secret,
            signature_len: object.signature_len,
            buffer: Vec::new(),
            multipart: false,
        };
        debug!(session, key, mechanism = info.name, ?kind, "operation initialized");
        state.session_mut(session)?.operation = Some(operation);
        Ok(())
    }

    fn update_operation(
        &self,
        session: CK_SESSION_HANDLE,
        kind: OperationKind,
        part: &[u8],
    ) -> CkResult<()> {
        let mut state = self.state.lock();
        let mut operation = state.take_operation(session, kind)?;
        if !operation.info.multipart {
            return Err(rv(CKR_MECHANISM_INVALID));
        }
        if !self.config.multipart {
            return Err(rv(CKR_FUNCTION_NOT_SUPPORTED));
        }
        operation.multipart = true;
        operation.buffer.extend_from_slice(part);
        state.restore_operation(session, operation);
        Ok(())
    }

    /// `write_output` with the output faults applied.
    fn write_signature(&self, value: &[u8], out: Option<&mut [u8]>) -> (CkResult<usize>, bool) {
        match out {
            None if self.config.has(Fault::UnderstateSignatureLength) => {
                (Ok(value.len().saturating_sub(1)), false)
            }
            Some(buffer)
                if buffer.len() < value.len() && self.config.has(Fault::IgnoreShortBuffer) =>
            {
                let len = buffer.len();
                buffer.copy_from_slice(&value[..len]);
                (Ok(len), true)
            }
            out => write_output(value, out),
        }
    }

    fn compare(&self, operation: &ActiveOperation, message: &[u8], signature: &[u8]) -> CkResult<()> {
        let expected = signature_value(operation, message)?;
        if self.config.has(Fault::AcceptAnySignature) {
            return Ok(());
        }
        if signature.len() != expected.len() && !self.config.has(Fault::IgnoreSignatureLength) {
            return Err(rv(CKR_SIGNATURE_LEN_RANGE));
        }
        if signature != expected.as_slice() {
            return Err(rv(CKR_SIGNATURE_INVALID));
        }
        Ok(())
    }

    fn key_pair_shape(
        &self,
        mechanism: &Mechanism,
        public_template: &Template,
    ) -> CkResult<(KeyKind, usize)> {
        if !self.config.supports(mechanism.mechanism) {
            return Err(rv(CKR_MECHANISM_INVALID));
        }
        match mechanism.mechanism {
            CKM_RSA_PKCS_KEY_PAIR_GEN => {
                let bits = public_template
                    .ulong(CKA_MODULUS_BITS)
                    .ok_or(rv(CKR_TEMPLATE_INCOMPLETE))?;
                if !(MIN_MODULUS_BITS..=MAX_MODULUS_BITS).contains(&bits) || bits % 8 != 0 {
                    return Err(rv(CKR_KEY_SIZE_RANGE));
                }
                Ok((KeyKind::Rsa, bits as usize / 8))
            }
            CKM_EC_KEY_PAIR_GEN => {
                let params = public_template
                    .bytes(CKA_EC_PARAMS)
                    .ok_or(rv(CKR_TEMPLATE_INCOMPLETE))?;
                let curve = curve_for_params(params)
                    .filter(|curve| self.config.curves.contains(curve))
                    .ok_or(rv(CKR_CURVE_NOT_SUPPORTED))?;
                Ok((KeyKind::Ec, curve.signature_len()))
            }
            _ => Err(rv(CKR_MECHANISM_INVALID)),
        }
    }
}

/// HMAC-SHA256 in counter mode over `context`, truncated to `len` bytes.
fn keystream(secret: &[u8], context: &[&[u8]], len: usize) -> CkResult<Vec<u8>> {
    let mut out = Vec::with_capacity(len + 32);
    let mut counter: u32 = 0;
    while out.len() < len {
        let mut mac =
            HmacSha256::new_from_slice(secret).map_err(|_| rv(CKR_GENERAL_ERROR))?;
        mac.update(&counter.to_be_bytes());
        for part in context {
            mac.update(part);
        }
        out.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    out.truncate(len);
    Ok(out)
}

fn signature_value(operation: &ActiveOperation, message: &[u8]) -> CkResult<Vec<u8>> {
    let mechanism = operation.info.mechanism.to_be_bytes();
    keystream(
        &operation.secret,
        &[b"sign".as_slice(), mechanism.as_slice(), message],
        operation.signature_len,
    )
}

/// Raw PKCS#1 v1.5 signing is bounded by the modulus.
fn check_data_len(operation: &ActiveOperation, len: usize) -> CkResult<()> {
    if operation.info.mechanism == CKM_RSA_PKCS
        && len > operation.signature_len.saturating_sub(PKCS1_OVERHEAD)
    {
        return Err(rv(CKR_DATA_LEN_RANGE));
    }
    Ok(())
}

fn recovery_tag(operation: &ActiveOperation, data: &[u8]) -> CkResult<Vec<u8>> {
    keystream(
        &operation.secret,
        &[b"recover".as_slice(), data],
        RECOVERY_TAG_LEN,
    )
}

/// Layout: tag(8) || mask(len(2) || data || zero padding), modulus sized.
fn seal_recoverable(operation: &ActiveOperation, data: &[u8]) -> CkResult<Vec<u8>> {
    let body_len = operation.signature_len - RECOVERY_TAG_LEN;
    let mut sealed = recovery_tag(operation, data)?;
    let mut body = Vec::with_capacity(body_len);
    body.extend_from_slice(&(data.len() as u16).to_be_bytes());
    body.extend_from_slice(data);
    body.resize(body_len, 0);
    let mask = keystream(&operation.secret, &[b"mask".as_slice(), sealed.as_slice()], body_len)?;
    sealed.extend(body.iter().zip(mask).map(|(byte, m)| byte ^ m));
    Ok(sealed)
}

fn open_recoverable(operation: &ActiveOperation, signature: &[u8]) -> CkResult<Vec<u8>> {
    if signature.len() != operation.signature_len {
        return Err(rv(CKR_SIGNATURE_LEN_RANGE));
    }
    let (tag, masked) = signature.split_at(RECOVERY_TAG_LEN);
    let mask = keystream(&operation.secret, &[b"mask".as_slice(), tag], masked.len())?;
    let body: Vec<u8> = masked.iter().zip(mask).map(|(byte, m)| byte ^ m).collect();
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    if len > body.len() - 2 {
        return Err(rv(CKR_SIGNATURE_INVALID));
    }
    let data = body[2..2 + len].to_vec();
    if recovery_tag(operation, &data)? != tag {
        return Err(rv(CKR_SIGNATURE_INVALID));
    }
    Ok(data)
}

/// Apply the PKCS#11 output convention. The flag is true when the operation
/// is finished; a length query or a short buffer leaves it active.
fn write_output(value: &[u8], out: Option<&mut [u8]>) -> (CkResult<usize>, bool) {
    match out {
        None => (Ok(value.len()), false),
        Some(buffer) if buffer.len() < value.len() => (Err(rv(CKR_BUFFER_TOO_SMALL)), false),
        Some(buffer) => {
            buffer[..value.len()].copy_from_slice(value);
            (Ok(value.len()), true)
        }
    }
}

fn random_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    secret
}

impl Cryptoki for SimulatedToken {
    fn initialize(&self) -> CkResult<()> {
        let mut state = self.state.lock();
        if state.initialized {
            return Err(rv(CKR_CRYPTOKI_ALREADY_INITIALIZED));
        }
        state.initialized = true;
        Ok(())
    }

    fn finalize(&self) -> CkResult<()> {
        let mut state = self.state.lock();
        state.ensure_initialized()?;
        *state = TokenState::default();
        Ok(())
    }

    fn module_info(&self) -> CkResult<ModuleInfo> {
        self.state.lock().ensure_initialized()?;
        Ok(ModuleInfo {
            cryptoki_version: (2, 40),
            manufacturer: "FerroLabs AG".to_string(),
            description: "p11test simulated token".to_string(),
            library_version: (0, 1),
        })
    }

    fn slot_list(&self, _token_present: bool) -> CkResult<Vec<CK_SLOT_ID>> {
        self.state.lock().ensure_initialized()?;
        Ok(vec![SIMULATED_SLOT])
    }

    fn mechanism_list(&self, slot: CK_SLOT_ID) -> CkResult<Vec<CK_MECHANISM_TYPE>> {
        self.state.lock().ensure_initialized()?;
        if slot != SIMULATED_SLOT {
            return Err(rv(CKR_SLOT_ID_INVALID));
        }
        Ok(self.config.mechanisms.iter().copied().collect())
    }

    fn open_session(&self, slot: CK_SLOT_ID, flags: CK_FLAGS) -> CkResult<CK_SESSION_HANDLE> {
        let mut state = self.state.lock();
        state.ensure_initialized()?;
        if slot != SIMULATED_SLOT {
            return Err(rv(CKR_SLOT_ID_INVALID));
        }
        if flags & CKF_SERIAL_SESSION == 0 {
            return Err(rv(CKR_SESSION_PARALLEL_NOT_SUPPORTED));
        }
        let handle = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            handle,
            SessionState {
                flags,
                operation: None,
            },
        );
        debug!(session = handle, "session opened");
        Ok(handle)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> CkResult<()> {
        let mut state = self.state.lock();
        state.ensure_initialized()?;
        if state.sessions.remove(&session).is_none() {
            return Err(rv(CKR_SESSION_HANDLE_INVALID));
        }
        state.objects.retain(|_, object| object.session != session);
        if state.sessions.is_empty() {
            state.logged_in = false;
        }
        Ok(())
    }

    fn login(
        &self,
        session: CK_SESSION_HANDLE,
        user_type: CK_USER_TYPE,
        pin: &[u8],
    ) -> CkResult<()> {
        let mut state = self.state.lock();
        state.session_mut(session)?;
        if user_type != CKU_USER {
            return Err(rv(CKR_USER_TYPE_INVALID));
        }
        if state.logged_in {
            return Err(rv(CKR_USER_ALREADY_LOGGED_IN));
        }
        if pin != self.config.user_pin.as_bytes() {
            return Err(rv(CKR_PIN_INCORRECT));
        }
        state.logged_in = true;
        Ok(())
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> CkResult<()> {
        let mut state = self.state.lock();
        state.session_mut(session)?;
        if !state.logged_in {
            return Err(rv(CKR_USER_NOT_LOGGED_IN));
        }
        state.logged_in = false;
        Ok(())
    }

    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        public_template: &Template,
        private_template: &Template,
    ) -> CkResult<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE)> {
        let mut state = self.state.lock();
        let flags = state.session_mut(session)?.flags;
        if !state.logged_in {
            return Err(rv(CKR_USER_NOT_LOGGED_IN));
        }
        if self.config.has(Fault::FailKeyGeneration) {
            return Err(rv(CKR_FUNCTION_FAILED));
        }
        let wants_token = public_template.flag(CKA_TOKEN).unwrap_or(false)
            || private_template.flag(CKA_TOKEN).unwrap_or(false);
        if wants_token && flags & CKF_RW_SESSION == 0 {
            return Err(rv(CKR_SESSION_READ_ONLY));
        }
        let (kind, signature_len) = self.key_pair_shape(mechanism, public_template)?;

        let secret = random_secret();
        let flag = |template: &Template, attr| template.flag(attr).unwrap_or(false);
        let public = KeyObject {
            session,
            class: KeyClass::Public,
            kind,
            secret,
            signature_len,
            usage: Usage {
                verify: flag(public_template, CKA_VERIFY),
                verify_recover: flag(public_template, CKA_VERIFY_RECOVER),
                ..Usage::default()
            },
        };
        let private = KeyObject {
            class: KeyClass::Private,
            usage: Usage {
                sign: flag(private_template, CKA_SIGN),
                sign_recover: flag(private_template, CKA_SIGN_RECOVER),
                ..Usage::default()
            },
            ..public.clone()
        };
        let public_handle = state.insert_object(public);
        let private_handle = state.insert_object(private);
        debug!(
            session,
            public_handle, private_handle, ?kind, signature_len, "keypair generated"
        );
        Ok((public_handle, private_handle))
    }

    fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> CkResult<()> {
        let mut state = self.state.lock();
        state.session_mut(session)?;
        state
            .objects
            .remove(&object)
            .map(|_| ())
            .ok_or(rv(CKR_OBJECT_HANDLE_INVALID))
    }

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()> {
        self.init_operation(session, mechanism, key, OperationKind::Sign)
    }

    fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        signature: Option<&mut [u8]>,
    ) -> CkResult<usize> {
        let mut state = self.state.lock();
        let operation = state.take_operation(session, OperationKind::Sign)?;
        if operation.multipart {
            // Only C_SignFinal ends a multi-part operation.
            state.restore_operation(session, operation);
            return Err(rv(CKR_OPERATION_ACTIVE));
        }
        check_data_len(&operation, data.len())?;
        let value = signature_value(&operation, data)?;
        let (result, finished) = self.write_signature(&value, signature);
        if !finished {
            state.restore_operation(session, operation);
        }
        result
    }

    fn sign_update(&self, session: CK_SESSION_HANDLE, part: &[u8]) -> CkResult<()> {
        self.update_operation(session, OperationKind::Sign, part)
    }

    fn sign_final(
        &self,
        session: CK_SESSION_HANDLE,
        signature: Option<&mut [u8]>,
    ) -> CkResult<usize> {
        let mut state = self.state.lock();
        let operation = state.take_operation(session, OperationKind::Sign)?;
        let value = signature_value(&operation, &operation.buffer)?;
        let (result, finished) = self.write_signature(&value, signature);
        if !finished {
            state.restore_operation(session, operation);
        }
        result
    }

    fn sign_recover_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()> {
        self.init_operation(session, mechanism, key, OperationKind::SignRecover)
    }

    fn sign_recover(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        signature: Option<&mut [u8]>,
    ) -> CkResult<usize> {
        let mut state = self.state.lock();
        let operation = state.take_operation(session, OperationKind::SignRecover)?;
        check_data_len(&operation, data.len())?;
        let value = seal_recoverable(&operation, data)?;
        let (result, finished) = write_output(&value, signature);
        if !finished {
            state.restore_operation(session, operation);
        }
        result
    }

    fn verify_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()> {
        self.init_operation(session, mechanism, key, OperationKind::Verify)
    }

    fn verify(&self, session: CK_SESSION_HANDLE, data: &[u8], signature: &[u8]) -> CkResult<()> {
        let mut state = self.state.lock();
        let operation = state.take_operation(session, OperationKind::Verify)?;
        if operation.multipart {
            // Only C_VerifyFinal ends a multi-part operation.
            state.restore_operation(session, operation);
            return Err(rv(CKR_OPERATION_ACTIVE));
        }
        check_data_len(&operation, data.len())?;
        self.compare(&operation, data, signature)
    }

    fn verify_update(&self, session: CK_SESSION_HANDLE, part: &[u8]) -> CkResult<()> {
        self.update_operation(session, OperationKind::Verify, part)
    }

    fn verify_final(&self, session: CK_SESSION_HANDLE, signature: &[u8]) -> CkResult<()> {
        let mut state = self.state.lock();
        let operation = state.take_operation(session, OperationKind::Verify)?;
        self.compare(&operation, &operation.buffer, signature)
    }

    fn verify_recover_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CkResult<()> {
        self.init_operation(session, mechanism, key, OperationKind::VerifyRecover)
    }

    fn verify_recover(
        &self,
        session: CK_SESSION_HANDLE,
        signature: &[u8],
        data: Option<&mut [u8]>,
    ) -> CkResult<usize> {
        let mut state = self.state.lock();
        let operation = state.take_operation(session, OperationKind::VerifyRecover)?;
        let mut recovered = open_recoverable(&operation, signature)?;
        if self.config.has(Fault::CorruptRecoveredData) {
            if let Some(first) = recovered.first_mut() {
                *first ^= 0x01;
            }
        }
        if self.config.has(Fault::TruncateRecoveredData) {
            recovered.pop();
        }
        let (result, finished) = write_output(&recovered, data);
        if !finished {
            state.restore_operation(session, operation);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curves::curve;

    fn logged_in(token: &SimulatedToken) -> CK_SESSION_HANDLE {
        token.initialize().expect("init");
        let session = token
            .open_session(SIMULATED_SLOT, CKF_SERIAL_SESSION)
            .expect("session");
        token.login(session, CKU_USER, b"1234").expect("login");
        session
    }

    fn rsa_pair(
        token: &SimulatedToken,
        session: CK_SESSION_HANDLE,
        public: &[CK_ATTRIBUTE_TYPE],
        private: &[CK_ATTRIBUTE_TYPE],
    ) -> (CK_OBJECT_HANDLE, CK_OBJECT_HANDLE) {
        let public = Template::new()
            .with_ulong(CKA_MODULUS_BITS, 1024)
            .with_flags(public);
        let private = Template::new().with_flags(private);
        token
            .generate_key_pair(
                session,
                &Mechanism::new(CKM_RSA_PKCS_KEY_PAIR_GEN),
                &public,
                &private,
            )
            .expect("keypair")
    }

    #[test]
    fn lifecycle_is_enforced() {
        let token = SimulatedToken::new();
        assert_eq!(
            token.slot_list(true),
            Err(ReturnCode(CKR_CRYPTOKI_NOT_INITIALIZED))
        );
        token.initialize().expect("init");
        assert_eq!(
            token.initialize(),
            Err(ReturnCode(CKR_CRYPTOKI_ALREADY_INITIALIZED))
        );
        token.finalize().expect("finalize");
        assert_eq!(
            token.finalize(),
            Err(ReturnCode(CKR_CRYPTOKI_NOT_INITIALIZED))
        );
    }

    #[test]
    fn login_checks_pin_and_state() {
        let token = SimulatedToken::builder().user_pin("0000").build();
        token.initialize().expect("init");
        let session = token
            .open_session(SIMULATED_SLOT, CKF_SERIAL_SESSION)
            .expect("session");
        assert_eq!(
            token.login(session, CKU_USER, b"1234"),
            Err(ReturnCode(CKR_PIN_INCORRECT))
        );
        token.login(session, CKU_USER, b"0000").expect("login");
        assert_eq!(
            token.login(session, CKU_USER, b"0000"),
            Err(ReturnCode(CKR_USER_ALREADY_LOGGED_IN))
        );
        token.logout(session).expect("logout");
        assert_eq!(token.logout(session), Err(ReturnCode(CKR_USER_NOT_LOGGED_IN)));
    }

    #[test]
    fn parallel_sessions_are_rejected() {
        let token = SimulatedToken::new();
        token.initialize().expect("init");
        assert_eq!(
            token.open_session(SIMULATED_SLOT, 0),
            Err(ReturnCode(CKR_SESSION_PARALLEL_NOT_SUPPORTED))
        );
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let token = SimulatedToken::new();
        let session = logged_in(&token);
        let (public, private) = rsa_pair(&token, session, &[CKA_VERIFY], &[CKA_SIGN]);
        let mechanism = Mechanism::new(CKM_SHA256_RSA_PKCS);

        token.sign_init(session, &mechanism, private).expect("sign init");
        let mut signature = [0u8; 1024];
        let len = token
            .sign(session, b"payload", Some(&mut signature))
            .expect("sign");
        assert_eq!(len, 128);

        token.verify_init(session, &mechanism, public).expect("verify init");
        token
            .verify(session, b"payload", &signature[..len])
            .expect("verify");

        token.verify_init(session, &mechanism, public).expect("verify init");
        assert_eq!(
            token.verify(session, b"other", &signature[..len]),
            Err(ReturnCode(CKR_SIGNATURE_INVALID))
        );
        token.verify_init(session, &mechanism, public).expect("verify init");
        assert_eq!(
            token.verify(session, b"payload", &signature[..4]),
            Err(ReturnCode(CKR_SIGNATURE_LEN_RANGE))
        );
    }

    #[test]
    fn length_query_keeps_operation_active() {
        let token = SimulatedToken::new();
        let session = logged_in(&token);
        let (_, private) = rsa_pair(&token, session, &[CKA_VERIFY], &[CKA_SIGN]);
        token
            .sign_init(session, &Mechanism::new(CKM_SHA1_RSA_PKCS), private)
            .expect("init");
        assert_eq!(token.sign(session, b"abc", None), Ok(128));
        let mut short = [0u8; 1];
        assert_eq!(
            token.sign(session, b"abc", Some(&mut short)),
            Err(ReturnCode(CKR_BUFFER_TOO_SMALL))
        );
        let mut full = [0u8; 256];
        assert_eq!(token.sign(session, b"abc", Some(&mut full)), Ok(128));
        assert_eq!(
            token.sign(session, b"abc", Some(&mut full)),
            Err(ReturnCode(CKR_OPERATION_NOT_INITIALIZED))
        );
    }

    #[test]
    fn init_checks_key_usage_and_type() {
        let token = SimulatedToken::new();
        let session = logged_in(&token);
        let (public, private) = rsa_pair(&token, session, &[], &[]);
        assert_eq!(
            token.sign_init(session, &Mechanism::new(CKM_RSA_PKCS), private),
            Err(ReturnCode(CKR_KEY_FUNCTION_NOT_PERMITTED))
        );
        assert_eq!(
            token.sign_init(session, &Mechanism::new(CKM_ECDSA), public),
            Err(ReturnCode(CKR_KEY_TYPE_INCONSISTENT))
        );
        assert_eq!(
            token.sign_init(session, &Mechanism::new(CKM_RSA_PKCS), 4242),
            Err(ReturnCode(CKR_KEY_HANDLE_INVALID))
        );
    }

    #[test]
    fn raw_rsa_enforces_padding_room() {
        let token = SimulatedToken::new();
        let session = logged_in(&token);
        let (_, private) = rsa_pair(&token, session, &[], &[CKA_SIGN]);
        let mechanism = Mechanism::new(CKM_RSA_PKCS);
        token.sign_init(session, &mechanism, private).expect("init");
        let mut out = [0u8; 256];
        assert_eq!(
            token.sign(session, &[0u8; 118], Some(&mut out)),
            Err(ReturnCode(CKR_DATA_LEN_RANGE))
        );
        token.sign_init(session, &mechanism, private).expect("init");
        assert_eq!(token.sign(session, &[0u8; 117], Some(&mut out)), Ok(128));
    }

    #[test]
    fn multipart_matches_single_part() {
        let token = SimulatedToken::new();
        let session = logged_in(&token);
        let (public, private) = rsa_pair(&token, session, &[CKA_VERIFY], &[CKA_SIGN]);
        let mechanism = Mechanism::new(CKM_SHA512_RSA_PKCS);

        token.sign_init(session, &mechanism, private).expect("init");
        token.sign_update(session, b"hello ").expect("update");
        token.sign_update(session, b"world").expect("update");
        let mut signature = [0u8; 512];
        let len = token
            .sign_final(session, Some(&mut signature))
            .expect("final");

        token.verify_init(session, &mechanism, public).expect("init");
        token
            .verify(session, b"hello world", &signature[..len])
            .expect("single-part verify");

        token.verify_init(session, &mechanism, public).expect("init");
        token.verify_update(session, b"hello world").expect("update");
        token
            .verify_final(session, &signature[..len])
            .expect("multi-part verify");
    }

    #[test]
    fn raw_mechanisms_refuse_multipart() {
        let token = SimulatedToken::new();
        let session = logged_in(&token);
        let (_, private) = rsa_pair(&token, session, &[], &[CKA_SIGN]);
        token
            .sign_init(session, &Mechanism::new(CKM_RSA_PKCS), private)
            .expect("init");
        assert_eq!(
            token.sign_update(session, b"x"),
            Err(ReturnCode(CKR_MECHANISM_INVALID))
        );
    }

    #[test]
    fn sign_recover_roundtrip() {
        let token = SimulatedToken::new();
        let session = logged_in(&token);
        let (public, private) = rsa_pair(
            &token,
            session,
            &[CKA_VERIFY_RECOVER],
            &[CKA_SIGN_RECOVER],
        );
        let mechanism = Mechanism::new(CKM_RSA_PKCS);
        let data: Vec<u8> = (0..64).collect();

        token
            .sign_recover_init(session, &mechanism, private)
            .expect("init");
        let mut signature = [0u8; 2048];
        let len = token
            .sign_recover(session, &data, Some(&mut signature))
            .expect("sign recover");
        assert_eq!(len, 128);

        token
            .verify_recover_init(session, &mechanism, public)
            .expect("init");
        let mut recovered = [0u8; 2048];
        let recovered_len = token
            .verify_recover(session, &signature[..len], Some(&mut recovered))
            .expect("verify recover");
        assert_eq!(&recovered[..recovered_len], data.as_slice());

        signature[3] ^= 0xFF;
        token
            .verify_recover_init(session, &mechanism, public)
            .expect("init");
        assert_eq!(
            token.verify_recover(session, &signature[..len], Some(&mut recovered)),
            Err(ReturnCode(CKR_SIGNATURE_INVALID))
        );
    }

    #[test]
    fn sign_recover_can_be_disabled() {
        let token = SimulatedToken::builder().without_sign_recover().build();
        let session = logged_in(&token);
        let (_, private) = rsa_pair(&token, session, &[], &[CKA_SIGN_RECOVER]);
        assert_eq!(
            token.sign_recover_init(session, &Mechanism::new(CKM_RSA_PKCS), private),
            Err(ReturnCode(CKR_FUNCTION_NOT_SUPPORTED))
        );
    }

    #[test]
    fn ec_keys_follow_curve_size() {
        let token = SimulatedToken::builder()
            .without_curve("NIST-SECP192R1")
            .build();
        let session = logged_in(&token);
        let mechanism = Mechanism::new(CKM_EC_KEY_PAIR_GEN);
        let p192 = curve("NIST-SECP192R1").expect("curve");
        let public = Template::new().with_bytes(CKA_EC_PARAMS, p192.ec_params());
        assert_eq!(
            token.generate_key_pair(session, &mechanism, &public, &Template::new()),
            Err(ReturnCode(CKR_CURVE_NOT_SUPPORTED))
        );

        let p384 = curve("NIST-SECP384R1").expect("curve");
        let public = Template::new()
            .with_bytes(CKA_EC_PARAMS, p384.ec_params())
            .with_flags(&[CKA_VERIFY]);
        let private = Template::new().with_flags(&[CKA_SIGN]);
        let (_, private) = token
            .generate_key_pair(session, &mechanism, &public, &private)
            .expect("keypair");
        token
            .sign_init(session, &Mechanism::new(CKM_ECDSA), private)
            .expect("init");
        assert_eq!(token.sign(session, &[7u8; 64], None), Ok(96));
    }

    #[test]
    fn closing_session_drops_its_objects() {
        let token = SimulatedToken::new();
        let session = logged_in(&token);
        rsa_pair(&token, session, &[], &[]);
        assert_eq!(token.live_objects(), 2);
        token.close_session(session).expect("close");
        assert_eq!(token.live_objects(), 0);
        assert_eq!(token.open_sessions(), 0);
    }

    #[test]
    fn token_objects_need_rw_session() {
        let token = SimulatedToken::new();
        let session = logged_in(&token);
        let public = Template::new()
            .with_ulong(CKA_MODULUS_BITS, 1024)
            .with_bool(CKA_TOKEN, true);
        assert_eq!(
            token.generate_key_pair(
                session,
                &Mechanism::new(CKM_RSA_PKCS_KEY_PAIR_GEN),
                &public,
                &Template::new()
            ),
            Err(ReturnCode(CKR_SESSION_READ_ONLY))
        );
    }

    #[test]
    fn faults_change_verification() {
        let token = SimulatedToken::builder()
            .with_fault(Fault::IgnoreSignatureLength)
            .build();
        let session = logged_in(&token);
        let (public, private) = rsa_pair(&token, session, &[CKA_VERIFY], &[CKA_SIGN]);
        let mechanism = Mechanism::new(CKM_SHA256_RSA_PKCS);
        token.sign_init(session, &mechanism, private).expect("init");
        let mut signature = [0u8; 256];
        let len = token
            .sign(session, b"data", Some(&mut signature))
            .expect("sign");
        token.verify_init(session, &mechanism, public).expect("init");
        assert_eq!(
            token.verify(session, b"data", &signature[..len - 1]),
            Err(ReturnCode(CKR_SIGNATURE_INVALID))
        );
    }

    #[test]
    fn single_part_call_leaves_multipart_operation_active() {
        let token = SimulatedToken::new();
        let session = logged_in(&token);
        let (_, private) = rsa_pair(&token, session, &[], &[CKA_SIGN]);
        let mechanism = Mechanism::new(CKM_SHA256_RSA_PKCS);
        token.sign_init(session, &mechanism, private).expect("init");
        token.sign_update(session, b"part").expect("update");

        let mut signature = [0u8; 256];
        assert_eq!(
            token.sign(session, b"part", Some(&mut signature)),
            Err(ReturnCode(CKR_OPERATION_ACTIVE))
        );
        assert_eq!(token.sign_final(session, Some(&mut signature)), Ok(128));
    }

    #[test]
    fn output_faults_misreport_signature_length() {
        let token = SimulatedToken::builder()
            .with_fault(Fault::UnderstateSignatureLength)
            .with_fault(Fault::IgnoreShortBuffer)
            .build();
        let session = logged_in(&token);
        let (_, private) = rsa_pair(&token, session, &[], &[CKA_SIGN]);
        token
            .sign_init(session, &Mechanism::new(CKM_SHA256_RSA_PKCS), private)
            .expect("init");
        assert_eq!(token.sign(session, b"data", None), Ok(127));
        let mut tiny = [0u8; 1];
        assert_eq!(token.sign(session, b"data", Some(&mut tiny)), Ok(1));
    }

    #[test]
    fn recovery_faults_alter_recovered_data() {
        let token = SimulatedToken::builder()
            .with_fault(Fault::CorruptRecoveredData)
            .with_fault(Fault::TruncateRecoveredData)
            .build();
        let session = logged_in(&token);
        let (public, private) = rsa_pair(
            &token,
            session,
            &[CKA_VERIFY_RECOVER],
            &[CKA_SIGN_RECOVER],
        );
        let mechanism = Mechanism::new(CKM_RSA_PKCS);
        let data = [0x10u8; 16];
        token
            .sign_recover_init(session, &mechanism, private)
            .expect("init");
        let mut signature = [0u8; 256];
        let len = token
            .sign_recover(session, &data, Some(&mut signature))
            .expect("sign recover");
        token
            .verify_recover_init(session, &mechanism, public)
            .expect("init");
        let mut recovered = [0u8; 256];
        let recovered_len = token
            .verify_recover(session, &signature[..len], Some(&mut recovered))
            .expect("verify recover");
        assert_eq!(recovered_len, 15);
        assert_eq!(recovered[0], 0x11);
    }
}

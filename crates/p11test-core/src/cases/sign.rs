//! s11.11 signing and s11.12 verification cases.

use cryptoki_sys::{
    CK_SESSION_HANDLE, CKA_DECRYPT, CKA_ENCRYPT, CKA_SIGN, CKA_SIGN_RECOVER, CKA_VERIFY,
    CKA_VERIFY_RECOVER, CKM_RSA_PKCS, CKR_BUFFER_TOO_SMALL, CKR_FUNCTION_NOT_SUPPORTED,
    CKR_SIGNATURE_INVALID, CKR_SIGNATURE_LEN_RANGE,
};
use tracing::{debug, info};

use super::{CaseContext, SignParam};
use crate::backend::Cryptoki;
use crate::check::{CaseResult, Checker, Stop, skip_if_unimplemented, skip_unless_valid};
use crate::data::{payload_for, random_bytes};
use crate::keypair::KeyPair;
use crate::mechanism::{Mechanism, SignatureInfo};
use crate::rv::{CkResult, rv_of};

const SIGNATURE_BUFFER: usize = 1024;
const RECOVER_BUFFER: usize = 2048;
const RECOVER_DATA_LEN: usize = 64;
const SHORT_SIGNATURE_LEN: usize = 4;
const MULTIPART_CHUNKS: usize = 3;

/// A sign/verify keypair plus the payload a case signs.
struct SignFixture<'a> {
    backend: &'a dyn Cryptoki,
    session: CK_SESSION_HANDLE,
    info: &'static SignatureInfo,
    pair: KeyPair<'a>,
    data: Vec<u8>,
}

impl<'a> SignFixture<'a> {
    fn new(ctx: &mut CaseContext<'a>, param: SignParam) -> Result<Self, Stop> {
        let backend = ctx.session.backend();
        let session = ctx.session.handle();
        let pair = match param.curve {
            None => KeyPair::rsa(backend, session, ctx.modulus_bits, &[CKA_VERIFY], &[CKA_SIGN]),
            Some(curve) => KeyPair::ec(
                backend,
                session,
                curve.ec_params(),
                &[CKA_VERIFY],
                &[CKA_SIGN],
            ),
        };
        skip_unless_valid(&pair, param.label())?;
        let data = payload_for(param.info, ctx.modulus_bits, &mut ctx.rng);
        debug!(mechanism = param.info.name, len = data.len(), "payload ready");
        Ok(Self {
            backend,
            session,
            info: param.info,
            pair,
            data,
        })
    }

    fn mechanism(&self) -> Mechanism {
        self.info.mechanism()
    }

    fn sign_init(&self, check: &mut Checker) -> CaseResult {
        let result = self
            .backend
            .sign_init(self.session, &self.mechanism(), self.pair.private_handle());
        skip_if_unimplemented(rv_of(&result), self.info.name)?;
        check.assert_ok("C_SignInit", result)
    }

    /// SignInit then single-part Sign into a fixed buffer.
    fn sign(&self, check: &mut Checker) -> Result<Vec<u8>, Stop> {
        self.sign_init(check)?;
        let mut signature = vec![0u8; SIGNATURE_BUFFER];
        let len = check.assert_ok(
            "C_Sign",
            self.backend
                .sign(self.session, &self.data, Some(&mut signature)),
        )?;
        check.assert_true("C_Sign produced a signature", len > 0)?;
        signature.truncate(len);
        debug!(signature = %hex::encode(&signature), "signed");
        Ok(signature)
    }

    fn verify_init(&self, check: &mut Checker) -> CaseResult {
        check.assert_ok(
            "C_VerifyInit",
            self.backend
                .verify_init(self.session, &self.mechanism(), self.pair.public_handle()),
        )
    }

    /// VerifyInit then single-part Verify; the verify status is the result.
    fn verify(&self, check: &mut Checker, signature: &[u8]) -> Result<CkResult<()>, Stop> {
        self.verify_init(check)?;
        Ok(self.backend.verify(self.session, &self.data, signature))
    }

    fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        let size = self.data.len().div_ceil(MULTIPART_CHUNKS).max(1);
        self.data.chunks(size)
    }
}

pub(super) fn sign_verify(ctx: &mut CaseContext<'_>, param: SignParam) -> CaseResult {
    let fixture = SignFixture::new(ctx, param)?;
    let signature = fixture.sign(&mut ctx.check)?;
    let result = fixture.verify(&mut ctx.check, &signature)?;
    ctx.check.expect_ok("C_Verify", &result);
    Ok(())
}

pub(super) fn sign_fail_verify_wrong(ctx: &mut CaseContext<'_>, param: SignParam) -> CaseResult {
    let fixture = SignFixture::new(ctx, param)?;
    let mut signature = fixture.sign(&mut ctx.check)?;
    signature[0] = signature[0].wrapping_add(1);
    let result = fixture.verify(&mut ctx.check, &signature)?;
    ctx.check
        .expect_rv("C_Verify", CKR_SIGNATURE_INVALID, &result);
    Ok(())
}

pub(super) fn sign_fail_verify_short(ctx: &mut CaseContext<'_>, param: SignParam) -> CaseResult {
    let fixture = SignFixture::new(ctx, param)?;
    let signature = fixture.sign(&mut ctx.check)?;
    let short = &signature[..SHORT_SIGNATURE_LEN.min(signature.len())];
    let result = fixture.verify(&mut ctx.check, short)?;
    ctx.check
        .expect_rv("C_Verify", CKR_SIGNATURE_LEN_RANGE, &result);
    Ok(())
}

pub(super) fn sign_verify_multipart(ctx: &mut CaseContext<'_>, param: SignParam) -> CaseResult {
    if !param.info.multipart {
        return Err(Stop::Skip(format!(
            "{} does not digest its input",
            param.info.name
        )));
    }
    let mut fixture = SignFixture::new(ctx, param)?;
    // At least one C_SignUpdate must reach the module.
    if fixture.data.is_empty() {
        fixture.data = random_bytes(&mut ctx.rng, 1);
    }
    fixture.sign_init(&mut ctx.check)?;

    for (index, chunk) in fixture.chunks().enumerate() {
        let result = fixture.backend.sign_update(fixture.session, chunk);
        if index == 0 && rv_of(&result).raw() == CKR_FUNCTION_NOT_SUPPORTED {
            return Err(Stop::Skip("multi-part signing not supported".to_string()));
        }
        ctx.check.assert_ok("C_SignUpdate", result)?;
    }
    let mut signature = vec![0u8; SIGNATURE_BUFFER];
    let len = ctx.check.assert_ok(
        "C_SignFinal",
        fixture
            .backend
            .sign_final(fixture.session, Some(&mut signature)),
    )?;
    signature.truncate(len);

    let single = fixture.verify(&mut ctx.check, &signature)?;
    ctx.check.expect_ok("C_Verify", &single);

    fixture.verify_init(&mut ctx.check)?;
    for chunk in fixture.chunks() {
        ctx.check.assert_ok(
            "C_VerifyUpdate",
            fixture.backend.verify_update(fixture.session, chunk),
        )?;
    }
    let multi = fixture.backend.verify_final(fixture.session, &signature);
    ctx.check.expect_ok("C_VerifyFinal", &multi);
    Ok(())
}

pub(super) fn sign_length_query(ctx: &mut CaseContext<'_>, param: SignParam) -> CaseResult {
    let fixture = SignFixture::new(ctx, param)?;
    fixture.sign_init(&mut ctx.check)?;

    let queried = ctx.check.assert_ok(
        "C_Sign(NULL)",
        fixture.backend.sign(fixture.session, &fixture.data, None),
    )?;
    ctx.check.assert_true("queried signature length is non-zero", queried > 0)?;

    let mut tiny = [0u8; 1];
    let result = fixture
        .backend
        .sign(fixture.session, &fixture.data, Some(&mut tiny));
    ctx.check
        .assert_rv("C_Sign(1-byte buffer)", CKR_BUFFER_TOO_SMALL, &result)?;

    let mut signature = vec![0u8; queried];
    let len = ctx.check.assert_ok(
        "C_Sign",
        fixture
            .backend
            .sign(fixture.session, &fixture.data, Some(&mut signature)),
    )?;
    ctx.check
        .expect_true("signature fits the queried length", len <= queried);
    signature.truncate(len);

    let result = fixture.verify(&mut ctx.check, &signature)?;
    ctx.check.expect_ok("C_Verify", &result);
    Ok(())
}

pub(super) fn sign_verify_recover(ctx: &mut CaseContext<'_>) -> CaseResult {
    let backend = ctx.session.backend();
    let session = ctx.session.handle();
    let pair = KeyPair::rsa(
        backend,
        session,
        ctx.modulus_bits,
        &[CKA_VERIFY_RECOVER, CKA_ENCRYPT],
        &[CKA_SIGN_RECOVER, CKA_DECRYPT],
    );
    skip_unless_valid(&pair, "RSA")?;
    let data = random_bytes(&mut ctx.rng, RECOVER_DATA_LEN);
    let mechanism = Mechanism::new(CKM_RSA_PKCS);

    let result = backend.sign_recover_init(session, &mechanism, pair.private_handle());
    if rv_of(&result).raw() == CKR_FUNCTION_NOT_SUPPORTED {
        return Err(Stop::Skip("SignRecover not supported".to_string()));
    }
    skip_if_unimplemented(rv_of(&result), "RSA")?;
    ctx.check.assert_ok("C_SignRecoverInit", result)?;

    let mut signature = vec![0u8; RECOVER_BUFFER];
    let len = ctx.check.assert_ok(
        "C_SignRecover",
        backend.sign_recover(session, &data, Some(&mut signature)),
    )?;
    signature.truncate(len);
    if ctx.verbose {
        info!(signature = %hex::encode(&signature), "SignRecover output");
    }

    ctx.check.assert_ok(
        "C_VerifyRecoverInit",
        backend.verify_recover_init(session, &mechanism, pair.public_handle()),
    )?;
    let mut recovered = vec![0u8; RECOVER_BUFFER];
    let recovered_len = ctx.check.assert_ok(
        "C_VerifyRecover",
        backend.verify_recover(session, &signature, Some(&mut recovered)),
    )?;
    recovered.truncate(recovered_len);

    ctx.check
        .expect_eq("recovered length", data.len(), recovered_len);
    ctx.check
        .expect_eq("recovered data", hex::encode(&data), hex::encode(&recovered));
    Ok(())
}

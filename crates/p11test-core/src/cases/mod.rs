//! Conformance case registry.

mod sign;

use cryptoki_sys::CK_ULONG;
use rand::rngs::StdRng;

use crate::check::{CaseResult, Checker};
use crate::curves::{CURVES, Curve};
use crate::mechanism::{SIGNATURE_MECHANISMS, SignatureInfo};
use crate::session::UserSession;

/// Everything a case body can touch.
pub struct CaseContext<'a> {
    pub session: &'a UserSession<'a>,
    pub rng: StdRng,
    pub check: Checker,
    pub modulus_bits: CK_ULONG,
    pub verbose: bool,
}

/// Parameter of the signature fixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignParam {
    pub info: &'static SignatureInfo,
    /// Set for the EC fixture, which is parameterized by curve.
    pub curve: Option<&'static Curve>,
}

impl SignParam {
    pub fn label(&self) -> &'static str {
        self.curve.map_or(self.info.name, |curve| curve.name)
    }
}

type ParamBody = fn(&mut CaseContext<'_>, SignParam) -> CaseResult;
type PlainBody = fn(&mut CaseContext<'_>) -> CaseResult;

#[derive(Clone, Copy)]
enum CaseBody {
    Parameterized(ParamBody, SignParam),
    Plain(PlainBody),
}

/// A registered case and its gtest-style id.
#[derive(Clone)]
pub struct Case {
    id: String,
    body: CaseBody,
}

impl Case {
    fn parameterized(
        instantiation: &str,
        fixture: &str,
        name: &str,
        body: ParamBody,
        param: SignParam,
    ) -> Self {
        Self {
            id: format!("{instantiation}/{fixture}.{name}/{}", param.label()),
            body: CaseBody::Parameterized(body, param),
        }
    }

    fn plain(fixture: &str, name: &str, body: PlainBody) -> Self {
        Self {
            id: format!("{fixture}.{name}"),
            body: CaseBody::Plain(body),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn run(&self, ctx: &mut CaseContext<'_>) -> CaseResult {
        match self.body {
            CaseBody::Parameterized(body, param) => body(ctx, param),
            CaseBody::Plain(body) => body(ctx),
        }
    }
}

impl std::fmt::Debug for Case {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Case").field("id", &self.id).finish()
    }
}

const RSA_PARAMS: [&str; 6] = [
    "RSA",
    "MD5-RSA",
    "SHA1-RSA",
    "SHA256-RSA",
    "SHA384-RSA",
    "SHA512-RSA",
];

fn rsa_params() -> Vec<SignParam> {
    SIGNATURE_MECHANISMS
        .iter()
        .filter(|info| RSA_PARAMS.contains(&info.name))
        .map(|info| SignParam { info, curve: None })
        .collect()
}

fn ec_params() -> Vec<SignParam> {
    SIGNATURE_MECHANISMS
        .iter()
        .filter(|info| info.name == "ECDSA")
        .flat_map(|info| {
            CURVES.iter().map(move |curve| SignParam {
                info,
                curve: Some(curve),
            })
        })
        .collect()
}

/// Every s11.11/11.12 case, grouped by fixture then case then parameter.
pub fn signature_cases() -> Vec<Case> {
    let mut cases = Vec::new();

    let rsa_cases: [(&str, ParamBody); 5] = [
        ("SignVerify", sign::sign_verify),
        ("SignFailVerifyWrong", sign::sign_fail_verify_wrong),
        ("SignFailVerifyShort", sign::sign_fail_verify_short),
        ("SignVerifyMultipart", sign::sign_verify_multipart),
        ("SignLengthQuery", sign::sign_length_query),
    ];
    let params = rsa_params();
    for (name, body) in rsa_cases {
        for param in &params {
            cases.push(Case::parameterized("Signatures", "SignTest", name, body, *param));
        }
    }

    let ec_cases: [(&str, ParamBody); 4] = [
        ("SignVerify", sign::sign_verify),
        ("SignFailVerifyWrong", sign::sign_fail_verify_wrong),
        ("SignFailVerifyShort", sign::sign_fail_verify_short),
        ("SignLengthQuery", sign::sign_length_query),
    ];
    let params = ec_params();
    for (name, body) in ec_cases {
        for param in &params {
            cases.push(Case::parameterized("SignaturesEC", "SignTestEC", name, body, *param));
        }
    }

    cases.push(Case::plain(
        "ROUserSessionTest",
        "SignVerifyRecover",
        sign::sign_verify_recover,
    ));
    cases
}

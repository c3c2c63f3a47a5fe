//! OAuth2 / OpenID Connect RFC protocol definitions for the authorisation
//! endpoint and the device authorisation endpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_with::base64::{Base64, UrlSafe};
use serde_with::formats::SpaceSeparator;
use serde_with::{
    formats, rust::deserialize_ignore_any, serde_as, skip_serializing_none, StringWithSeparator,
};
use url::Url;

/// How many seconds a device code is valid for.
pub const OAUTH2_DEVICE_CODE_EXPIRY_SECONDS: u64 = 300;
/// How often a client device may poll for the status of the user code entry.
pub const OAUTH2_DEVICE_CODE_INTERVAL_SECONDS: u64 = 5;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum CodeChallengeMethod {
    // BASE64URL-ENCODE(SHA256(ASCII(code_verifier))). We do not accept
    // the plain method at all.
    S256,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PkceRequest {
    #[serde_as(as = "Base64<UrlSafe, formats::Unpadded>")]
    pub code_challenge: Vec<u8>,
    pub code_challenge_method: CodeChallengeMethod,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    // Auth Code flow
    // https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.1
    Code,
    // Implicit Grant flow
    // https://datatracker.ietf.org/doc/html/rfc6749#section-4.2.1
    Token,
    // https://openid.net/specs/oauth-v2-multiple-response-types-1_0.html#id_token
    IdToken,
}

impl FromStr for ResponseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(ResponseType::Code),
            "token" => Ok(ResponseType::Token),
            "id_token" => Ok(ResponseType::IdToken),
            _ => Err(format!("Unknown response_type: {s}")),
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResponseType::Code => "code",
            ResponseType::Token => "token",
            ResponseType::IdToken => "id_token",
        })
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Query,
    Fragment,
    FormPost,
    #[serde(other, deserialize_with = "deserialize_ignore_any")]
    Invalid,
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResponseMode::Query => "query",
            ResponseMode::Fragment => "fragment",
            ResponseMode::FormPost => "form_post",
            ResponseMode::Invalid => "invalid",
        })
    }
}

/// The `prompt` request parameter values.
/// <https://openid.net/specs/openid-connect-core-1_0.html#AuthRequest>
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
    None,
    Login,
    Consent,
    SelectAccount,
}

impl FromStr for Prompt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Prompt::None),
            "login" => Ok(Prompt::Login),
            "consent" => Ok(Prompt::Consent),
            "select_account" => Ok(Prompt::SelectAccount),
            _ => Err(format!("Unknown prompt value: {s}")),
        }
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Prompt::None => "none",
            Prompt::Login => "login",
            Prompt::Consent => "consent",
            Prompt::SelectAccount => "select_account",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum DisplayValue {
    Page,
    Popup,
    Touch,
    Wap,
}

/// An OAuth2 client redirects to the authorisation server with these
/// parameters, either directly or by reference through a pushed
/// authorisation request.
#[serde_as]
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthorisationRequest {
    /// Space separated response types. Any combination of `code`, `token`
    /// and `id_token`.
    #[serde_as(as = "StringWithSeparator::<SpaceSeparator, ResponseType>")]
    pub response_type: BTreeSet<ResponseType>,
    /// Optional; defaults to `query` when only `code` is requested and
    /// `fragment` whenever an implicit type is present.
    ///
    /// Reference:
    /// [OAuth 2.0 Multiple Response Type Encoding Practices: Response Modes](https://openid.net/specs/oauth-v2-multiple-response-types-1_0.html#ResponseModes)
    pub response_mode: Option<ResponseMode>,
    pub client_id: String,
    pub state: Option<String>,
    #[serde(flatten)]
    pub pkce_request: Option<PkceRequest>,
    /// Absent when a pushed authorisation request or a device flow page
    /// supplies the effective redirect target.
    pub redirect_uri: Option<Url>,
    #[serde_as(as = "StringWithSeparator::<SpaceSeparator, String>")]
    pub scope: BTreeSet<String>,
    pub nonce: Option<String>,
    #[serde_as(as = "Option<StringWithSeparator::<SpaceSeparator, Prompt>>")]
    pub prompt: Option<Vec<Prompt>>,
    pub display: Option<DisplayValue>,
    // Needs to be hoisted here due to serde flatten bug #3185
    pub max_age: Option<i64>,
    pub ui_locales: Option<String>,
    pub id_token_hint: Option<String>,
    pub login_hint: Option<String>,
    #[serde_as(as = "Option<StringWithSeparator::<SpaceSeparator, String>>")]
    pub acr_values: Option<Vec<String>>,
    #[serde_as(as = "Option<StringWithSeparator::<SpaceSeparator, String>>")]
    pub amr_values: Option<Vec<String>>,
    /// An inline JWT request object.
    pub request: Option<String>,
    /// A by-reference request object, or a pushed authorisation request
    /// reference when it carries the PAR urn prefix.
    pub request_uri: Option<String>,
    pub session_id: Option<String>,
    /// Raw `claims` request parameter, kept as the original JSON text.
    pub claims: Option<String>,
    /// Backchannel authentication request id being completed by this
    /// interactive round trip.
    pub auth_req_id: Option<String>,
    /// Deployment defined JSON object of headers to echo on the response.
    pub custom_response_headers: Option<String>,
    // Opaque parameters we carry but do not interpret.
    #[serde(flatten)]
    pub unknown_keys: BTreeMap<String, String>,
}

impl AuthorisationRequest {
    /// Get the `response_mode` appropriate for this request, taking into
    /// account defaults from the `response_type` parameter. Returns `None`
    /// if the selection is invalid.
    ///
    /// Reference:
    /// [OAuth 2.0 Multiple Response Type Encoding Practices: Response Modes](https://openid.net/specs/oauth-v2-multiple-response-types-1_0.html#ResponseModes)
    pub fn get_response_mode(&self) -> Option<ResponseMode> {
        let fragment_default = self.response_type.contains(&ResponseType::Token)
            || self.response_type.contains(&ResponseType::IdToken);

        match (self.response_mode, fragment_default) {
            (None, false) => Some(ResponseMode::Query),
            (None, true) => Some(ResponseMode::Fragment),
            // In no case should a set of parameters whose default response
            // mode is the fragment encoding be sent in the query encoding.
            (Some(ResponseMode::Query), true) => None,
            (Some(ResponseMode::Invalid), _) => None,
            (Some(m), _) => Some(m),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    #[serde(rename = "authorization_code")]
    AuthorisationCode,
    Implicit,
    RefreshToken,
    /// ref <https://www.rfc-editor.org/rfc/rfc8628#section-3.4>
    #[serde(rename = "urn:ietf:params:oauth:grant-type:device_code")]
    DeviceCode,
    #[serde(rename = "urn:openid:params:grant-type:ciba")]
    Ciba,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Pairwise,
    Public,
}

/// How tokens minted by a backchannel (CIBA) completion reach the client.
/// <https://openid.net/specs/openid-client-initiated-backchannel-authentication-core-1_0.html#rfc.section.5>
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum BackchannelTokenDeliveryMode {
    Poll,
    Ping,
    Push,
}

/// Access token types, per [IANA Registry - OAuth Access Token Types](https://www.iana.org/assignments/oauth-parameters/oauth-parameters.xhtml#token-types)
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone, Copy)]
#[serde(try_from = "&str")]
pub enum AccessTokenType {
    Bearer,
    PoP,
    #[serde(rename = "N_A")]
    NA,
    DPoP,
}

impl TryFrom<&str> for AccessTokenType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "bearer" => Ok(AccessTokenType::Bearer),
            "pop" => Ok(AccessTokenType::PoP),
            "n_a" => Ok(AccessTokenType::NA),
            "dpop" => Ok(AccessTokenType::DPoP),
            _ => Err(format!("Unknown AccessTokenType: {s}")),
        }
    }
}

impl fmt::Display for AccessTokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessTokenType::Bearer => "Bearer",
            AccessTokenType::PoP => "PoP",
            AccessTokenType::NA => "N_A",
            AccessTokenType::DPoP => "DPoP",
        })
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
    pub error_uri: Option<Url>,
}

/// Request body of the device authorisation endpoint.
/// <https://www.rfc-editor.org/rfc/rfc8628#section-3.1>
#[serde_as]
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeviceAuthorizationRequest {
    pub client_id: String,
    #[serde_as(as = "Option<StringWithSeparator::<SpaceSeparator, String>>")]
    pub scope: Option<BTreeSet<String>>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
/// Ref <https://www.rfc-editor.org/rfc/rfc8628#section-3.2>
pub struct DeviceAuthorizationResponse {
    /// Base64-encoded bundle of 16 bytes
    pub device_code: String,
    /// xxx-yyy-zzz where x/y/z are digits.
    pub user_code: String,
    pub verification_uri: Url,
    pub verification_uri_complete: Url,
    pub expires_in: u64,
    pub interval: u64,
}

impl DeviceAuthorizationResponse {
    pub fn new(verification_uri: Url, device_code: [u8; 16], user_code: String) -> Self {
        let mut verification_uri_complete = verification_uri.clone();
        verification_uri_complete
            .query_pairs_mut()
            .append_pair("user_code", &user_code);

        let device_code = STANDARD.encode(device_code);

        Self {
            verification_uri_complete,
            device_code,
            user_code,
            verification_uri,
            expires_in: OAUTH2_DEVICE_CODE_EXPIRY_SECONDS,
            interval: OAUTH2_DEVICE_CODE_INTERVAL_SECONDS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorisation_request_from_query() {
        let q = "response_type=code&client_id=test_client&state=123\
                 &redirect_uri=https%3A%2F%2Fdemo.example.com%2Foauth2%2Fresult\
                 &scope=openid%20email&nonce=abcdef&prompt=consent%20login\
                 &code_challenge=dGVzdF9jaGFsbGVuZ2VfdmFsdWU&code_challenge_method=S256\
                 &custom_param=custom_value";
        let req: AuthorisationRequest = serde_urlencoded::from_str(q).expect("Failed to parse");

        assert_eq!(req.response_type, BTreeSet::from([ResponseType::Code]));
        assert_eq!(req.client_id, "test_client");
        assert_eq!(
            req.scope,
            BTreeSet::from(["openid".to_string(), "email".to_string()])
        );
        assert_eq!(req.prompt, Some(vec![Prompt::Consent, Prompt::Login]));
        assert_eq!(
            req.pkce_request.as_ref().map(|p| p.code_challenge_method),
            Some(CodeChallengeMethod::S256)
        );
        assert_eq!(
            req.unknown_keys.get("custom_param").map(String::as_str),
            Some("custom_value")
        );
        assert_eq!(req.get_response_mode(), Some(ResponseMode::Query));
    }

    #[test]
    fn test_response_mode_defaults() {
        let mut req: AuthorisationRequest =
            serde_urlencoded::from_str("response_type=code%20token&client_id=c&scope=openid")
                .expect("Failed to parse");

        // Hybrid defaults to fragment.
        assert_eq!(req.get_response_mode(), Some(ResponseMode::Fragment));

        // Downgrading a fragment-default set to query is rejected.
        req.response_mode = Some(ResponseMode::Query);
        assert_eq!(req.get_response_mode(), None);

        // form_post may always be requested explicitly.
        req.response_mode = Some(ResponseMode::FormPost);
        assert_eq!(req.get_response_mode(), Some(ResponseMode::FormPost));
    }

    #[test]
    fn test_unknown_response_mode_is_invalid() {
        let req: AuthorisationRequest = serde_urlencoded::from_str(
            "response_type=code&client_id=c&scope=openid&response_mode=cheese",
        )
        .expect("Failed to parse");
        assert_eq!(req.response_mode, Some(ResponseMode::Invalid));
        assert_eq!(req.get_response_mode(), None);
    }

    #[test]
    fn test_access_token_type_serde() {
        for testcase in ["bearer", "Bearer", "BeArEr"] {
            let at: AccessTokenType =
                serde_json::from_str(&format!("\"{testcase}\"")).expect("Failed to parse");
            assert_eq!(at, AccessTokenType::Bearer);
        }

        {
            let testcase = "cheese";
            let at = serde_json::from_str::<AccessTokenType>(&format!("\"{testcase}\""));
            assert!(at.is_err())
        }
    }

    #[test]
    fn test_grant_type_serde() {
        let gt: GrantType =
            serde_json::from_str("\"urn:ietf:params:oauth:grant-type:device_code\"")
                .expect("Failed to parse");
        assert_eq!(gt, GrantType::DeviceCode);

        let gt: GrantType =
            serde_json::from_str("\"authorization_code\"").expect("Failed to parse");
        assert_eq!(gt, GrantType::AuthorisationCode);
    }

    #[test]
    fn test_device_authorization_response() {
        let uri = Url::parse("https://idp.example.com/device").expect("Invalid url");
        let resp = DeviceAuthorizationResponse::new(uri, [0u8; 16], "123-456-789".to_string());
        assert_eq!(
            resp.verification_uri_complete.as_str(),
            "https://idp.example.com/device?user_code=123-456-789"
        );
        assert_eq!(resp.expires_in, OAUTH2_DEVICE_CODE_EXPIRY_SECONDS);
    }
}

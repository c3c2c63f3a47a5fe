//! Signed (JWT encoded) request objects, RFC 9101, and the analogous rule
//! set for CIBA backchannel request objects. Parsing and claim validation
//! happen here; signature verification is the crypto collaborator's
//! problem.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ianus_proto::oauth2::{
    CodeChallengeMethod, DisplayValue, PkceRequest, Prompt, ResponseMode, ResponseType,
};
use serde::Deserialize;
use serde_with::formats::SpaceSeparator;
use serde_with::{serde_as, OneOrMany, StringWithSeparator};

use crate::authz::request::AuthzRequest;
use crate::authz::Oauth2Error;
use crate::external::{CryptoProvider, RequestObjectFetcher, SignaturePolicyError};
use crate::prelude::*;
use crate::store::Client;

/// One entry of the OIDC `claims` request syntax, e.g.
/// `{"essential": true, "value": "mfa"}`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ClaimEntry {
    pub essential: Option<bool>,
    pub value: Option<String>,
    pub values: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct IdTokenMember {
    pub max_age: Option<i64>,
    pub acr: Option<ClaimEntry>,
    #[serde(flatten)]
    pub claims: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ClaimsMember {
    pub userinfo: Option<serde_json::Value>,
    pub id_token: Option<IdTokenMember>,
}

/// The claim set of a request object. Everything is optional at parse
/// time; validation decides what is mandatory under which profile.
#[serde_as]
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RequestObjectClaims {
    pub iss: Option<String>,
    #[serde(default)]
    #[serde_as(as = "OneOrMany<_>")]
    pub aud: Vec<String>,
    pub exp: Option<i64>,
    pub nbf: Option<i64>,
    pub iat: Option<i64>,
    pub jti: Option<String>,
    pub client_id: Option<String>,
    #[serde_as(as = "Option<StringWithSeparator::<SpaceSeparator, ResponseType>>")]
    pub response_type: Option<BTreeSet<ResponseType>>,
    pub response_mode: Option<ResponseMode>,
    pub redirect_uri: Option<Url>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    #[serde_as(as = "Option<StringWithSeparator::<SpaceSeparator, String>>")]
    pub scope: Option<BTreeSet<String>>,
    #[serde_as(as = "Option<StringWithSeparator::<SpaceSeparator, Prompt>>")]
    pub prompt: Option<Vec<Prompt>>,
    pub display: Option<DisplayValue>,
    pub max_age: Option<i64>,
    #[serde_as(as = "Option<StringWithSeparator::<SpaceSeparator, String>>")]
    pub acr_values: Option<Vec<String>>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub claims: Option<ClaimsMember>,
    pub login_hint: Option<String>,
    pub login_hint_token: Option<String>,
    pub id_token_hint: Option<String>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestObject {
    pub raw: String,
    pub alg: String,
    pub claims: RequestObjectClaims,
}

#[derive(Deserialize)]
struct JoseHeader {
    alg: String,
}

/// Parse a compact JWS into its header algorithm and claim set. Encrypted
/// (five segment) objects are refused here; decryption belongs to the
/// transport in front of us.
pub fn parse_request_object(raw: &str) -> Result<RequestObject, Oauth2Error> {
    let segments: Vec<&str> = raw.split('.').collect();
    if segments.len() != 3 {
        warn!(
            segments = segments.len(),
            "Request object is not a compact JWS"
        );
        return Err(Oauth2Error::InvalidRequestObject);
    }

    let header_bytes = URL_SAFE_NO_PAD.decode(segments[0]).map_err(|err| {
        warn!(?err, "Failed to decode request object header");
        Oauth2Error::InvalidRequestObject
    })?;
    let header: JoseHeader = serde_json::from_slice(&header_bytes).map_err(|err| {
        warn!(?err, "Failed to parse request object header");
        Oauth2Error::InvalidRequestObject
    })?;

    let payload_bytes = URL_SAFE_NO_PAD.decode(segments[1]).map_err(|err| {
        warn!(?err, "Failed to decode request object payload");
        Oauth2Error::InvalidRequestObject
    })?;
    let claims: RequestObjectClaims = serde_json::from_slice(&payload_bytes).map_err(|err| {
        warn!(?err, "Failed to parse request object claims");
        Oauth2Error::InvalidRequestObject
    })?;

    Ok(RequestObject {
        raw: raw.to_string(),
        alg: header.alg,
        claims,
    })
}

/// Load the request object of the canonical request, if any. A `request_uri`
/// that cannot be fetched is reported as absent, not as a failure.
pub(crate) fn load_request_object(
    fetcher: Option<&dyn RequestObjectFetcher>,
    request: &AuthzRequest,
) -> Result<Option<RequestObject>, Oauth2Error> {
    if request.request.is_some() && request.request_uri.is_some() {
        warn!("Both request and request_uri are specified which is not allowed");
        return Err(Oauth2Error::InvalidRequest);
    }

    if let Some(raw) = &request.request {
        return parse_request_object(raw).map(Some);
    }

    let Some(request_uri) = &request.request_uri else {
        return Ok(None);
    };

    let Ok(uri) = Url::parse(request_uri) else {
        warn!(%request_uri, "request_uri is not a valid URL");
        return Err(Oauth2Error::InvalidRequestObject);
    };

    let Some(fetcher) = fetcher else {
        warn!("No request object fetcher configured, treating request_uri as absent");
        return Ok(None);
    };

    match fetcher.fetch(&uri) {
        Some(raw) => parse_request_object(&raw).map(Some),
        None => {
            warn!(%uri, "Failed to dereference request_uri, treating request object as absent");
            Ok(None)
        }
    }
}

/// Validate a request object against the outer request and the active
/// profile. Must run before any claim is merged.
pub(crate) fn validate_request_object(
    config: &AuthzConfig,
    crypto: &dyn CryptoProvider,
    client: &Client,
    request: &AuthzRequest,
    ro: &RequestObject,
) -> Result<(), Oauth2Error> {
    // Signature policy first: an object we won't trust has no say.
    if ro.alg == "none" {
        if config.force_signed_request_object || config.strict_profile {
            warn!("Unsigned request object but a signed request object is required");
            return Err(Oauth2Error::InvalidRequestObject);
        }
    } else {
        if config.strict_profile && ro.alg == "RS256" {
            warn!("The request object signature algorithm is not acceptable under the strict profile");
            return Err(Oauth2Error::InvalidRequestObject);
        }
        crypto
            .verify_request_object(&ro.raw, &ro.alg, client)
            .map_err(|err| {
                match err {
                    SignaturePolicyError::VerificationFailed => {
                        warn!("Request object signature verification failed")
                    }
                    SignaturePolicyError::AlgorithmRejected(alg) => {
                        warn!(%alg, "Request object signature algorithm rejected by policy")
                    }
                }
                Oauth2Error::InvalidRequestObject
            })?;
    }

    if !ro.claims.aud.is_empty() && !ro.claims.aud.iter().any(|aud| aud == config.issuer.as_str())
    {
        warn!(aud = ?ro.claims.aud, "Failed to match request object aud to this issuer");
        return Err(Oauth2Error::InvalidRequestObject);
    }

    // Inner and outer identity must agree.
    match &ro.claims.response_type {
        Some(inner) if *inner == request.response_type => {}
        _ => {
            warn!("The response_type parameter is not the same in the request object");
            return Err(Oauth2Error::InvalidRequestObject);
        }
    }
    match &ro.claims.client_id {
        Some(inner) if *inner == request.client_id => {}
        _ => {
            warn!("The client_id parameter is not the same in the request object");
            return Err(Oauth2Error::InvalidRequestObject);
        }
    }

    if let Some(inner_redirect) = &ro.claims.redirect_uri {
        if Some(inner_redirect) != request.redirect_uri.as_ref() {
            warn!("The redirect_uri parameter is not the same in the request object");
            return Err(Oauth2Error::InvalidRequestObject);
        }
        if !client.redirect_uris.iter().any(|uri| uri == inner_redirect) {
            warn!("redirect_uri in the request object is not registered");
            return Err(Oauth2Error::InvalidRequestObject);
        }
    }

    if config.strict_profile {
        if ro.claims.exp.is_none() {
            warn!("The exp claim is not set");
            return Err(Oauth2Error::InvalidRequestObject);
        }
        if ro.claims.scope.as_ref().map_or(true, BTreeSet::is_empty) {
            warn!("Request object does not have a scope claim");
            return Err(Oauth2Error::InvalidRequestObject);
        }
        if ro.claims.nonce.is_none() {
            warn!("Request object does not have a nonce claim");
            return Err(Oauth2Error::InvalidRequestObject);
        }
        if ro.claims.redirect_uri.is_none() {
            warn!("Request object does not have a redirect_uri claim");
            return Err(Oauth2Error::InvalidRequestObject);
        }
    }

    Ok(())
}

/// Expiry is time dependent and split out so callers hold one clock.
pub(crate) fn check_request_object_expiry(
    ro: &RequestObject,
    ct: Duration,
) -> Result<(), Oauth2Error> {
    if let Some(exp) = ro.claims.exp {
        if exp <= 0 || (exp as u64) < ct.as_secs() {
            warn!(exp, now = ct.as_secs(), "Request object expired");
            return Err(Oauth2Error::InvalidRequestObject);
        }
    }
    Ok(())
}

/// Merge the validated claims over the canonical request. Outer values lose
/// precedence to validated inner values.
pub(crate) fn merge_request_object(
    request: &mut AuthzRequest,
    ro: &RequestObject,
    strict_profile: bool,
) -> Result<(), Oauth2Error> {
    if let Some(scope) = &ro.claims.scope {
        if !scope.is_empty() {
            // Even with a scope claim in the request object, the OAuth2
            // syntax scope parameter must still carry the openid value.
            if !request.scope.contains(OAUTH2_SCOPE_OPENID) {
                warn!("scope parameter does not contain the openid value which is required");
                return Err(Oauth2Error::InvalidScope);
            }
            request.scope = scope.clone();
        }
    }

    match &ro.claims.state {
        Some(state) => request.state = Some(state.clone()),
        // Under the strict profile an absent state claim discards the
        // outer state rather than falling back to it.
        None if strict_profile => request.state = None,
        None => {}
    }

    if let Some(redirect_uri) = &ro.claims.redirect_uri {
        request.redirect_uri = Some(redirect_uri.clone());
    }
    if let Some(nonce) = &ro.claims.nonce {
        request.nonce = Some(nonce.clone());
    }
    if let Some(code_challenge) = &ro.claims.code_challenge {
        let challenge = URL_SAFE_NO_PAD.decode(code_challenge).map_err(|err| {
            warn!(?err, "Invalid code_challenge encoding in request object");
            Oauth2Error::InvalidRequestObject
        })?;
        match ro.claims.code_challenge_method.as_deref() {
            Some("S256") | None => {}
            Some(other) => {
                warn!(%other, "Invalid code_challenge_method in request object (must be 'S256')");
                return Err(Oauth2Error::InvalidRequestObject);
            }
        }
        request.pkce_request = Some(PkceRequest {
            code_challenge: challenge,
            code_challenge_method: CodeChallengeMethod::S256,
        });
    }
    if let Some(display) = ro.claims.display {
        request.display = Some(display);
    }
    if let Some(prompt) = &ro.claims.prompt {
        if !prompt.is_empty() {
            request.prompt = prompt.clone();
        }
    }
    if let Some(response_mode) = ro.claims.response_mode {
        request.response_mode = Some(response_mode);
    }
    if let Some(max_age) = ro.claims.max_age {
        request.max_age = Some(max_age);
    }
    if let Some(acr_values) = &ro.claims.acr_values {
        request.acr_values = acr_values.clone();
    }

    if let Some(claims) = &ro.claims.claims {
        request.has_userinfo_member = claims.userinfo.is_some();
        if let Some(id_token) = &claims.id_token {
            request.has_id_token_member = true;
            if let Some(max_age) = id_token.max_age {
                request.max_age = Some(max_age);
            }
            if let Some(acr) = &id_token.acr {
                if let Some(value) = &acr.value {
                    request.acr_values = vec![value.clone()];
                } else if let Some(values) = &acr.values {
                    request.acr_values = values.clone();
                }
            }
        }
    }

    // Opaque string claims ride along as custom parameters.
    for (key, value) in &ro.claims.other {
        if let serde_json::Value::String(value) = value {
            request
                .custom_parameters
                .insert(key.clone(), value.clone());
        }
    }

    Ok(())
}

/// Validate a CIBA backchannel request object. Same family as the
/// authorisation request object, but with a freshness requirement and an
/// exclusive user hint.
pub fn validate_ciba_request_object(
    config: &AuthzConfig,
    claims: &RequestObjectClaims,
    client_id: &str,
    ct: Duration,
) -> Result<(), Oauth2Error> {
    if claims.aud.is_empty() || !claims.aud.iter().any(|aud| aud == config.issuer.as_str()) {
        warn!(aud = ?claims.aud, "Failed to match CIBA request object aud to this issuer");
        return Err(Oauth2Error::InvalidRequest);
    }

    match claims.iss.as_deref() {
        Some(iss) if iss == client_id => {}
        other => {
            warn!(?other, "CIBA request object has a wrong iss claim");
            return Err(Oauth2Error::InvalidRequest);
        }
    }

    let now = ct.as_secs() as i64;

    match claims.exp {
        Some(exp) if exp > now => {}
        _ => {
            warn!(exp = ?claims.exp, "CIBA request object exp claim missing or expired");
            return Err(Oauth2Error::InvalidRequest);
        }
    }

    match claims.iat {
        Some(iat) if iat > 0 => {}
        _ => {
            warn!(iat = ?claims.iat, "CIBA request object has a wrong iat claim");
            return Err(Oauth2Error::InvalidRequest);
        }
    }

    let oldest_nbf = now.saturating_sub(config.ciba_max_request_age as i64);
    match claims.nbf {
        Some(nbf) if nbf <= now && nbf >= oldest_nbf => {}
        _ => {
            warn!(nbf = ?claims.nbf, "CIBA request object has a wrong nbf claim");
            return Err(Oauth2Error::InvalidRequest);
        }
    }

    if claims.jti.as_deref().map_or(true, str::is_empty) {
        warn!("CIBA request object has a wrong jti claim");
        return Err(Oauth2Error::InvalidRequest);
    }

    if claims.scope.as_ref().map_or(true, BTreeSet::is_empty) {
        warn!("CIBA request object does not have a scope claim");
        return Err(Oauth2Error::InvalidRequest);
    }

    // Exactly one way of naming the user.
    let hints = [
        claims.login_hint.as_deref(),
        claims.login_hint_token.as_deref(),
        claims.id_token_hint.as_deref(),
    ]
    .iter()
    .filter(|hint| hint.is_some_and(|h| !h.is_empty()))
    .count();
    if hints != 1 {
        warn!(hints, "CIBA request object has too many hints or doesn't have any");
        return Err(Oauth2Error::InvalidRequest);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::encode_request_object;

    #[test]
    fn test_parse_round_trip() {
        let raw = encode_request_object(
            "ES256",
            &serde_json::json!({
                "iss": "c1",
                "aud": "https://idp.example.com/",
                "client_id": "c1",
                "response_type": "code",
                "scope": "openid email",
                "nonce": "n1",
                "custom_thing": "value",
            }),
        );
        let ro = parse_request_object(&raw).expect("Failed to parse request object");
        assert_eq!(ro.alg, "ES256");
        assert_eq!(ro.claims.client_id.as_deref(), Some("c1"));
        assert_eq!(ro.claims.aud, vec!["https://idp.example.com/".to_string()]);
        assert_eq!(
            ro.claims.scope,
            Some(BTreeSet::from(["openid".to_string(), "email".to_string()]))
        );
        assert_eq!(
            ro.claims.other.get("custom_thing"),
            Some(&serde_json::Value::String("value".to_string()))
        );
    }

    #[test]
    fn test_encrypted_objects_are_refused() {
        assert_eq!(
            parse_request_object("a.b.c.d.e"),
            Err(Oauth2Error::InvalidRequestObject)
        );
        assert_eq!(
            parse_request_object("not-a-jwt"),
            Err(Oauth2Error::InvalidRequestObject)
        );
    }

    fn ciba_claims(overrides: impl FnOnce(&mut serde_json::Value)) -> RequestObjectClaims {
        let mut value = serde_json::json!({
            "iss": "c1",
            "aud": "https://idp.example.com/",
            "exp": 7000,
            "iat": 5900,
            "nbf": 5900,
            "jti": "unique-id",
            "scope": "openid",
            "login_hint": "alice",
        });
        overrides(&mut value);
        #[allow(clippy::unwrap_used)]
        serde_json::from_value(value).unwrap()
    }

    fn ciba_config() -> AuthzConfig {
        #[allow(clippy::unwrap_used)]
        AuthzConfig::new(Url::parse("https://idp.example.com/").unwrap())
    }

    #[test]
    fn test_ciba_request_object_happy_path() {
        let claims = ciba_claims(|_| {});
        assert!(
            validate_ciba_request_object(&ciba_config(), &claims, "c1", Duration::from_secs(6000))
                .is_ok()
        );
    }

    #[test]
    fn test_ciba_request_object_hint_exclusivity() {
        // No hint at all.
        let claims = ciba_claims(|v| {
            if let Some(m) = v.as_object_mut() {
                m.remove("login_hint");
            }
        });
        assert_eq!(
            validate_ciba_request_object(&ciba_config(), &claims, "c1", Duration::from_secs(6000)),
            Err(Oauth2Error::InvalidRequest)
        );

        // Two hints.
        let claims = ciba_claims(|v| {
            v["id_token_hint"] = serde_json::Value::String("tok".to_string());
        });
        assert_eq!(
            validate_ciba_request_object(&ciba_config(), &claims, "c1", Duration::from_secs(6000)),
            Err(Oauth2Error::InvalidRequest)
        );
    }

    #[test]
    fn test_ciba_request_object_freshness() {
        // Expired.
        let claims = ciba_claims(|_| {});
        assert_eq!(
            validate_ciba_request_object(&ciba_config(), &claims, "c1", Duration::from_secs(8000)),
            Err(Oauth2Error::InvalidRequest)
        );

        // nbf in the future.
        let claims = ciba_claims(|v| {
            v["nbf"] = serde_json::Value::from(6500);
        });
        assert_eq!(
            validate_ciba_request_object(&ciba_config(), &claims, "c1", Duration::from_secs(6000)),
            Err(Oauth2Error::InvalidRequest)
        );

        // Wrong issuer.
        let claims = ciba_claims(|_| {});
        assert_eq!(
            validate_ciba_request_object(&ciba_config(), &claims, "other", Duration::from_secs(6000)),
            Err(Oauth2Error::InvalidRequest)
        );
    }
}

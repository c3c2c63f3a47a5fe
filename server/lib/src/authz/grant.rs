//! Grant issuance: authorisation codes, implicit access tokens and id
//! tokens. However many response types a request carries, exactly one
//! underlying grant is created; later response types attach their tokens to
//! the grant an earlier one created.

use ianus_proto::oauth2::{AccessTokenType, ResponseType};

use crate::authz::request::AuthzRequest;
use crate::authz::response::RedirectUriResponse;
use crate::external::{CryptoProvider, TokenUpdatePolicy};
use crate::prelude::*;
use crate::store::{
    gen_opaque_handle, AuthorisationGrant, Client, GrantStore, IssuedToken, IssuedTokenKind,
    Session,
};

/// Issue everything the response types ask for, appending the response
/// parameters as we go. Returns the grant all tokens were attached to, if
/// any response type needed one.
#[allow(clippy::too_many_arguments)]
pub(crate) fn issue_grants(
    config: &AuthzConfig,
    grants: &dyn GrantStore,
    crypto: &dyn CryptoProvider,
    token_update: Option<&dyn TokenUpdatePolicy>,
    client: &Client,
    session: &Session,
    request: &AuthzRequest,
    scopes: &BTreeSet<String>,
    token_binding_header: Option<&str>,
    redirect: &mut RedirectUriResponse,
    ct: Duration,
) -> Result<Option<AuthorisationGrant>, OperationError> {
    let user_id = session
        .user_id
        .as_deref()
        .ok_or(OperationError::InvalidSessionState)?;

    let acr = grant_acr(session, request);

    let token_binding_hash = match (token_binding_header, &client.id_token_token_binding_cnf) {
        (Some(header), Some(cnf)) => Some(crypto.compute_token_binding_hash(header, cnf)?),
        _ => None,
    };

    let mut grant: Option<AuthorisationGrant> = None;

    if request.response_type.contains(&ResponseType::Code) {
        let mut code_grant = grants.create_code_grant(user_id, client, session.auth_time)?;
        code_grant.nonce = request.nonce.clone();
        code_grant.scopes = scopes.clone();
        code_grant.claims = request.claims.clone();
        code_grant.acr = acr.clone();
        code_grant.session_id = Some(session.id);
        code_grant.token_binding_hash = token_binding_hash.clone();
        if let Some(pkce) = &request.pkce_request {
            code_grant.code_challenge = Some(pkce.code_challenge.clone());
            code_grant.code_challenge_method = Some(pkce.code_challenge_method);
        }
        // Save after object modification!
        grants.save_grant(&code_grant)?;

        if let Some(code) = code_grant.authorisation_code() {
            redirect.add_param("code", code);
        }
        grant = Some(code_grant);
    }

    if request.response_type.contains(&ResponseType::Token) {
        let issued = ensure_grant(
            &mut grant, grants, user_id, client, session, request, scopes, &acr,
        )?;

        let token = gen_opaque_handle();
        issued.push_token(IssuedToken {
            kind: IssuedTokenKind::Access,
            value: token.clone(),
            expires_in: Some(config.access_token_lifetime),
        });
        grants.save_grant(issued)?;

        redirect.add_param("access_token", &token);
        redirect.add_param("token_type", &AccessTokenType::Bearer.to_string());
        redirect.add_param("expires_in", &config.access_token_lifetime.to_string());
    }

    if request.response_type.contains(&ResponseType::IdToken) {
        let issued = ensure_grant(
            &mut grant, grants, user_id, client, session, request, scopes, &acr,
        )?;

        let id_token = mint_id_token(
            config,
            crypto,
            token_update,
            client,
            issued,
            Some(session),
            request.nonce.as_deref(),
            token_binding_hash.as_deref(),
            ct,
        )?;

        issued.push_token(IssuedToken {
            kind: IssuedTokenKind::IdToken,
            value: id_token.clone(),
            expires_in: Some(config.id_token_lifetime),
        });
        grants.save_grant(issued)?;

        redirect.add_param("id_token", &id_token);
    }

    // Informational echo, suppressed under the strict profile.
    if grant.is_some() && !request.acr_values.is_empty() && !config.strict_profile {
        redirect.add_param("acr_values", &request.acr_values_string());
    }

    Ok(grant)
}

/// The grant already created by an earlier response type, or a fresh
/// implicit grant when this is the first one that needs it.
#[allow(clippy::too_many_arguments)]
fn ensure_grant<'a>(
    grant: &'a mut Option<AuthorisationGrant>,
    grants: &dyn GrantStore,
    user_id: &str,
    client: &Client,
    session: &Session,
    request: &AuthzRequest,
    scopes: &BTreeSet<String>,
    acr: &Option<String>,
) -> Result<&'a mut AuthorisationGrant, OperationError> {
    if grant.is_none() {
        let mut implicit = grants.create_implicit_grant(user_id, client, session.auth_time)?;
        implicit.nonce = request.nonce.clone();
        implicit.scopes = scopes.clone();
        implicit.claims = request.claims.clone();
        implicit.acr = acr.clone();
        implicit.session_id = Some(session.id);
        grants.save_grant(&implicit)?;
        *grant = Some(implicit);
    }
    grant.as_mut().ok_or(OperationError::InvalidRequestState)
}

/// Mint an id_token for a grant. Runs the token binding pre-processing and
/// the policy driven post-processing hook, then hands the claim set to the
/// signer.
#[allow(clippy::too_many_arguments)]
pub(crate) fn mint_id_token(
    config: &AuthzConfig,
    crypto: &dyn CryptoProvider,
    token_update: Option<&dyn TokenUpdatePolicy>,
    client: &Client,
    grant: &AuthorisationGrant,
    session: Option<&Session>,
    nonce: Option<&str>,
    token_binding_hash: Option<&str>,
    ct: Duration,
) -> Result<String, OperationError> {
    let subject = match client.subject_type {
        ianus_proto::oauth2::SubjectType::Pairwise => {
            crypto.pairwise_identifier(client, &grant.user_id)
        }
        ianus_proto::oauth2::SubjectType::Public => grant.user_id.clone(),
    };

    let mut claims = serde_json::json!({
        "iss": config.issuer.as_str(),
        "sub": subject,
        "aud": client.client_id,
        "exp": ct.as_secs() + config.id_token_lifetime,
        "iat": ct.as_secs(),
    });

    if let Some(auth_time) = grant.auth_time {
        claims["auth_time"] = serde_json::Value::from(auth_time);
    }
    if let Some(nonce) = nonce {
        claims["nonce"] = serde_json::Value::from(nonce);
    }
    if let Some(acr) = &grant.acr {
        claims["acr"] = serde_json::Value::from(acr.as_str());
    }

    // Pre-processing: bind the token to the user agent and the session.
    if let Some(session) = session {
        claims["sid"] = serde_json::Value::from(session.id.to_string());
    }
    if let Some(hash) = token_binding_hash {
        claims["cnf"] = serde_json::json!({ "tbh": hash });
    }

    // Post-processing: the deployment's token update policy has the last
    // word on the claim set.
    if let Some(policy) = token_update {
        policy.modify_id_token(&mut claims, client, grant);
    }

    crypto.sign_id_token(client, &claims)
}

fn grant_acr(session: &Session, request: &AuthzRequest) -> Option<String> {
    // The ACR the session actually authenticated with wins over the
    // requested values.
    session.acr.clone().or_else(|| {
        if request.acr_values.is_empty() {
            None
        } else {
            Some(request.acr_values_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::response::AuthoriseResponse;
    use crate::store::GrantKind;
    use crate::testkit::{
        test_client, test_request, InMemoryGrantStore, TestCrypto,
    };
    use ianus_proto::oauth2::ResponseMode;

    const TEST_CURRENT_TIME: u64 = 6000;

    fn redirect() -> RedirectUriResponse {
        #[allow(clippy::unwrap_used)]
        RedirectUriResponse::new(
            Url::parse("https://demo.example.com/cb").unwrap(),
            ResponseMode::Fragment,
            Some("st".to_string()),
        )
    }

    fn config() -> AuthzConfig {
        #[allow(clippy::unwrap_used)]
        AuthzConfig::new(Url::parse("https://idp.example.com").unwrap())
    }

    fn session() -> Session {
        Session::new_authenticated("alice", Some("basic"), Duration::from_secs(5000))
    }

    fn scopes() -> BTreeSet<String> {
        BTreeSet::from(["openid".to_string()])
    }

    #[test]
    fn test_hybrid_request_shares_one_grant() {
        let grants = InMemoryGrantStore::default();
        let crypto = TestCrypto;
        let client = test_client("c1");
        let session = session();
        let mut request = test_request("c1", "openid");
        request.response_type =
            BTreeSet::from([ResponseType::Code, ResponseType::Token, ResponseType::IdToken]);
        request.nonce = Some("n1".to_string());
        let mut resp = redirect();

        let grant = issue_grants(
            &config(),
            &grants,
            &crypto,
            None,
            &client,
            &session,
            &request,
            &scopes(),
            None,
            &mut resp,
            Duration::from_secs(TEST_CURRENT_TIME),
        )
        .expect("Issuance failed")
        .expect("A grant must exist");

        // One grant holds the code, the access token and the id token.
        assert_eq!(grants.grant_count(), 1);
        assert!(matches!(grant.kind, GrantKind::AuthorisationCode { .. }));
        let stored = grants.get_grant(grant.grant_id).expect("Grant must exist");
        assert_eq!(stored.tokens.len(), 2);

        let AuthoriseResponse::Redirect { location, .. } = resp.finish() else {
            panic!("expected redirect");
        };
        let fragment = location.fragment().unwrap_or("");
        assert!(fragment.contains("code="));
        assert!(fragment.contains("access_token="));
        assert!(fragment.contains("id_token="));
        assert!(fragment.contains("state=st"));
    }

    #[test]
    fn test_code_grant_binds_pkce_and_nonce() {
        let grants = InMemoryGrantStore::default();
        let crypto = TestCrypto;
        let client = test_client("c1");
        let session = session();
        let mut request = test_request("c1", "openid");
        request.nonce = Some("n1".to_string());
        request.pkce_request = Some(ianus_proto::oauth2::PkceRequest {
            code_challenge: vec![1u8; 32],
            code_challenge_method: ianus_proto::oauth2::CodeChallengeMethod::S256,
        });
        let mut resp = redirect();

        let grant = issue_grants(
            &config(),
            &grants,
            &crypto,
            None,
            &client,
            &session,
            &request,
            &scopes(),
            None,
            &mut resp,
            Duration::from_secs(TEST_CURRENT_TIME),
        )
        .expect("Issuance failed")
        .expect("A grant must exist");

        assert_eq!(grant.nonce.as_deref(), Some("n1"));
        assert_eq!(grant.code_challenge, Some(vec![1u8; 32]));
        assert_eq!(grant.session_id, Some(session.id));
        assert_eq!(grant.acr.as_deref(), Some("basic"));
        assert!(grant.authorisation_code().is_some());
    }

    #[test]
    fn test_id_token_only_creates_a_holding_grant() {
        let grants = InMemoryGrantStore::default();
        let crypto = TestCrypto;
        let client = test_client("c1");
        let session = session();
        let mut request = test_request("c1", "openid");
        request.response_type = BTreeSet::from([ResponseType::IdToken]);
        request.nonce = Some("n1".to_string());
        let mut resp = redirect();

        let grant = issue_grants(
            &config(),
            &grants,
            &crypto,
            None,
            &client,
            &session,
            &request,
            &scopes(),
            None,
            &mut resp,
            Duration::from_secs(TEST_CURRENT_TIME),
        )
        .expect("Issuance failed")
        .expect("A grant must exist");

        assert!(matches!(grant.kind, GrantKind::Implicit));
        assert_eq!(grants.grant_count(), 1);
        let stored = grants.get_grant(grant.grant_id).expect("Grant must exist");
        assert_eq!(stored.tokens.len(), 1);
        assert_eq!(stored.tokens[0].kind, IssuedTokenKind::IdToken);
    }
}

//! Validation of the client, the redirect target and the security
//! parameters of the canonical request. Failures raised before the redirect
//! target is trusted are JSON errors; anything after rides the redirect.

use ianus_proto::oauth2::{Prompt, ResponseType};
use regex::Regex;

use crate::authz::request::AuthzRequest;
use crate::authz::response::{
    json_error, Interrupt, RedirectUriResponse, STATUS_BAD_REQUEST,
    STATUS_INTERNAL_SERVER_ERROR, STATUS_UNAUTHORIZED,
};
use crate::authz::Oauth2Error;
use crate::prelude::*;
use crate::store::{BackchannelCache, Client, ClientStore, Session};

lazy_static! {
    static ref OAUTHSCOPE_RE: Regex = {
        #[allow(clippy::expect_used)]
        Regex::new("^[0-9a-zA-Z_\\-:.]+$").expect("Invalid oauthscope regex found")
    };
}

/// Resolve and gate the client. A client registered as PAR-only refuses
/// anything that did not arrive through a pushed authorisation request.
pub(crate) fn validate_client(
    clients: &dyn ClientStore,
    client_id: &str,
    is_par: bool,
) -> Result<Client, Interrupt> {
    if client_id.is_empty() {
        warn!("Authorisation request with an empty client_id");
        return Err(json_error(
            STATUS_BAD_REQUEST,
            &Oauth2Error::UnauthorizedClient,
            Some("client_id is empty or blank"),
        )
        .into());
    }

    let client = clients
        .find_client(client_id)
        .map_err(server_error_status)?
        .ok_or_else(|| {
            warn!(%client_id, "Invalid client_id. Have you registered the client?");
            Interrupt(json_error(
                STATUS_UNAUTHORIZED,
                &Oauth2Error::UnauthorizedClient,
                Some("Unable to find client"),
            ))
        })?;

    if !client.enabled {
        warn!(%client_id, "Client is disabled");
        return Err(json_error(
            STATUS_UNAUTHORIZED,
            &Oauth2Error::UnauthorizedClient,
            Some("Client is disabled"),
        )
        .into());
    }

    if client.require_par && !is_par {
        debug!(%client_id, "Client may only perform PAR requests");
        return Err(json_error(
            STATUS_BAD_REQUEST,
            &Oauth2Error::InvalidRequest,
            Some("Client can perform only PAR requests"),
        )
        .into());
    }

    Ok(client)
}

/// Validate the requested redirect target against the client registration,
/// or substitute the device verification page when this user agent is in
/// the middle of a device flow.
pub(crate) fn validate_redirect_uri(
    config: &AuthzConfig,
    backchannel: &dyn BackchannelCache,
    client: &Client,
    requested: Option<&Url>,
    device_user_code: Option<&str>,
    ct: Duration,
) -> Result<Url, Interrupt> {
    if let Some(user_code) = device_user_code {
        let record = backchannel
            .find_device_by_user_code(user_code)
            .map_err(server_error_status)?
            .filter(|record| !record.is_expired(ct));

        return match record {
            Some(_) => {
                let mut page = config.device_verification_page();
                page.query_pairs_mut().append_pair("user_code", user_code);
                Ok(page)
            }
            None => {
                warn!(%user_code, "No pending device authorisation for the session user code");
                Err(json_error(
                    STATUS_BAD_REQUEST,
                    &Oauth2Error::InvalidRequest,
                    Some("Invalid redirect uri"),
                )
                .into())
            }
        };
    }

    let Some(requested) = requested else {
        warn!("Authorisation request without a redirect_uri");
        return Err(json_error(
            STATUS_BAD_REQUEST,
            &Oauth2Error::InvalidRequest,
            Some("Invalid redirect uri"),
        )
        .into());
    };

    // Exact match against the registered set. Nothing is inferred from
    // origins; a single changed query parameter is a different target.
    if client.redirect_uris.iter().any(|uri| uri == requested) {
        Ok(requested.clone())
    } else {
        warn!(
            redirect_uri = %requested,
            "Invalid redirect_uri (must be an exact match to a registered redirect uri)"
        );
        Err(json_error(
            STATUS_BAD_REQUEST,
            &Oauth2Error::InvalidRequest,
            Some("Invalid redirect uri"),
        )
        .into())
    }
}

/// Every requested ACR must be inside the client's allow-list, when the
/// client restricts them at all.
pub(crate) fn validate_acrs(
    client: &Client,
    request: &AuthzRequest,
    redirect: &RedirectUriResponse,
) -> Result<(), Interrupt> {
    if client.authorized_acr_values.is_empty() {
        return Ok(());
    }
    if request
        .acr_values
        .iter()
        .all(|acr| client.authorized_acr_values.contains(acr))
    {
        return Ok(());
    }

    warn!(requested = ?request.acr_values, "Restricted acr value request");
    Err(redirect
        .clone()
        .error_redirect(
            &Oauth2Error::InvalidRequest,
            Some("Restricted acr value request, please review the list of authorized acr values for this client"),
        )
        .into())
}

/// The requested response types must be non-empty and permitted by the
/// client's registered grant types.
pub(crate) fn validate_response_types(
    client: &Client,
    request: &AuthzRequest,
    redirect: &RedirectUriResponse,
) -> Result<(), Interrupt> {
    if request.response_type.is_empty() {
        warn!("Authorisation request without a response_type");
        return Err(redirect
            .clone()
            .error_redirect(&Oauth2Error::UnsupportedResponseType, None)
            .into());
    }

    if !request
        .response_type
        .iter()
        .all(|rt| client.allows_response_type(*rt))
    {
        warn!(
            response_type = %request.response_type_string(),
            client_id = %client.client_id,
            "Unsupported response_type for this client's grant types"
        );
        return Err(redirect
            .clone()
            .error_redirect(&Oauth2Error::UnsupportedResponseType, None)
            .into());
    }

    // OIDC requires a nonce whenever an id_token is returned from the
    // authorisation endpoint.
    if request.response_type.contains(&ResponseType::IdToken) && request.nonce.is_none() {
        warn!("id_token requested without a nonce");
        return Err(redirect
            .clone()
            .error_redirect(
                &Oauth2Error::InvalidRequest,
                Some("nonce is required for the id_token response type"),
            )
            .into());
    }

    Ok(())
}

/// PKCE presence policy. The challenge itself is bound into the grant and
/// checked at the token endpoint; here we only refuse requests that were
/// required to carry one and did not.
pub(crate) fn validate_pkce(
    config: &AuthzConfig,
    client: &Client,
    request: &AuthzRequest,
    redirect: &RedirectUriResponse,
) -> Result<(), Interrupt> {
    if request.pkce_request.is_some() {
        return Ok(());
    }
    if config.require_pkce || client.require_pkce {
        error!(
            client_id = %client.client_id,
            "No PKCE code challenge was provided with the client in enforced PKCE mode"
        );
        return Err(redirect
            .clone()
            .error_redirect(&Oauth2Error::InvalidRequest, Some("code_challenge is required"))
            .into());
    }
    debug!(client_id = %client.client_id, "Insecure client configuration - PKCE is not enforced");
    Ok(())
}

/// Requested scopes must be present and syntactically valid.
pub(crate) fn validate_scopes(
    scopes: &BTreeSet<String>,
    redirect: &RedirectUriResponse,
) -> Result<(), Interrupt> {
    if scopes.is_empty() {
        warn!("Authorisation request must contain at least one requested scope");
        return Err(redirect
            .clone()
            .error_redirect(&Oauth2Error::InvalidScope, None)
            .into());
    }
    if let Some(invalid) = scopes.iter().find(|s| !OAUTHSCOPE_RE.is_match(s)) {
        warn!(%invalid, "Invalid scope syntax");
        return Err(redirect
            .clone()
            .error_redirect(&Oauth2Error::InvalidScope, None)
            .into());
    }
    Ok(())
}

/// `offline_access` only survives for a code flow, and only when the user
/// will actually see a consent step for it - a trusted client is exempt.
pub(crate) fn trim_offline_access(
    scopes: &mut BTreeSet<String>,
    request: &AuthzRequest,
    client: &Client,
) {
    if !scopes.contains(OAUTH2_SCOPE_OFFLINE_ACCESS) || client.trusted {
        return;
    }

    if !request.response_type.contains(&ResponseType::Code) {
        trace!("Removed (ignored) offline_access. Can't find `code` in response_type which is required.");
        scopes.remove(OAUTH2_SCOPE_OFFLINE_ACCESS);
        return;
    }

    if !request.prompt.contains(&Prompt::Consent) {
        warn!("Removed offline_access. Can't find prompt=consent. Consent is required for offline_access.");
        scopes.remove(OAUTH2_SCOPE_OFFLINE_ACCESS);
    }
}

/// When the request carries no acr_values, the client's registered defaults
/// apply.
pub(crate) fn apply_default_acr_values(request: &mut AuthzRequest, client: &Client) {
    if request.acr_values.is_empty() && !client.default_acr_values.is_empty() {
        request.acr_values = client.default_acr_values.clone();
    }
}

/// Is the session's authentication still fresh enough for the requested
/// (or client default) max_age?
pub(crate) fn is_authn_max_age_valid(
    config: &AuthzConfig,
    client: &Client,
    request: &AuthzRequest,
    session: &Session,
    ct: Duration,
) -> bool {
    let max_age = request.max_age.or(client.default_max_age);
    let Some(max_age) = max_age else {
        return true;
    };

    if max_age == 0 {
        // max_age=0 permits the existing authentication unless the
        // deployment opts into the stricter reading.
        return !config.disable_authn_for_max_age_zero;
    }
    if max_age < 0 {
        return true;
    }

    let Some(auth_time) = session.auth_time else {
        return false;
    };
    auth_time.saturating_add(max_age as u64) > ct.as_secs()
}

pub(crate) fn server_error_status(err: OperationError) -> Interrupt {
    error!(?err, "Operation failed while processing the authorisation request");
    Interrupt(json_error(
        STATUS_INTERNAL_SERVER_ERROR,
        &Oauth2Error::ServerError(err),
        None,
    ))
}

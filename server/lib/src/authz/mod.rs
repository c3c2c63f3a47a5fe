//! The authorisation request engine. An inbound `/authorize` request is
//! normalised, validated, resolved against the browser session and consent
//! state, and answered with either a redirect carrying issued credentials,
//! a redirect to an interactive first party page, or a structured error.
//!
//! Control flow runs RequestAssembler -> ClientAndRedirectValidator ->
//! RequestObjectValidator -> SessionAndAcrResolver -> PromptStateMachine ->
//! ConsentResolver -> GrantIssuer -> ResponseBuilder; any stage may
//! short-circuit to the response builder through an [`response::Interrupt`].

mod ciba;
mod consent;
mod device;
mod grant;
pub mod prompt;
pub mod request;
pub mod request_object;
pub mod response;
mod session;
mod validator;

use serde::{Deserialize, Serialize};

use ianus_proto::oauth2::{AuthorisationRequest, Prompt, ResponseMode, ResponseType};

use crate::audit::{AuditAction, AuditEvent, AuditGuard};
use crate::external::{
    AuditLogger, AuthenticationFilter, ClientNotifier, CryptoProvider, PolicyRegistry,
    PostAuthnPolicy, RequestObjectFetcher, ScopePolicy, TokenUpdatePolicy,
};
use crate::prelude::*;
use crate::store::{
    BackchannelCache, ClientAuthorisationStore, ClientStore, GrantStore, ParStore, Session,
    SessionStore,
};

use device::UserCodeThrottle;
use request::{AuthzRequest, HttpMethod};
use response::{AuthoriseResponse, Interrupt, RedirectUriResponse};

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Oauth2Error {
    // Standard
    InvalidRequest,
    InvalidRequestObject,
    UnauthorizedClient,
    AccessDenied,
    UnsupportedResponseType,
    InvalidScope,
    ServerError(OperationError),
    // Interactive-completion conditions surfaced to a non-interactive
    // caller. Not failures of the server, but the client must act.
    LoginRequired,
    SessionSelectionRequired,
    ConsentRequired,
    // Device flow conditions, from https://www.rfc-editor.org/rfc/rfc8628
    SlowDown,
    ExpiredToken,
}

impl std::fmt::Display for Oauth2Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Oauth2Error::InvalidRequest => "invalid_request",
            Oauth2Error::InvalidRequestObject => "invalid_request_object",
            Oauth2Error::UnauthorizedClient => "unauthorized_client",
            Oauth2Error::AccessDenied => "access_denied",
            Oauth2Error::UnsupportedResponseType => "unsupported_response_type",
            Oauth2Error::InvalidScope => "invalid_scope",
            Oauth2Error::ServerError(_) => "server_error",
            Oauth2Error::LoginRequired => "login_required",
            Oauth2Error::SessionSelectionRequired => "session_selection_required",
            Oauth2Error::ConsentRequired => "consent_required",
            Oauth2Error::SlowDown => "slow_down",
            Oauth2Error::ExpiredToken => "expired_token",
        })
    }
}

/// Transport level facts about the inbound request that are not protocol
/// parameters.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub http_method: HttpMethod,
    /// Session id from the user agent's cookie, if it presented one.
    pub session_cookie: Option<Uuid>,
    /// Raw value of the `Sec-Token-Binding` header.
    pub token_binding: Option<String>,
    pub remote_addr: Option<String>,
}

/// The collaborator set the engine is wired to at startup.
pub struct AuthzCollaborators {
    pub clients: Arc<dyn ClientStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub client_authorisations: Arc<dyn ClientAuthorisationStore>,
    pub grants: Arc<dyn GrantStore>,
    pub pars: Arc<dyn ParStore>,
    pub backchannel: Arc<dyn BackchannelCache>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub scope_policy: Arc<dyn ScopePolicy>,
    pub notifier: Arc<dyn ClientNotifier>,
    pub audit: Arc<dyn AuditLogger>,
    pub authn_filter: Option<Arc<dyn AuthenticationFilter>>,
    pub request_fetcher: Option<Arc<dyn RequestObjectFetcher>>,
}

pub struct AuthzServer {
    pub(crate) config: AuthzConfig,
    pub(crate) clients: Arc<dyn ClientStore>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) client_authorisations: Arc<dyn ClientAuthorisationStore>,
    pub(crate) grants: Arc<dyn GrantStore>,
    pub(crate) pars: Arc<dyn ParStore>,
    pub(crate) backchannel: Arc<dyn BackchannelCache>,
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    pub(crate) scope_policy: Arc<dyn ScopePolicy>,
    pub(crate) notifier: Arc<dyn ClientNotifier>,
    pub(crate) audit: Arc<dyn AuditLogger>,
    pub(crate) authn_filter: Option<Arc<dyn AuthenticationFilter>>,
    pub(crate) request_fetcher: Option<Arc<dyn RequestObjectFetcher>>,
    pub(crate) post_authn: Option<Arc<dyn PostAuthnPolicy>>,
    pub(crate) token_update: Option<Arc<dyn TokenUpdatePolicy>>,
    pub(crate) registry: PolicyRegistry,
    pub(crate) device_throttle: UserCodeThrottle,
}

impl AuthzServer {
    /// Build the engine. Deployment level policies are resolved against the
    /// registry here, once - an unknown name is a startup failure, not a
    /// per-request surprise.
    pub fn new(
        config: AuthzConfig,
        collaborators: AuthzCollaborators,
        registry: PolicyRegistry,
        post_authn_policy: Option<&str>,
        token_update_policy: Option<&str>,
    ) -> Result<Self, OperationError> {
        let post_authn = match post_authn_policy {
            Some(name) => Some(registry.post_authn(name).ok_or_else(|| {
                error!(%name, "Unknown post-authn policy");
                OperationError::InvalidRequestState
            })?),
            None => None,
        };
        let token_update = match token_update_policy {
            Some(name) => Some(registry.token_update(name).ok_or_else(|| {
                error!(%name, "Unknown token update policy");
                OperationError::InvalidRequestState
            })?),
            None => None,
        };

        let AuthzCollaborators {
            clients,
            sessions,
            client_authorisations,
            grants,
            pars,
            backchannel,
            crypto,
            scope_policy,
            notifier,
            audit,
            authn_filter,
            request_fetcher,
        } = collaborators;

        Ok(AuthzServer {
            config,
            clients,
            sessions,
            client_authorisations,
            grants,
            pars,
            backchannel,
            crypto,
            scope_policy,
            notifier,
            audit,
            authn_filter,
            request_fetcher,
            post_authn,
            token_update,
            registry,
            device_throttle: UserCodeThrottle::default(),
        })
    }

    /// Handle an authorisation request. Infallible at the type level: every
    /// outcome, including internal failure, is encoded as a response, and
    /// exactly one audit event is dispatched whichever path was taken.
    #[instrument(level = "debug", skip_all, fields(client_id = %params.client_id))]
    pub fn authorise(
        &self,
        ctx: &RequestContext,
        params: AuthorisationRequest,
        ct: Duration,
    ) -> AuthoriseResponse {
        let mut event = AuditEvent::new(AuditAction::UserAuthorisation);
        event.client_id = Some(params.client_id.clone());
        event.scope = Some(
            params
                .scope
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(" "),
        );
        event.remote_addr = ctx.remote_addr.clone();
        let mut audit = AuditGuard::new(self.audit.as_ref(), event);

        match self.authorise_inner(ctx, params, ct, &mut audit) {
            Ok(response) => {
                audit.set_success();
                response
            }
            Err(Interrupt(response)) => response,
        }
    }

    fn authorise_inner(
        &self,
        ctx: &RequestContext,
        params: AuthorisationRequest,
        ct: Duration,
        audit: &mut AuditGuard,
    ) -> Result<AuthoriseResponse, Interrupt> {
        trace!(?params);

        let mut request = AuthzRequest::assemble(params, ctx.http_method);

        self.process_par(&mut request, ct)?;

        let client = validator::validate_client(
            self.clients.as_ref(),
            &request.client_id,
            request.from_par,
        )?;

        let mut session = session::load_session(
            self.sessions.as_ref(),
            ctx.session_cookie,
            request.session_id.as_deref(),
        )?;

        let device_user_code = session
            .as_ref()
            .and_then(|s| s.device_user_code().map(str::to_string));

        let response_mode = self.resolve_response_mode(&request).ok_or_else(|| {
            warn!(
                response_mode = ?request.response_mode,
                "Invalid response_mode for the requested response types"
            );
            Interrupt(response::json_error(
                response::STATUS_BAD_REQUEST,
                &Oauth2Error::InvalidRequest,
                Some("Invalid response_mode"),
            ))
        })?;

        // Failures up to here answer with a JSON status; once the redirect
        // target is validated, errors ride the redirect instead.
        let redirect_base = validator::validate_redirect_uri(
            &self.config,
            self.backchannel.as_ref(),
            &client,
            request.redirect_uri.as_ref(),
            device_user_code.as_deref(),
            ct,
        )?;
        request.redirect_uri = Some(redirect_base.clone());
        let mut redirect =
            RedirectUriResponse::new(redirect_base, response_mode, request.state.clone());

        validator::validate_acrs(&client, &request, &redirect)?;
        if let Some(session) = session.as_mut() {
            session::check_acr_change(
                &self.config,
                self.sessions.as_ref(),
                &mut request,
                session,
                &redirect,
            )?;
        }

        if self.config.force_signed_request_object
            && request.request.is_none()
            && request.request_uri.is_none()
        {
            warn!("A signed request object is required");
            return Err(redirect
                .clone()
                .error_redirect(
                    &Oauth2Error::InvalidRequestObject,
                    Some("A signed request object is required"),
                )
                .into());
        }

        let request_object =
            request_object::load_request_object(self.request_fetcher.as_deref(), &request)
                .map_err(|err| Interrupt(redirect.clone().error_redirect(&err, None)))?;
        if let Some(ro) = &request_object {
            let merged = request_object::validate_request_object(
                &self.config,
                self.crypto.as_ref(),
                &client,
                &request,
                ro,
            )
            .and_then(|()| request_object::check_request_object_expiry(ro, ct))
            .and_then(|()| {
                request_object::merge_request_object(&mut request, ro, self.config.strict_profile)
            });
            if let Err(err) = merged {
                return Err(redirect.clone().error_redirect(&err, None).into());
            }

            // Re-anchor the response accumulator on the validated inner
            // values.
            redirect.set_state(request.state.clone());
            if let Some(uri) = &request.redirect_uri {
                redirect.set_base(uri.clone());
            }
            match self.resolve_response_mode(&request) {
                Some(mode) => redirect.set_response_mode(mode),
                None => {
                    return Err(redirect
                        .clone()
                        .error_redirect(&Oauth2Error::InvalidRequest, Some("Invalid response_mode"))
                        .into())
                }
            }
        }

        validator::validate_scopes(&request.scope, &redirect)?;
        let mut scopes = self.scope_policy.check_scopes_policy(&client, &request.scope);
        if scopes.is_empty() {
            warn!("No requested scope is available to this client");
            return Err(redirect
                .clone()
                .error_redirect(&Oauth2Error::AccessDenied, None)
                .into());
        }

        validator::validate_response_types(&client, &request, &redirect)?;
        validator::apply_default_acr_values(&mut request, &client);
        validator::trim_offline_access(&mut scopes, &request, &client);
        validator::validate_pkce(&self.config, &client, &request, &redirect)?;

        let prompt_none = request.prompt.contains(&Prompt::None);

        // First pass of the prompt state machine: contradictions, account
        // selection and the authentication requirement, strictly in order.
        let authenticated = session.as_ref().is_some_and(Session::is_authenticated);
        let mut session = match prompt::evaluate(&request.prompt, authenticated) {
            prompt::PromptAction::Contradiction => {
                warn!(
                    prompt = %request.prompt_string(),
                    "prompt=none must not be combined with other values"
                );
                return Err(redirect
                    .clone()
                    .error_redirect(&Oauth2Error::InvalidRequest, Some("Invalid prompt combination"))
                    .into());
            }
            prompt::PromptAction::AccountSelection => {
                return Ok(response::interactive_redirect(
                    self.config.select_account_page(),
                    request.carry_forward_params(),
                ));
            }
            prompt::PromptAction::Authentication => {
                if prompt_none {
                    match session::authenticate_via_filters(
                        self.authn_filter.as_deref(),
                        self.sessions.as_ref(),
                        &request,
                        ct,
                    )? {
                        Some(session) => session,
                        None => {
                            debug!("prompt=none without an authenticated session");
                            return Err(redirect
                                .clone()
                                .error_redirect(&Oauth2Error::LoginRequired, None)
                                .into());
                        }
                    }
                } else {
                    if request.prompt.contains(&Prompt::Login) {
                        if let Some(session) = session.as_mut() {
                            session::unauthenticate_session(self.sessions.as_ref(), session);
                        }
                        prompt::clear(&mut request.prompt, Prompt::Login);
                    }
                    return Ok(self.redirect_to_interactive(&request, device_user_code.is_some()));
                }
            }
            prompt::PromptAction::ForcedLogin | prompt::PromptAction::EvaluateConsent => {
                match session {
                    Some(session) => session,
                    None => {
                        return Err(validator::server_error_status(
                            OperationError::InvalidSessionState,
                        )
                        .into())
                    }
                }
            }
        };

        let Some(user_id) = session.user_id.clone() else {
            return Err(
                validator::server_error_status(OperationError::InvalidSessionState).into(),
            );
        };
        audit.set_username(&user_id);

        if !validator::is_authn_max_age_valid(&self.config, &client, &request, &session, ct) {
            debug!("Session authentication is too old for the requested max_age");
            session::unauthenticate_session(self.sessions.as_ref(), &mut session);
            return Ok(self.redirect_to_interactive(&request, device_user_code.is_some()));
        }

        if let Some(policy) = &self.post_authn {
            if policy.force_re_authentication(&client, &session) {
                debug!("Post-authn policy forces re-authentication");
                session::unauthenticate_session(self.sessions.as_ref(), &mut session);
                return Ok(self.redirect_to_interactive(&request, device_user_code.is_some()));
            }
            if policy.force_authorization(&client, &session) {
                debug!("Post-authn policy forces authorization");
                return Ok(self.redirect_to_interactive(&request, device_user_code.is_some()));
            }
        }

        // A client may demand a login prompt on every authorisation, except
        // straight after the login that satisfied it.
        if client.default_prompt_login
            && !request.prompt.contains(&Prompt::Login)
            && session
                .auth_time
                .is_some_and(|auth_time| ct.as_secs() > auth_time)
        {
            debug!("Client requests a default login prompt");
            request.prompt.push(Prompt::Login);
        }

        // Second pass: prompt=login fires exactly once against the possibly
        // refreshed prompt list.
        if let prompt::PromptAction::ForcedLogin = prompt::evaluate(&request.prompt, true) {
            session::unauthenticate_session(self.sessions.as_ref(), &mut session);
            prompt::clear(&mut request.prompt, Prompt::Login);
            return Ok(self.redirect_to_interactive(&request, device_user_code.is_some()));
        }

        let gathering_policy = client.consent_gathering_policy.as_deref().and_then(|name| {
            let policy = self.registry.consent_gathering(name);
            if policy.is_none() {
                warn!(%name, "Client references an unregistered consent gathering policy");
            }
            policy
        });

        match consent::resolve_consent(
            &client,
            gathering_policy.as_deref(),
            self.client_authorisations.as_ref(),
            self.sessions.as_ref(),
            &mut request,
            &mut session,
            &user_id,
            &scopes,
        )? {
            consent::ConsentOutcome::Granted => {}
            consent::ConsentOutcome::CollectConsent => {
                if prompt_none {
                    debug!("prompt=none but consent has not been granted");
                    return Err(redirect
                        .clone()
                        .error_redirect(&Oauth2Error::ConsentRequired, None)
                        .into());
                }
                return Ok(self.redirect_to_interactive(&request, device_user_code.is_some()));
            }
            consent::ConsentOutcome::GatheringStep(page) => {
                if prompt_none {
                    return Err(redirect
                        .clone()
                        .error_redirect(&Oauth2Error::ConsentRequired, None)
                        .into());
                }
                return Ok(response::interactive_redirect(
                    page,
                    request.carry_forward_params(),
                ));
            }
        }

        let issued = grant::issue_grants(
            &self.config,
            self.grants.as_ref(),
            self.crypto.as_ref(),
            self.token_update.as_deref(),
            &client,
            &session,
            &request,
            &scopes,
            ctx.token_binding.as_deref(),
            &mut redirect,
            ct,
        );
        let grant = match issued {
            Ok(grant) => grant,
            Err(err) => {
                error!(?err, "Failed to issue the requested grants");
                return Err(redirect
                    .clone()
                    .error_redirect(&Oauth2Error::ServerError(err), None)
                    .into());
            }
        };

        for (key, value) in &request.custom_parameters {
            redirect.add_param(key, value);
        }

        if self.config.session_id_parameter_enabled && !self.config.strict_profile {
            redirect.add_param("session_id", &session.id.to_string());
        }
        if self.config.include_sid_in_response {
            redirect.add_param("sid", &session.id.to_string());
        }

        let origin = redirect.base().origin().ascii_serialization();
        let session_state =
            self.crypto
                .compute_session_state(&client.client_id, &origin, &session);
        redirect.add_param("session_state", &session_state);

        if grant.is_some() && !self.config.strict_profile {
            let granted = scopes.iter().cloned().collect::<Vec<_>>().join(" ");
            redirect.add_param("scope", &granted);
        }

        if self.config.custom_headers_with_authorization_response {
            if let Some(raw) = &request.custom_response_headers {
                match serde_json::from_str::<BTreeMap<String, String>>(raw) {
                    Ok(headers) => {
                        for (key, value) in headers {
                            redirect.add_custom_header(&key, &value);
                        }
                    }
                    Err(err) => warn!(?err, "Ignoring unparseable custom response headers"),
                }
            }
        }

        let final_response = redirect.finish();

        // Secondary completions run synchronously on the same request that
        // finished the interactive step, after the redirect is computed.
        if let Some(auth_req_id) = request.auth_req_id.clone() {
            self.run_ciba_completion(&auth_req_id, ct);
        }
        if let Some(user_code) = &device_user_code {
            self.complete_device_authorisation(user_code, &user_id, session.auth_time, ct);
        }

        Ok(final_response)
    }

    fn process_par(&self, request: &mut AuthzRequest, ct: Duration) -> Result<(), Interrupt> {
        let is_par_ref = request
            .request_uri
            .as_deref()
            .map(request::is_par_reference)
            .unwrap_or(false);

        if !is_par_ref {
            if self.config.require_par {
                debug!("Server configured for PAR only, refusing a direct authorisation request");
                return Err(response::json_error(
                    response::STATUS_BAD_REQUEST,
                    &Oauth2Error::InvalidRequest,
                    Some("Failed to find par by request_uri"),
                )
                .into());
            }
            return Ok(());
        }

        let Some(reference) = request.request_uri.clone() else {
            return Ok(());
        };

        let par = self
            .pars
            .resolve(&reference)
            .map_err(validator::server_error_status)?
            .filter(|par| !par.is_expired(ct))
            .filter(|par| par.client_id == request.client_id);

        let Some(par) = par else {
            debug!(%reference, "Failed to find PAR by request_uri");
            return Err(response::json_error(
                response::STATUS_BAD_REQUEST,
                &Oauth2Error::InvalidRequest,
                Some("Failed to find par by request_uri"),
            )
            .into());
        };

        debug!("Setting request parameters from PAR");
        request.apply_par(&par);
        Ok(())
    }

    /// The default response mode for the requested types, refusing modes
    /// that would downgrade a fragment-default set.
    fn resolve_response_mode(&self, request: &AuthzRequest) -> Option<ResponseMode> {
        let fragment_default = request.response_type.contains(&ResponseType::Token)
            || request.response_type.contains(&ResponseType::IdToken);

        let mode = match (request.response_mode, fragment_default) {
            (None, false) => ResponseMode::Query,
            (None, true) => ResponseMode::Fragment,
            (Some(ResponseMode::Query), true) => return None,
            (Some(ResponseMode::Invalid), _) => return None,
            (Some(mode), _) => mode,
        };

        if mode == ResponseMode::FormPost && !self.config.allow_form_post {
            warn!("form_post requested but not allowed, remapping to the default mode");
            return Some(if fragment_default {
                ResponseMode::Fragment
            } else {
                ResponseMode::Query
            });
        }
        Some(mode)
    }

    /// Redirect to the interactive authorisation page (or, for device flow
    /// initiated requests, the account selection page) carrying the full
    /// parameter set so the flow can resume losslessly.
    fn redirect_to_interactive(
        &self,
        request: &AuthzRequest,
        device_initiated: bool,
    ) -> AuthoriseResponse {
        let page = if device_initiated {
            self.config.select_account_page()
        } else {
            self.config.authorization_page()
        };
        response::interactive_redirect(page, request.carry_forward_params())
    }
}

//! Normalisation of an inbound request into one canonical in-memory value.
//! The canonical request is mutable during the pipeline: a pushed
//! authorisation request replaces it wholesale, and a validated request
//! object merges over it.

use ianus_proto::oauth2::{
    AuthorisationRequest, DisplayValue, PkceRequest, Prompt, ResponseMode, ResponseType,
};

use crate::prelude::*;
use crate::store::Par;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// The canonical authorisation request threaded through the pipeline.
/// At most one of `request` / `request_uri` survives assembly; a request
/// arriving through PAR has both cleared and every stored attribute applied
/// before any directly supplied value is consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthzRequest {
    pub http_method: HttpMethod,
    pub response_type: BTreeSet<ResponseType>,
    pub response_mode: Option<ResponseMode>,
    pub client_id: String,
    pub state: Option<String>,
    pub pkce_request: Option<PkceRequest>,
    pub redirect_uri: Option<Url>,
    pub scope: BTreeSet<String>,
    pub nonce: Option<String>,
    pub prompt: Vec<Prompt>,
    pub display: Option<DisplayValue>,
    pub max_age: Option<i64>,
    pub ui_locales: Option<String>,
    pub id_token_hint: Option<String>,
    pub login_hint: Option<String>,
    pub acr_values: Vec<String>,
    pub amr_values: Vec<String>,
    pub request: Option<String>,
    pub request_uri: Option<String>,
    pub session_id: Option<String>,
    pub claims: Option<String>,
    pub auth_req_id: Option<String>,
    pub custom_response_headers: Option<String>,
    pub custom_parameters: BTreeMap<String, String>,
    /// True when this request was dereferenced from a pushed authorisation
    /// request, which satisfies PAR-only policies.
    pub from_par: bool,
    /// The request object asked for id_token claims.
    pub has_id_token_member: bool,
    /// The request object asked for userinfo claims.
    pub has_userinfo_member: bool,
}

impl AuthzRequest {
    pub fn assemble(params: AuthorisationRequest, http_method: HttpMethod) -> Self {
        let AuthorisationRequest {
            response_type,
            response_mode,
            client_id,
            state,
            pkce_request,
            redirect_uri,
            scope,
            nonce,
            prompt,
            display,
            max_age,
            ui_locales,
            id_token_hint,
            login_hint,
            acr_values,
            amr_values,
            request,
            request_uri,
            session_id,
            claims,
            auth_req_id,
            custom_response_headers,
            unknown_keys,
        } = params;

        AuthzRequest {
            http_method,
            response_type,
            response_mode,
            client_id,
            state,
            pkce_request,
            redirect_uri,
            scope,
            nonce,
            prompt: prompt.unwrap_or_default(),
            display,
            max_age,
            ui_locales,
            id_token_hint,
            login_hint,
            acr_values: acr_values.unwrap_or_default(),
            amr_values: amr_values.unwrap_or_default(),
            request,
            request_uri,
            session_id,
            claims,
            auth_req_id,
            custom_response_headers,
            custom_parameters: unknown_keys,
            from_par: false,
            has_id_token_member: false,
            has_userinfo_member: false,
        }
    }

    /// Replace this request with the attributes stored at push time. The
    /// stored parameters are the source of truth; `request` and
    /// `request_uri` are cleared so no further dereference is attempted.
    pub fn apply_par(&mut self, par: &Par) {
        let stored = AuthzRequest::assemble(par.request.clone(), self.http_method);

        let http_method = self.http_method;
        let auth_req_id = self.auth_req_id.take();

        *self = stored;

        self.http_method = http_method;
        // The completion id is a property of this round trip, not of the
        // pushed parameters.
        if self.auth_req_id.is_none() {
            self.auth_req_id = auth_req_id;
        }
        self.request = None;
        self.request_uri = None;
        self.from_par = true;
    }

    pub fn scope_string(&self) -> String {
        self.scope
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn response_type_string(&self) -> String {
        self.response_type
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn prompt_string(&self) -> String {
        self.prompt
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn acr_values_string(&self) -> String {
        self.acr_values.join(" ")
    }

    /// Every parameter of the original request, under its wire name, so an
    /// interactive page can re-submit the flow losslessly. The prompt list
    /// reflects any values consumed by the pipeline so far.
    pub fn carry_forward_params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = Vec::new();

        let mut push = |key: &str, value: String| {
            if !value.is_empty() {
                params.push((key.to_string(), value));
            }
        };

        push("response_type", self.response_type_string());
        push("scope", self.scope_string());
        push("client_id", self.client_id.clone());
        if let Some(redirect_uri) = &self.redirect_uri {
            push("redirect_uri", redirect_uri.to_string());
        }
        if let Some(state) = &self.state {
            push("state", state.clone());
        }
        if let Some(response_mode) = self.response_mode {
            push("response_mode", response_mode.to_string());
        }
        if let Some(nonce) = &self.nonce {
            push("nonce", nonce.clone());
        }
        push("prompt", self.prompt_string());
        if let Some(max_age) = self.max_age {
            push("max_age", max_age.to_string());
        }
        if let Some(ui_locales) = &self.ui_locales {
            push("ui_locales", ui_locales.clone());
        }
        if let Some(id_token_hint) = &self.id_token_hint {
            push("id_token_hint", id_token_hint.clone());
        }
        if let Some(login_hint) = &self.login_hint {
            push("login_hint", login_hint.clone());
        }
        push("acr_values", self.acr_values_string());
        push("amr_values", self.amr_values.join(" "));
        if let Some(request) = &self.request {
            push("request", request.clone());
        }
        if let Some(request_uri) = &self.request_uri {
            push("request_uri", request_uri.clone());
        }
        if let Some(pkce) = &self.pkce_request {
            use base64::engine::general_purpose::URL_SAFE_NO_PAD;
            use base64::Engine as _;
            push("code_challenge", URL_SAFE_NO_PAD.encode(&pkce.code_challenge));
            push("code_challenge_method", "S256".to_string());
        }
        if let Some(session_id) = &self.session_id {
            push("session_id", session_id.clone());
        }
        if let Some(claims) = &self.claims {
            push("claims", claims.clone());
        }
        if let Some(auth_req_id) = &self.auth_req_id {
            push("auth_req_id", auth_req_id.clone());
        }
        for (key, value) in &self.custom_parameters {
            push(key, value.clone());
        }

        params
    }
}

/// Whether a `request_uri` value is a pushed authorisation request
/// reference rather than a dereferenceable URL.
pub fn is_par_reference(request_uri: &str) -> bool {
    request_uri.starts_with(PAR_URI_PREFIX)
}

//! Assembly of the final answer to an authorisation request. Every path out
//! of the pipeline - success, protocol error, or interactive hand-off -
//! terminates in an [`AuthoriseResponse`] built here.

use ianus_proto::oauth2::{ErrorResponse, ResponseMode};
use url::form_urlencoded;

use crate::authz::Oauth2Error;
use crate::prelude::*;

/// HTTP statuses we answer JSON errors with. Errors discovered before a
/// redirect target is trusted must never bounce the user agent anywhere.
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_UNAUTHORIZED: u16 = 401;
pub const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;

/// The decision the transport renders for the user agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthoriseResponse {
    /// A 302 to the client redirect target or a first party page. Carries
    /// success parameters, error parameters or the interactive carry-over
    /// set, already encoded in the selected response mode.
    Redirect {
        location: Url,
        custom_headers: BTreeMap<String, String>,
    },
    /// `response_mode=form_post`: the transport renders an auto submitting
    /// form targeting `action` with these fields.
    FormPost {
        action: Url,
        params: Vec<(String, String)>,
        custom_headers: BTreeMap<String, String>,
    },
    /// A JSON error with an HTTP status, used before a redirect target is
    /// established and for truly unexpected failures.
    Invalid { status: u16, body: ErrorResponse },
}

/// Short-circuit of the pipeline with a fully formed response. Stages
/// return `Result<T, Interrupt>` so `?` threads the decision out without
/// exception-shaped control flow.
#[derive(Debug)]
pub(crate) struct Interrupt(pub AuthoriseResponse);

impl From<AuthoriseResponse> for Interrupt {
    fn from(response: AuthoriseResponse) -> Self {
        Interrupt(response)
    }
}

/// A JSON error response for failures detected before the redirect target
/// was validated.
pub(crate) fn json_error(
    status: u16,
    error: &Oauth2Error,
    description: Option<&str>,
) -> AuthoriseResponse {
    AuthoriseResponse::Invalid {
        status,
        body: ErrorResponse {
            error: error.to_string(),
            error_description: description.map(str::to_string),
            error_uri: None,
        },
    }
}

/// Accumulator of response parameters against a validated redirect target.
/// Threaded through every component that contributes a parameter; turned
/// into the final [`AuthoriseResponse`] exactly once.
#[derive(Debug, Clone)]
pub(crate) struct RedirectUriResponse {
    base: Url,
    response_mode: ResponseMode,
    state: Option<String>,
    params: Vec<(String, String)>,
    custom_headers: BTreeMap<String, String>,
}

impl RedirectUriResponse {
    pub(crate) fn new(base: Url, response_mode: ResponseMode, state: Option<String>) -> Self {
        RedirectUriResponse {
            base,
            response_mode,
            state,
            params: Vec::new(),
            custom_headers: BTreeMap::new(),
        }
    }

    pub(crate) fn base(&self) -> &Url {
        &self.base
    }

    /// A validated request object may re-anchor the redirect target.
    pub(crate) fn set_base(&mut self, base: Url) {
        self.base = base;
    }

    pub(crate) fn set_state(&mut self, state: Option<String>) {
        self.state = state;
    }

    pub(crate) fn set_response_mode(&mut self, response_mode: ResponseMode) {
        self.response_mode = response_mode;
    }

    pub(crate) fn add_param(&mut self, key: &str, value: &str) {
        self.params.push((key.to_string(), value.to_string()));
    }

    pub(crate) fn clear_params(&mut self) {
        self.params.clear();
    }

    pub(crate) fn add_custom_header(&mut self, key: &str, value: &str) {
        self.custom_headers
            .insert(key.to_string(), value.to_string());
    }

    /// Encode the accumulated parameters, appending `state` verbatim if the
    /// request carried one.
    pub(crate) fn finish(mut self) -> AuthoriseResponse {
        if let Some(state) = self.state.take() {
            self.params.push(("state".to_string(), state));
        }
        self.encode()
    }

    /// Discard any accumulated success parameters and answer with an error
    /// in the same response mode.
    pub(crate) fn error_redirect(
        mut self,
        error: &Oauth2Error,
        description: Option<&str>,
    ) -> AuthoriseResponse {
        self.params.clear();
        self.params.push(("error".to_string(), error.to_string()));
        if let Some(description) = description {
            self.params
                .push(("error_description".to_string(), description.to_string()));
        }
        self.finish()
    }

    fn encode(self) -> AuthoriseResponse {
        let RedirectUriResponse {
            mut base,
            response_mode,
            state: _,
            params,
            custom_headers,
        } = self;

        match response_mode {
            ResponseMode::FormPost => AuthoriseResponse::FormPost {
                action: base,
                params,
                custom_headers,
            },
            ResponseMode::Fragment => {
                let fragment = form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(params.iter())
                    .finish();
                base.set_fragment(Some(&fragment));
                AuthoriseResponse::Redirect {
                    location: base,
                    custom_headers,
                }
            }
            // Query is the default; a registered redirect target may already
            // carry its own query parameters, so we append rather than set.
            ResponseMode::Query | ResponseMode::Invalid => {
                base.query_pairs_mut().extend_pairs(params.iter());
                AuthoriseResponse::Redirect {
                    location: base,
                    custom_headers,
                }
            }
        }
    }
}

/// A redirect to a first party interactive page (login, consent, account
/// selection, device verification), carrying the full parameter set of the
/// original request so the flow can resume losslessly.
pub(crate) fn interactive_redirect(
    mut page: Url,
    params: Vec<(String, String)>,
) -> AuthoriseResponse {
    page.query_pairs_mut().extend_pairs(params.iter());
    AuthoriseResponse::Redirect {
        location: page,
        custom_headers: BTreeMap::new(),
    }
}

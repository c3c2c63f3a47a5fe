//! Deployment level configuration of the authorisation engine. This is
//! deserialised from the server configuration file by the hosting process
//! and handed to [`crate::authz::AuthzServer`] at startup.

use ianus_proto::constants::{
    AUTHORIZATION_PAGE_PATH, DEVICE_VERIFICATION_PAGE_PATH, SELECT_ACCOUNT_PAGE_PATH,
};
use ianus_proto::oauth2::{
    OAUTH2_DEVICE_CODE_EXPIRY_SECONDS, OAUTH2_DEVICE_CODE_INTERVAL_SECONDS,
};
use serde::Deserialize;
use url::Url;

const DEFAULT_ACCESS_TOKEN_LIFETIME: u64 = 3600;
const DEFAULT_REFRESH_TOKEN_LIFETIME: u64 = 86400;
const DEFAULT_ID_TOKEN_LIFETIME: u64 = 3600;
const DEFAULT_USER_CODE_ATTEMPT_LIMIT: u32 = 5;
const DEFAULT_USER_CODE_ATTEMPT_WINDOW: u64 = 60;
const DEFAULT_CIBA_MAX_REQUEST_AGE: u64 = 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthzConfig {
    /// The issuer origin of this authorisation server. All first party pages
    /// and token `iss` claims are derived from it.
    pub issuer: Url,

    /// Refuse any authorisation request that did not arrive through a pushed
    /// authorisation request reference.
    #[serde(default)]
    pub require_par: bool,

    /// Refuse any authorisation request without a PKCE code challenge, even
    /// for clients that do not individually require one.
    #[serde(default)]
    pub require_pkce: bool,

    /// Refuse request objects that are unsigned (alg `none`).
    #[serde(default)]
    pub force_signed_request_object: bool,

    /// The strict financial-grade profile. Tightens request object
    /// validation and suppresses informational response parameters.
    #[serde(default)]
    pub strict_profile: bool,

    /// Permit `response_mode=form_post`. When disabled the request falls
    /// back to the default mode for its response types.
    #[serde(default = "default_true")]
    pub allow_form_post: bool,

    /// Echo `session_id` on successful responses.
    #[serde(default)]
    pub session_id_parameter_enabled: bool,

    /// Echo `sid` on successful responses. Off by default, relying parties
    /// should read it from the id_token.
    #[serde(default)]
    pub include_sid_in_response: bool,

    /// Echo the deployment defined custom response headers parameter as
    /// HTTP headers on the final response.
    #[serde(default)]
    pub custom_headers_with_authorization_response: bool,

    /// Treat `max_age=0` as an unconditional re-authentication demand
    /// rather than permitting the existing session.
    #[serde(default)]
    pub disable_authn_for_max_age_zero: bool,

    /// When an authenticated session's ACR no longer matches the requested
    /// one, silently force re-authentication instead of failing with
    /// `session_selection_required`.
    #[serde(default = "default_true")]
    pub acr_change_forces_reauthentication: bool,

    #[serde(default = "default_authorization_page")]
    pub authorization_page_path: String,
    #[serde(default = "default_select_account_page")]
    pub select_account_page_path: String,
    #[serde(default = "default_device_verification_page")]
    pub device_verification_page_path: String,

    #[serde(default = "default_access_token_lifetime")]
    pub access_token_lifetime: u64,
    #[serde(default = "default_refresh_token_lifetime")]
    pub refresh_token_lifetime: u64,
    #[serde(default = "default_id_token_lifetime")]
    pub id_token_lifetime: u64,

    #[serde(default = "default_device_code_lifetime")]
    pub device_code_lifetime: u64,
    #[serde(default = "default_device_poll_interval")]
    pub device_poll_interval: u64,

    /// How many user code submissions a single session may attempt within
    /// one attempt window before being rate limited.
    #[serde(default = "default_user_code_attempt_limit")]
    pub user_code_attempt_limit: u32,
    #[serde(default = "default_user_code_attempt_window")]
    pub user_code_attempt_window: u64,

    /// Maximum age in seconds of the `nbf` claim of a CIBA request object.
    #[serde(default = "default_ciba_max_request_age")]
    pub ciba_max_request_age: u64,
}

impl AuthzConfig {
    /// A configuration with every policy at its default, suitable as a
    /// starting point for the hosting process.
    pub fn new(issuer: Url) -> Self {
        AuthzConfig {
            issuer,
            require_par: false,
            require_pkce: false,
            force_signed_request_object: false,
            strict_profile: false,
            allow_form_post: true,
            session_id_parameter_enabled: false,
            include_sid_in_response: false,
            custom_headers_with_authorization_response: false,
            disable_authn_for_max_age_zero: false,
            acr_change_forces_reauthentication: true,
            authorization_page_path: default_authorization_page(),
            select_account_page_path: default_select_account_page(),
            device_verification_page_path: default_device_verification_page(),
            access_token_lifetime: DEFAULT_ACCESS_TOKEN_LIFETIME,
            refresh_token_lifetime: DEFAULT_REFRESH_TOKEN_LIFETIME,
            id_token_lifetime: DEFAULT_ID_TOKEN_LIFETIME,
            device_code_lifetime: OAUTH2_DEVICE_CODE_EXPIRY_SECONDS,
            device_poll_interval: OAUTH2_DEVICE_CODE_INTERVAL_SECONDS,
            user_code_attempt_limit: DEFAULT_USER_CODE_ATTEMPT_LIMIT,
            user_code_attempt_window: DEFAULT_USER_CODE_ATTEMPT_WINDOW,
            ciba_max_request_age: DEFAULT_CIBA_MAX_REQUEST_AGE,
        }
    }

    pub fn authorization_page(&self) -> Url {
        self.page(&self.authorization_page_path)
    }

    pub fn select_account_page(&self) -> Url {
        self.page(&self.select_account_page_path)
    }

    pub fn device_verification_page(&self) -> Url {
        self.page(&self.device_verification_page_path)
    }

    fn page(&self, path: &str) -> Url {
        self.issuer.join(path).unwrap_or_else(|err| {
            warn!(?err, %path, "Invalid first party page path, using issuer");
            self.issuer.clone()
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_authorization_page() -> String {
    AUTHORIZATION_PAGE_PATH.to_string()
}

fn default_select_account_page() -> String {
    SELECT_ACCOUNT_PAGE_PATH.to_string()
}

fn default_device_verification_page() -> String {
    DEVICE_VERIFICATION_PAGE_PATH.to_string()
}

fn default_access_token_lifetime() -> u64 {
    DEFAULT_ACCESS_TOKEN_LIFETIME
}

fn default_refresh_token_lifetime() -> u64 {
    DEFAULT_REFRESH_TOKEN_LIFETIME
}

fn default_id_token_lifetime() -> u64 {
    DEFAULT_ID_TOKEN_LIFETIME
}

fn default_device_code_lifetime() -> u64 {
    OAUTH2_DEVICE_CODE_EXPIRY_SECONDS
}

fn default_device_poll_interval() -> u64 {
    OAUTH2_DEVICE_CODE_INTERVAL_SECONDS
}

fn default_user_code_attempt_limit() -> u32 {
    DEFAULT_USER_CODE_ATTEMPT_LIMIT
}

fn default_user_code_attempt_window() -> u64 {
    DEFAULT_USER_CODE_ATTEMPT_WINDOW
}

fn default_ciba_max_request_age() -> u64 {
    DEFAULT_CIBA_MAX_REQUEST_AGE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_partial_input() {
        let config: AuthzConfig =
            serde_json::from_str(r#"{"issuer": "https://idp.example.com", "require_pkce": true}"#)
                .expect("Failed to parse config");

        assert!(config.require_pkce);
        assert!(!config.require_par);
        assert!(config.allow_form_post);
        assert_eq!(config.access_token_lifetime, 3600);
        assert_eq!(
            config.authorization_page().as_str(),
            "https://idp.example.com/authorize"
        );
    }
}

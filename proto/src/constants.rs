//! Constant strings shared over the wire.

pub const OAUTH2_SCOPE_OPENID: &str = "openid";
pub const OAUTH2_SCOPE_PROFILE: &str = "profile";
pub const OAUTH2_SCOPE_EMAIL: &str = "email";
pub const OAUTH2_SCOPE_OFFLINE_ACCESS: &str = "offline_access";

/// Prefix that marks a `request_uri` value as a reference to a pushed
/// authorisation request rather than a dereferenceable URL.
/// <https://www.rfc-editor.org/rfc/rfc9126#section-2.2>
pub const PAR_URI_PREFIX: &str = "urn:ietf:params:oauth:request_uri:";

/// Header carrying the token binding message of the user agent.
pub const TOKEN_BINDING_HEADER: &str = "Sec-Token-Binding";

/// First party pages that interactive flows are redirected to. These are
/// resolved against the issuer origin.
pub const AUTHORIZATION_PAGE_PATH: &str = "/authorize";
pub const SELECT_ACCOUNT_PAGE_PATH: &str = "/select_account";
pub const DEVICE_VERIFICATION_PAGE_PATH: &str = "/device";

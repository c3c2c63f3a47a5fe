//! External collaborator capabilities: cryptography, policy oracles,
//! backchannel notification and audit. The engine treats each of these as
//! opaque - it decides *when* to consult them, never *how* they work.

use hashbrown::HashMap;

use crate::audit::AuditEvent;
use crate::authz::request::AuthzRequest;
use crate::prelude::*;
use crate::store::{AuthorisationGrant, Client, Session};

/// Why a request object failed signature policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignaturePolicyError {
    /// The signature did not verify against the client's registered keys.
    VerificationFailed,
    /// The algorithm is forbidden by the active profile.
    AlgorithmRejected(String),
}

/// Signing, verification and hash construction. JWT serialisation details
/// live entirely behind this seam.
pub trait CryptoProvider: Send + Sync {
    /// Verify the signature of a compact JWT request object against the
    /// client's registered keys. Claim validation stays with the caller.
    fn verify_request_object(
        &self,
        raw_jwt: &str,
        alg: &str,
        client: &Client,
    ) -> Result<(), SignaturePolicyError>;

    /// Serialise and sign an id_token from its claim set.
    fn sign_id_token(
        &self,
        client: &Client,
        claims: &serde_json::Value,
    ) -> Result<String, OperationError>;

    /// Hash binding an issued token to the user agent's token binding
    /// message and the client's registered confirmation key.
    fn compute_token_binding_hash(
        &self,
        binding_header: &str,
        cnf: &str,
    ) -> Result<String, OperationError>;

    /// The `session_state` value for OpenID Connect session management.
    fn compute_session_state(
        &self,
        client_id: &str,
        redirect_origin: &str,
        session: &Session,
    ) -> String;

    /// The pairwise subject identifier for a client and user.
    fn pairwise_identifier(&self, client: &Client, user_id: &str) -> String;
}

/// The scope policy oracle: which of the requested scopes this client may
/// be granted at all. Unknown or forbidden scopes are silently dropped.
pub trait ScopePolicy: Send + Sync {
    fn check_scopes_policy(
        &self,
        client: &Client,
        requested: &BTreeSet<String>,
    ) -> BTreeSet<String>;
}

/// Non-interactive authentication over the request parameters. Consulted
/// only for `prompt=none` requests with no authenticated session.
pub trait AuthenticationFilter: Send + Sync {
    /// Returns the authenticated user id, or `None` when the filter chain
    /// could not establish one.
    fn process_filters(&self, request: &AuthzRequest) -> Option<String>;
}

/// Post-authentication policy, consulted once the session user is known.
pub trait PostAuthnPolicy: Send + Sync {
    /// Demand a fresh interactive authentication despite the valid session.
    fn force_re_authentication(&self, client: &Client, session: &Session) -> bool;
    /// Demand a fresh pass through the authorisation (consent) page.
    fn force_authorization(&self, client: &Client, session: &Session) -> bool;
}

/// Outcome of one consent gathering step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentVerdict {
    pub allow: bool,
    /// Override of the step the user agent should visit next. `None` means
    /// the natural next step.
    pub next_step: Option<u32>,
}

/// An external interactive consent gathering flow, modelled as a capability
/// of step count, page-per-step and an authorise decision. Its internals
/// are not defined here; it only signals pass/fail and step routing.
pub trait ConsentGatheringPolicy: Send + Sync {
    fn steps(&self, client: &Client) -> u32;
    fn page_for_step(&self, client: &Client, step: u32) -> Option<Url>;
    fn authorize(&self, client: &Client, session: &Session, step: u32) -> ConsentVerdict;
}

/// Policy driven claim modification of a minted id_token.
pub trait TokenUpdatePolicy: Send + Sync {
    fn modify_id_token(
        &self,
        claims: &mut serde_json::Value,
        client: &Client,
        grant: &AuthorisationGrant,
    );
}

/// Delivery of backchannel tokens to the client's notification endpoint.
pub trait ClientNotifier: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn push_token_delivery(
        &self,
        auth_req_id: &str,
        endpoint: &Url,
        notification_token: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        id_token: &str,
        expires_in: u64,
    );

    fn ping_callback(&self, auth_req_id: &str, endpoint: &Url, notification_token: &str);
}

pub trait AuditLogger: Send + Sync {
    fn send(&self, event: AuditEvent);
}

/// Statically registered policy implementations, keyed by the name used in
/// client and deployment configuration. Resolution happens once when the
/// engine is constructed, never per request.
#[derive(Default)]
pub struct PolicyRegistry {
    post_authn: HashMap<String, Arc<dyn PostAuthnPolicy>>,
    consent_gathering: HashMap<String, Arc<dyn ConsentGatheringPolicy>>,
    token_update: HashMap<String, Arc<dyn TokenUpdatePolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_post_authn(&mut self, name: &str, policy: Arc<dyn PostAuthnPolicy>) {
        if self
            .post_authn
            .insert(name.to_string(), policy)
            .is_some()
        {
            warn!(%name, "Replaced an already registered post-authn policy");
        }
    }

    pub fn register_consent_gathering(
        &mut self,
        name: &str,
        policy: Arc<dyn ConsentGatheringPolicy>,
    ) {
        if self
            .consent_gathering
            .insert(name.to_string(), policy)
            .is_some()
        {
            warn!(%name, "Replaced an already registered consent gathering policy");
        }
    }

    pub fn register_token_update(&mut self, name: &str, policy: Arc<dyn TokenUpdatePolicy>) {
        if self
            .token_update
            .insert(name.to_string(), policy)
            .is_some()
        {
            warn!(%name, "Replaced an already registered token update policy");
        }
    }

    pub fn post_authn(&self, name: &str) -> Option<Arc<dyn PostAuthnPolicy>> {
        self.post_authn.get(name).cloned()
    }

    pub fn consent_gathering(&self, name: &str) -> Option<Arc<dyn ConsentGatheringPolicy>> {
        self.consent_gathering.get(name).cloned()
    }

    pub fn token_update(&self, name: &str) -> Option<Arc<dyn TokenUpdatePolicy>> {
        self.token_update.get(name).cloned()
    }
}

/// Dereference of a non-PAR `request_uri`. The implementation should apply
/// its own timeout; a failed fetch is reported as `None` and treated by the
/// engine as "request object absent", never as a fatal error.
pub trait RequestObjectFetcher: Send + Sync {
    fn fetch(&self, uri: &Url) -> Option<String>;
}

//! Persisted domain entities and the traits the engine uses to reach the
//! entry store. The engine never owns storage: every mutation here is a
//! read-modify-write against a collaborator, and the collaborator is free to
//! be LDAP, SQL or an in-memory map (see [`crate::testkit`]).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ianus_proto::oauth2::{
    BackchannelTokenDeliveryMode, CodeChallengeMethod, GrantType, Prompt, SubjectType,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// A registered relying party. Owned by the persistence collaborator and
/// read-only to this subsystem.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Client {
    pub client_id: String,
    pub display_name: String,
    pub enabled: bool,
    /// Registered redirect targets. A requested `redirect_uri` must match
    /// one of these exactly.
    pub redirect_uris: Vec<Url>,
    pub grant_types: BTreeSet<GrantType>,
    pub subject_type: SubjectType,
    /// Trusted clients never see a consent page.
    pub trusted: bool,
    /// This client may only authorise through pushed authorisation requests.
    pub require_par: bool,
    pub require_pkce: bool,
    pub default_acr_values: Vec<String>,
    /// ACR values this client may request. Empty means unrestricted.
    pub authorized_acr_values: Vec<String>,
    pub default_max_age: Option<i64>,
    /// Force a login prompt on every authorisation for this client.
    pub default_prompt_login: bool,
    /// Whether granted consent is written back as a [`ClientAuthorisation`].
    pub persist_client_authorizations: bool,
    pub backchannel_delivery_mode: Option<BackchannelTokenDeliveryMode>,
    pub backchannel_notification_endpoint: Option<Url>,
    /// Token binding confirmation key material registered for id_tokens.
    pub id_token_token_binding_cnf: Option<String>,
    /// Name of the consent gathering policy bound to this client, resolved
    /// against the policy registry at engine construction.
    pub consent_gathering_policy: Option<String>,
}

impl Client {
    /// Response types this client may request, derived from its grant types.
    pub fn allows_response_type(&self, rt: ianus_proto::oauth2::ResponseType) -> bool {
        use ianus_proto::oauth2::ResponseType;
        match rt {
            ResponseType::Code => self.grant_types.contains(&GrantType::AuthorisationCode),
            ResponseType::Token | ResponseType::IdToken => {
                self.grant_types.contains(&GrantType::Implicit)
            }
        }
    }
}

pub trait ClientStore: Send + Sync {
    fn find_client(&self, client_id: &str) -> Result<Option<Client>, OperationError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
}

/// Interactive sub-flow state stashed on the session between round trips.
/// A tagged value rather than a free-form attribute map so that an illegal
/// combination of stashed state is unrepresentable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFlow {
    Idle,
    /// An ACR transition forced this session back to login; the prompt list
    /// to restore when the user returns is carried here.
    ForcedReauthentication { prompt: Vec<Prompt> },
    /// The user agent entered a device flow user code and is authorising it.
    DeviceVerification { user_code: String },
    /// An external consent gathering policy is walking the user through its
    /// step sequence.
    ConsentGathering { client_id: String, step: u32 },
}

/// Continuity of one user agent across requests. One session belongs to one
/// user agent; all mutation is read-most-recent, mutate, write-back.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub state: SessionState,
    pub user_id: Option<String>,
    /// Epoch seconds of the last successful authentication.
    pub auth_time: Option<u64>,
    /// The authentication context class used for the last authentication.
    pub acr: Option<String>,
    /// Per-client consent decisions made during this session.
    pub permissions: BTreeMap<String, bool>,
    pub flow: SessionFlow,
}

impl Session {
    pub fn new_unauthenticated() -> Self {
        Session {
            id: Uuid::new_v4(),
            state: SessionState::Unauthenticated,
            user_id: None,
            auth_time: None,
            acr: None,
            permissions: BTreeMap::new(),
            flow: SessionFlow::Idle,
        }
    }

    pub fn new_authenticated(user_id: &str, acr: Option<&str>, ct: Duration) -> Self {
        Session {
            id: Uuid::new_v4(),
            state: SessionState::Authenticated,
            user_id: Some(user_id.to_string()),
            auth_time: Some(ct.as_secs()),
            acr: acr.map(str::to_string),
            permissions: BTreeMap::new(),
            flow: SessionFlow::Idle,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated && self.user_id.is_some()
    }

    /// Return this session to the unauthenticated state, discarding the
    /// authenticated user. Consent decisions and flow state survive so an
    /// interrupted flow can resume after re-login.
    pub fn invalidate(&mut self) {
        self.state = SessionState::Unauthenticated;
        self.user_id = None;
        self.auth_time = None;
        self.acr = None;
    }

    pub fn add_permission(&mut self, client_id: &str, granted: bool) {
        self.permissions.insert(client_id.to_string(), granted);
    }

    pub fn is_permission_granted(&self, client_id: &str) -> bool {
        self.permissions.get(client_id).copied().unwrap_or(false)
    }

    pub fn device_user_code(&self) -> Option<&str> {
        match &self.flow {
            SessionFlow::DeviceVerification { user_code } => Some(user_code.as_str()),
            _ => None,
        }
    }
}

pub trait SessionStore: Send + Sync {
    fn find_session(&self, id: Uuid) -> Result<Option<Session>, OperationError>;
    /// Persist a session that does not exist yet. Fails with
    /// [`OperationError::DuplicateKey`] if it does.
    fn create_session(&self, session: &Session) -> Result<(), OperationError>;
    fn update_session(&self, session: &Session) -> Result<(), OperationError>;
}

/// Scopes a user has previously granted to a client, surviving the session
/// that granted them. Superseding writes happen only through the consent
/// resolver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientAuthorisation {
    pub user_id: String,
    pub client_id: String,
    pub scopes: BTreeSet<String>,
}

pub trait ClientAuthorisationStore: Send + Sync {
    fn find_authorisation(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<ClientAuthorisation>, OperationError>;
    fn save_authorisation(&self, authz: &ClientAuthorisation) -> Result<(), OperationError>;
    fn clear_authorisation(&self, user_id: &str, client_id: &str) -> Result<(), OperationError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum IssuedTokenKind {
    Access,
    Refresh,
    IdToken,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub kind: IssuedTokenKind,
    pub value: String,
    pub expires_in: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum GrantKind {
    AuthorisationCode { code: String },
    Implicit,
    Ciba { auth_req_id: String },
    Device { device_code: String, user_code: String },
}

/// An issued credential context binding a subject, client and scope set to
/// the tokens minted from it. The grant id is immutable once created; the
/// token set grows as tokens are minted within the same request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthorisationGrant {
    pub grant_id: Uuid,
    pub kind: GrantKind,
    pub user_id: String,
    pub client_id: String,
    pub auth_time: Option<u64>,
    pub scopes: BTreeSet<String>,
    pub nonce: Option<String>,
    pub acr: Option<String>,
    /// Raw `claims` request parameter attached for the token endpoint.
    pub claims: Option<String>,
    pub code_challenge: Option<Vec<u8>>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub token_binding_hash: Option<String>,
    pub session_id: Option<Uuid>,
    pub tokens: Vec<IssuedToken>,
    /// Backchannel grants flip this once the client has received the tokens.
    pub tokens_delivered: bool,
}

impl AuthorisationGrant {
    fn new(kind: GrantKind, user_id: &str, client: &Client, auth_time: Option<u64>) -> Self {
        AuthorisationGrant {
            grant_id: Uuid::new_v4(),
            kind,
            user_id: user_id.to_string(),
            client_id: client.client_id.clone(),
            auth_time,
            scopes: BTreeSet::new(),
            nonce: None,
            acr: None,
            claims: None,
            code_challenge: None,
            code_challenge_method: None,
            token_binding_hash: None,
            session_id: None,
            tokens: Vec::new(),
            tokens_delivered: false,
        }
    }

    pub fn new_code_grant(user_id: &str, client: &Client, auth_time: Option<u64>) -> Self {
        let code = gen_opaque_handle();
        Self::new(
            GrantKind::AuthorisationCode { code },
            user_id,
            client,
            auth_time,
        )
    }

    pub fn new_implicit_grant(user_id: &str, client: &Client, auth_time: Option<u64>) -> Self {
        Self::new(GrantKind::Implicit, user_id, client, auth_time)
    }

    pub fn authorisation_code(&self) -> Option<&str> {
        match &self.kind {
            GrantKind::AuthorisationCode { code } => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn push_token(&mut self, token: IssuedToken) {
        self.tokens.push(token);
    }
}

pub trait GrantStore: Send + Sync {
    /// Persist the current state of a grant. Grants are saved after every
    /// mutation; the grant id is the stable key.
    fn save_grant(&self, grant: &AuthorisationGrant) -> Result<(), OperationError>;

    fn create_code_grant(
        &self,
        user_id: &str,
        client: &Client,
        auth_time: Option<u64>,
    ) -> Result<AuthorisationGrant, OperationError> {
        let grant = AuthorisationGrant::new_code_grant(user_id, client, auth_time);
        self.save_grant(&grant)?;
        Ok(grant)
    }

    fn create_implicit_grant(
        &self,
        user_id: &str,
        client: &Client,
        auth_time: Option<u64>,
    ) -> Result<AuthorisationGrant, OperationError> {
        let grant = AuthorisationGrant::new_implicit_grant(user_id, client, auth_time);
        self.save_grant(&grant)?;
        Ok(grant)
    }

    fn create_ciba_grant(
        &self,
        request: &CibaRequestRecord,
        client: &Client,
    ) -> Result<AuthorisationGrant, OperationError> {
        let mut grant = AuthorisationGrant::new(
            GrantKind::Ciba {
                auth_req_id: request.auth_req_id.clone(),
            },
            &request.user_id,
            client,
            None,
        );
        grant.scopes = request.scopes.clone();
        self.save_grant(&grant)?;
        Ok(grant)
    }

    fn create_device_grant(
        &self,
        pending: &DeviceAuthorizationRecord,
        client: &Client,
        user_id: &str,
        auth_time: Option<u64>,
    ) -> Result<AuthorisationGrant, OperationError> {
        let mut grant = AuthorisationGrant::new(
            GrantKind::Device {
                device_code: pending.device_code.clone(),
                user_code: pending.user_code.clone(),
            },
            user_id,
            client,
            auth_time,
        );
        grant.scopes = pending.scopes.clone();
        self.save_grant(&grant)?;
        Ok(grant)
    }
}

/// A pushed authorisation request at rest. The stored parameter set is the
/// complete source of truth for the eventual authorisation request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Par {
    /// The `urn:ietf:params:oauth:request_uri:...` reference.
    pub reference: String,
    pub client_id: String,
    /// Epoch seconds after which the reference is dead.
    pub expires_at: u64,
    pub request: ianus_proto::oauth2::AuthorisationRequest,
}

impl Par {
    pub fn is_expired(&self, ct: Duration) -> bool {
        self.expires_at <= ct.as_secs()
    }
}

pub trait ParStore: Send + Sync {
    /// Look up and consume a pushed authorisation request. A reference
    /// resolves at most once; a second resolve returns `None`.
    fn resolve(&self, reference: &str) -> Result<Option<Par>, OperationError>;
}

/// A pending device flow authorisation, cached until the user enters the
/// user code or the TTL runs out.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeviceAuthorizationRecord {
    pub device_code: String,
    pub user_code: String,
    pub client_id: String,
    pub scopes: BTreeSet<String>,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl DeviceAuthorizationRecord {
    pub fn is_expired(&self, ct: Duration) -> bool {
        self.expires_at <= ct.as_secs()
    }
}

/// A pending backchannel (CIBA) authentication request, cached until the
/// interactive completion or the TTL runs out.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CibaRequestRecord {
    pub auth_req_id: String,
    pub client_id: String,
    pub user_id: String,
    pub scopes: BTreeSet<String>,
    pub expires_at: u64,
    pub client_notification_token: Option<String>,
}

impl CibaRequestRecord {
    pub fn is_expired(&self, ct: Duration) -> bool {
        self.expires_at <= ct.as_secs()
    }
}

/// TTL cache for the device and backchannel flows. `take_*` removes the
/// record, which is what makes a second completion of the same code a no-op
/// rather than a duplicate grant.
pub trait BackchannelCache: Send + Sync {
    fn insert_device(&self, record: DeviceAuthorizationRecord) -> Result<(), OperationError>;
    fn find_device_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceAuthorizationRecord>, OperationError>;
    fn take_device_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceAuthorizationRecord>, OperationError>;

    fn insert_ciba(&self, record: CibaRequestRecord) -> Result<(), OperationError>;
    fn take_ciba_by_auth_req_id(
        &self,
        auth_req_id: &str,
    ) -> Result<Option<CibaRequestRecord>, OperationError>;
}

/// An unguessable single-use handle - authorisation codes, opaque access
/// tokens and backchannel request ids are all minted from this.
pub fn gen_opaque_handle() -> String {
    let mut rng = rand::thread_rng();
    let mut buf = [0u8; 32];
    rng.fill(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_handles_are_unique() {
        let a = gen_opaque_handle();
        let b = gen_opaque_handle();
        assert_ne!(a, b);
        assert!(a.len() >= 40);
    }

    #[test]
    fn test_session_invalidate_keeps_flow_state() {
        let mut session = Session::new_authenticated("alice", Some("basic"), Duration::from_secs(100));
        session.flow = SessionFlow::DeviceVerification {
            user_code: "123-456-789".to_string(),
        };
        session.invalidate();

        assert_eq!(session.state, SessionState::Unauthenticated);
        assert!(session.user_id.is_none());
        assert_eq!(session.device_user_code(), Some("123-456-789"));
    }
}

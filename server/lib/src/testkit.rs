//! In-memory collaborator implementations and request builders for tests.
//! Enable the `test` feature to reuse these from dependent crates.

use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hashbrown::HashMap;
use ianus_proto::oauth2::{AuthorisationRequest, GrantType, ResponseType, SubjectType};

use crate::audit::AuditEvent;
use crate::authz::request::{AuthzRequest, HttpMethod};
use crate::authz::{AuthzCollaborators, AuthzServer, RequestContext};
use crate::external::{
    AuditLogger, AuthenticationFilter, ClientNotifier, CryptoProvider, PolicyRegistry,
    RequestObjectFetcher, ScopePolicy, SignaturePolicyError,
};
use crate::prelude::*;
use crate::store::{
    AuthorisationGrant, BackchannelCache, CibaRequestRecord, Client, ClientAuthorisation,
    ClientAuthorisationStore, ClientStore, DeviceAuthorizationRecord, GrantStore, Par, ParStore,
    Session, SessionStore,
};

#[derive(Default)]
pub struct InMemoryClientStore {
    clients: Mutex<HashMap<String, Client>>,
}

impl InMemoryClientStore {
    pub fn insert(&self, client: Client) {
        let mut clients = lock(&self.clients);
        clients.insert(client.client_id.clone(), client);
    }
}

impl ClientStore for InMemoryClientStore {
    fn find_client(&self, client_id: &str) -> Result<Option<Client>, OperationError> {
        Ok(lock(&self.clients).get(client_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl SessionStore for InMemorySessionStore {
    fn find_session(&self, id: Uuid) -> Result<Option<Session>, OperationError> {
        Ok(lock(&self.sessions).get(&id).cloned())
    }

    fn create_session(&self, session: &Session) -> Result<(), OperationError> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&session.id) {
            return Err(OperationError::DuplicateKey);
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn update_session(&self, session: &Session) -> Result<(), OperationError> {
        let mut sessions = lock(&self.sessions);
        if !sessions.contains_key(&session.id) {
            return Err(OperationError::NoMatchingEntries);
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryClientAuthorisationStore {
    records: Mutex<HashMap<(String, String), ClientAuthorisation>>,
}

impl ClientAuthorisationStore for InMemoryClientAuthorisationStore {
    fn find_authorisation(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<ClientAuthorisation>, OperationError> {
        Ok(lock(&self.records)
            .get(&(user_id.to_string(), client_id.to_string()))
            .cloned())
    }

    fn save_authorisation(&self, authz: &ClientAuthorisation) -> Result<(), OperationError> {
        lock(&self.records).insert(
            (authz.user_id.clone(), authz.client_id.clone()),
            authz.clone(),
        );
        Ok(())
    }

    fn clear_authorisation(&self, user_id: &str, client_id: &str) -> Result<(), OperationError> {
        lock(&self.records).remove(&(user_id.to_string(), client_id.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryGrantStore {
    grants: Mutex<HashMap<Uuid, AuthorisationGrant>>,
}

impl InMemoryGrantStore {
    pub fn grant_count(&self) -> usize {
        lock(&self.grants).len()
    }

    pub fn get_grant(&self, grant_id: Uuid) -> Option<AuthorisationGrant> {
        lock(&self.grants).get(&grant_id).cloned()
    }

    pub fn all_grants(&self) -> Vec<AuthorisationGrant> {
        lock(&self.grants).values().cloned().collect()
    }
}

impl GrantStore for InMemoryGrantStore {
    fn save_grant(&self, grant: &AuthorisationGrant) -> Result<(), OperationError> {
        lock(&self.grants).insert(grant.grant_id, grant.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryParStore {
    records: Mutex<HashMap<String, Par>>,
}

impl InMemoryParStore {
    pub fn insert(&self, par: Par) {
        lock(&self.records).insert(par.reference.clone(), par);
    }

    pub fn contains(&self, reference: &str) -> bool {
        lock(&self.records).contains_key(reference)
    }
}

impl ParStore for InMemoryParStore {
    fn resolve(&self, reference: &str) -> Result<Option<Par>, OperationError> {
        Ok(lock(&self.records).remove(reference))
    }
}

#[derive(Default)]
pub struct InMemoryBackchannelCache {
    device: Mutex<HashMap<String, DeviceAuthorizationRecord>>,
    ciba: Mutex<HashMap<String, CibaRequestRecord>>,
}

impl BackchannelCache for InMemoryBackchannelCache {
    fn insert_device(&self, record: DeviceAuthorizationRecord) -> Result<(), OperationError> {
        lock(&self.device).insert(record.user_code.clone(), record);
        Ok(())
    }

    fn find_device_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceAuthorizationRecord>, OperationError> {
        Ok(lock(&self.device).get(user_code).cloned())
    }

    fn take_device_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceAuthorizationRecord>, OperationError> {
        Ok(lock(&self.device).remove(user_code))
    }

    fn insert_ciba(&self, record: CibaRequestRecord) -> Result<(), OperationError> {
        lock(&self.ciba).insert(record.auth_req_id.clone(), record);
        Ok(())
    }

    fn take_ciba_by_auth_req_id(
        &self,
        auth_req_id: &str,
    ) -> Result<Option<CibaRequestRecord>, OperationError> {
        Ok(lock(&self.ciba).remove(auth_req_id))
    }
}

/// Deterministic stand-in for the crypto collaborator. Signatures verify
/// unless the algorithm is the literal string `BAD`.
pub struct TestCrypto;

impl CryptoProvider for TestCrypto {
    fn verify_request_object(
        &self,
        _raw_jwt: &str,
        alg: &str,
        _client: &Client,
    ) -> Result<(), SignaturePolicyError> {
        if alg == "BAD" {
            Err(SignaturePolicyError::VerificationFailed)
        } else {
            Ok(())
        }
    }

    fn sign_id_token(
        &self,
        _client: &Client,
        claims: &serde_json::Value,
    ) -> Result<String, OperationError> {
        let payload = serde_json::to_vec(claims).map_err(|_| OperationError::SerdeJsonError)?;
        Ok(format!(
            "eyJhbGciOiJFUzI1NiJ9.{}.sig",
            URL_SAFE_NO_PAD.encode(payload)
        ))
    }

    fn compute_token_binding_hash(
        &self,
        binding_header: &str,
        cnf: &str,
    ) -> Result<String, OperationError> {
        Ok(format!("tbh:{binding_header}:{cnf}"))
    }

    fn compute_session_state(
        &self,
        client_id: &str,
        redirect_origin: &str,
        session: &Session,
    ) -> String {
        format!("{client_id}.{redirect_origin}.{}", session.id)
    }

    fn pairwise_identifier(&self, client: &Client, user_id: &str) -> String {
        format!("pairwise:{}:{user_id}", client.client_id)
    }
}

pub struct AllowAllScopePolicy;

impl ScopePolicy for AllowAllScopePolicy {
    fn check_scopes_policy(
        &self,
        _client: &Client,
        requested: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        requested.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    Push {
        auth_req_id: String,
        access_token: String,
        refresh_token: Option<String>,
        id_token: String,
    },
    Ping {
        auth_req_id: String,
    },
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifierEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotifierEvent> {
        lock(&self.events).clone()
    }
}

impl ClientNotifier for RecordingNotifier {
    fn push_token_delivery(
        &self,
        auth_req_id: &str,
        _endpoint: &Url,
        _notification_token: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        id_token: &str,
        _expires_in: u64,
    ) {
        lock(&self.events).push(NotifierEvent::Push {
            auth_req_id: auth_req_id.to_string(),
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(str::to_string),
            id_token: id_token.to_string(),
        });
    }

    fn ping_callback(&self, auth_req_id: &str, _endpoint: &Url, _notification_token: &str) {
        lock(&self.events).push(NotifierEvent::Ping {
            auth_req_id: auth_req_id.to_string(),
        });
    }
}

#[derive(Default)]
pub struct RecordingAuditLogger {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditLogger {
    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }
}

impl AuditLogger for RecordingAuditLogger {
    fn send(&self, event: AuditEvent) {
        lock(&self.events).push(event);
    }
}

/// A canned request object fetcher backed by a map of URL to body.
#[derive(Default)]
pub struct MapRequestObjectFetcher {
    bodies: Mutex<HashMap<String, String>>,
}

impl MapRequestObjectFetcher {
    pub fn insert(&self, uri: &str, body: &str) {
        lock(&self.bodies).insert(uri.to_string(), body.to_string());
    }
}

impl RequestObjectFetcher for MapRequestObjectFetcher {
    fn fetch(&self, uri: &Url) -> Option<String> {
        lock(&self.bodies).get(uri.as_str()).cloned()
    }
}

/// An authentication filter that accepts any request carrying a
/// `filter_token` custom parameter.
pub struct StaticAuthenticationFilter {
    pub user_id: String,
}

impl AuthenticationFilter for StaticAuthenticationFilter {
    fn process_filters(&self, request: &AuthzRequest) -> Option<String> {
        request
            .custom_parameters
            .contains_key("filter_token")
            .then(|| self.user_id.clone())
    }
}

/// Encode a claim set as an unverified compact JWS, the shape request
/// objects arrive in. The signature segment is junk; [`TestCrypto`]
/// accepts anything that is not alg `BAD`.
pub fn encode_request_object(alg: &str, claims: &serde_json::Value) -> String {
    let header = serde_json::json!({ "alg": alg, "typ": "JWT" });
    #[allow(clippy::unwrap_used)]
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
    #[allow(clippy::unwrap_used)]
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("{header_b64}.{payload_b64}.c2lnbmF0dXJl")
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A pairwise, non-trusted client registered for every flow the engine
/// supports, pointing at the demo relying party.
pub fn test_client(client_id: &str) -> Client {
    #[allow(clippy::unwrap_used)]
    let redirect_uri = Url::parse("https://demo.example.com/oauth2/result").unwrap();
    Client {
        client_id: client_id.to_string(),
        display_name: format!("Test client {client_id}"),
        enabled: true,
        redirect_uris: vec![redirect_uri],
        grant_types: BTreeSet::from([
            GrantType::AuthorisationCode,
            GrantType::Implicit,
            GrantType::DeviceCode,
            GrantType::Ciba,
        ]),
        subject_type: SubjectType::Pairwise,
        trusted: false,
        require_par: false,
        require_pkce: false,
        default_acr_values: Vec::new(),
        authorized_acr_values: Vec::new(),
        default_max_age: None,
        default_prompt_login: false,
        persist_client_authorizations: true,
        backchannel_delivery_mode: None,
        backchannel_notification_endpoint: None,
        id_token_token_binding_cnf: None,
        consent_gathering_policy: None,
    }
}

/// Wire-shaped parameters for a plain code flow request.
pub fn test_params(client_id: &str, scope: &str) -> AuthorisationRequest {
    AuthorisationRequest {
        response_type: BTreeSet::from([ResponseType::Code]),
        response_mode: None,
        client_id: client_id.to_string(),
        state: Some("123".to_string()),
        pkce_request: None,
        redirect_uri: Url::parse("https://demo.example.com/oauth2/result").ok(),
        scope: scope.split(' ').map(str::to_string).collect(),
        nonce: Some("abcdef".to_string()),
        prompt: None,
        display: None,
        max_age: None,
        ui_locales: None,
        id_token_hint: None,
        login_hint: None,
        acr_values: None,
        amr_values: None,
        request: None,
        request_uri: None,
        session_id: None,
        claims: None,
        auth_req_id: None,
        custom_response_headers: None,
        unknown_keys: BTreeMap::new(),
    }
}

/// The canonical request equivalent of [`test_params`].
pub fn test_request(client_id: &str, scope: &str) -> AuthzRequest {
    AuthzRequest::assemble(test_params(client_id, scope), HttpMethod::Get)
}

pub struct TestHarness {
    pub server: AuthzServer,
    pub clients: Arc<InMemoryClientStore>,
    pub sessions: Arc<InMemorySessionStore>,
    pub authorisations: Arc<InMemoryClientAuthorisationStore>,
    pub grants: Arc<InMemoryGrantStore>,
    pub pars: Arc<InMemoryParStore>,
    pub backchannel: Arc<InMemoryBackchannelCache>,
    pub notifier: Arc<RecordingNotifier>,
    pub audit: Arc<RecordingAuditLogger>,
}

impl TestHarness {
    pub fn context(&self, session: Option<&Session>) -> RequestContext {
        RequestContext {
            http_method: HttpMethod::Get,
            session_cookie: session.map(|s| s.id),
            token_binding: None,
            remote_addr: Some("127.0.0.1".to_string()),
        }
    }

    /// Seed an authenticated session for the given user.
    pub fn seed_session(&self, user_id: &str, acr: Option<&str>, ct: Duration) -> Session {
        let session = Session::new_authenticated(user_id, acr, ct);
        #[allow(clippy::expect_used)]
        self.sessions
            .create_session(&session)
            .expect("Failed to seed session");
        session
    }
}

pub fn test_harness(config: AuthzConfig) -> TestHarness {
    test_harness_full(config, PolicyRegistry::new(), None, None)
}

pub fn test_harness_full(
    config: AuthzConfig,
    registry: PolicyRegistry,
    authn_filter: Option<Arc<dyn AuthenticationFilter>>,
    request_fetcher: Option<Arc<dyn RequestObjectFetcher>>,
) -> TestHarness {
    let clients = Arc::new(InMemoryClientStore::default());
    let sessions = Arc::new(InMemorySessionStore::default());
    let authorisations = Arc::new(InMemoryClientAuthorisationStore::default());
    let grants = Arc::new(InMemoryGrantStore::default());
    let pars = Arc::new(InMemoryParStore::default());
    let backchannel = Arc::new(InMemoryBackchannelCache::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let audit = Arc::new(RecordingAuditLogger::default());

    let collaborators = AuthzCollaborators {
        clients: clients.clone(),
        sessions: sessions.clone(),
        client_authorisations: authorisations.clone(),
        grants: grants.clone(),
        pars: pars.clone(),
        backchannel: backchannel.clone(),
        crypto: Arc::new(TestCrypto),
        scope_policy: Arc::new(AllowAllScopePolicy),
        notifier: notifier.clone(),
        audit: audit.clone(),
        authn_filter,
        request_fetcher,
    };

    #[allow(clippy::expect_used)]
    let server = AuthzServer::new(config, collaborators, registry, None, None)
        .expect("Failed to build test server");

    TestHarness {
        server,
        clients,
        sessions,
        authorisations,
        grants,
        pars,
        backchannel,
        notifier,
        audit,
    }
}

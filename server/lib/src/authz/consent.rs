//! Consent resolution: whether the user's explicit approval can be skipped,
//! must be (re-)collected on the consent page, or is being gathered by an
//! external step-wise policy.

use ianus_proto::oauth2::{Prompt, SubjectType};

use crate::authz::prompt;
use crate::authz::request::AuthzRequest;
use crate::authz::response::Interrupt;
use crate::authz::validator::server_error_status;
use crate::external::ConsentGatheringPolicy;
use crate::prelude::*;
use crate::store::{
    Client, ClientAuthorisation, ClientAuthorisationStore, Session, SessionFlow, SessionStore,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConsentOutcome {
    /// Consent is settled; proceed to issuance.
    Granted,
    /// Send the user to the interactive consent page. The carried prompt
    /// list has already had `consent` removed so the return trip does not
    /// loop.
    CollectConsent,
    /// An external consent gathering policy wants the user on this page.
    GatheringStep(Url),
}

/// Decide the consent disposition for an authenticated user.
#[allow(clippy::too_many_arguments)]
pub(crate) fn resolve_consent(
    client: &Client,
    gathering_policy: Option<&dyn ConsentGatheringPolicy>,
    client_authorisations: &dyn ClientAuthorisationStore,
    sessions: &dyn SessionStore,
    request: &mut AuthzRequest,
    session: &mut Session,
    user_id: &str,
    scopes: &BTreeSet<String>,
) -> Result<ConsentOutcome, Interrupt> {
    // An explicit prompt=consent always re-collects, and supersedes any
    // stored authorisation.
    if request.prompt.contains(&Prompt::Consent) {
        client_authorisations
            .clear_authorisation(user_id, &client.client_id)
            .map_err(server_error_status)?;
        session.add_permission(&client.client_id, false);
        prompt::clear(&mut request.prompt, Prompt::Consent);
        debug!("prompt=consent requested, collecting consent");
        return collect_or_gather(gathering_policy, client, session, sessions);
    }

    if session.is_permission_granted(&client.client_id) {
        // The user already approved this client during this session,
        // typically by returning from the consent page. Persist the
        // approval for future sessions now.
        if client.persist_client_authorizations {
            let record = ClientAuthorisation {
                user_id: user_id.to_string(),
                client_id: client.client_id.clone(),
                scopes: scopes.clone(),
            };
            client_authorisations
                .save_authorisation(&record)
                .map_err(server_error_status)?;
        }
        return Ok(ConsentOutcome::Granted);
    }

    let bypass = consent_bypass_allowed(client, request, scopes);

    let covered_by_stored = if bypass {
        false
    } else {
        match client_authorisations
            .find_authorisation(user_id, &client.client_id)
            .map_err(server_error_status)?
        {
            Some(stored) => {
                trace!(stored_scopes = ?stored.scopes, requested = ?scopes, "Stored client authorisation");
                scopes.is_subset(&stored.scopes)
            }
            None => false,
        }
    };

    if bypass || covered_by_stored {
        session.add_permission(&client.client_id, true);
        sessions
            .update_session(session)
            .map_err(server_error_status)?;
        return Ok(ConsentOutcome::Granted);
    }

    debug!(client_id = %client.client_id, "Explicit consent required");
    collect_or_gather(gathering_policy, client, session, sessions)
}

/// Consent may be skipped for a trusted client, and for a pairwise-subject
/// client asking for nothing beyond `openid` itself.
fn consent_bypass_allowed(
    client: &Client,
    request: &AuthzRequest,
    scopes: &BTreeSet<String>,
) -> bool {
    if client.trusted {
        return true;
    }

    client.subject_type == SubjectType::Pairwise
        && scopes.len() == 1
        && scopes.contains(OAUTH2_SCOPE_OPENID)
        && request.claims.is_none()
        && !request.has_id_token_member
        && !request.has_userinfo_member
}

/// Standard consent page, unless an external gathering policy owns the
/// interaction - then it acts as a second-opinion oracle with its own step
/// counter stored on the session.
fn collect_or_gather(
    gathering_policy: Option<&dyn ConsentGatheringPolicy>,
    client: &Client,
    session: &mut Session,
    sessions: &dyn SessionStore,
) -> Result<ConsentOutcome, Interrupt> {
    let Some(policy) = gathering_policy else {
        return Ok(ConsentOutcome::CollectConsent);
    };

    let step = match &session.flow {
        SessionFlow::ConsentGathering { client_id, step } if *client_id == client.client_id => {
            *step
        }
        _ => 1,
    };

    let verdict = policy.authorize(client, session, step);
    if verdict.allow {
        session.flow = SessionFlow::Idle;
        session.add_permission(&client.client_id, true);
        sessions
            .update_session(session)
            .map_err(server_error_status)?;
        return Ok(ConsentOutcome::Granted);
    }

    let next_step = verdict.next_step.unwrap_or(step);
    session.flow = SessionFlow::ConsentGathering {
        client_id: client.client_id.clone(),
        step: next_step,
    };
    sessions
        .update_session(session)
        .map_err(server_error_status)?;

    match policy.page_for_step(client, next_step) {
        Some(page) => Ok(ConsentOutcome::GatheringStep(page)),
        None => Ok(ConsentOutcome::CollectConsent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ConsentVerdict;
    use crate::testkit::{
        test_client, test_request, InMemoryClientAuthorisationStore, InMemorySessionStore,
    };

    fn granted_session(client_id: &str) -> Session {
        let mut session =
            Session::new_authenticated("alice", Some("basic"), Duration::from_secs(100));
        session.add_permission(client_id, true);
        session
    }

    fn plain_session() -> Session {
        Session::new_authenticated("alice", Some("basic"), Duration::from_secs(100))
    }

    fn scopes(s: &str) -> BTreeSet<String> {
        s.split(' ').map(str::to_string).collect()
    }

    #[test]
    fn test_trusted_client_bypasses_consent() {
        let mut client = test_client("c1");
        client.trusted = true;
        let sessions = InMemorySessionStore::default();
        let authz = InMemoryClientAuthorisationStore::default();
        let mut session = plain_session();
        sessions.create_session(&session).expect("seed");
        let mut request = test_request("c1", "openid profile email");

        let outcome = resolve_consent(
            &client,
            None,
            &authz,
            &sessions,
            &mut request,
            &mut session,
            "alice",
            &scopes("openid profile email"),
        )
        .expect("Consent resolution failed");

        assert_eq!(outcome, ConsentOutcome::Granted);
        assert!(session.is_permission_granted("c1"));
    }

    #[test]
    fn test_pairwise_openid_only_bypasses_consent() {
        let client = test_client("c1"); // pairwise, not trusted
        let sessions = InMemorySessionStore::default();
        let authz = InMemoryClientAuthorisationStore::default();
        let mut session = plain_session();
        sessions.create_session(&session).expect("seed");
        let mut request = test_request("c1", "openid");

        let outcome = resolve_consent(
            &client,
            None,
            &authz,
            &sessions,
            &mut request,
            &mut session,
            "alice",
            &scopes("openid"),
        )
        .expect("Consent resolution failed");
        assert_eq!(outcome, ConsentOutcome::Granted);
    }

    #[test]
    fn test_pairwise_with_extra_scope_collects_consent() {
        let client = test_client("c1");
        let sessions = InMemorySessionStore::default();
        let authz = InMemoryClientAuthorisationStore::default();
        let mut session = plain_session();
        sessions.create_session(&session).expect("seed");
        let mut request = test_request("c1", "openid email");

        let outcome = resolve_consent(
            &client,
            None,
            &authz,
            &sessions,
            &mut request,
            &mut session,
            "alice",
            &scopes("openid email"),
        )
        .expect("Consent resolution failed");
        assert_eq!(outcome, ConsentOutcome::CollectConsent);
    }

    #[test]
    fn test_stored_authorisation_covers_request() {
        let client = test_client("c1");
        let sessions = InMemorySessionStore::default();
        let authz = InMemoryClientAuthorisationStore::default();
        authz
            .save_authorisation(&ClientAuthorisation {
                user_id: "alice".to_string(),
                client_id: "c1".to_string(),
                scopes: scopes("openid email profile"),
            })
            .expect("seed");
        let mut session = plain_session();
        sessions.create_session(&session).expect("seed");
        let mut request = test_request("c1", "openid email");

        let outcome = resolve_consent(
            &client,
            None,
            &authz,
            &sessions,
            &mut request,
            &mut session,
            "alice",
            &scopes("openid email"),
        )
        .expect("Consent resolution failed");
        assert_eq!(outcome, ConsentOutcome::Granted);

        // A wider request than the stored grant goes back to consent.
        let mut session = plain_session();
        let mut request = test_request("c1", "openid email phone");
        let outcome = resolve_consent(
            &client,
            None,
            &authz,
            &sessions,
            &mut request,
            &mut session,
            "alice",
            &scopes("openid email phone"),
        )
        .expect("Consent resolution failed");
        assert_eq!(outcome, ConsentOutcome::CollectConsent);
    }

    #[test]
    fn test_prompt_consent_clears_stored_authorisation() {
        let client = test_client("c1");
        let sessions = InMemorySessionStore::default();
        let authz = InMemoryClientAuthorisationStore::default();
        authz
            .save_authorisation(&ClientAuthorisation {
                user_id: "alice".to_string(),
                client_id: "c1".to_string(),
                scopes: scopes("openid email"),
            })
            .expect("seed");
        let mut session = granted_session("c1");
        sessions.create_session(&session).expect("seed");
        let mut request = test_request("c1", "openid email");
        request.prompt = vec![Prompt::Consent];

        let outcome = resolve_consent(
            &client,
            None,
            &authz,
            &sessions,
            &mut request,
            &mut session,
            "alice",
            &scopes("openid email"),
        )
        .expect("Consent resolution failed");

        assert_eq!(outcome, ConsentOutcome::CollectConsent);
        // The loop guard: consent is gone from the carried prompts.
        assert!(!request.prompt.contains(&Prompt::Consent));
        // And the stored authorisation is gone.
        assert_eq!(
            authz
                .find_authorisation("alice", "c1")
                .expect("Store failure"),
            None
        );
    }

    struct TwoStepGathering;

    impl ConsentGatheringPolicy for TwoStepGathering {
        fn steps(&self, _client: &Client) -> u32 {
            2
        }

        fn page_for_step(&self, _client: &Client, step: u32) -> Option<Url> {
            Url::parse(&format!("https://idp.example.com/cg/step{step}")).ok()
        }

        fn authorize(&self, _client: &Client, _session: &Session, step: u32) -> ConsentVerdict {
            ConsentVerdict {
                allow: step > 2,
                next_step: Some(step + 1),
            }
        }
    }

    #[test]
    fn test_consent_gathering_policy_steps() {
        let client = test_client("c1");
        let policy = TwoStepGathering;
        let sessions = InMemorySessionStore::default();
        let authz = InMemoryClientAuthorisationStore::default();
        let mut session = plain_session();
        sessions.create_session(&session).expect("seed");
        let mut request = test_request("c1", "openid email");

        // First pass: step 1 refused, routed to step 2's page.
        let outcome = resolve_consent(
            &client,
            Some(&policy),
            &authz,
            &sessions,
            &mut request,
            &mut session,
            "alice",
            &scopes("openid email"),
        )
        .expect("Consent resolution failed");
        let ConsentOutcome::GatheringStep(page) = outcome else {
            panic!("expected a gathering step");
        };
        assert_eq!(page.as_str(), "https://idp.example.com/cg/step2");
        assert_eq!(
            session.flow,
            SessionFlow::ConsentGathering {
                client_id: "c1".to_string(),
                step: 2
            }
        );

        // Second pass: step 2 refused, routed to step 3.
        let outcome = resolve_consent(
            &client,
            Some(&policy),
            &authz,
            &sessions,
            &mut request,
            &mut session,
            "alice",
            &scopes("openid email"),
        )
        .expect("Consent resolution failed");
        assert!(matches!(outcome, ConsentOutcome::GatheringStep(_)));

        // Third pass: the oracle approves, permission lands on the session.
        let outcome = resolve_consent(
            &client,
            Some(&policy),
            &authz,
            &sessions,
            &mut request,
            &mut session,
            "alice",
            &scopes("openid email"),
        )
        .expect("Consent resolution failed");
        assert_eq!(outcome, ConsentOutcome::Granted);
        assert_eq!(session.flow, SessionFlow::Idle);
        assert!(session.is_permission_granted("c1"));
    }
}

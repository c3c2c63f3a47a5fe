//! Session continuity and authentication context resolution: find or
//! create the browser session, detect ACR downgrades against it, and decide
//! whether the user has to authenticate again.

use ianus_proto::oauth2::Prompt;

use crate::authz::request::AuthzRequest;
use crate::authz::response::{Interrupt, RedirectUriResponse};
use crate::authz::validator::server_error_status;
use crate::authz::Oauth2Error;
use crate::external::AuthenticationFilter;
use crate::prelude::*;
use crate::store::{Session, SessionFlow, SessionStore};

/// Hint carried on a `session_selection_required` redirect, telling the
/// client how to recover.
const SESSION_SELECTION_HINT: &str = "Use prompt=login in order to alter existing session.";

/// Load the session this user agent belongs to. The cookie wins over the
/// `session_id` request parameter.
pub(crate) fn load_session(
    sessions: &dyn SessionStore,
    cookie: Option<Uuid>,
    param: Option<&str>,
) -> Result<Option<Session>, Interrupt> {
    let id = cookie.or_else(|| param.and_then(|p| Uuid::parse_str(p).ok()));
    let Some(id) = id else {
        return Ok(None);
    };
    sessions.find_session(id).map_err(server_error_status)
}

/// An authenticated session exists and the request asks for a different
/// authentication context. Either force the user back through login, or
/// refuse with `session_selection_required` when the deployment does not
/// permit the silent downgrade of an established session.
pub(crate) fn check_acr_change(
    config: &AuthzConfig,
    sessions: &dyn SessionStore,
    request: &mut AuthzRequest,
    session: &mut Session,
    redirect: &RedirectUriResponse,
) -> Result<(), Interrupt> {
    if !session.is_authenticated() || request.acr_values.is_empty() {
        return Ok(());
    }

    let matches = session
        .acr
        .as_ref()
        .is_some_and(|acr| request.acr_values.contains(acr));
    if matches {
        return Ok(());
    }

    if !config.acr_change_forces_reauthentication {
        error!("ACR is changed, please provide a supported and enabled acr value");
        let mut response = redirect.clone();
        response.clear_params();
        response.add_param("error", &Oauth2Error::SessionSelectionRequired.to_string());
        response.add_param("hint", SESSION_SELECTION_HINT);
        return Err(response.finish().into());
    }

    if !request.prompt.contains(&Prompt::Login) {
        info!("ACR is changed, adding prompt=login to prompts");
        request.prompt.push(Prompt::Login);

        session.invalidate();
        session.flow = SessionFlow::ForcedReauthentication {
            prompt: request.prompt.clone(),
        };

        // The store may not have seen this session yet. Persist-as-new
        // first, and fall back to update-in-place; the pair is not atomic
        // and the lost-update window is a documented limitation.
        if let Err(err) = sessions.create_session(session) {
            trace!(?err, "Unable to persist session, trying to update it");
            sessions
                .update_session(session)
                .map_err(server_error_status)?;
        }
    }

    Ok(())
}

/// Run the non-interactive authentication filter chain for a `prompt=none`
/// request with no authenticated user. Success yields a freshly
/// authenticated, persisted session.
pub(crate) fn authenticate_via_filters(
    filter: Option<&dyn AuthenticationFilter>,
    sessions: &dyn SessionStore,
    request: &AuthzRequest,
    ct: Duration,
) -> Result<Option<Session>, Interrupt> {
    let Some(filter) = filter else {
        return Ok(None);
    };

    let Some(user_id) = filter.process_filters(request) else {
        debug!("Authentication filter chain did not produce a user");
        return Ok(None);
    };

    let session = Session::new_authenticated(&user_id, None, ct);
    sessions
        .create_session(&session)
        .map_err(server_error_status)?;
    debug!(%user_id, session_id = %session.id, "Authenticated through the filter chain");
    Ok(Some(session))
}

/// Return the session to the unauthenticated state and write it back. A
/// failed write is logged, not fatal - the in-memory state is already
/// unauthenticated and the redirect to login proceeds regardless.
pub(crate) fn unauthenticate_session(sessions: &dyn SessionStore, session: &mut Session) {
    session.invalidate();
    if let Err(err) = sessions.update_session(session) {
        error!(?err, session_id = %session.id, "Failed to update session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::request::AuthzRequest;
    use crate::store::SessionState;
    use crate::testkit::{test_request, InMemorySessionStore};
    use ianus_proto::oauth2::ResponseMode;

    fn redirect() -> RedirectUriResponse {
        #[allow(clippy::unwrap_used)]
        RedirectUriResponse::new(
            Url::parse("https://demo.example.com/cb").unwrap(),
            ResponseMode::Query,
            Some("st".to_string()),
        )
    }

    fn mfa_request() -> AuthzRequest {
        let mut request = test_request("c1", "openid");
        request.acr_values = vec!["mfa".to_string()];
        request
    }

    #[test]
    fn test_acr_change_forces_reauthentication() {
        #[allow(clippy::unwrap_used)]
        let config = AuthzConfig::new(Url::parse("https://idp.example.com").unwrap());
        let sessions = InMemorySessionStore::default();
        let mut session =
            Session::new_authenticated("alice", Some("basic"), Duration::from_secs(100));
        sessions
            .create_session(&session)
            .expect("Failed to seed session");
        let mut request = mfa_request();

        check_acr_change(&config, &sessions, &mut request, &mut session, &redirect())
            .expect("ACR change must force re-authentication, not fail");

        assert_eq!(session.state, SessionState::Unauthenticated);
        assert!(request.prompt.contains(&Prompt::Login));

        // The transition is persisted.
        let stored = sessions
            .find_session(session.id)
            .expect("Store failure")
            .expect("Session must exist");
        assert_eq!(stored.state, SessionState::Unauthenticated);
        assert!(matches!(
            stored.flow,
            SessionFlow::ForcedReauthentication { .. }
        ));
    }

    #[test]
    fn test_acr_change_without_forced_reauth_is_session_selection_required() {
        #[allow(clippy::unwrap_used)]
        let mut config = AuthzConfig::new(Url::parse("https://idp.example.com").unwrap());
        config.acr_change_forces_reauthentication = false;

        let sessions = InMemorySessionStore::default();
        let mut session =
            Session::new_authenticated("alice", Some("basic"), Duration::from_secs(100));
        let mut request = mfa_request();

        let err = check_acr_change(&config, &sessions, &mut request, &mut session, &redirect())
            .expect_err("Must be refused");
        let crate::authz::response::AuthoriseResponse::Redirect { location, .. } = err.0 else {
            panic!("expected redirect");
        };
        let query = location.query().unwrap_or("");
        assert!(query.contains("error=session_selection_required"));
        assert!(query.contains("hint="));
        assert!(query.contains("state=st"));
    }

    #[test]
    fn test_matching_acr_is_untouched() {
        #[allow(clippy::unwrap_used)]
        let config = AuthzConfig::new(Url::parse("https://idp.example.com").unwrap());
        let sessions = InMemorySessionStore::default();
        let mut session =
            Session::new_authenticated("alice", Some("mfa"), Duration::from_secs(100));
        let mut request = mfa_request();

        check_acr_change(&config, &sessions, &mut request, &mut session, &redirect())
            .expect("No change expected");
        assert_eq!(session.state, SessionState::Authenticated);
        assert!(!request.prompt.contains(&Prompt::Login));
    }

    #[test]
    fn test_load_session_prefers_cookie() {
        let sessions = InMemorySessionStore::default();
        let by_cookie = Session::new_unauthenticated();
        let by_param = Session::new_unauthenticated();
        sessions.create_session(&by_cookie).expect("seed");
        sessions.create_session(&by_param).expect("seed");

        let loaded = load_session(
            &sessions,
            Some(by_cookie.id),
            Some(&by_param.id.to_string()),
        )
        .expect("Store failure")
        .expect("Session must exist");
        assert_eq!(loaded.id, by_cookie.id);

        let loaded = load_session(&sessions, None, Some(&by_param.id.to_string()))
            .expect("Store failure")
            .expect("Session must exist");
        assert_eq!(loaded.id, by_param.id);
    }
}

//! The device authorisation flow, RFC 8628: issuing device/user code pairs,
//! attaching an entered user code to a browser session, and completing the
//! pending authorisation once its user finishes the interactive flow.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hashbrown::HashMap;
use ianus_proto::oauth2::{
    DeviceAuthorizationRequest, DeviceAuthorizationResponse, GrantType,
};
use rand::Rng;
use std::sync::Mutex;

use crate::audit::{AuditAction, AuditEvent, AuditGuard};
use crate::authz::{AuthzServer, Oauth2Error};
use crate::prelude::*;
use crate::store::{DeviceAuthorizationRecord, SessionFlow};

/// Brute force limiter for user code entry. Counters are keyed by session
/// id under one lock, so concurrent submissions from the same session are
/// counted exactly; the observable limit is attempts-per-window.
#[derive(Default)]
pub(crate) struct UserCodeThrottle {
    attempts: Mutex<HashMap<Uuid, AttemptWindow>>,
}

struct AttemptWindow {
    count: u32,
    window_start: u64,
}

impl UserCodeThrottle {
    pub(crate) fn check(
        &self,
        session_id: Uuid,
        limit: u32,
        window: u64,
        ct: Duration,
    ) -> Result<(), Oauth2Error> {
        let now = ct.as_secs();
        let mut attempts = match self.attempts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let entry = attempts.entry(session_id).or_insert(AttemptWindow {
            count: 0,
            window_start: now,
        });
        if now.saturating_sub(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        if entry.count > limit {
            warn!(%session_id, "User code verification rate limit hit");
            return Err(Oauth2Error::SlowDown);
        }
        Ok(())
    }
}

fn gen_user_code() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{:03}-{:03}-{:03}",
        rng.gen_range(0..1000),
        rng.gen_range(0..1000),
        rng.gen_range(0..1000)
    )
}

fn gen_device_code() -> [u8; 16] {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill(&mut buf);
    buf
}

impl AuthzServer {
    /// Handle a `POST /device_authorization` request.
    #[instrument(level = "debug", skip_all, fields(client_id = %request.client_id))]
    pub fn start_device_flow(
        &self,
        request: &DeviceAuthorizationRequest,
        remote_addr: Option<&str>,
        ct: Duration,
    ) -> Result<DeviceAuthorizationResponse, Oauth2Error> {
        let mut event = AuditEvent::new(AuditAction::DeviceAuthorisation);
        event.client_id = Some(request.client_id.clone());
        event.scope = request
            .scope
            .as_ref()
            .map(|s| s.iter().cloned().collect::<Vec<_>>().join(" "));
        event.remote_addr = remote_addr.map(str::to_string);
        let mut audit = AuditGuard::new(self.audit.as_ref(), event);

        let client = self
            .clients
            .find_client(&request.client_id)
            .map_err(Oauth2Error::ServerError)?
            .filter(|client| client.enabled)
            .ok_or_else(|| {
                warn!("Invalid device authorisation client_id");
                Oauth2Error::UnauthorizedClient
            })?;

        if !client.grant_types.contains(&GrantType::DeviceCode) {
            warn!("Client does not have the device code grant type enabled");
            return Err(Oauth2Error::UnauthorizedClient);
        }

        let scopes = match &request.scope {
            Some(requested) => {
                let granted = self.scope_policy.check_scopes_policy(&client, requested);
                if granted.is_empty() {
                    warn!("No requested scope survived the scope policy");
                    return Err(Oauth2Error::InvalidScope);
                }
                granted
            }
            None => BTreeSet::new(),
        };

        let user_code = gen_user_code();
        let device_code = STANDARD.encode(gen_device_code());

        let record = DeviceAuthorizationRecord {
            device_code: device_code.clone(),
            user_code: user_code.clone(),
            client_id: client.client_id.clone(),
            scopes,
            issued_at: ct.as_secs(),
            expires_at: ct.as_secs() + self.config.device_code_lifetime,
        };
        self.backchannel
            .insert_device(record)
            .map_err(Oauth2Error::ServerError)?;

        let verification_uri = self.config.device_verification_page();
        let mut verification_uri_complete = verification_uri.clone();
        verification_uri_complete
            .query_pairs_mut()
            .append_pair("user_code", &user_code);

        audit.set_success();

        Ok(DeviceAuthorizationResponse {
            device_code,
            user_code,
            verification_uri,
            verification_uri_complete,
            expires_in: self.config.device_code_lifetime,
            interval: self.config.device_poll_interval,
        })
    }

    /// A user agent on the device verification page submitted a user code.
    /// On success the code is stashed on the session, so the following
    /// authorisation request is treated as device-flow-initiated.
    pub fn verify_device_user_code(
        &self,
        session_id: Uuid,
        user_code: &str,
        ct: Duration,
    ) -> Result<(), Oauth2Error> {
        self.device_throttle.check(
            session_id,
            self.config.user_code_attempt_limit,
            self.config.user_code_attempt_window,
            ct,
        )?;

        let record = self
            .backchannel
            .find_device_by_user_code(user_code)
            .map_err(Oauth2Error::ServerError)?
            .ok_or_else(|| {
                warn!(%user_code, "Unknown device user code");
                Oauth2Error::AccessDenied
            })?;
        if record.is_expired(ct) {
            warn!(%user_code, "Expired device user code");
            return Err(Oauth2Error::ExpiredToken);
        }

        let mut session = self
            .sessions
            .find_session(session_id)
            .map_err(Oauth2Error::ServerError)?
            .ok_or(Oauth2Error::InvalidRequest)?;
        session.flow = SessionFlow::DeviceVerification {
            user_code: user_code.to_string(),
        };
        self.sessions
            .update_session(&session)
            .map_err(Oauth2Error::ServerError)?;
        Ok(())
    }

    /// Consume the pending device authorisation once the interactive flow
    /// finished. Consuming is exactly-once: a second completion for an
    /// already taken user code is a no-op, not an error.
    pub(crate) fn complete_device_authorisation(
        &self,
        user_code: &str,
        user_id: &str,
        auth_time: Option<u64>,
        ct: Duration,
    ) {
        let record = match self.backchannel.take_device_by_user_code(user_code) {
            Ok(Some(record)) => record,
            Ok(None) => {
                trace!(%user_code, "No pending device authorisation, already consumed or unknown");
                return;
            }
            Err(err) => {
                error!(?err, "Failed to look up pending device authorisation");
                return;
            }
        };

        if record.is_expired(ct) {
            trace!(%user_code, "User responded too late and the device authorisation has expired");
            return;
        }

        let client = match self.clients.find_client(&record.client_id) {
            Ok(Some(client)) => client,
            Ok(None) => {
                warn!(client_id = %record.client_id, "Device authorisation client vanished");
                return;
            }
            Err(err) => {
                error!(?err, "Failed to load device authorisation client");
                return;
            }
        };

        match self
            .grants
            .create_device_grant(&record, &client, user_id, auth_time)
        {
            Ok(grant) => {
                info!(
                    %user_code,
                    device_code = %record.device_code,
                    grant_id = %grant.grant_id,
                    "Granted device authorization request"
                );
            }
            Err(err) => {
                error!(?err, "Failed to create device grant");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_code_shape() {
        let code = gen_user_code();
        let parts: Vec<&str> = code.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts
            .iter()
            .all(|p| p.len() == 3 && p.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn test_throttle_limits_within_window() {
        let throttle = UserCodeThrottle::default();
        let session = Uuid::new_v4();
        let ct = Duration::from_secs(1000);

        for _ in 0..5 {
            assert!(throttle.check(session, 5, 60, ct).is_ok());
        }
        assert_eq!(
            throttle.check(session, 5, 60, ct),
            Err(Oauth2Error::SlowDown)
        );

        // Another session is unaffected.
        assert!(throttle.check(Uuid::new_v4(), 5, 60, ct).is_ok());

        // A new window resets the counter.
        assert!(throttle
            .check(session, 5, 60, Duration::from_secs(1060))
            .is_ok());
    }
}

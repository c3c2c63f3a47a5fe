//! Completion of client-initiated backchannel authentication requests. An
//! interactive authorisation that carries an `auth_req_id` finishes the
//! out-of-band request: tokens are minted on a backchannel grant and the
//! client is notified per its registered delivery mode.

use ianus_proto::oauth2::BackchannelTokenDeliveryMode;

use crate::authz::grant::mint_id_token;
use crate::authz::AuthzServer;
use crate::prelude::*;
use crate::store::{gen_opaque_handle, IssuedToken, IssuedTokenKind};

impl AuthzServer {
    /// Run once after the main redirect has been computed. Failures are
    /// logged, never surfaced: the interactive user already has their
    /// response, and the pending request was consumed exactly once.
    #[instrument(level = "debug", skip_all, fields(%auth_req_id))]
    pub(crate) fn run_ciba_completion(&self, auth_req_id: &str, ct: Duration) {
        let record = match self.backchannel.take_ciba_by_auth_req_id(auth_req_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                trace!("No pending backchannel request, already consumed or unknown");
                return;
            }
            Err(err) => {
                error!(?err, "Failed to look up pending backchannel request");
                return;
            }
        };

        if record.is_expired(ct) {
            trace!("User responded too late and the backchannel request has expired");
            return;
        }

        let client = match self.clients.find_client(&record.client_id) {
            Ok(Some(client)) => client,
            Ok(None) => {
                warn!(client_id = %record.client_id, "Backchannel request client vanished");
                return;
            }
            Err(err) => {
                error!(?err, "Failed to load backchannel request client");
                return;
            }
        };

        let mut grant = match self.grants.create_ciba_grant(&record, &client) {
            Ok(grant) => grant,
            Err(err) => {
                error!(?err, "Failed to create backchannel grant");
                return;
            }
        };

        let access_token = gen_opaque_handle();
        grant.push_token(IssuedToken {
            kind: IssuedTokenKind::Access,
            value: access_token.clone(),
            expires_in: Some(self.config.access_token_lifetime),
        });
        debug!("Issuing backchannel access token");

        let refresh_token = if self.config.refresh_token_lifetime > 0 {
            let token = gen_opaque_handle();
            grant.push_token(IssuedToken {
                kind: IssuedTokenKind::Refresh,
                value: token.clone(),
                expires_in: Some(self.config.refresh_token_lifetime),
            });
            Some(token)
        } else {
            None
        };

        let id_token = match mint_id_token(
            &self.config,
            self.crypto.as_ref(),
            self.token_update.as_deref(),
            &client,
            &grant,
            None,
            None,
            None,
            ct,
        ) {
            Ok(id_token) => id_token,
            Err(err) => {
                error!(?err, "Failed to mint backchannel id_token");
                return;
            }
        };
        grant.push_token(IssuedToken {
            kind: IssuedTokenKind::IdToken,
            value: id_token.clone(),
            expires_in: Some(self.config.id_token_lifetime),
        });

        let delivery_mode = client
            .backchannel_delivery_mode
            .unwrap_or(BackchannelTokenDeliveryMode::Poll);

        match (delivery_mode, &client.backchannel_notification_endpoint) {
            (BackchannelTokenDeliveryMode::Push, Some(endpoint)) => {
                grant.tokens_delivered = true;
                if let Err(err) = self.grants.save_grant(&grant) {
                    error!(?err, "Failed to save backchannel grant");
                    return;
                }
                self.notifier.push_token_delivery(
                    auth_req_id,
                    endpoint,
                    record.client_notification_token.as_deref().unwrap_or(""),
                    &access_token,
                    refresh_token.as_deref(),
                    &id_token,
                    self.config.access_token_lifetime,
                );
            }
            (BackchannelTokenDeliveryMode::Ping, Some(endpoint)) => {
                grant.tokens_delivered = false;
                if let Err(err) = self.grants.save_grant(&grant) {
                    error!(?err, "Failed to save backchannel grant");
                    return;
                }
                self.notifier.ping_callback(
                    auth_req_id,
                    endpoint,
                    record.client_notification_token.as_deref().unwrap_or(""),
                );
            }
            (BackchannelTokenDeliveryMode::Poll, _) => {
                grant.tokens_delivered = false;
                if let Err(err) = self.grants.save_grant(&grant) {
                    error!(?err, "Failed to save backchannel grant");
                }
            }
            (mode, None) => {
                warn!(
                    ?mode,
                    "Client has no backchannel notification endpoint, leaving tokens for poll"
                );
                grant.tokens_delivered = false;
                if let Err(err) = self.grants.save_grant(&grant) {
                    error!(?err, "Failed to save backchannel grant");
                }
            }
        }
    }
}

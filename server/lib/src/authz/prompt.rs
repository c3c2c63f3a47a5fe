//! The prompt state machine. Interprets the `prompt` parameter together
//! with the session state to decide the next interactive action. Rules are
//! evaluated strictly in order; the first match wins.

use ianus_proto::oauth2::Prompt;

/// The next step the pipeline must take for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAction {
    /// `prompt=none` combined with any other value is a contradiction.
    Contradiction,
    /// The user must pick an account before anything else happens.
    AccountSelection,
    /// No authenticated user is attached to this user agent.
    Authentication,
    /// An authenticated session exists but `prompt=login` demands a fresh
    /// one. The caller unauthenticates the session, clears the flag and
    /// redirects so this fires exactly once.
    ForcedLogin,
    /// Proceed to consent evaluation.
    EvaluateConsent,
}

pub fn evaluate(prompts: &[Prompt], session_authenticated: bool) -> PromptAction {
    if prompts.contains(&Prompt::None) && prompts.len() > 1 {
        return PromptAction::Contradiction;
    }
    if prompts.contains(&Prompt::SelectAccount) {
        return PromptAction::AccountSelection;
    }
    if !session_authenticated {
        return PromptAction::Authentication;
    }
    if prompts.contains(&Prompt::Login) {
        return PromptAction::ForcedLogin;
    }
    PromptAction::EvaluateConsent
}

/// Remove one prompt value from the carried-forward list, so the
/// interactive round trip does not re-trigger the same action.
pub fn clear(prompts: &mut Vec<Prompt>, value: Prompt) {
    prompts.retain(|p| *p != value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_with_any_other_value_is_a_contradiction() {
        for other in [Prompt::Login, Prompt::Consent, Prompt::SelectAccount] {
            assert_eq!(
                evaluate(&[Prompt::None, other], true),
                PromptAction::Contradiction
            );
            // Order must not matter, and an unauthenticated session must
            // not mask the contradiction.
            assert_eq!(
                evaluate(&[other, Prompt::None], false),
                PromptAction::Contradiction
            );
        }
    }

    #[test]
    fn test_select_account_wins_over_authentication() {
        assert_eq!(
            evaluate(&[Prompt::SelectAccount], false),
            PromptAction::AccountSelection
        );
        assert_eq!(
            evaluate(&[Prompt::SelectAccount, Prompt::Login], true),
            PromptAction::AccountSelection
        );
    }

    #[test]
    fn test_unauthenticated_goes_to_login() {
        assert_eq!(evaluate(&[], false), PromptAction::Authentication);
        assert_eq!(
            evaluate(&[Prompt::Consent], false),
            PromptAction::Authentication
        );
        // prompt=none alone is not a contradiction; the caller decides
        // between the filter chain and login_required.
        assert_eq!(
            evaluate(&[Prompt::None], false),
            PromptAction::Authentication
        );
    }

    #[test]
    fn test_login_forces_reauthentication_once() {
        assert_eq!(evaluate(&[Prompt::Login], true), PromptAction::ForcedLogin);

        let mut prompts = vec![Prompt::Login, Prompt::Consent];
        clear(&mut prompts, Prompt::Login);
        assert_eq!(prompts, vec![Prompt::Consent]);
        assert_eq!(evaluate(&prompts, true), PromptAction::EvaluateConsent);
    }

    #[test]
    fn test_default_path_is_consent_evaluation() {
        assert_eq!(evaluate(&[], true), PromptAction::EvaluateConsent);
        assert_eq!(
            evaluate(&[Prompt::Consent], true),
            PromptAction::EvaluateConsent
        );
    }
}

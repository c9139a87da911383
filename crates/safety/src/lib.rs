use uuid::Uuid;

pub const TOKEN_PREFIX: &str = "DRV-";

#[derive(Debug, Clone)]
pub struct SafetyContext {
    /// The operator explicitly asked for changes to be applied.
    pub confirmed: bool,
    pub confirmation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyDecision::Allow)
    }
}

pub fn require_confirmation_token() -> String {
    format!("{TOKEN_PREFIX}{}", Uuid::new_v4())
}

fn token_is_well_formed(token: &str) -> bool {
    token
        .strip_prefix(TOKEN_PREFIX)
        .map(|rest| Uuid::parse_str(rest).is_ok())
        .unwrap_or(false)
}

/// Gate in front of every driver-changing operation.
pub fn can_install(ctx: &SafetyContext, selected: usize) -> SafetyDecision {
    if !ctx.confirmed {
        return SafetyDecision::Deny(
            "Denied: driver installation requires explicit confirmation".to_string(),
        );
    }

    let Some(token) = &ctx.confirmation_token else {
        return SafetyDecision::Deny("Denied: confirmation token missing".to_string());
    };
    if !token_is_well_formed(token) {
        return SafetyDecision::Deny("Denied: invalid confirmation token".to_string());
    }

    if selected == 0 {
        return SafetyDecision::Deny("Denied: no updates selected".to_string());
    }

    SafetyDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(confirmed: bool, token: Option<&str>) -> SafetyContext {
        SafetyContext {
            confirmed,
            confirmation_token: token.map(str::to_string),
        }
    }

    #[test]
    fn denies_without_confirmation() {
        let token = require_confirmation_token();
        assert!(matches!(
            can_install(&ctx(false, Some(&token)), 1),
            SafetyDecision::Deny(_)
        ));
    }

    #[test]
    fn denies_without_token() {
        assert!(matches!(
            can_install(&ctx(true, None), 1),
            SafetyDecision::Deny(_)
        ));
    }

    #[test]
    fn denies_invalid_token() {
        assert!(!can_install(&ctx(true, Some("BAD")), 1).is_allowed());
        assert!(!can_install(&ctx(true, Some("DRV-123")), 1).is_allowed());
        assert!(!can_install(&ctx(true, Some("PHX-0f8fad5b-d9cb-469f-a165-70867728950e")), 1)
            .is_allowed());
    }

    #[test]
    fn denies_empty_selection() {
        let token = require_confirmation_token();
        assert_eq!(
            can_install(&ctx(true, Some(&token)), 0),
            SafetyDecision::Deny("Denied: no updates selected".to_string())
        );
    }

    #[test]
    fn allows_with_token() {
        let token = require_confirmation_token();
        assert!(token.starts_with("DRV-"));
        assert!(can_install(&ctx(true, Some(&token)), 3).is_allowed());
    }
}

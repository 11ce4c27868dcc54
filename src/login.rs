//! Login decisions of the privileged parent.

use crate::{config::Config, session::Session};
use std::time::Duration;

/// Maximum length of user names and passwords.
pub const MAX_CREDENTIAL_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginResult {
    Fail,
    Anon,
    Real,
}

/// Password check of local accounts.
pub trait Authenticator {
    fn authenticate(&self, user: &str, pass: &str) -> bool;
}

/// Rejects every local account.
#[derive(Debug, Default)]
pub struct DenyAll;

impl Authenticator for DenyAll {
    fn authenticate(&self, _user: &str, _pass: &str) -> bool {
        false
    }
}

/// Returns true if the name is acceptable as a local account name.
pub fn check_username(user: &str) -> bool {
    let mut chars = user.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == '_' || first == '.' => {}
        _ => return false,
    }
    user.len() <= MAX_CREDENTIAL_LEN && chars.all(|c| c.is_ascii_graphic())
}

fn is_anonymous_name(user: &str) -> bool {
    user.eq_ignore_ascii_case("ftp") || user.eq_ignore_ascii_case("anonymous")
}

/// Anonymous passwords are logged, so they are stripped of anything
/// that would break a log line.
fn sanitize_identity(pass: &str) -> String {
    if pass.is_empty() {
        return "?".to_string();
    }
    pass.chars()
        .map(|c| match c {
            ' ' => '_',
            '\n' => '?',
            c => c,
        })
        .collect()
}

/// Decide a login and record the identity in the session.
pub fn do_login(
    session: &mut Session,
    config: &Config,
    auth: &dyn Authenticator,
    user: &str,
    pass: &str,
) -> LoginResult {
    if !check_username(user) || pass.len() > MAX_CREDENTIAL_LEN {
        return LoginResult::Fail;
    }

    if config.anonymous_enable && is_anonymous_name(user) {
        if config.banned_emails.iter().any(|email| email == pass) {
            return LoginResult::Fail;
        }
        if !config.email_passwords.is_empty()
            && !config.email_passwords.iter().any(|email| email == pass)
        {
            return LoginResult::Fail;
        }
        session.is_anonymous = true;
        session.user = Some(config.ftp_username.clone());
        session.anon_identity = Some(sanitize_identity(pass));
        return LoginResult::Anon;
    }

    if !config.local_enable || !auth.authenticate(user, pass) {
        return LoginResult::Fail;
    }
    session.is_anonymous = false;
    session.is_guest = config.guest_enable;
    session.user = Some(user.to_string());

    LoginResult::Real
}

/// Pause after a login attempt.
pub fn delay(config: &Config, result: LoginResult) -> Duration {
    let secs = match result {
        LoginResult::Fail => config.delay_failed_login,
        LoginResult::Anon | LoginResult::Real => config.delay_successful_login,
    };
    Duration::from_secs(secs)
}

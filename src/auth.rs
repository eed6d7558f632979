use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::model::{AdminId, VisitorId};

/// Shared-secret password check. Real credentials belong to the external
/// auth layer; this only gates the socket.
#[derive(Debug)]
pub struct RoomdAuthSource {
    password: String,
}

impl RoomdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RoomdAuthSource {
    /// Malformed user names are refused before the password exchange.
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if let Err(e) = parse_principal(user) {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("login refused: {e}");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                e.to_string(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Identity named by the startup `user` parameter, before it is checked
/// against the engine's visitor and admin rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalClaim {
    Anonymous,
    Visitor(VisitorId),
    /// `admin:<id>` and `super_admin:<id>` both land here. The role comes
    /// from the stored admin row, not from the prefix.
    Admin(AdminId),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unrecognised user {0:?}: expected visitor:<id>, admin:<id>, super_admin:<id> or anonymous")]
pub struct BadUser(pub String);

pub fn parse_principal(user: &str) -> Result<PrincipalClaim, BadUser> {
    let user = user.trim();
    if user.is_empty() || user.eq_ignore_ascii_case("anonymous") {
        return Ok(PrincipalClaim::Anonymous);
    }
    let bad = || BadUser(user.to_string());
    let (kind, id) = user.split_once(':').ok_or_else(bad)?;
    let id: u64 = id.trim().parse().map_err(|_| bad())?;
    match kind.to_ascii_lowercase().as_str() {
        "visitor" => Ok(PrincipalClaim::Visitor(id)),
        "admin" | "super_admin" => Ok(PrincipalClaim::Admin(id)),
        _ => Err(bad()),
    }
}

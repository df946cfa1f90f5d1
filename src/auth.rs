use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::error::BookingError;
use crate::model::Principal;
use crate::service::DataService;

/// Cleartext password source: every login shares the studio password.
#[derive(Debug)]
pub struct SlotbookAuthSource {
    password: String,
}

impl SlotbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Map a login user name to a principal.
///
/// The configured admin user is the built-in administrator. Anyone else logs
/// in with the email of a verified profile.
pub async fn resolve_principal<S: DataService + ?Sized>(
    service: &S,
    user: &str,
    admin_user: &str,
) -> Result<Principal, BookingError> {
    if user == admin_user {
        return Ok(Principal::bootstrap_admin());
    }
    let profile = service
        .find_profile_by_email(user)
        .await?
        .ok_or_else(|| BookingError::ProfileNotFound(user.to_string()))?;
    if !profile.is_verified() {
        return Err(BookingError::Unauthorized("email address not verified"));
    }
    Ok(Principal::new(profile.id, profile.role))
}

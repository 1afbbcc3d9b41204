use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Which side of the business a connection speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The public booking front end, acting for requesters.
    App,
    /// Back-office staff: vans, prices, request decisions.
    Staff,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub app_password: String,
    pub staff_user: String,
    pub staff_password: String,
}

impl Credentials {
    pub fn role_of(&self, user: Option<&str>) -> Role {
        match user {
            Some(u) if u == self.staff_user => Role::Staff,
            _ => Role::App,
        }
    }
}

/// Cleartext password lookup keyed by login user: the staff user gets the
/// staff password, every other user the shared app password.
#[derive(Debug)]
pub struct VanbookAuthSource {
    credentials: Credentials,
}

impl VanbookAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for VanbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let password = match self.credentials.role_of(login.user()) {
            Role::Staff => &self.credentials.staff_password,
            Role::App => &self.credentials.app_password,
        };
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}

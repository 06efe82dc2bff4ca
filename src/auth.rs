use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use ulid::Ulid;

use crate::engine::EngineError;

#[derive(Debug)]
pub struct TourdeskAuthSource {
    password: String,
}

impl TourdeskAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for TourdeskAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Who is issuing a command, derived from the pgwire login user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Admin(Ulid),
    Guide(Ulid),
    /// `None` for anonymous visitors.
    Tourist(Option<Ulid>),
}

impl Actor {
    /// `admin_<ulid>`, `guide_<ulid>` and `tourist_<ulid>` map to their role;
    /// anything else is an anonymous tourist.
    pub fn from_login(user: &str) -> Self {
        let Some((role, id)) = user.split_once('_') else {
            return Actor::Tourist(None);
        };
        let Ok(id) = Ulid::from_string(id) else {
            return Actor::Tourist(None);
        };
        match role {
            "admin" => Actor::Admin(id),
            "guide" => Actor::Guide(id),
            "tourist" => Actor::Tourist(Some(id)),
            _ => Actor::Tourist(None),
        }
    }

    pub fn id(&self) -> Option<Ulid> {
        match self {
            Actor::Admin(id) | Actor::Guide(id) => Some(*id),
            Actor::Tourist(id) => *id,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin(_))
    }

    pub fn require_admin(&self) -> Result<Ulid, EngineError> {
        match self {
            Actor::Admin(id) => Ok(*id),
            _ => Err(EngineError::Forbidden("admin role required")),
        }
    }

    pub fn require_guide(&self) -> Result<Ulid, EngineError> {
        match self {
            Actor::Guide(id) => Ok(*id),
            _ => Err(EngineError::Forbidden("guide role required")),
        }
    }

    /// Customer id recorded on bookings this actor creates.
    pub fn customer_id(&self) -> Option<Ulid> {
        match self {
            Actor::Tourist(id) => *id,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_roles() {
        let id = Ulid::new();
        assert_eq!(Actor::from_login(&format!("admin_{id}")), Actor::Admin(id));
        assert_eq!(Actor::from_login(&format!("guide_{id}")), Actor::Guide(id));
        assert_eq!(Actor::from_login(&format!("tourist_{id}")), Actor::Tourist(Some(id)));
    }

    #[test]
    fn unknown_logins_are_anonymous() {
        assert_eq!(Actor::from_login("postgres"), Actor::Tourist(None));
        assert_eq!(Actor::from_login("admin_not-a-ulid"), Actor::Tourist(None));
        assert_eq!(Actor::from_login(&format!("root_{}", Ulid::new())), Actor::Tourist(None));
    }

    #[test]
    fn role_requirements() {
        let guide = Actor::Guide(Ulid::new());
        assert!(guide.require_guide().is_ok());
        assert!(matches!(guide.require_admin(), Err(EngineError::Forbidden(_))));
        assert_eq!(guide.customer_id(), None);
    }
}

use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Member,
}

/// Already-authenticated caller identity. Passed explicitly into every
/// engine and saga operation; the core never looks up identity on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub tenant: String,
    pub requester: String,
    pub roles: Vec<Role>,
}

impl AuthContext {
    pub fn new(tenant: impl Into<String>, requester: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            tenant: tenant.into(),
            requester: requester.into(),
            roles,
        }
    }

    pub fn member(tenant: impl Into<String>, requester: impl Into<String>) -> Self {
        Self::new(tenant, requester, vec![Role::Member])
    }

    pub fn admin(tenant: impl Into<String>, requester: impl Into<String>) -> Self {
        Self::new(tenant, requester, vec![Role::Admin])
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }
}

/// Maps login users to roles. Users listed in `RESERVOIR_ADMIN_USERS` are
/// administrators, everyone else is a member.
#[derive(Debug, Clone, Default)]
pub struct RoleMap {
    admins: HashSet<String>,
}

impl RoleMap {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn roles_for(&self, user: &str) -> Vec<Role> {
        if self.admins.contains(user) {
            vec![Role::Admin]
        } else {
            vec![Role::Member]
        }
    }

    pub fn context(&self, tenant: &str, user: &str) -> AuthContext {
        AuthContext::new(tenant, user, self.roles_for(user))
    }
}

/// Shared-secret password check for the pgwire startup handshake.
#[derive(Debug)]
pub struct ReservoirAuthSource {
    password: String,
}

impl ReservoirAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ReservoirAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_users_get_admin_role() {
        let roles = RoleMap::new(["registrar", "facilities"]);
        let ctx = roles.context("campus", "registrar");
        assert!(ctx.is_admin());
        assert_eq!(ctx.tenant, "campus");
        assert_eq!(ctx.requester, "registrar");
    }

    #[test]
    fn unknown_users_are_members() {
        let roles = RoleMap::new(["registrar"]);
        let ctx = roles.context("campus", "student42");
        assert!(!ctx.is_admin());
        assert_eq!(ctx.roles, vec![Role::Member]);
    }
}

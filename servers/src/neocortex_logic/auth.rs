//! Caller identity, as forwarded by the gateway in `x-user-*` headers.

use axum::{extract::FromRequestParts, http::HeaderMap, http::request::Parts};
use neocortex::Actor;

use super::error::{AppError, MSG_ADMIN_ONLY, MSG_SUPER_ADMIN_ONLY};

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_EMAIL: &str = "x-user-email";
pub const HEADER_USER_ROLE: &str = "x-user-role";

pub const ROLE_SUPER_ADMIN: &str = "admin_sgg";
pub const ROLE_DIRECTOR: &str = "directeur_sgg";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub Actor);

impl CurrentUser {
    pub fn user_id(&self) -> &str {
        &self.0.user_id
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.0.role.as_str(), ROLE_SUPER_ADMIN | ROLE_DIRECTOR)
    }

    pub fn is_super_admin(&self) -> bool {
        self.0.role == ROLE_SUPER_ADMIN
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Identity carried by the headers; `None` without a user id.
pub fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let user_id = header(headers, HEADER_USER_ID)?;
    Some(Actor {
        user_id,
        email: header(headers, HEADER_USER_EMAIL).unwrap_or_default(),
        role: header(headers, HEADER_USER_ROLE).unwrap_or_default(),
    })
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers)
            .map(CurrentUser)
            .ok_or(AppError::Unauthorized)
    }
}

/// `admin_sgg` or `directeur_sgg`.
#[derive(Debug, Clone)]
pub struct AdminUser(pub CurrentUser);

impl<S: Send + Sync> FromRequestParts<S> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(AppError::Forbidden(MSG_ADMIN_ONLY));
        }
        Ok(AdminUser(user))
    }
}

/// `admin_sgg` only.
#[derive(Debug, Clone)]
pub struct SuperAdmin(pub CurrentUser);

impl<S: Send + Sync> FromRequestParts<S> for SuperAdmin {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_super_admin() {
            return Err(AppError::Forbidden(MSG_SUPER_ADMIN_ONLY));
        }
        Ok(SuperAdmin(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn identity_requires_user_id() {
        assert!(actor_from_headers(&headers(&[(HEADER_USER_ROLE, "admin_sgg")])).is_none());
        assert!(actor_from_headers(&headers(&[(HEADER_USER_ID, "  ")])).is_none());

        let actor = actor_from_headers(&headers(&[(HEADER_USER_ID, "u1")])).unwrap();
        assert_eq!(actor.email, "");
        assert_eq!(actor.role, "");
    }

    #[test]
    fn roles() {
        let user = |role: &str| {
            CurrentUser(Actor {
                user_id: "u".into(),
                email: "u@sgg.ga".into(),
                role: role.into(),
            })
        };
        assert!(user("admin_sgg").is_super_admin());
        assert!(user("directeur_sgg").is_admin());
        assert!(!user("directeur_sgg").is_super_admin());
        assert!(!user("agent").is_admin());
    }
}

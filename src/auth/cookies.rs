//! `access_token` cookie handed to browser clients.

use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

use crate::config::AppConfig;

pub const ACCESS_COOKIE: &str = "access_token";

/// Readable by the client app, sent only over TLS, scoped to the client origin.
pub fn access_cookie(token: &str, cfg: &AppConfig) -> Cookie<'static> {
    Cookie::build((ACCESS_COOKIE, token.to_string()))
        .path("/")
        .same_site(SameSite::Lax)
        .secure(true)
        .http_only(false)
        .domain(cfg.client_origin.clone())
        .max_age(Duration::minutes(cfg.token.access_max_age_minutes))
        .build()
}

pub fn clear_access_cookie(cfg: &AppConfig) -> Cookie<'static> {
    Cookie::build((ACCESS_COOKIE, String::new()))
        .path("/")
        .same_site(SameSite::Lax)
        .secure(true)
        .http_only(true)
        .domain(cfg.client_origin.clone())
        .max_age(Duration::ZERO)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;

    #[test]
    fn access_cookie_attributes() {
        let cfg = test_config();
        let cookie = access_cookie("tok", &cfg);
        assert_eq!(cookie.name(), "access_token");
        assert_eq!(cookie.value(), "tok");
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.domain(), Some("kassa.test"));
        assert_eq!(
            cookie.max_age(),
            Some(Duration::seconds(cfg.token.access_max_age_minutes * 60))
        );
    }

    #[test]
    fn clearing_cookie_expires_immediately() {
        let cookie = clear_access_cookie(&test_config());
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(Duration::ZERO));
    }
}

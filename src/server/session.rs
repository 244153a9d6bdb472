use actix_web::cookie::{Cookie, SameSite};
use actix_web::dev::Payload;
use actix_web::{FromRequest, HttpRequest, HttpResponseBuilder};
use std::future::{Ready, ready};

pub const SESSION_COOKIE: &str = "automanim_session";

/// Browser session keyed by an http-only cookie, issued on first contact.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    fresh: bool,
}

impl Session {
    pub fn from_http(req: &HttpRequest) -> Self {
        let existing = req
            .cookie(SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .filter(|v| uuid::Uuid::parse_str(v).is_ok());

        match existing {
            Some(id) => Self { id, fresh: false },
            None => Self {
                id: uuid::Uuid::new_v4().to_string(),
                fresh: true,
            },
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Set the session cookie on `builder` when the session is new.
    pub fn attach<'a>(&self, builder: &'a mut HttpResponseBuilder) -> &'a mut HttpResponseBuilder {
        if self.fresh {
            builder.cookie(
                Cookie::build(SESSION_COOKIE, self.id.clone())
                    .path("/")
                    .http_only(true)
                    .same_site(SameSite::Lax)
                    .finish(),
            );
        }
        builder
    }
}

impl FromRequest for Session {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Ok(Session::from_http(req)))
    }
}

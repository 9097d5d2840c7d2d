use std::future::{ready, Ready};

use actix_web::{dev::Payload, FromRequest, HttpRequest};

/// Header set by the authenticating proxy in front of this service.
pub const ACTOR_HEADER: &str = "X-Forwarded-User";

const ANONYMOUS: &str = "anonymous";

/// Identity of the caller that triggered an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(pub String);

impl FromRequest for Actor {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let name = req
            .headers()
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(ANONYMOUS);
        ready(Ok(Actor(name.to_string())))
    }
}

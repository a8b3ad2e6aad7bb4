use crate::http::{make_boxed_error_response, make_boxed_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Administrative endpoints served next to the relay.
///
/// - `GET /health`: liveness, always `200`.
/// - `GET /ready`: `200` while `is_ready` returns true, `503` otherwise.
/// - `GET /cache`: JSON dump of every cache entry.
/// - `GET /cache/<key>`: JSON dump of a single entry, `404` if it does not exist.
pub struct AdminService<R, C, E> {
    is_ready: R,
    cache_dump: C,
    _error: PhantomData<E>,
}

impl<R, C, E> AdminService<R, C, E>
where
    R: Fn() -> bool,
    C: Fn(Option<&str>) -> Option<String>,
{
    /// `cache_dump` is called with `None` for the full dump and `Some(key)` for a
    /// single entry. It returns the rendered JSON document, or `None` if the key is unknown.
    pub fn new(is_ready: R, cache_dump: C) -> Self {
        Self {
            is_ready,
            cache_dump,
            _error: PhantomData,
        }
    }

    fn respond(&self, method: &Method, path: &str) -> Response<BoxBody<Bytes, Infallible>> {
        if method != Method::GET {
            return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        let ok = || make_boxed_response(StatusCode::OK, "text/plain", "ok\n");
        let json = |body: String| make_boxed_response(StatusCode::OK, "application/json", body);

        match path.trim_end_matches('/') {
            "/health" => ok(),
            "/ready" => match (self.is_ready)() {
                true => ok(),
                false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
            },
            "/cache" => match (self.cache_dump)(None) {
                Some(body) => json(body),
                None => make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR),
            },
            other => match other.strip_prefix("/cache/") {
                Some(key) if !key.is_empty() => match (self.cache_dump)(Some(key)) {
                    Some(body) => json(body),
                    None => make_boxed_error_response(StatusCode::NOT_FOUND),
                },
                _ => make_boxed_error_response(StatusCode::NOT_FOUND),
            },
        }
    }
}

impl<R, C, E> Service<Request<Incoming>> for AdminService<R, C, E>
where
    R: Fn() -> bool,
    C: Fn(Option<&str>) -> Option<String>,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = self.respond(req.method(), req.uri().path());
        Box::pin(async move { Ok(res) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    type TestService = AdminService<
        Box<dyn Fn() -> bool>,
        Box<dyn Fn(Option<&str>) -> Option<String>>,
        Infallible,
    >;

    fn service(ready: bool) -> TestService {
        AdminService::new(
            Box::new(move || ready),
            Box::new(|key: Option<&str>| match key {
                None => Some(r#"[{"key":"cluster_n1"}]"#.to_string()),
                Some("cluster_n1") => Some(r#"{"key":"cluster_n1"}"#.to_string()),
                Some(_) => None,
            }),
        )
    }

    async fn body_string(response: Response<BoxBody<Bytes, Infallible>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let svc = service(true);
        assert_eq!(svc.respond(&Method::GET, "/health").status(), StatusCode::OK);
        assert_eq!(svc.respond(&Method::GET, "/ready").status(), StatusCode::OK);

        let svc = service(false);
        assert_eq!(svc.respond(&Method::GET, "/health").status(), StatusCode::OK);
        assert_eq!(
            svc.respond(&Method::GET, "/ready").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_cache_dump() {
        let svc = service(true);

        let all = svc.respond(&Method::GET, "/cache/");
        assert_eq!(all.status(), StatusCode::OK);
        assert_eq!(body_string(all).await, r#"[{"key":"cluster_n1"}]"#);

        let one = svc.respond(&Method::GET, "/cache/cluster_n1");
        assert_eq!(one.status(), StatusCode::OK);
        assert_eq!(body_string(one).await, r#"{"key":"cluster_n1"}"#);

        assert_eq!(
            svc.respond(&Method::GET, "/cache/unknown").status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_unknown_routes() {
        let svc = service(true);
        assert_eq!(
            svc.respond(&Method::GET, "/nope").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            svc.respond(&Method::POST, "/health").status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}

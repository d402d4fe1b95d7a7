//! Request rewriting for synchronous invocations.

use http::header::HOST;
use http::uri::{Scheme, Uri};
use http::{HeaderValue, Request};

/// Rewrites an inbound request so it reaches a live service instance.
///
/// The scheme, authority and path are replaced; the query string is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDirector {
    scheme: Scheme,
    authority: String,
    path: String,
}

impl ProxyDirector {
    /// Plain HTTP to `authority`, at the root path.
    pub fn http(authority: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::HTTP,
            authority: authority.into(),
            path: "/".to_string(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn direct<B>(&self, request: &mut Request<B>) -> http::Result<()> {
        let path_and_query = match request.uri().query() {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        };
        let uri = Uri::builder()
            .scheme(self.scheme.as_str())
            .authority(self.authority.as_str())
            .path_and_query(path_and_query.as_str())
            .build()?;
        *request.uri_mut() = uri;
        request
            .headers_mut()
            .insert(HOST, HeaderValue::from_str(&self.authority)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_target_and_keeps_query() {
        let director = ProxyDirector::http("s1.faasgrid-svc");
        let mut request = Request::post("http://gateway.local/run/s1?verbose=1")
            .header(HOST, "gateway.local")
            .body(())
            .unwrap();

        director.direct(&mut request).unwrap();
        assert_eq!(request.uri().to_string(), "http://s1.faasgrid-svc/?verbose=1");
        assert_eq!(request.headers()[HOST], "s1.faasgrid-svc");
    }

    #[test]
    fn relative_requests_get_an_absolute_uri() {
        let director = ProxyDirector::http("s1-svc.faasgrid-svc").with_path("/health");
        let mut request = Request::get("/run/s1").body(()).unwrap();
        director.direct(&mut request).unwrap();
        assert_eq!(request.uri().scheme_str(), Some("http"));
        assert_eq!(request.uri().host(), Some("s1-svc.faasgrid-svc"));
        assert_eq!(request.uri().path(), "/health");
    }

    #[test]
    fn invalid_authority_is_an_error() {
        let director = ProxyDirector::http("bad host");
        let mut request = Request::get("/").body(()).unwrap();
        assert!(director.direct(&mut request).is_err());
    }
}

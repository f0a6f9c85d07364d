//! Test request construction
//!
//! Thin wrapper over `actix_web::test::TestRequest` that knows the headers
//! and cookies the guard inspects.

use std::net::SocketAddr;

use actix_web::cookie::Cookie;
use actix_web::test::TestRequest;
use actix_web::HttpRequest;

use crate::testing::constants;

pub struct RequestBuilder {
    request: TestRequest,
}

impl RequestBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            request: TestRequest::default().uri("/orders"),
        }
    }

    /// Set the request path
    #[must_use]
    pub fn uri(mut self, uri: &str) -> Self {
        self.request = self.request.uri(uri);
        self
    }

    /// Set the user agent header
    #[must_use]
    pub fn user_agent(mut self, agent: &str) -> Self {
        self.request = self.request.insert_header(("User-Agent", agent));
        self
    }

    /// Headers a real browser would send, enough to pass transport checks
    #[must_use]
    pub fn browser_headers(mut self) -> Self {
        self.request = self
            .request
            .insert_header(("User-Agent", constants::TEST_USER_AGENT))
            .insert_header(("Accept", "application/json"))
            .insert_header(("sec-ch-ua-platform", "\"macOS\""));
        self
    }

    /// Arbitrary header
    #[must_use]
    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        self.request = self.request.insert_header((name, value));
        self
    }

    /// Attach a cookie
    #[must_use]
    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        self.request = self
            .request
            .cookie(Cookie::new(name.to_string(), value.to_string()));
        self
    }

    /// Set the peer address the fingerprint derives from
    ///
    /// # Panics
    ///
    /// Panics on an unparseable IP; test input is fixed.
    #[must_use]
    pub fn with_client_ip(mut self, ip: &str) -> Self {
        let addr: SocketAddr = format!("{ip}:443").parse().expect("valid test IP");
        self.request = self.request.peer_addr(addr);
        self
    }

    #[must_use]
    pub fn build(self) -> HttpRequest {
        self.request.to_http_request()
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

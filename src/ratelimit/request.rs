//! Request descriptors and dynamic policy providers.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::trace;

use super::RateLimitPolicy;

/// Framework-independent view of an incoming request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDescriptor {
    /// Route pattern the request matched, e.g. `/api/users/{id}`
    pub route_template: String,
    /// Concrete request path
    pub path: String,
    pub method: String,
    /// Header names are stored lowercased
    headers: HashMap<String, String>,
    /// Authenticated client identity, if any
    pub identity: Option<String>,
    pub remote_addr: Option<IpAddr>,
}

impl RequestDescriptor {
    pub fn new(
        route_template: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            route_template: route_template.into(),
            path: path.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Supplies the policy for a request, typically by identifying the client.
///
/// A returned policy with no rates (and overrides allowed) defers to the
/// static policy table.
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn get_policy(&self, request: &RequestDescriptor) -> Option<RateLimitPolicy>;
}

/// Template policy for `request_key` that lets the static table decide.
fn deferring_policy(request_key: &str, request: &RequestDescriptor) -> Option<RateLimitPolicy> {
    RateLimitPolicy::for_request_key(request_key, &request.route_template, &request.method).ok()
}

/// Identifies clients by their authenticated identity or a client-id header.
#[derive(Debug, Clone)]
pub struct ClientIdPolicyProvider {
    header: String,
}

impl ClientIdPolicyProvider {
    pub const DEFAULT_HEADER: &'static str = "x-client-id";

    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for ClientIdPolicyProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_HEADER)
    }
}

#[async_trait]
impl PolicyProvider for ClientIdPolicyProvider {
    async fn get_policy(&self, request: &RequestDescriptor) -> Option<RateLimitPolicy> {
        fn present(id: &&str) -> bool {
            !id.trim().is_empty()
        }

        let client = request
            .identity
            .as_deref()
            .filter(present)
            .or_else(|| request.header(&self.header).filter(present));

        match client {
            Some(id) => deferring_policy(id, request),
            None => {
                trace!(header = %self.header, "No client id on request");
                None
            }
        }
    }
}

/// Identifies clients by their remote IP address.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpAddressPolicyProvider;

#[async_trait]
impl PolicyProvider for IpAddressPolicyProvider {
    async fn get_policy(&self, request: &RequestDescriptor) -> Option<RateLimitPolicy> {
        let addr = request.remote_addr?;
        deferring_policy(&addr.to_string(), request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestDescriptor {
        RequestDescriptor::new("/api/values", "/api/values", "get")
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let request = request().with_header("X-Client-Id", "abc");
        assert_eq!(request.header("x-client-id"), Some("abc"));
        assert_eq!(request.header("X-CLIENT-ID"), Some("abc"));
        assert_eq!(request.header("other"), None);
    }

    #[tokio::test]
    async fn test_client_id_prefers_identity() {
        let provider = ClientIdPolicyProvider::default();
        let request = request()
            .with_header("x-client-id", "from-header")
            .with_identity("from-identity");

        let policy = provider.get_policy(&request).await.unwrap();
        assert_eq!(policy.request_key(), "from-identity");
        assert_eq!(policy.route_template(), "/api/values");
        assert_eq!(policy.http_method(), "GET");
        assert!(policy.rates().is_empty());
        assert!(policy.allow_attribute_override());
    }

    #[tokio::test]
    async fn test_client_id_from_custom_header() {
        let provider = ClientIdPolicyProvider::new("X-Api-Key");
        let request = request().with_header("x-api-key", "key-1");

        let policy = provider.get_policy(&request).await.unwrap();
        assert_eq!(policy.request_key(), "key-1");
    }

    #[tokio::test]
    async fn test_blank_identity_falls_back_to_header() {
        let provider = ClientIdPolicyProvider::default();
        let request = request()
            .with_identity(" ")
            .with_header("x-client-id", "from-header");

        let policy = provider.get_policy(&request).await.unwrap();
        assert_eq!(policy.request_key(), "from-header");
    }

    #[tokio::test]
    async fn test_client_id_missing() {
        let provider = ClientIdPolicyProvider::default();
        assert!(provider.get_policy(&request()).await.is_none());

        let blank = request().with_header("x-client-id", "  ");
        assert!(provider.get_policy(&blank).await.is_none());
    }

    #[test]
    fn test_ip_address_provider() {
        let provider = IpAddressPolicyProvider;
        assert!(tokio_test::block_on(provider.get_policy(&request())).is_none());

        let request = request().with_remote_addr("10.0.0.7".parse().unwrap());
        let policy = tokio_test::block_on(provider.get_policy(&request)).unwrap();
        assert_eq!(policy.request_key(), "10.0.0.7");
    }
}

//! Policy resolution: whitelists, the dynamic provider and the static table.
//!
//! The resolver is populated once before serving. Registration takes
//! `&mut self`, so a resolver shared behind an `Arc` is read-only and safe to
//! query concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use super::policy::{normalize_method, normalize_route, PolicyKey, RateLimitPolicy, WILDCARD};
use super::request::{PolicyProvider, RequestDescriptor};
use crate::error::{FloodgateError, Result};

pub struct PolicyResolver {
    provider: Arc<dyn PolicyProvider>,
    policies: HashMap<PolicyKey, RateLimitPolicy>,
    /// Lowercased path prefixes that bypass limiting
    whitelisted_paths: Vec<String>,
}

impl fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyResolver")
            .field("policies", &self.policies.len())
            .field("whitelisted_paths", &self.whitelisted_paths)
            .finish_non_exhaustive()
    }
}

impl PolicyResolver {
    pub fn new(provider: Arc<dyn PolicyProvider>) -> Self {
        Self {
            provider,
            policies: HashMap::new(),
            whitelisted_paths: Vec::new(),
        }
    }

    /// Exempt every path starting with `prefix` (case-insensitive).
    pub fn add_whitelisted_path(&mut self, prefix: &str) {
        let prefix = prefix.trim().to_lowercase();
        if !prefix.is_empty() && !self.whitelisted_paths.contains(&prefix) {
            self.whitelisted_paths.push(prefix);
        }
    }

    /// Register a static policy under its identity key.
    ///
    /// # Errors
    /// Returns [`FloodgateError::DuplicatePolicy`] if a policy with the same
    /// key is already registered.
    pub fn add_endpoint_policy(&mut self, policy: RateLimitPolicy) -> Result<()> {
        let key = policy.key();
        if self.policies.contains_key(&key) {
            return Err(FloodgateError::DuplicatePolicy(key.to_string()));
        }
        debug!(key = %key, name = %policy.name(), rates = policy.rates().len(), "Registered policy");
        self.policies.insert(key, policy);
        Ok(())
    }

    pub fn add_endpoint_policies(
        &mut self,
        policies: impl IntoIterator<Item = RateLimitPolicy>,
    ) -> Result<()> {
        policies
            .into_iter()
            .try_for_each(|policy| self.add_endpoint_policy(policy))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn is_whitelisted_path(&self, path: &str) -> bool {
        let path = path.to_lowercase();
        self.whitelisted_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Most specific static policy for the triple.
    ///
    /// Tries the exact triple first, then widens method, route, and finally
    /// the request key to `*`.
    pub fn find_static(
        &self,
        request_key: &str,
        route_template: &str,
        http_method: &str,
    ) -> Option<&RateLimitPolicy> {
        let route = normalize_route(route_template);
        let method = normalize_method(http_method);

        let candidates = [
            (request_key, route.as_str(), method.as_str()),
            (request_key, route.as_str(), WILDCARD),
            (request_key, WILDCARD, method.as_str()),
            (request_key, WILDCARD, WILDCARD),
            (WILDCARD, route.as_str(), method.as_str()),
            (WILDCARD, route.as_str(), WILDCARD),
            (WILDCARD, WILDCARD, method.as_str()),
            (WILDCARD, WILDCARD, WILDCARD),
        ];

        let found = candidates.into_iter().find_map(|(key, route, method)| {
            self.policies.get(&PolicyKey {
                request_key: key.to_string(),
                route_template: route.to_string(),
                http_method: method.to_string(),
            })
        });
        found
    }

    /// Policy that applies to `request`, or `None` if it is not limited.
    pub async fn get_policy(&self, request: &RequestDescriptor) -> Option<RateLimitPolicy> {
        if self.is_whitelisted_path(&request.path) {
            trace!(path = %request.path, "Path is whitelisted");
            return None;
        }

        let dynamic = self.provider.get_policy(request).await?;
        if !dynamic.rates().is_empty() || !dynamic.allow_attribute_override() {
            return Some(dynamic);
        }

        match self.find_static(
            dynamic.request_key(),
            dynamic.route_template(),
            dynamic.http_method(),
        ) {
            Some(matched) => {
                trace!(
                    request_key = %dynamic.request_key(),
                    matched = %matched.key(),
                    "Resolved static policy"
                );
                Some(dynamic.adopt(matched))
            }
            None => {
                debug!(request_key = %dynamic.request_key(), "No policy matched");
                None
            }
        }
    }
}

//! Typed request-scoped context threaded through every service call.

use crate::store::{Principal, StrategyResource};

/// Operation class a request performs, used by permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Create,
    Modify,
    Delete,
}

/// Context assembled by the auth interceptor before a permission check.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub operation: Operation,
    pub method: &'static str,
    pub resources: Vec<StrategyResource>,
    pub principal: Option<Principal>,
}

/// Request-scoped values carried explicitly instead of through opaque
/// context keys. Interceptors mutate the typed fields only.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub auth_context: Option<AuthContext>,
    pub request_id: Option<String>,
    pub platform_id: Option<String>,
    pub operator: Option<String>,
    /// Whether the request came in over the client (data-plane) surface.
    pub from_client: bool,
    /// Whether this request may take the async register path.
    pub open_async_regis: bool,
    pub principal: Option<Principal>,
}

impl RequestContext {
    pub fn client() -> Self {
        Self {
            from_client: true,
            ..Self::default()
        }
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn operator_or_default(&self) -> &str {
        self.operator.as_deref().unwrap_or("registry")
    }
}

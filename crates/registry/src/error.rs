use common::api::ApiCode;
use tracing::error;

/// Application error carried by every request path.
///
/// Always holds one of the closed [`ApiCode`] values; low-level failures are
/// translated before they cross a layer boundary.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ApiCode,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn new(code: ApiCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
        }
    }

    pub fn code(code: ApiCode) -> Self {
        Self {
            code,
            message: String::new(),
        }
    }

    pub fn not_allowed(msg: impl Into<String>) -> Self {
        Self::new(ApiCode::NotAllowedAccess, msg)
    }

    pub fn store_layer(msg: impl Into<String>) -> Self {
        Self::new(ApiCode::StoreLayerException, msg)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for ApiError {}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!(?err, "internal error");
        ApiError::new(ApiCode::ExecuteException, "internal error")
    }
}

/// Internal coordination failures. Never surfaced to clients verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    #[error("peer closed")]
    PeerClosed,
    #[error("beat record not found")]
    RecordNotFound,
    #[error("redirect request only once")]
    RedirectOnlyOnce,
    #[error("event bus not initialized")]
    EventBusClosed,
    #[error("peer transport: {0}")]
    Transport(String),
}

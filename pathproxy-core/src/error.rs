use http::StatusCode;

/// Everything that can stop a request on its way through the dispatcher.
///
/// The `Display` text doubles as the plain-text response body, so client
/// errors carry enough detail for the caller to fix the request.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The request path stops at (or before) the end of the route prefix.
    #[error("no target url provided")]
    NoTargetSpecified,

    /// The path suffix does not form a valid `host[/path][?query]`.
    #[error("invalid target url {target:?}: {reason}")]
    InvalidTargetUrl { target: String, reason: String },

    /// The request path is not mounted under the route prefix at all.
    #[error("path {path:?} is not under route prefix {prefix:?}")]
    PrefixMismatch { path: String, prefix: String },

    #[error("invalid route prefix {0:?}: must start and end with '/'")]
    InvalidRoutePrefix(String),

    /// The upstream prefix does not cover the request path being rewritten.
    #[error("rewrite prefix {prefix:?} does not cover request path {path:?}")]
    RewriteInvariantViolation { prefix: String, path: String },

    #[error("failed to build outbound request: {0}")]
    OutboundRequest(#[from] http::Error),

    #[error("upstream {host} failed: {source:#}")]
    Upstream {
        host: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoTargetSpecified | Self::InvalidTargetUrl { .. } => StatusCode::BAD_REQUEST,
            Self::PrefixMismatch { .. } => StatusCode::NOT_FOUND,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::InvalidRoutePrefix(_)
            | Self::RewriteInvariantViolation { .. }
            | Self::OutboundRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client errors are the caller's fault and are never logged as server faults.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

//! Error taxonomy for the HTTP surface
//!
//! Every failure a client can see is a `kind:surface` code plus a message.
//! Internal failures keep their cause in the logs only.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::any::Any;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimit,
    Offline,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::RateLimit => "rate_limit",
            Self::Offline => "offline",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::Offline => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Api,
    Chat,
    Stream,
    Auth,
}

impl Surface {
    fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Chat => "chat",
            Self::Stream => "stream",
            Self::Auth => "auth",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{message}")]
    Visible {
        kind: ErrorKind,
        surface: Surface,
        message: String,
        cause: Option<String>,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ChatError {
    pub fn new(kind: ErrorKind, surface: Surface) -> Self {
        Self::Visible {
            kind,
            surface,
            message: default_message(kind, surface).to_string(),
            cause: None,
        }
    }

    pub fn bad_request(surface: Surface, cause: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, surface).with_cause(cause)
    }

    pub fn unauthorized(surface: Surface) -> Self {
        Self::new(ErrorKind::Unauthorized, surface)
    }

    pub fn forbidden(surface: Surface) -> Self {
        Self::new(ErrorKind::Forbidden, surface)
    }

    pub fn not_found(surface: Surface) -> Self {
        Self::new(ErrorKind::NotFound, surface)
    }

    pub fn rate_limited(surface: Surface) -> Self {
        Self::new(ErrorKind::RateLimit, surface)
    }

    pub fn offline(surface: Surface) -> Self {
        Self::new(ErrorKind::Offline, surface)
    }

    pub fn with_cause(self, cause: impl Into<String>) -> Self {
        match self {
            Self::Visible {
                kind,
                surface,
                message,
                ..
            } => Self::Visible {
                kind,
                surface,
                message,
                cause: Some(cause.into()),
            },
            other => other,
        }
    }

    /// `kind:surface`, or `None` for internal errors.
    pub fn code(&self) -> Option<String> {
        match self {
            Self::Visible { kind, surface, .. } => {
                Some(format!("{}:{}", kind.as_str(), surface.as_str()))
            }
            Self::Internal(_) => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Visible { kind, .. } => kind.status(),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn default_message(kind: ErrorKind, surface: Surface) -> &'static str {
    match (kind, surface) {
        (ErrorKind::BadRequest, _) => "The request couldn't be processed. Please check your input and try again.",
        (ErrorKind::Unauthorized, _) => "You need to sign in before continuing.",
        (ErrorKind::Forbidden, Surface::Chat) => "This chat belongs to another user.",
        (ErrorKind::Forbidden, Surface::Stream) => "This stream belongs to another user.",
        (ErrorKind::Forbidden, _) => "Your account does not have access to this feature.",
        (ErrorKind::NotFound, Surface::Chat) => "The requested chat was not found.",
        (ErrorKind::NotFound, Surface::Stream) => "The requested stream was not found.",
        (ErrorKind::NotFound, _) => "The requested resource was not found.",
        (ErrorKind::RateLimit, _) => "You have exceeded your maximum number of messages for the day.",
        (ErrorKind::Offline, _) => "We're having trouble sending your message. Please try again later.",
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Visible {
                message, cause, ..
            } => json!({
                "code": self.code(),
                "message": message,
                "cause": cause,
            }),
            Self::Internal(e) => {
                tracing::error!(error = %format!("{e:#}"), "Unhandled request error");
                json!({
                    "code": "internal:api",
                    "message": "Something went wrong. Please try again later.",
                    "cause": null,
                })
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Response for a handler that panicked; same body as any internal error.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("non-string panic payload");
    ChatError::Internal(anyhow::anyhow!("handler panicked: {detail}")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses() {
        let err = ChatError::rate_limited(Surface::Chat);
        assert_eq!(err.code().as_deref(), Some("rate_limit:chat"));
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);

        let err = ChatError::bad_request(Surface::Api, "id must be a UUID");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(err, ChatError::Visible { cause: Some(c), .. } if c == "id must be a UUID"));

        assert_eq!(ChatError::offline(Surface::Chat).status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn internal_errors_hide_their_cause() {
        let err: ChatError = anyhow::anyhow!("database password is hunter2").into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.code().is_none());
    }

    async fn explode() -> &'static str {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let app = axum::Router::new()
            .route("/explode", axum::routing::get(explode))
            .layer(tower_http::catch_panic::CatchPanicLayer::custom(panic_response));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = reqwest::get(format!("http://{addr}/explode")).await.unwrap();
        assert_eq!(response.status(), 500);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["code"], "internal:api");
        assert!(!body["message"].as_str().unwrap().contains("exploded"));
    }
}

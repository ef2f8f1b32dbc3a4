use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pageconf_service::caching::{CacheError, ResourceId};
use pageconf_service::loader::{ErrorKind, LoadError};
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    kind: ErrorKind,
    resource_id: Option<ResourceId>,
    err: anyhow::Error,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NetworkError => StatusCode::BAD_GATEWAY,
        ErrorKind::InvalidConfig => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::CacheError | ErrorKind::Cancelled | ErrorKind::Unknown => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<LoadError> for ResponseError {
    fn from(err: LoadError) -> Self {
        Self {
            status: status_for(err.kind()),
            kind: err.kind(),
            resource_id: Some(err.resource_id().clone()),
            err: err.into(),
        }
    }
}

impl From<CacheError> for ResponseError {
    fn from(err: CacheError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: ErrorKind::CacheError,
            resource_id: None,
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut body = ApiErrorResponse::from(self.err);
        body.kind = Some(self.kind);
        body.resource_id = self.resource_id;

        let mut response = Json(body).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<ResourceId>,
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse {
            detail,
            causes,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use pageconf_service::loader::{Failure, classify};

    use super::*;

    #[test]
    fn test_status_codes() {
        let id = ResourceId::new("dashboard-page");
        let status = |failure| ResponseError::from(classify(&id, failure)).status;

        assert_eq!(status(Failure::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status(Failure::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(
            status(Failure::UnexpectedNotModified),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(Failure::Storage(CacheError::from(io::Error::other("disk full")))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_body() {
        let id = ResourceId::new("dashboard-page");
        let err = ResponseError::from(classify(&id, Failure::Forbidden));

        let mut body = ApiErrorResponse::from(err.err);
        body.kind = Some(err.kind);
        body.resource_id = err.resource_id;
        insta::assert_json_snapshot!(body, @r###"
        {
          "kind": "forbidden",
          "resource_id": "dashboard-page",
          "detail": "forbidden: `dashboard-page`"
        }
        "###);
    }
}

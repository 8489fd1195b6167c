//! Unauthenticated liveness endpoints.

use axum::http::StatusCode;

/// `GET /up`: liveness probe for load balancers and deploy tooling.
pub async fn up() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// `GET /`: plain-text banner with the running version.
pub async fn root() -> String {
    format!(
        "Actions Gateway is running. version: {}",
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn up_returns_no_content() {
        let app = Router::new().route("/up", get(up));
        let res = app
            .oneshot(Request::get("/up").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn root_reports_version() {
        assert!(root().await.ends_with(env!("CARGO_PKG_VERSION")));
    }
}

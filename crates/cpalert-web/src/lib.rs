//! JSON surface over a running [`AlertService`].

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cpalert_core::{Contest, Platform};
use cpalert_sync::AlertService;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "cpalert-web";

pub const NO_CONTESTS_MESSAGE: &str = "no contests in range";

#[derive(Debug, Default, Deserialize)]
struct ContestsQuery {
    platform: Option<Platform>,
}

#[derive(Debug, Serialize)]
struct ContestsBody<'a> {
    contests: Vec<&'a Contest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

pub fn app(state: Arc<AlertService>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/probe", get(probe_handler))
        .route("/contests", get(contests_handler))
        .route("/reminders", get(reminders_handler))
        .route("/refresh", post(refresh_handler))
        .with_state(state)
}

pub async fn serve(
    addr: &str,
    state: Arc<AlertService>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "web surface listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn probe_handler(State(state): State<Arc<AlertService>>) -> Response {
    Json(state.probe_all().await).into_response()
}

async fn contests_handler(
    State(state): State<Arc<AlertService>>,
    Query(query): Query<ContestsQuery>,
) -> Response {
    let all = state.last_contests().await;
    let contests: Vec<&Contest> = all
        .iter()
        .filter(|c| query.platform.map_or(true, |p| c.platform() == p))
        .collect();
    let message = contests.is_empty().then_some(NO_CONTESTS_MESSAGE);
    Json(ContestsBody { contests, message }).into_response()
}

async fn reminders_handler(State(state): State<Arc<AlertService>>) -> Response {
    Json(state.reminders().await).into_response()
}

async fn refresh_handler(State(state): State<Arc<AlertService>>) -> Response {
    Json(state.refresh_and_arm().await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::StatusCode;
    use chrono::Utc;
    use cpalert_adapters::{FetchRequest, PlatformRules, SourceAdapter, SourceKind};
    use cpalert_core::{RawContest, ReminderOffset, SourceResult};
    use cpalert_http::{BackoffPolicy, HttpClientConfig, HttpFetcher};
    use cpalert_remind::{LogSink, ReminderScheduler, SystemClock};
    use cpalert_sync::{Aggregator, Cascade, PlatformRegistry};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct UpcomingRound;

    #[async_trait]
    impl SourceAdapter for UpcomingRound {
        fn source_id(&self) -> &'static str {
            "upcoming-round"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::StructuredApi
        }

        fn probe_url(&self) -> &str {
            "http://127.0.0.1:9/"
        }

        async fn fetch(&self, _http: &HttpFetcher, _request: &FetchRequest) -> SourceResult {
            Ok(vec![RawContest {
                resource: Some("codeforces.com".into()),
                name: "Codeforces Round 1030 (Div. 2)".into(),
                url: Some("https://codeforces.com/contests/2100".into()),
                start: Utc::now() + chrono::Duration::days(3),
                end: None,
                duration_secs: Some(7200),
            }])
        }
    }

    fn service(with_source: bool) -> Arc<AlertService> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let cascades = if with_source {
            vec![Cascade::new(
                Platform::Codeforces,
                vec![Arc::new(UpcomingRound)],
                http,
                Arc::new(PlatformRules::builtin()),
                BackoffPolicy::default(),
            )]
        } else {
            Vec::new()
        };
        Arc::new(AlertService::new(
            Aggregator::new(cascades),
            ReminderScheduler::new(
                ReminderOffset::defaults(),
                Arc::new(LogSink),
                Arc::new(SystemClock),
            ),
            PlatformRegistry::all_enabled(),
            7,
        ))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let resp = app(service(false))
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn empty_contest_list_says_so() {
        let (status, json) = get_json(app(service(false)), "/contests").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["contests"].as_array().map(Vec::len), Some(0));
        assert_eq!(json["message"], NO_CONTESTS_MESSAGE);
    }

    #[tokio::test]
    async fn refresh_then_list_contests_and_reminders() {
        let router = app(service(true));
        let resp = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let summary: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary["contests"], 1);
        assert_eq!(summary["reminders"]["armed"], 3);

        let (_, contests) = get_json(router.clone(), "/contests").await;
        assert_eq!(contests["contests"].as_array().map(Vec::len), Some(1));
        assert!(contests.get("message").is_none());

        let (_, filtered) = get_json(router.clone(), "/contests?platform=atcoder").await;
        assert_eq!(filtered["message"], NO_CONTESTS_MESSAGE);

        let (_, reminders) = get_json(router, "/reminders").await;
        assert_eq!(reminders.as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn unknown_platform_filter_is_rejected() {
        let (status, _) = get_json(app(service(false)), "/contests?platform=topcoder").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn probe_lists_configured_platforms() {
        let (status, json) = get_json(app(service(true)), "/probe").await;
        assert_eq!(status, StatusCode::OK);
        let probes = json.as_array().unwrap();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0]["platform"], "codeforces");
        assert_eq!(probes[0]["reachable"], false);
    }
}

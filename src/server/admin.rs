use super::ServerState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::sync::atomic::Ordering;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: ServerState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/api/proxies" => {
            let body = serde_json::to_string(&state.registry.snapshot()).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        "/api/status" => {
            let body = serde_json::json!({
                "auth_enabled": state.config.enable_auth,
                "active_connections": state.active_clients.load(Ordering::Relaxed),
            });
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body.to_string()))
                .unwrap())
        }

        "/dashboard" => match &state.dashboard_html {
            Some(html) => Ok(Response::builder()
                .status(200)
                .header("content-type", "text/html; charset=utf-8")
                .body(full_body(html.as_str().to_owned()))
                .unwrap()),
            None => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(full_body("dashboard not found"))
                .unwrap()),
        },

        "/" => Ok(Response::builder()
            .status(StatusCode::FOUND)
            .header("location", "/dashboard")
            .body(full_body(""))
            .unwrap()),

        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}

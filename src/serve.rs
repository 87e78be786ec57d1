/// HTTP surface: reset and restart endpoints plus a JSON health check.
use crate::config::Settings;
use crate::timer::{Expiry, ResetOutcome, WatchdogTimer};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// What handlers need to know about how to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub reset_path: String,
    pub restart_path: String,
    pub stealth: bool,
    pub redirect: Option<String>,
    pub onetime: bool,
}

impl From<&Settings> for HttpSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            reset_path: settings.reset_path.clone(),
            restart_path: settings.restart_path.clone(),
            stealth: settings.stealth,
            redirect: settings.redirect.clone(),
            onetime: settings.onetime,
        }
    }
}

#[derive(Clone)]
struct AppState {
    timer: Arc<WatchdogTimer>,
    http: Arc<HttpSettings>,
}

/// Build the router. Restart is left out entirely in one-shot mode.
pub fn router(timer: Arc<WatchdogTimer>, http: HttpSettings) -> Router {
    // Each action answers on its path and on everything below it.
    let mut app = Router::new()
        .route(&http.reset_path, get(reset))
        .route(&subtree(&http.reset_path), get(reset));
    if !http.onetime {
        app = app
            .route(&http.restart_path, get(restart))
            .route(&subtree(&http.restart_path), get(restart));
    }
    if !http.stealth {
        app = app.route("/api/health", get(health));
    }

    let state = AppState {
        timer,
        http: Arc::new(http),
    };
    app.with_state(state).layer(TraceLayer::new_for_http())
}

fn subtree(path: &str) -> String {
    format!("{path}{{*rest}}")
}

/// Bind the listener and serve until `shutdown` resolves.
pub async fn run(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!("watchdog listening on {local_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn reset(State(state): State<AppState>) -> Response {
    let outcome = state.timer.extend().await;
    match outcome {
        ResetOutcome::Extended(expiry) => {
            tracing::info!(
                cycle = expiry.cycle,
                expires_at = %expiry.expires_at.to_rfc3339(),
                "timer extended"
            );
        }
        ResetOutcome::Expired => tracing::info!("reset rejected, timer already expired"),
    }

    if let Some(response) = suppressed(&state.http) {
        return response;
    }
    let http = &state.http;
    let body = match outcome {
        ResetOutcome::Extended(expiry) => format!(
            "{}<a href=\"{}\">Reset Timer</a>\n",
            status_lines("reset", &expiry, state.timer.task().command_line()),
            escape_html(&http.reset_path)
        ),
        ResetOutcome::Expired => {
            let mut body = "Timer expired.<br>\n".to_string();
            if !http.onetime {
                body.push_str(&format!(
                    "<a href=\"{}\">Restart Timer</a>\n",
                    escape_html(&http.restart_path)
                ));
            }
            body
        }
    };
    Html(page(&http.reset_path, &body)).into_response()
}

async fn restart(State(state): State<AppState>) -> Response {
    let expiry = state.timer.arm().await;

    if let Some(response) = suppressed(&state.http) {
        return response;
    }
    let http = &state.http;
    let body = format!(
        "{}<a href=\"{}\">Reset Timer</a>\n",
        status_lines("restarted", &expiry, state.timer.task().command_line()),
        escape_html(&http.reset_path)
    );
    Html(page(&http.restart_path, &body)).into_response()
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.timer.snapshot().await;
    Json(serde_json::json!({
        "ok": true,
        "state": snapshot.state,
        "cycle": snapshot.cycle,
        "expires_at": snapshot.expires_at.map(|t| t.to_rfc3339()),
    }))
}

/// Redirect and stealth modes replace the rendered page. Redirect wins.
fn suppressed(http: &HttpSettings) -> Option<Response> {
    if let Some(target) = &http.redirect {
        return Some((StatusCode::FOUND, [(header::LOCATION, target.clone())]).into_response());
    }
    if http.stealth {
        return Some((StatusCode::NOT_FOUND, "404 page not found\n").into_response());
    }
    None
}

fn status_lines(verb: &str, expiry: &Expiry, command: &str) -> String {
    format!(
        "Timer {verb} at {}.<br>\nTimer expires at {}.<br>\nRunning \"{}\" when expired.<br>\n",
        escape_html(&expiry.at.to_rfc3339()),
        escape_html(&expiry.expires_at.to_rfc3339()),
        escape_html(command)
    )
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n\
         <meta http-equiv=\"Content-Type\" content=\"text/html; charset=UTF-8\" />\n\
         <title>{}</title>\n</head>\n<body>\n{body}</body>\n</html>",
        escape_html(title)
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

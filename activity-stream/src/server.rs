//! The incoming HTTP application.
//!
//! Rocket serves four surfaces: the authenticated `/v1` query routes
//! (scroll-paginated search proxied to the search backend), the probe
//! POST, the plaintext `/check` liveness page and the `/metrics` payload
//! cached in the KV store by the poller. Authentication failures, scroll
//! misses and unexpected errors all come back as `{"details": "..."}`
//! JSON with the `Server: activity-stream` header.

use std::io::Cursor;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use rocket::data::ToByteUnit;
use rocket::http::{ContentType, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::Response;
use rocket::{catch, catchers, get, post, routes, Data, State};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::auth::{self, AuthError, Caller, Credential, RequestHeaders, UNKNOWN_ERROR};
use crate::elasticsearch::{
    activities_collection, new_scroll_query, private_scroll_id_of, reply_has_hits,
    scroll_continuation_body, EsClient, PAGINATION_EXPIRE, SCROLL_PATH, SEARCH_PATH,
};
use crate::feeds::Feed;
use crate::kv::KvStore;
use crate::signing::random_url_safe;

const STARTUP_GRACE_PERIOD: Duration = Duration::from_secs(30);
const ES_GREEN_MAX_AGE_SECONDS: f64 = 60.0;
const MAX_BODY_BYTES: u64 = 2 * 1024 * 1024;

/// Application state stored inside Rocket managed state.
pub struct AppState {
    pub started_at: Instant,
    pub kv: KvStore,
    pub es: EsClient,
    pub credentials: Vec<Credential>,
    pub ip_whitelist: Vec<String>,
    pub feeds: Vec<Feed>,
}

/// A fully materialised response. Everything the API returns goes
/// through this so statuses from the backend can be proxied verbatim and
/// JSON responses always carry the `Server` header.
pub struct ApiResponse {
    status: Status,
    content_type: ContentType,
    body: Vec<u8>,
    server_header: bool,
}

impl ApiResponse {
    fn json_bytes(status: Status, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: ContentType::JSON,
            body,
            server_header: true,
        }
    }

    fn json_value(status: Status, value: &Value) -> Self {
        Self::json_bytes(
            status,
            serde_json::to_vec(value).expect("a JSON value always serialises"),
        )
    }

    fn details(status: Status, message: &str) -> Self {
        Self::json_value(status, &json!({ "details": message }))
    }

    fn plain(body: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            content_type: ContentType::Plain,
            body,
            server_header: false,
        }
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for ApiResponse {
    fn respond_to(self, _: &'r Request<'_>) -> rocket::response::Result<'static> {
        let mut builder = Response::build();
        builder
            .status(self.status)
            .header(self.content_type)
            .sized_body(self.body.len(), Cursor::new(self.body));
        if self.server_header {
            builder.raw_header("Server", "activity-stream");
        }
        builder.ok()
    }
}

/// The pieces of the raw request that authentication and the query
/// proxy need, captured before any body reading happens.
pub struct RequestMeta {
    pub headers: RequestHeaders,
    pub path_and_query: String,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestMeta {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let headers = request.headers();
        Outcome::Success(RequestMeta {
            headers: RequestHeaders {
                authorization: headers.get_one("Authorization").map(str::to_string),
                content_type: headers.get_one("Content-Type").map(str::to_string),
                x_forwarded_proto: headers.get_one("X-Forwarded-Proto").map(str::to_string),
                x_forwarded_for: headers.get_one("X-Forwarded-For").map(str::to_string),
                host: headers.get_one("Host").map(str::to_string),
            },
            path_and_query: request.uri().to_string(),
        })
    }
}

impl RequestMeta {
    fn query_pairs(&self) -> Vec<(String, String)> {
        match self.path_and_query.split_once('?') {
            Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// The externally visible base for minting scroll URLs, using the
    /// scheme callers will sign their next request with.
    fn public_v1_base(&self) -> Option<String> {
        let proto = self.headers.x_forwarded_proto.as_deref()?;
        let host = self.headers.host.as_deref()?;
        Some(format!("{}://{}/v1", proto, host))
    }
}

async fn read_body(data: Data<'_>) -> Result<Vec<u8>, ApiResponse> {
    match data.open(MAX_BODY_BYTES.bytes()).into_bytes().await {
        Ok(bytes) => Ok(bytes.into_inner()),
        Err(error) => {
            error!(error = %error, "failed reading request body");
            Err(ApiResponse::details(
                Status::InternalServerError,
                UNKNOWN_ERROR,
            ))
        }
    }
}

fn internal_error_response(error: anyhow::Error) -> ApiResponse {
    error!(error = format!("{:#}", error), "about to return 500");
    sentry::integrations::anyhow::capture_anyhow(&error);
    ApiResponse::details(Status::InternalServerError, UNKNOWN_ERROR)
}

fn auth_error_response(error: AuthError) -> ApiResponse {
    match error {
        AuthError::Unauthorized(message) => ApiResponse::details(Status::Unauthorized, message),
        AuthError::Forbidden(message) => ApiResponse::details(Status::Forbidden, message),
        AuthError::Internal(error) => internal_error_response(error),
    }
}

/// Authenticate and authorize, or produce the response that says why not.
async fn authenticated_caller(
    state: &AppState,
    meta: &RequestMeta,
    method: &str,
    body: &[u8],
) -> Result<Caller, ApiResponse> {
    let caller = auth::authenticate(
        &state.kv,
        &state.credentials,
        &state.ip_whitelist,
        &meta.headers,
        method,
        &meta.path_and_query,
        body,
    )
    .await
    .map_err(auth_error_response)?;
    auth::authorize(&caller, method).map_err(auth_error_response)?;
    Ok(caller)
}

/// Proxy one search to the backend. 200 replies are shaped into the
/// public collection form, minting a public scroll id when the backend
/// returned one and there are further results; anything else passes
/// through verbatim, status and body.
async fn proxy_search(
    state: &AppState,
    meta: &RequestMeta,
    path: &str,
    query: &[(String, String)],
    es_body: Vec<u8>,
    content_type: &str,
) -> ApiResponse {
    let (status, bytes) = match state.es.search_raw(path, query, es_body, content_type).await {
        Ok(reply) => reply,
        Err(error) => return internal_error_response(error),
    };
    if status.as_u16() != 200 {
        return ApiResponse::json_bytes(Status::new(status.as_u16()), bytes);
    }

    let reply: Value = match serde_json::from_slice(&bytes) {
        Ok(reply) => reply,
        Err(error) => {
            return internal_error_response(anyhow!("search reply is not valid JSON: {}", error))
        }
    };

    let next_url = match (reply_has_hits(&reply), private_scroll_id_of(&reply)) {
        (true, Some(private_id)) => {
            let public_id = random_url_safe(8);
            if let Err(error) = state
                .kv
                .store_private_scroll_id(&public_id, private_id, PAGINATION_EXPIRE)
                .await
            {
                return internal_error_response(error);
            }
            meta.public_v1_base()
                .map(|base| format!("{}/{}", base, public_id))
        }
        _ => None,
    };

    ApiResponse::json_value(Status::Ok, &activities_collection(&reply, next_url))
}

#[post("/v1", data = "<data>")]
async fn activities_post(
    state: &State<AppState>,
    meta: RequestMeta,
    data: Data<'_>,
) -> ApiResponse {
    let body = match read_body(data).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    if let Err(response) = authenticated_caller(state, &meta, "POST", &body).await {
        return response;
    }
    ApiResponse::json_value(Status::Ok, &json!({"secret": "to-be-hidden"}))
}

#[get("/v1", data = "<data>")]
async fn activities_get_new(
    state: &State<AppState>,
    meta: RequestMeta,
    data: Data<'_>,
) -> ApiResponse {
    let body = match read_body(data).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    if let Err(response) = authenticated_caller(state, &meta, "GET", &body).await {
        return response;
    }
    let content_type = meta.headers.content_type.clone().unwrap_or_default();
    let query = new_scroll_query(meta.query_pairs());
    proxy_search(state, &meta, SEARCH_PATH, &query, body, &content_type).await
}

#[get("/v1/<public_scroll_id>", data = "<data>")]
async fn activities_get_existing(
    state: &State<AppState>,
    meta: RequestMeta,
    public_scroll_id: &str,
    data: Data<'_>,
) -> ApiResponse {
    let body = match read_body(data).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    if let Err(response) = authenticated_caller(state, &meta, "GET", &body).await {
        return response;
    }

    let private_id = match state.kv.private_scroll_id(public_scroll_id).await {
        Ok(Some(private_id)) => private_id,
        Ok(None) => return ApiResponse::details(Status::NotFound, "Scroll ID not found."),
        Err(error) => return internal_error_response(error),
    };
    let content_type = meta.headers.content_type.clone().unwrap_or_default();
    proxy_search(
        state,
        &meta,
        SCROLL_PATH,
        &[],
        scroll_continuation_body(&private_id),
        &content_type,
    )
    .await
}

fn green_red(green: bool) -> &'static str {
    if green {
        "GREEN"
    } else {
        "RED"
    }
}

/// Render the liveness page. During the startup grace period a RED feed
/// does not force the whole service DOWN, since the ingester may simply
/// not have finished its first cycle yet.
fn render_check_page(
    redis_green: bool,
    es_green: bool,
    feed_statuses: &[(String, bool)],
    in_grace_period: bool,
) -> String {
    let all_feeds_green = feed_statuses.iter().all(|(_, green)| *green);
    let all_green = redis_green && es_green && (all_feeds_green || in_grace_period);

    let mut page = String::new();
    page.push_str(if all_green { "__UP__" } else { "__DOWN__" });
    if in_grace_period {
        page.push_str(" (IN_STARTUP_GRACE_PERIOD)");
    }
    page.push('\n');
    page.push_str(&format!("redis:{}\n", green_red(redis_green)));
    page.push_str(&format!("elasticsearch:{}\n", green_red(es_green)));
    for (feed_id, green) in feed_statuses {
        page.push_str(&format!("{}:{}\n", feed_id, green_red(*green)));
    }
    page
}

#[get("/check")]
async fn check(state: &State<AppState>) -> ApiResponse {
    let redis_green = state.kv.ping().await.unwrap_or(false);
    let es_green = match state.es.min_verification_age().await {
        Ok(age) => age < ES_GREEN_MAX_AGE_SECONDS,
        Err(_) => false,
    };

    let mut feed_statuses = Vec::with_capacity(state.feeds.len());
    for feed in &state.feeds {
        let feed_id = feed.unique_id();
        let green = matches!(
            state.kv.feed_status(feed_id).await,
            Ok(Some(status)) if status == "GREEN"
        );
        feed_statuses.push((feed_id.to_string(), green));
    }

    let in_grace_period = state.started_at.elapsed() <= STARTUP_GRACE_PERIOD;
    let page = render_check_page(redis_green, es_green, &feed_statuses, in_grace_period);
    ApiResponse::plain(page.into_bytes())
}

#[get("/metrics")]
async fn metrics(state: &State<AppState>) -> ApiResponse {
    match state.kv.cached_metrics().await {
        Ok(payload) => ApiResponse::plain(payload),
        Err(error) => internal_error_response(error),
    }
}

#[catch(404)]
fn not_found() -> ApiResponse {
    ApiResponse::details(Status::NotFound, "Not found.")
}

#[catch(500)]
fn internal_error() -> ApiResponse {
    ApiResponse::details(Status::InternalServerError, UNKNOWN_ERROR)
}

#[catch(default)]
fn default_catcher(status: Status, _: &Request<'_>) -> ApiResponse {
    ApiResponse::details(status, status.reason().unwrap_or(UNKNOWN_ERROR))
}

/// Build and launch the Rocket server. Returns when Rocket shuts down
/// (SIGINT/SIGTERM or a fatal launch error).
pub async fn launch_rocket(state: AppState, port: u16) -> Result<()> {
    let figment = rocket::Config::figment()
        .merge(("port", port))
        .merge(("address", "0.0.0.0"))
        // Rocket's own Server ident would fight the activity-stream one.
        .merge(("ident", false));

    info!(port, "starting HTTP server");
    rocket::custom(figment)
        .manage(state)
        .mount(
            "/",
            routes![
                activities_post,
                activities_get_new,
                activities_get_existing,
                check,
                metrics,
            ],
        )
        .register("/", catchers![not_found, internal_error, default_catcher])
        .launch()
        .await
        .map_err(|error| anyhow!("HTTP server failed: {}", error))?;

    info!("HTTP server has shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_page_is_up_when_everything_is_green() {
        let page = render_check_page(
            true,
            true,
            &[("first_feed".to_string(), true), ("second_feed".to_string(), true)],
            false,
        );
        assert_eq!(
            page,
            "__UP__\nredis:GREEN\nelasticsearch:GREEN\nfirst_feed:GREEN\nsecond_feed:GREEN\n"
        );
    }

    #[test]
    fn a_red_feed_forces_down_after_the_grace_period() {
        let page = render_check_page(true, true, &[("first_feed".to_string(), false)], false);
        assert!(page.starts_with("__DOWN__\n"));
        assert!(page.ends_with("first_feed:RED\n"));
    }

    #[test]
    fn a_red_feed_does_not_force_down_during_grace() {
        let page = render_check_page(true, true, &[("first_feed".to_string(), false)], true);
        assert!(page.starts_with("__UP__ (IN_STARTUP_GRACE_PERIOD)\n"));
        assert!(page.contains("first_feed:RED\n"));
    }

    #[test]
    fn red_redis_or_elasticsearch_forces_down_even_during_grace() {
        let page = render_check_page(false, true, &[], true);
        assert!(page.starts_with("__DOWN__ (IN_STARTUP_GRACE_PERIOD)\n"));
        assert!(page.contains("redis:RED\n"));

        let page = render_check_page(true, false, &[], true);
        assert!(page.contains("elasticsearch:RED\n"));
        assert!(page.starts_with("__DOWN__"));
    }
}

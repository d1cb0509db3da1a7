//! herd-api — operator REST API for the herd.
//!
//! Callers are identified by the fronting proxy through the
//! `x-remote-user` and `x-remote-groups` headers. Users and groups listed in
//! the `[api]` section of herd.toml get method access; everyone else can
//! act only on subs they own.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/subs?status=a,b` | List sub hostnames, optionally by status |
//! | GET | `/api/v1/subs/{hostname}` | Snapshot of one sub |
//! | POST | `/api/v1/subs/{hostname}/clear-safety-shutoff` | Allow one unsafe update |
//! | POST | `/api/v1/subs/{hostname}/force-disruptive-update` | Allow one disruptive update |
//! | POST | `/api/v1/subs/{hostname}/fast-update` | Converge now, returns progress |
//! | POST | `/api/v1/subs/{hostname}/computed-files` | Deliver computed file content |
//! | GET | `/api/v1/snapshots` | Snapshots of every sub |
//! | GET | `/api/v1/status` | Status counts |
//! | GET | `/api/v1/limits` | Pool and CPU sharer usage |
//! | GET | `/api/v1/updates` | Herd-wide updates-disabled state |
//! | POST | `/api/v1/updates/disable` | Disable updates on every sub |
//! | POST | `/api/v1/updates/enable` | Re-enable updates |
//! | GET/PUT | `/api/v1/default-image` | Image for subs without one |
//! | GET/PUT | `/api/v1/sub-configuration` | Configuration pushed to subs |
//! | GET | `/api/v1/images` | Stored image names |
//! | PUT | `/api/v1/images/{name}` | Store a new image |
//! | POST | `/api/v1/debug/hold-lock` | Hold the node-table lock |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use herd::Herd;
use herd_core::config::ApiSection;
use herd_node::AuthInfo;

pub const REMOTE_USER_HEADER: &str = "x-remote-user";
pub const REMOTE_GROUPS_HEADER: &str = "x-remote-groups";

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub herd: Arc<Herd>,
    pub admins: Arc<ApiSection>,
}

impl ApiState {
    pub fn new(herd: Arc<Herd>, admins: ApiSection) -> Self {
        Self {
            herd,
            admins: Arc::new(admins),
        }
    }

    /// Identify the caller from the proxy headers.
    pub fn auth(&self, headers: &HeaderMap) -> AuthInfo {
        let username = headers
            .get(REMOTE_USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim();
        let groups: Vec<&str> = headers
            .get(REMOTE_GROUPS_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let mut auth = AuthInfo::user(username, &groups);
        auth.have_method_access = (!username.is_empty()
            && self.admins.admin_users.iter().any(|u| u == username))
            || self
                .admins
                .admin_groups
                .iter()
                .any(|g| auth.groups.contains(g));
        auth
    }
}

/// Build the operator API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/subs", get(handlers::list_subs))
        .route("/subs/{hostname}", get(handlers::get_sub))
        .route(
            "/subs/{hostname}/clear-safety-shutoff",
            post(handlers::clear_safety_shutoff),
        )
        .route(
            "/subs/{hostname}/force-disruptive-update",
            post(handlers::force_disruptive_update),
        )
        .route("/subs/{hostname}/fast-update", post(handlers::fast_update))
        .route(
            "/subs/{hostname}/computed-files",
            post(handlers::receive_computed_files),
        )
        .route("/snapshots", get(handlers::list_snapshots))
        .route("/status", get(handlers::status_summary))
        .route("/limits", get(handlers::limits))
        .route("/updates", get(handlers::get_updates))
        .route("/updates/disable", post(handlers::disable_updates))
        .route("/updates/enable", post(handlers::enable_updates))
        .route(
            "/default-image",
            get(handlers::get_default_image).put(handlers::set_default_image),
        )
        .route(
            "/sub-configuration",
            get(handlers::get_sub_configuration).put(handlers::set_sub_configuration),
        )
        .route("/images", get(handlers::list_images))
        .route("/images/{name}", put(handlers::add_image))
        .route("/debug/hold-lock", post(handlers::hold_lock))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

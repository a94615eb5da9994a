//! Shared fixtures for integration tests: an in-process HTTP server with
//! scriptable routes and builders for bundle directories, manifests, and
//! entry documents.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use url::Url;

/// Installs a test-friendly tracing subscriber once per process. Honors
/// `RUST_LOG` so a failing test can be rerun with full engine logs.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A canned response for one URL path.
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    pub etag: Option<String>,
}

/// Minimal update-origin server. Routes are keyed by URL path with the query
/// string stripped; unrouted paths answer 404. Every request path is
/// recorded so tests can assert exactly what was fetched.
pub struct FixtureServer {
    base: Url,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FixtureServer {
    pub fn start() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind fixture server");
        let addr = server.server_addr().to_ip().expect("tcp listener");
        let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::default();
        let requests: Arc<Mutex<Vec<String>>> = Arc::default();

        let thread_routes = Arc::clone(&routes);
        let thread_requests = Arc::clone(&requests);
        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                let path = request.url().split('?').next().unwrap_or("").to_string();
                thread_requests.lock().unwrap().push(path.clone());

                let routes = thread_routes.lock().unwrap();
                let response = match routes.get(&path) {
                    Some(route) => {
                        let mut response = tiny_http::Response::from_data(route.body.clone())
                            .with_status_code(route.status);
                        if let Some(etag) = &route.etag {
                            let value = format!("\"{etag}\"");
                            response.add_header(
                                tiny_http::Header::from_bytes(&b"ETag"[..], value.as_bytes())
                                    .expect("valid header"),
                            );
                        }
                        response
                    }
                    None => tiny_http::Response::from_data(b"not found".to_vec())
                        .with_status_code(404),
                };
                let _ = request.respond(response);
            }
        });

        let base = Url::parse(&format!("http://{addr}/")).expect("valid base url");
        Self { base, routes, requests }
    }

    /// The server origin, suitable as a `ROOT_URL`.
    pub fn root_url(&self) -> Url {
        self.base.clone()
    }

    /// The update endpoint prefix bundles are fetched from.
    pub fn update_url(&self) -> Url {
        self.base.join("__cordova/").unwrap()
    }

    pub fn route(&self, path: &str, route: Route) {
        self.routes.lock().unwrap().insert(path.to_string(), route);
    }

    pub fn serve(&self, path: &str, body: impl Into<Vec<u8>>, etag: Option<&str>) {
        self.route(
            path,
            Route { status: 200, body: body.into(), etag: etag.map(str::to_string) },
        );
    }

    /// Paths requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Drains and returns the request log.
    pub fn take_requests(&self) -> Vec<String> {
        std::mem::take(&mut self.requests.lock().unwrap())
    }
}

/// 40-hex content hash built from a single repeated character.
pub fn fake_hash(fill: char) -> String {
    fill.to_string().repeat(40)
}

pub fn manifest_entry(url: &str, path: &str, hash: &str) -> serde_json::Value {
    serde_json::json!({
        "where": "client",
        "url": url,
        "path": path,
        "type": "js",
        "cacheable": true,
        "hash": hash,
    })
}

pub fn manifest_json(version: &str, compatibility: &str, entries: &[serde_json::Value]) -> Vec<u8> {
    serde_json::json!({
        "format": "web-program-pre1",
        "version": version,
        "cordovaCompatibilityVersions": {"ios": compatibility, "android": compatibility},
        "manifest": entries,
    })
    .to_string()
    .into_bytes()
}

pub fn runtime_config(root_url: &Url, app_id: &str, version: &str) -> serde_json::Value {
    serde_json::json!({
        "ROOT_URL": root_url.as_str(),
        "appId": app_id,
        "autoupdateVersionCordova": version,
    })
}

/// An entry document embedding `config` the way a server renders it.
pub fn index_html(config: &serde_json::Value) -> String {
    let encoded = urlencoding::encode(&config.to_string()).into_owned();
    format!(
        "<html><head><script>__meteor_runtime_config__ = \
         JSON.parse(decodeURIComponent(\"{encoded}\"))</script></head><body></body></html>"
    )
}

/// Writes a loadable bundle directory: `program.json` plus an entry document.
pub fn write_bundle(dir: &Path, manifest: &[u8], index: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("program.json"), manifest).unwrap();
    std::fs::write(dir.join("index.html"), index).unwrap();
}

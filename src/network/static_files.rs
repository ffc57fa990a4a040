//! Static directory routes served ahead of the proxy

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use indexmap::IndexMap;
use tracing::{debug, warn};

use super::HttpHandler;

const INDEX_FILE: &str = "index.html";

/// Outcome of looking a request path up in the static routes
#[derive(Debug, PartialEq, Eq)]
enum Lookup {
    /// No route prefix covers the path
    Unrouted,
    /// A route covers the path; candidate file on disk
    File(PathBuf),
    /// The path tried to escape the route directory
    Forbidden,
}

/// Route prefixes mapped to directories, longest prefix first
#[derive(Debug, Clone, Default)]
pub struct StaticRoutes {
    routes: Vec<(String, PathBuf)>,
}

impl StaticRoutes {
    /// Build the routing table from configuration
    #[must_use]
    pub fn new(routes: &IndexMap<String, PathBuf>) -> Self {
        let mut routes: Vec<_> = routes
            .iter()
            .map(|(prefix, dir)| (prefix.trim_end_matches('/').to_string(), dir.clone()))
            .collect();
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self { routes }
    }

    fn lookup(&self, pathname: &str) -> Lookup {
        for (prefix, dir) in &self.routes {
            let Some(rest) = pathname.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if !rest.is_empty() && !rest.starts_with('/') {
                continue;
            }

            let Ok(rest) = urlencoding::decode(rest.trim_start_matches('/')) else {
                return Lookup::Forbidden;
            };

            let relative = Path::new(rest.as_ref());
            let escapes = rest.contains('\\')
                || relative
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                return Lookup::Forbidden;
            }

            return Lookup::File(dir.join(relative));
        }

        Lookup::Unrouted
    }

    /// Serve `pathname` from a static route
    ///
    /// Returns `None` when the request should go to the proxy instead: no
    /// route matches, the method is not `GET`/`HEAD`, or no file exists.
    pub async fn serve(&self, method: &Method, pathname: &str) -> Option<Response<Full<Bytes>>> {
        if method != Method::GET && method != Method::HEAD {
            return None;
        }

        let mut path = match self.lookup(pathname) {
            Lookup::Unrouted => return None,
            Lookup::Forbidden => {
                warn!("Rejected static path {}", pathname);
                return Some(HttpHandler::create_response(StatusCode::FORBIDDEN, "Forbidden"));
            }
            Lookup::File(path) => path,
        };

        if tokio::fs::metadata(&path).await.is_ok_and(|meta| meta.is_dir()) {
            path.push(INDEX_FILE);
        }

        match tokio::fs::read(&path).await {
            Ok(body) => {
                debug!("Serving static file {}", path.display());
                Some(file_response(&path, body))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                Some(HttpHandler::create_response(StatusCode::FORBIDDEN, "Forbidden"))
            }
            Err(e) => {
                warn!("Failed to read static file {}: {}", path.display(), e);
                Some(HttpHandler::create_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                ))
            }
        }
    }
}

fn file_response(path: &Path, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(guess_mime(path)));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    *response.body_mut() = Full::new(Bytes::from(body));
    response
}

fn guess_mime(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("htm" | "html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "application/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

//! Embedded decoy site
//!
//! Everything that fails authentication lands here and sees a small
//! static site, served identically for any method so probes cannot
//! distinguish the carrier from a boring web server.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

const INDEX_HTML: &str = include_str!("static/index.html");
const STYLE_CSS: &str = include_str!("static/style.css");
const ROBOTS_TXT: &str = include_str!("static/robots.txt");

/// Serve the static file at `path`, or a plain 404
pub(crate) fn serve(path: &str) -> Response<Full<Bytes>> {
    let (body, content_type) = match path {
        "/" | "/index.html" => (INDEX_HTML, "text/html; charset=utf-8"),
        "/style.css" => (STYLE_CSS, "text/css; charset=utf-8"),
        "/robots.txt" => (ROBOTS_TXT, "text/plain; charset=utf-8"),
        _ => {
            let mut resp = Response::new(Full::new(Bytes::from_static(b"404 page not found\n")));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            resp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            return resp;
        }
    };

    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_served_at_root() {
        let resp = serve("/");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_unknown_path_is_404() {
        let resp = serve("/wp-admin/login.php");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

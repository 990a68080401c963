//! Request routing.
//!
//! Matches a request against the ordered route table, resolves the file a
//! static or CGI request refers to, and renders directory indexes.
//!
//! Matching is first-match-wins by string prefix, not longest prefix: a `/`
//! route listed before `/api` swallows every `/api` request. Operators must
//! list specific routes first.

use crate::config::Route;
use crate::protocols::http::Request;
use std::fmt::Write as _;
use std::io;
use std::path::{Component, Path, PathBuf};

/// How a matched request should be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Static,
    Cgi,
    Redirect,
    MethodNotAllowed,
}

/// The route selected for one request.
#[derive(Debug, Clone, Copy)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub kind: MatchKind,
}

/// Ordered route table.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Find the first route whose prefix matches and classify the request.
    ///
    /// Precedence: redirect, then method check, then CGI extension, then static.
    pub fn match_request(&self, request: &Request) -> Option<RouteMatch<'_>> {
        let path = request.path.as_str();
        let route = self.routes.iter().find(|r| path.starts_with(&r.path))?;

        let kind = if route.redirect.is_some() {
            MatchKind::Redirect
        } else if !route.allows(&request.method) {
            MatchKind::MethodNotAllowed
        } else if route
            .cgi_extension
            .as_deref()
            .is_some_and(|ext| path.ends_with(ext))
        {
            MatchKind::Cgi
        } else {
            MatchKind::Static
        };

        Some(RouteMatch { route, kind })
    }
}

/// Map a request path onto the route's document root.
///
/// Returns `None` for routes without a root (redirects). The result may be a
/// directory: the default file is preferred when it exists, otherwise the
/// directory itself is returned for the caller to list or forbid. The path is
/// not yet checked for containment; see [`confine`].
pub fn resolve_file_path(route: &Route, request_path: &str) -> Option<PathBuf> {
    let root = route.root.as_deref()?;
    let mut relative = request_path
        .strip_prefix(route.path.as_str())
        .unwrap_or("")
        .to_string();

    if relative.is_empty() || relative == "/" {
        relative = format!("/{}", route.default_file.as_deref().unwrap_or(""));
    }

    let full = root.join(relative.trim_start_matches('/'));
    if full.is_dir() {
        if let Some(default_file) = &route.default_file {
            let index = full.join(default_file);
            if index.exists() {
                return Some(index);
            }
        }
    }
    Some(full)
}

/// Why a resolved path cannot be served.
#[derive(Debug)]
pub enum Confinement {
    /// Nothing exists at the path.
    NotFound,
    /// The path resolves outside the document root.
    Escapes,
    Io(io::Error),
}

/// Canonicalize `candidate` and require it to stay under `root`.
///
/// Resolves `..` segments and symlinks, so neither can leave the document root.
pub fn confine(root: &Path, candidate: &Path) -> Result<PathBuf, Confinement> {
    let canonical_root = root.canonicalize().map_err(classify_io)?;

    // Reject lexical escapes before touching the target, so probing for
    // files outside the root answers the same regardless of existence.
    if let Ok(suffix) = candidate.strip_prefix(root) {
        let mut depth = 0usize;
        for component in suffix.components() {
            match component {
                Component::ParentDir if depth == 0 => return Err(Confinement::Escapes),
                Component::ParentDir => depth -= 1,
                Component::Normal(_) => depth += 1,
                _ => {}
            }
        }
    }

    let resolved = candidate.canonicalize().map_err(classify_io)?;
    if resolved.starts_with(&canonical_root) {
        Ok(resolved)
    } else {
        Err(Confinement::Escapes)
    }
}

fn classify_io(e: io::Error) -> Confinement {
    if e.kind() == io::ErrorKind::NotFound {
        Confinement::NotFound
    } else {
        Confinement::Io(e)
    }
}

/// MIME type by lowercased file extension.
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("txt") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Render an HTML index of `dir`, entries sorted by name.
///
/// Returns `None` when `dir` is missing, not a directory, or unreadable.
pub fn directory_listing(dir: &Path, request_path: &str) -> Option<Vec<u8>> {
    if !dir.is_dir() {
        return None;
    }

    let mut names: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                name.push('/');
            }
            name
        })
        .collect();
    names.sort();

    let title = escape_html(request_path);
    let mut html = String::with_capacity(256 + names.len() * 64);
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html>\n<head>\n<title>Index of {title}</title>\n</head>\n\
         <body>\n<h1>Index of {title}</h1>\n<hr>\n<ul>\n"
    );

    if request_path != "/" {
        html.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for name in &names {
        let name = escape_html(name);
        let _ = writeln!(html, "<li><a href=\"{name}\">{name}</a></li>");
    }
    html.push_str("</ul>\n<hr>\n</body>\n</html>");

    Some(html.into_bytes())
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http::decode;
    use std::fs;

    fn request(method: &str, path: &str) -> Request {
        decode(format!("{method} {path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
    }

    #[test]
    fn test_first_match_wins() {
        let router = Router::new(vec![
            Route::new("/api", "api"),
            Route::new("/", "public"),
        ]);
        let m = router.match_request(&request("GET", "/api/users")).unwrap();
        assert_eq!(m.route.path, "/api");

        let m = router.match_request(&request("GET", "/index.html")).unwrap();
        assert_eq!(m.route.path, "/");

        // Order is load-bearing: a catch-all listed first wins everything
        let router = Router::new(vec![
            Route::new("/", "public"),
            Route::new("/api", "api"),
        ]);
        let m = router.match_request(&request("GET", "/api/users")).unwrap();
        assert_eq!(m.route.path, "/");
    }

    #[test]
    fn test_no_match() {
        let router = Router::new(vec![Route::new("/static", "public")]);
        assert!(router.match_request(&request("GET", "/other")).is_none());
        // Malformed request lines decode to an empty path, which matches nothing
        assert!(router.match_request(&decode(b"BROKEN\r\n\r\n")).is_none());
    }

    #[test]
    fn test_classification_precedence() {
        let router = Router::new(vec![
            Route::redirect("/old", "/new"),
            Route::new("/cgi-bin", "cgi-bin")
                .with_methods(&["GET", "POST"])
                .with_cgi(".py", None),
            Route::new("/", "public").with_methods(&["GET", "POST"]),
        ]);

        // Redirect regardless of method
        let m = router.match_request(&request("DELETE", "/old/page")).unwrap();
        assert_eq!(m.kind, MatchKind::Redirect);

        let m = router.match_request(&request("DELETE", "/cgi-bin/x.py")).unwrap();
        assert_eq!(m.kind, MatchKind::MethodNotAllowed);

        let m = router.match_request(&request("POST", "/cgi-bin/x.py")).unwrap();
        assert_eq!(m.kind, MatchKind::Cgi);

        let m = router.match_request(&request("GET", "/cgi-bin/readme.txt")).unwrap();
        assert_eq!(m.kind, MatchKind::Static);

        let m = router.match_request(&request("DELETE", "/index.html")).unwrap();
        assert_eq!(m.kind, MatchKind::MethodNotAllowed);
    }

    #[test]
    fn test_resolve_default_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "home").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs").join("index.html"), "docs").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();

        let route = Route::new("/", dir.path()).with_default_file("index.html");

        assert_eq!(
            resolve_file_path(&route, "/").unwrap(),
            dir.path().join("index.html")
        );
        assert_eq!(
            resolve_file_path(&route, "/style.css").unwrap(),
            dir.path().join("style.css")
        );
        assert_eq!(
            resolve_file_path(&route, "/docs").unwrap(),
            dir.path().join("docs").join("index.html")
        );
        // Directory without a default file comes back as the directory itself
        assert_eq!(
            resolve_file_path(&route, "/empty").unwrap(),
            dir.path().join("empty")
        );
    }

    #[test]
    fn test_resolve_strips_prefix() {
        let route = Route::new("/assets", "public");
        assert_eq!(
            resolve_file_path(&route, "/assets/css/site.css").unwrap(),
            Path::new("public").join("css/site.css")
        );
        assert!(resolve_file_path(&Route::redirect("/old", "/new"), "/old").is_none());
    }

    #[test]
    fn test_confine_rejects_traversal() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("public");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("ok.txt"), "ok").unwrap();
        fs::write(outer.path().join("secret.txt"), "secret").unwrap();

        let route = Route::new("/", &root);

        let ok = resolve_file_path(&route, "/ok.txt").unwrap();
        assert!(confine(&root, &ok).is_ok());

        let escape = resolve_file_path(&route, "/../secret.txt").unwrap();
        assert!(matches!(confine(&root, &escape), Err(Confinement::Escapes)));

        let nested = resolve_file_path(&route, "/a/../../secret.txt").unwrap();
        assert!(matches!(confine(&root, &nested), Err(Confinement::Escapes)));

        let missing = resolve_file_path(&route, "/nope.txt").unwrap();
        assert!(matches!(confine(&root, &missing), Err(Confinement::NotFound)));
    }

    #[cfg(unix)]
    #[test]
    fn test_confine_rejects_symlink_escape() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("public");
        fs::create_dir(&root).unwrap();
        fs::write(outer.path().join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(outer.path().join("secret.txt"), root.join("link.txt"))
            .unwrap();

        let link = root.join("link.txt");
        assert!(matches!(confine(&root, &link), Err(Confinement::Escapes)));
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(mime_type(Path::new("index.html")), "text/html");
        assert_eq!(mime_type(Path::new("INDEX.HTM")), "text/html");
        assert_eq!(mime_type(Path::new("app.js")), "application/javascript");
        assert_eq!(mime_type(Path::new("photo.JPeG")), "image/jpeg");
        assert_eq!(mime_type(Path::new("logo.svg")), "image/svg+xml");
        assert_eq!(mime_type(Path::new("archive.tar.gz")), "application/octet-stream");
        assert_eq!(mime_type(Path::new("Makefile")), "application/octet-stream");
        assert_eq!(mime_type(Path::new(".bashrc")), "application/octet-stream");
    }

    #[test]
    fn test_directory_listing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let html = String::from_utf8(directory_listing(dir.path(), "/files/").unwrap()).unwrap();
        assert!(html.contains("<title>Index of /files/</title>"));
        assert!(html.contains("<a href=\"../\">../</a>"));
        assert!(html.contains("<a href=\"sub/\">sub/</a>"));

        let a = html.find("a.txt").unwrap();
        let b = html.find("b.txt").unwrap();
        assert!(a < b, "entries are sorted");

        let root_html = String::from_utf8(directory_listing(dir.path(), "/").unwrap()).unwrap();
        assert!(!root_html.contains("../"));
    }

    #[test]
    fn test_directory_listing_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        fs::write(&file, "x").unwrap();

        assert!(directory_listing(&dir.path().join("nope"), "/nope").is_none());
        assert!(directory_listing(&file, "/file.txt").is_none());
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a&b>\"'"), "&lt;a&amp;b&gt;&quot;&#39;");
    }
}

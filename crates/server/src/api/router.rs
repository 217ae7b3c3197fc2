//! Line-protocol request router
//!
//! Paths are matched in three tiers: exact literals first, then templated
//! paths with `{name}` placeholders, then stream routes (whose handlers
//! take over the whole connection).

use common::Result;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One parsed request line.
pub struct Request {
    /// Values captured by `{name}` placeholders
    pub params: HashMap<String, String>,
    /// Whitespace-split arguments after the path
    pub args: Vec<String>,
    /// Dies when the connection closes
    pub cancel: CancellationToken,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;
pub type Handler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_template(path: &str) -> Vec<Segment> {
    path.split('/')
        .map(|seg| {
            if let Some(name) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Segment::Param(name.to_string())
            } else {
                Segment::Literal(seg.to_ascii_lowercase())
            }
        })
        .collect()
}

fn match_segments(template: &[Segment], path: &str) -> Option<HashMap<String, String>> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != template.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (segment, part) in template.iter().zip(parts) {
        match segment {
            Segment::Literal(lit) => {
                if lit != part {
                    return None;
                }
            }
            Segment::Param(name) => {
                params.insert(name.clone(), part.to_string());
            }
        }
    }
    Some(params)
}

#[derive(Default)]
pub struct Router {
    exact: HashMap<String, Handler>,
    templated: Vec<(Vec<Segment>, Handler)>,
    streams: Vec<Vec<Segment>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Paths containing `{name}` placeholders become
    /// templated routes.
    pub fn register(&mut self, path: &str, handler: Handler) {
        if path.contains('{') {
            self.templated.push((parse_template(path), handler));
        } else {
            self.exact.insert(path.to_ascii_lowercase(), handler);
        }
    }

    /// Register a stream route: a match upgrades the connection instead of
    /// answering a line.
    pub fn register_stream(&mut self, path: &str) {
        self.streams.push(parse_template(path));
    }

    /// Resolve `path` (already lowercased) to a line handler.
    pub fn match_handler(&self, path: &str) -> Option<(Handler, HashMap<String, String>)> {
        if let Some(handler) = self.exact.get(path) {
            return Some((handler.clone(), HashMap::new()));
        }
        for (template, handler) in &self.templated {
            if let Some(params) = match_segments(template, path) {
                return Some((handler.clone(), params));
            }
        }
        None
    }

    /// Resolve `path` to a stream route.
    pub fn match_stream(&self, path: &str) -> Option<HashMap<String, String>> {
        self.streams
            .iter()
            .find_map(|template| match_segments(template, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(|_req| Box::pin(async { Ok(serde_json::Value::Null) }))
    }

    #[test]
    fn test_exact_before_templated() {
        let mut router = Router::new();
        router.register("bus/list", noop());
        router.register("bus/{id}/list", noop());

        let (_, params) = router.match_handler("bus/list").unwrap();
        assert!(params.is_empty());

        let (_, params) = router.match_handler("bus/3/list").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_templated_before_stream() {
        let mut router = Router::new();
        router.register("bus/{id}/add", noop());
        router.register_stream("bus/{busId}/{deviceid}");

        // "bus/1/add" hits the templated route, not the stream template.
        assert!(router.match_handler("bus/1/add").is_some());
        let params = router.match_stream("bus/1/2").unwrap();
        assert_eq!(params.get("busId").map(String::as_str), Some("1"));
        assert_eq!(params.get("deviceid").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_segment_count_must_match() {
        let mut router = Router::new();
        router.register("bus/{id}/add", noop());
        assert!(router.match_handler("bus/1").is_none());
        assert!(router.match_handler("bus/1/add/extra").is_none());
    }

    #[test]
    fn test_unknown_path() {
        let router = Router::new();
        assert!(router.match_handler("nope").is_none());
        assert!(router.match_stream("nope").is_none());
    }
}

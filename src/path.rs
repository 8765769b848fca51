//! Normalized path object: UTF-8, `/`-separated, refcounted.
//!
//! Constructed once per operation and reused across the fsindex walk: the
//! element list is split eagerly so `get`/`set`/`unset` don't re-split the
//! string on every directory hop.

use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathObj {
    inner: Arc<PathInner>,
}

#[derive(Debug, PartialEq, Eq)]
struct PathInner {
    full: String,
    elements: Vec<String>,
}

impl PathObj {
    /// Parse a `/`-separated path. Leading/trailing/duplicate separators
    /// are collapsed; `.` and `..` are treated as literal names (this
    /// layer does no traversal semantics, only splitting).
    pub fn new(path: &str) -> Result<Self, String> {
        let trimmed = path.trim_matches('/');
        let elements: Vec<String> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').filter(|s| !s.is_empty()).map(String::from).collect()
        };
        if elements.iter().any(|e| e.is_empty()) {
            return Err("bad path: empty component".into());
        }
        Ok(Self {
            inner: Arc::new(PathInner { full: elements.join("/"), elements }),
        })
    }

    pub fn root() -> Self {
        Self { inner: Arc::new(PathInner { full: String::new(), elements: Vec::new() }) }
    }

    pub fn is_root(&self) -> bool {
        self.inner.elements.is_empty()
    }

    pub fn full_name(&self) -> &str {
        &self.inner.full
    }

    pub fn elements(&self) -> &[String] {
        &self.inner.elements
    }

    pub fn tail(&self) -> Option<&str> {
        self.inner.elements.last().map(|s| s.as_str())
    }

    pub fn extension(&self) -> &str {
        match self.tail() {
            Some(tail) => match tail.rfind('.') {
                Some(0) | None => "",
                Some(idx) => &tail[idx + 1..],
            },
            None => "",
        }
    }

    /// Parent path, or `None` if this is already the root.
    pub fn parent(&self) -> Option<PathObj> {
        if self.inner.elements.is_empty() {
            return None;
        }
        let parent_elements = &self.inner.elements[..self.inner.elements.len() - 1];
        Some(PathObj {
            inner: Arc::new(PathInner {
                full: parent_elements.join("/"),
                elements: parent_elements.to_vec(),
            }),
        })
    }

    /// A key form with `/` replaced by NUL, for use as a fsindex hash key.
    pub fn nul_joined_key(&self) -> String {
        self.inner.elements.join("\0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_elements() {
        let p = PathObj::new("/a/b/c.txt").unwrap();
        assert_eq!(p.elements(), &["a", "b", "c.txt"]);
        assert_eq!(p.tail(), Some("c.txt"));
        assert_eq!(p.extension(), "txt");
    }

    #[test]
    fn collapses_separators() {
        let p = PathObj::new("//a///b/").unwrap();
        assert_eq!(p.elements(), &["a", "b"]);
    }

    #[test]
    fn root_path() {
        let p = PathObj::new("").unwrap();
        assert!(p.is_root());
        assert_eq!(p.parent(), None);
    }

    #[test]
    fn parent_walks_up() {
        let p = PathObj::new("a/b/c").unwrap();
        let parent = p.parent().unwrap();
        assert_eq!(parent.full_name(), "a/b");
    }

    #[test]
    fn no_extension_for_dotfile_prefix() {
        let p = PathObj::new(".gitignore").unwrap();
        assert_eq!(p.extension(), "");
    }
}

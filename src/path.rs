//! Hierarchical D-Bus object-path construction and validation.

use std::fmt;

use crate::{Error, ErrorKind, Result};

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || !segment.chars().all(is_identifier_char) {
        return Err(Error::new(ErrorKind::InvalidPath, format!("invalid path segment {segment:?}")));
    }
    Ok(())
}

/// An absolute D-Bus object path, guaranteed to be a non-empty sequence of
/// `[A-Za-z0-9_]+` segments joined by `/` and prefixed with `/`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// The D-Bus root path `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parses an absolute path, validating every segment.
    pub fn parse(path: &str) -> Result<Self> {
        if path == "/" {
            return Ok(Self::root());
        }
        if !path.starts_with('/') {
            return Err(Error::new(ErrorKind::InvalidPath, format!("path {path:?} is not absolute")));
        }
        for segment in path[1..].split('/') {
            validate_segment(segment)?;
        }
        Ok(Self(path.to_string()))
    }

    /// Appends a single path segment, returning a new path.
    pub fn append(&self, segment: &str) -> Result<Self> {
        validate_segment(segment)?;
        let mut s = self.0.clone();
        if !s.ends_with('/') {
            s.push('/');
        }
        s.push_str(segment);
        Ok(Self(s))
    }

    /// The final path segment, if any (empty only for the root path).
    pub fn last_segment(&self) -> Option<&str> {
        self.0.rsplit('/').next().filter(|s| !s.is_empty())
    }

    /// The parent of this path, or `None` if this is the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0 == "/" {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Returns whether `other` is this path or a descendant of it.
    pub fn contains(&self, other: &ObjectPath) -> bool {
        if self.0 == "/" {
            return true;
        }
        other.0 == self.0 || other.0.starts_with(&format!("{}/", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&ObjectPath> for dbus::Path<'static> {
    fn from(path: &ObjectPath) -> Self {
        dbus::Path::new(path.0.clone()).expect("ObjectPath invariant guarantees a valid dbus::Path")
    }
}

impl From<ObjectPath> for dbus::Path<'static> {
    fn from(path: ObjectPath) -> Self {
        (&path).into()
    }
}

/// Derives the well-known bus name `com.<service_name>` for a validated
/// service name.
pub fn derived_bus_name(service_name: &str) -> String {
    format!("com.{service_name}")
}

/// Derives the root object path `/com/<service_name with '.' -> '/'>`.
pub fn derived_root_path(service_name: &str) -> ObjectPath {
    let mut path = format!("/com/{}", service_name.replace('.', "/"));
    if path.ends_with('/') {
        path.pop();
    }
    ObjectPath::parse(&path).expect("validated service_name yields a valid root path")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root() {
        assert_eq!(ObjectPath::root().as_str(), "/");
    }

    #[test]
    fn rejects_relative_path() {
        assert!(ObjectPath::parse("com/bzperi").is_err());
    }

    #[test]
    fn rejects_bad_segment() {
        assert!(ObjectPath::parse("/com/bz-peri").is_err());
        assert!(ObjectPath::parse("/com//bzperi").is_err());
    }

    #[test]
    fn append_builds_children() {
        let root = ObjectPath::parse("/com/bzperi").unwrap();
        let svc = root.append("battery").unwrap();
        assert_eq!(svc.as_str(), "/com/bzperi/battery");
        let ch = svc.append("level").unwrap();
        assert_eq!(ch.as_str(), "/com/bzperi/battery/level");
        assert_eq!(ch.parent().unwrap(), svc);
    }

    #[test]
    fn append_rejects_slash_in_segment() {
        let root = ObjectPath::parse("/com/bzperi").unwrap();
        assert!(root.append("a/b").is_err());
    }

    #[test]
    fn derived_names_match_invariant() {
        assert_eq!(derived_bus_name("bzperi"), "com.bzperi");
        assert_eq!(derived_root_path("bzperi").as_str(), "/com/bzperi");
        assert_eq!(derived_bus_name("bzperi.myapp"), "com.bzperi.myapp");
        assert_eq!(derived_root_path("bzperi.myapp").as_str(), "/com/bzperi/myapp");
    }

    #[test]
    fn contains_checks_descendants() {
        let root = ObjectPath::parse("/com/bzperi").unwrap();
        let child = ObjectPath::parse("/com/bzperi/battery").unwrap();
        let unrelated = ObjectPath::parse("/com/other").unwrap();
        assert!(root.contains(&child));
        assert!(root.contains(&root));
        assert!(!root.contains(&unrelated));
    }
}

// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! `PathKey`: the canonical identifier of a file or folder. A slash-rooted,
//! POSIX-style path with its Unicode normalized to a configured form, plus the host-supplied
//! predicate that recognizes temp file names.

use std::fmt;
use std::sync::Arc;

use hybridfs_config::UnicodeNormalizeForm;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// A canonicalized, slash-separated path, rooted at `/`. Two `PathKey`s are equal iff they name
/// the same entity after Unicode normalization — construction is the only place normalization
/// happens, so every other component can compare/hash `PathKey`s directly.
///
/// Serializes as its normalized string form; deserialization trusts that the string was already
/// normalized by whoever wrote it (queue persistence round-trips values this crate itself wrote).
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathKey(String);

impl PathKey {
    /// Normalizes `raw` to the given form and collapses/validates slash-rooted segments.
    pub fn new(raw: &str, form: UnicodeNormalizeForm) -> PathKey {
        let normalized: String = match form {
            UnicodeNormalizeForm::Nfc => raw.nfc().collect(),
            UnicodeNormalizeForm::Nfd => raw.nfd().collect(),
            UnicodeNormalizeForm::Nfkc => raw.nfkc().collect(),
            UnicodeNormalizeForm::Nfkd => raw.nfkd().collect(),
        };
        let mut segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return PathKey("/".to_string());
        }
        let mut out = String::with_capacity(normalized.len() + 1);
        for segment in segments.drain(..) {
            out.push('/');
            out.push_str(segment);
        }
        PathKey(out)
    }

    pub fn root() -> PathKey {
        PathKey("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The final path segment, i.e. the `name` half of a `(parentPath, name)` key, or `""` for
    /// the root.
    pub fn name(&self) -> &str {
        if self.is_root() {
            return "";
        }
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// The parent path. The root is its own parent.
    pub fn parent(&self) -> PathKey {
        if self.is_root() {
            return self.clone();
        }
        match self.0.rfind('/') {
            Some(0) => PathKey::root(),
            Some(idx) => PathKey(self.0[..idx].to_string()),
            None => PathKey::root(),
        }
    }

    pub fn child(&self, name: &str, form: UnicodeNormalizeForm) -> PathKey {
        let joined = if self.is_root() {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.0)
        };
        PathKey::new(&joined, form)
    }

    /// True iff `self` is `other`, or a descendant of it. Used to find every entry whose
    /// `parentPath` equals or is under some prefix being renamed or invalidated.
    pub fn is_under_or_equal(&self, other: &PathKey) -> bool {
        if self.0 == other.0 {
            return true;
        }
        if other.is_root() {
            return true;
        }
        self.0.starts_with(other.as_str()) && self.0.as_bytes().get(other.0.len()) == Some(&b'/')
    }

    /// Every path segment, regardless of name, not just the leaf.
    pub fn any_segment_dotted(&self) -> bool {
        self.0.split('/').any(|s| s.starts_with('.') && !s.is_empty())
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathKey({:?})", self.0)
    }
}

/// Host-supplied predicate recognizing temp file names (editor swap files, atomic-save scratch
/// files, and the like). Wrapped
/// in `Arc` so it can be cloned cheaply into every component that needs it (content cache
/// filtering, hybrid tree merge, request queue enqueue).
#[derive(Clone)]
pub struct TempPredicate(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl TempPredicate {
    pub fn new(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        TempPredicate(Arc::new(f))
    }

    pub fn is_temp(&self, name: &str) -> bool {
        (self.0)(name)
    }

    /// A predicate that never matches, for hosts that don't distinguish temp files.
    pub fn never() -> Self {
        TempPredicate::new(|_| false)
    }
}

impl fmt::Debug for TempPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TempPredicate(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_and_collapses_slashes() {
        let p = PathKey::new("//a//b/c", UnicodeNormalizeForm::Nfc);
        assert_eq!(p.as_str(), "/a/b/c");
    }

    #[test]
    fn name_and_parent() {
        let p = PathKey::new("/a/b/c.txt", UnicodeNormalizeForm::Nfc);
        assert_eq!(p.name(), "c.txt");
        assert_eq!(p.parent().as_str(), "/a/b");
        assert_eq!(p.parent().parent().as_str(), "/a");
        assert_eq!(p.parent().parent().parent().as_str(), "/");
        assert_eq!(p.parent().parent().parent().parent().as_str(), "/");
    }

    #[test]
    fn root_is_its_own_parent() {
        assert_eq!(PathKey::root().parent(), PathKey::root());
    }

    #[test]
    fn is_under_or_equal() {
        let root = PathKey::root();
        let a = PathKey::new("/a", UnicodeNormalizeForm::Nfc);
        let ab = PathKey::new("/a/b", UnicodeNormalizeForm::Nfc);
        let ac = PathKey::new("/ac", UnicodeNormalizeForm::Nfc);
        assert!(ab.is_under_or_equal(&a));
        assert!(a.is_under_or_equal(&a));
        assert!(a.is_under_or_equal(&root));
        assert!(!ac.is_under_or_equal(&a));
    }

    #[test]
    fn dotted_segment_detection() {
        let p = PathKey::new("/a/.git/config", UnicodeNormalizeForm::Nfc);
        assert!(p.any_segment_dotted());
        let q = PathKey::new("/a/b.txt", UnicodeNormalizeForm::Nfc);
        assert!(!q.any_segment_dotted());
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Ref namespaces the reconciler cares about. Everything else in an
/// `ls-remote` listing (`HEAD`, notes, peeled `^{}` entries) is noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefKind {
    Branch,
    Tag,
}

impl RefKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RefKind::Branch => "refs/heads/",
            RefKind::Tag => "refs/tags/",
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKind::Branch => write!(f, "branch"),
            RefKind::Tag => write!(f, "tag"),
        }
    }
}

/// Sorted `{(kind, name) -> oid}` view of one remote's `ls-remote` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefListing {
    tips: BTreeMap<(RefKind, String), String>,
}

impl RefListing {
    /// Parses `git ls-remote` stdout, keeping only branches and tags.
    pub fn parse(ls_remote_stdout: &str) -> Self {
        let mut tips = BTreeMap::new();
        for line in ls_remote_stdout.lines() {
            let mut fields = line.split_whitespace();
            let (Some(oid), Some(refname)) = (fields.next(), fields.next()) else {
                continue;
            };
            if refname.ends_with("^{}") {
                continue;
            }
            let kind = if let Some(name) = refname.strip_prefix("refs/heads/") {
                Some((RefKind::Branch, name))
            } else {
                refname
                    .strip_prefix("refs/tags/")
                    .map(|name| (RefKind::Tag, name))
            };
            if let Some((kind, name)) = kind {
                tips.insert((kind, name.to_string()), oid.to_string());
            }
        }
        RefListing { tips }
    }

    pub fn get(&self, kind: RefKind, name: &str) -> Option<&str> {
        self.tips
            .get(&(kind, name.to_string()))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tips.is_empty()
    }

    /// The sorted canonical text of this listing. Two remotes agree exactly
    /// when their canonical texts are equal; this is also the content of the
    /// sync sentinel file.
    pub fn canonical(&self) -> String {
        let mut text = String::new();
        for ((kind, name), oid) in &self.tips {
            text.push_str(oid);
            text.push('\t');
            text.push_str(kind.prefix());
            text.push_str(name);
            text.push('\n');
        }
        text
    }

    /// Names present in either listing whose tips differ between the two.
    pub fn diff_names(&self, other: &RefListing) -> BTreeSet<(RefKind, String)> {
        let mut names = BTreeSet::new();
        for key in self.tips.keys().chain(other.tips.keys()) {
            if self.tips.get(key) != other.tips.get(key) {
                names.insert(key.clone());
            }
        }
        names
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const LISTING: &str = "\
a111111111111111111111111111111111111111\tHEAD
a111111111111111111111111111111111111111\trefs/heads/main
b222222222222222222222222222222222222222\trefs/heads/topic
c333333333333333333333333333333333333333\trefs/tags/v1
d444444444444444444444444444444444444444\trefs/tags/v1^{}
e555555555555555555555555555555555555555\trefs/notes/commits
";

    #[test]
    fn test_parse_filters_noise() {
        let listing = RefListing::parse(LISTING);
        assert_eq!(listing.get(RefKind::Branch, "main"), Some("a111111111111111111111111111111111111111"));
        assert_eq!(listing.get(RefKind::Branch, "topic"), Some("b222222222222222222222222222222222222222"));
        // Annotated tag keeps the tag object id, not the peeled one
        assert_eq!(listing.get(RefKind::Tag, "v1"), Some("c333333333333333333333333333333333333333"));
        assert_eq!(listing.get(RefKind::Tag, "v1^{}"), None);
        assert_eq!(listing.canonical().lines().count(), 3);
        assert!(!listing.canonical().contains("HEAD"));
        assert!(!listing.canonical().contains("notes"));
    }

    #[test]
    fn test_canonical_round_trips() {
        let listing = RefListing::parse(LISTING);
        let again = RefListing::parse(&listing.canonical());
        assert_eq!(listing, again);
    }

    #[test]
    fn test_diff_names() {
        let a = RefListing::parse(
            "aaaa\trefs/heads/main\nbbbb\trefs/heads/topic\ncccc\trefs/tags/v1\n",
        );
        let b = RefListing::parse(
            "aaaa\trefs/heads/main\ndddd\trefs/heads/topic\neeee\trefs/tags/v2\n",
        );
        let diff = a.diff_names(&b);
        assert!(!diff.contains(&(RefKind::Branch, "main".to_string())));
        assert!(diff.contains(&(RefKind::Branch, "topic".to_string())));
        assert!(diff.contains(&(RefKind::Tag, "v1".to_string())));
        assert!(diff.contains(&(RefKind::Tag, "v2".to_string())));
        assert_eq!(diff.len(), 3);
    }

    #[test]
    fn test_identical_listings_have_no_diff() {
        let a = RefListing::parse("aaaa\trefs/heads/main\n");
        let b = RefListing::parse("aaaa\trefs/heads/main\nffff\tHEAD\n");
        assert!(a.diff_names(&b).is_empty());
    }
}

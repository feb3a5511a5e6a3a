
use anyhow::Result;
use regex::Regex;

/// Three-valued inclusion verdict.
///
/// Filesystems make include/exclude rules awkward: an ancestor directory of
/// an included path must appear in the output even when nothing includes it
/// directly, without pulling in its siblings.  `ParentOfIncluded` marks
/// exactly those paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathVerdict {
    Excluded,
    ParentOfIncluded,
    Included,
}

/// Decides whether a path is included by a set of patterns.
///
/// Each pattern is split on '/' and every piece is compiled as a regex that
/// must match one whole path segment.  Matching starts at the first segment
/// of the path, so `branches/v.*/web` includes `branches/v1/web/index.html`,
/// reports `branches` as a parent, and excludes `test/branches/v1/web`.
pub struct PathFilter {
    includes: Vec<Vec<Regex>>,
}

impl PathFilter {
    /// An empty pattern list includes every path.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<PathFilter> {
        let mut includes = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim_matches('/');
            let segments = pattern
                .split('/')
                .map(|segment| Regex::new(&format!(r"\A{}\z", segment)))
                .collect::<Result<Vec<_>, _>>()?;
            includes.push(segments);
        }
        Ok(PathFilter { includes })
    }

    pub fn check(&self, path: &str) -> PathVerdict {
        if self.includes.is_empty() {
            return PathVerdict::Included;
        }
        let parts: Vec<&str> = path
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .collect();
        let mut verdict = PathVerdict::Excluded;
        for include in &self.includes {
            // Pair segments with pattern pieces, ignoring whichever side is
            // longer: extra path segments are covered by their matched
            // ancestor, extra pattern pieces make this path a parent.
            let matched = parts
                .iter()
                .zip(include.iter())
                .all(|(part, regex)| regex.is_match(part));
            if matched {
                if parts.len() >= include.len() {
                    return PathVerdict::Included;
                }
                // Keep looking; another pattern may fully include this path.
                verdict = PathVerdict::ParentOfIncluded;
            }
        }
        verdict
    }

    pub fn is_included(&self, path: &str) -> bool {
        self.check(path) == PathVerdict::Included
    }

    pub fn is_parent_of_included(&self, path: &str) -> bool {
        self.check(path) == PathVerdict::ParentOfIncluded
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.check(path) == PathVerdict::Excluded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_includes_everything() {
        let filter = PathFilter::new::<&str>(&[]).unwrap();
        assert_eq!(filter.check(""), PathVerdict::Included);
        assert_eq!(filter.check("anything/at/all"), PathVerdict::Included);
    }

    #[test]
    fn literal_pattern() {
        let filter = PathFilter::new(&["foo/bar"]).unwrap();
        assert_eq!(filter.check("foo/bar/baz"), PathVerdict::Included);
        assert_eq!(filter.check("foo/bar"), PathVerdict::Included);
        assert_eq!(filter.check("foo/baz"), PathVerdict::Excluded);
        assert_eq!(filter.check("foo"), PathVerdict::ParentOfIncluded);
        assert!(filter.is_included("foo/bar"));
        assert!(filter.is_parent_of_included("foo"));
        assert!(filter.is_excluded("bar"));
    }

    #[test]
    fn regex_segments_match_one_segment_only() {
        let filter = PathFilter::new(&["fo+/bop"]).unwrap();
        assert_eq!(filter.check("fooooo"), PathVerdict::ParentOfIncluded);
        assert_eq!(filter.check("food"), PathVerdict::Excluded);
        assert_eq!(filter.check("foooooooooo/boppity"), PathVerdict::Excluded);
        assert_eq!(filter.check("fooooo/bop"), PathVerdict::Included);
        assert_eq!(filter.check("foo/bop/de/bop"), PathVerdict::Included);
    }

    #[test]
    fn matching_is_anchored_at_the_first_segment() {
        let filter = PathFilter::new(&["branches/v.*/web"]).unwrap();
        assert_eq!(filter.check("branches/v1/web"), PathVerdict::Included);
        assert_eq!(filter.check("branches/v1/web/index.html"), PathVerdict::Included);
        assert_eq!(filter.check("branches/v1/test/web"), PathVerdict::Excluded);
        assert_eq!(filter.check("test/branches/v1/web"), PathVerdict::Excluded);
        assert_eq!(filter.check("branches/v1"), PathVerdict::ParentOfIncluded);
    }

    #[test]
    fn included_wins_over_parent_across_patterns() {
        let filter = PathFilter::new(&["trunk/deep/path", "trunk"]).unwrap();
        assert_eq!(filter.check("trunk"), PathVerdict::Included);
    }

    #[test]
    fn paths_are_normalized_before_matching() {
        let filter = PathFilter::new(&["/foo/bar/"]).unwrap();
        assert_eq!(filter.check("foo//bar"), PathVerdict::Included);
        assert_eq!(filter.check("./foo/bar"), PathVerdict::Included);
        assert_eq!(filter.check("/foo"), PathVerdict::ParentOfIncluded);
    }

    #[test]
    fn bad_pattern_is_an_error() {
        assert!(PathFilter::new(&["foo/[bar"]).is_err());
    }
}

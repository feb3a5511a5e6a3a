
use std::collections::BTreeSet;
use std::path::Path;
use anyhow::Result;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// A revision number, where `None` stands for HEAD/unspecified.
pub type Rev = Option<u32>;

#[derive(Error, Debug)]
pub enum SvError {
    #[error("{0}")]
    General(String),
    #[error("{}", String::from_utf8_lossy(&.0.stderr))]
    SvnError(std::process::Output),
}

//  Everything except unreserved characters and '/' is percent-encoded,
//  matching what the svn client itself accepts in file:// URLs.
const URL_UNSAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~');

pub fn quote_url(text: &str) -> String {
    utf8_percent_encode(text, URL_UNSAFE).to_string()
}

pub fn unquote_url(text: &str) -> String {
    percent_decode_str(text).decode_utf8_lossy().into_owned()
}

/// Build a file:// URL for a point inside a local repository.
///
/// `path` is the path within the repository (or None for the root) and
/// `rev` becomes an `@N` peg suffix when given.
pub fn file_url(repo: &Path, path: Option<&str>, rev: Rev, quote: bool) -> String {
    let repo = repo.to_string_lossy();
    let mut url = String::from("file://");
    if quote {
        url += &quote_url(&repo);
    } else {
        url += &repo;
    }
    if let Some(path) = path {
        if !path.is_empty() {
            url += "/";
            if quote {
                url += &quote_url(path);
            } else {
                url += path;
            }
        }
    }
    if let Some(rev) = rev {
        url += &format!("@{}", rev);
    }
    url
}

/// Split a REV:PATH flag value on the first colon.
pub fn parse_rev_path(spec: &str) -> Result<(u32, String)> {
    let (rev, path) = spec.split_once(':').ok_or_else(|| {
        SvError::General(format!("'{}' is not of the form REV:PATH", spec))
    })?;
    let rev = rev.parse::<u32>().map_err(|_| {
        SvError::General(format!("'{}' is not a valid revision number", rev))
    })?;
    Ok((rev, path.to_owned()))
}

/// Expand a revision set expression such as "5,7-9,12".
pub fn parse_rev_set(text: &str) -> Result<BTreeSet<u32>> {
    let mut revs = BTreeSet::new();
    for part in text.split(',') {
        let part = part.trim();
        if let Some((first, last)) = part.split_once('-') {
            let first = parse_rev_number(first)?;
            let last = parse_rev_number(last)?;
            revs.extend(first..=last);
        } else {
            revs.insert(parse_rev_number(part)?);
        }
    }
    Ok(revs)
}

fn parse_rev_number(text: &str) -> Result<u32> {
    text.parse::<u32>().map_err(|_| {
        SvError::General(format!("'{}' is not a valid revision number", text)).into()
    })
}

//  The dump stream itself goes to stdout, so all diagnostics go to stderr.
pub fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn file_url_plain() {
        let repo = PathBuf::from("/svn/zoo");
        assert_eq!(file_url(&repo, None, None, true), "file:///svn/zoo");
        assert_eq!(file_url(&repo, Some("trunk/foo"), None, true),
                   "file:///svn/zoo/trunk/foo");
        assert_eq!(file_url(&repo, Some("trunk"), Some(7), true),
                   "file:///svn/zoo/trunk@7");
    }

    #[test]
    fn file_url_empty_path_is_root() {
        let repo = PathBuf::from("/svn/zoo");
        assert_eq!(file_url(&repo, Some(""), Some(3), true), "file:///svn/zoo@3");
    }

    #[test]
    fn file_url_quoting() {
        let repo = PathBuf::from("/svn/my repo");
        assert_eq!(file_url(&repo, Some("a b"), None, true),
                   "file:///svn/my%20repo/a%20b");
        assert_eq!(file_url(&repo, Some("a b"), None, false),
                   "file:///svn/my repo/a b");
    }

    #[test]
    fn unquote_round_trip() {
        assert_eq!(unquote_url(&quote_url("a b/c%d")), "a b/c%d");
    }

    #[test]
    fn rev_path_splits_on_first_colon() {
        assert_eq!(parse_rev_path("12:trunk/a:b").unwrap(),
                   (12, "trunk/a:b".to_owned()));
        assert!(parse_rev_path("trunk").is_err());
        assert!(parse_rev_path("x:trunk").is_err());
    }

    #[test]
    fn rev_set_expansion() {
        let revs = parse_rev_set("5,7-9,12").unwrap();
        assert_eq!(revs.into_iter().collect::<Vec<_>>(), vec![5, 7, 8, 9, 12]);
        assert!(parse_rev_set("5,x").is_err());
    }
}

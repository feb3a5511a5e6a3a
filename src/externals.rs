
//  Parsing of svn:externals property values into normalized descriptions.
//
//  Subversion accepts six line formats (libsvn_wc/externals.c):
//    1) DIR URL
//    2) DIR -r N URL
//    3) DIR -rN URL
//    4) URL DIR
//    5) -r N URL DIR
//    6) -rN URL DIR
//  Old syntax (DIR first) treats N as both the peg and operative revision
//  and allows no @peg.  New syntax treats N as the operative revision and
//  takes an optional @peg suffix on the URL, which may also be relative.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use anyhow::Result;
use indexmap::IndexMap;
use regex::Regex;
use thiserror::Error;
use tracing::warn;
use crate::repos::Repos;
use crate::util::{self, Rev};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unrecognized externals format \"{0}\"")]
    UnknownFormat(String),
    #[error("failed to map {0} to a local repo")]
    UnknownRepo(String),
    #[error("{0}")]
    Invalid(String),
}

/// One line-item of an svn:externals property, normalized.
///
/// `dstpath` is where the external is pinned relative to the holding
/// directory, `srcrepo` is the local filesystem root of the source
/// repository, and `srcpath` the path within it.  `srcpeg` is carried for
/// equality but the reconstruction tools have no notion of peg revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalsDescription {
    pub dstpath: String,
    pub srcrepo: PathBuf,
    pub srcrev: Rev,
    pub srcpath: String,
    pub srcpeg: Rev,
}

impl ExternalsDescription {
    /// Build a description from raw revision tokens.  A missing operative
    /// revision defaults to the peg revision.
    pub fn new(
        dstpath: &str,
        srcrepo: impl Into<PathBuf>,
        srcrev: Option<&str>,
        srcpath: &str,
        srcpeg: Option<&str>,
    ) -> Result<ExternalsDescription, ParseError> {
        let peg = sanitize_rev(srcpeg)?;
        let rev = match srcrev {
            None => peg,
            Some(token) => sanitize_rev(Some(token))?,
        };
        Ok(ExternalsDescription {
            dstpath: dstpath.to_owned(),
            srcrepo: srcrepo.into(),
            srcrev: rev,
            srcpath: srcpath.to_owned(),
            srcpeg: peg,
        })
    }
}

//  'HEAD' (any case) and an absent token both mean unspecified.
fn sanitize_rev(token: Option<&str>) -> Result<Rev, ParseError> {
    match token {
        None => Ok(None),
        Some(token) if token.eq_ignore_ascii_case("HEAD") => Ok(None),
        Some(token) => token
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ParseError::Invalid(format!("invalid revision '{}'", token))),
    }
}

/// Maps URL prefixes to local repository roots.
///
/// Loaded from the `--externals-map` file: one repository per line,
/// `LOCAL_PATH [URL ...]`, `#` comments, URLs optionally percent-encoded.
/// Every local path is implicitly reachable through its own file:// URL.
#[derive(Debug, Default, Clone)]
pub struct ExternalsMap {
    entries: Vec<(String, PathBuf)>,
}

impl ExternalsMap {
    pub fn load(path: &Path) -> Result<ExternalsMap> {
        let text = std::fs::read_to_string(path)?;
        let mut map = ExternalsMap::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(local) = parts.next() else { continue };
            let local = local.trim_end_matches('/');
            map.insert(util::file_url(Path::new(local), None, None, true), local);
            for url in parts {
                map.insert(util::unquote_url(url), local);
            }
        }
        Ok(map)
    }

    pub fn insert(&mut self, url: impl Into<String>, repo: impl Into<PathBuf>) {
        let url = url.into().trim_end_matches('/').to_owned();
        self.entries.push((url, repo.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split a URL into (repo root, path within repo) by longest-prefix
    /// match over the mapped roots.
    pub fn lookup(&self, url: &str) -> Result<(PathBuf, String), ParseError> {
        let mut best: Option<(&String, &PathBuf)> = None;
        for (prefix, repo) in &self.entries {
            if url != prefix && !url.starts_with(&format!("{}/", prefix)) {
                continue;
            }
            if best.map_or(true, |(b, _)| prefix.len() > b.len()) {
                best = Some((prefix, repo));
            }
        }
        let (prefix, repo) = best.ok_or_else(|| ParseError::UnknownRepo(url.to_owned()))?;
        let path = url[prefix.len()..].trim_start_matches('/').to_owned();
        Ok((repo.clone(), path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    RFlag,
    Num,
    RNum,
    Url,
    Dir,
}

fn rev_flag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\A-r(\d+|HEAD)\z").expect("Error parsing -rN regular expression")
    })
}

fn classify(token: &str) -> Token {
    if token == "-r" {
        Token::RFlag
    } else if (!token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
        || token.eq_ignore_ascii_case("HEAD")
    {
        Token::Num
    } else if rev_flag_re().is_match(token) {
        Token::RNum
    } else if token.contains("://") {
        Token::Url
    } else {
        Token::Dir
    }
}

fn signature(types: &[Token]) -> String {
    types
        .iter()
        .map(|t| match t {
            Token::RFlag => "-r",
            Token::Num => "N",
            Token::RNum => "-rN",
            Token::Url => "URL",
            Token::Dir => "DIR",
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse one line of an svn:externals property.
///
/// `main_repo` is the local root of the repository holding the property
/// (no trailing slash), `parent_dir` the directory it is set on.  When the
/// resolved source is the owning repository itself, unspecified revisions
/// become `main_repo_rev - 1`, since a revision cannot copy from itself.
pub fn parse_line(
    main_repo: &Path,
    main_repo_rev: u32,
    parent_dir: &str,
    line: &str,
    map: &ExternalsMap,
) -> Result<ExternalsDescription, ParseError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let types: Vec<Token> = tokens.iter().map(|t| classify(t)).collect();
    use Token::*;
    let mut ed = match types.as_slice() {
        // Format 1: DIR URL
        [Dir, Url] => parse_old_style(tokens[0], tokens[1], None, map)?,
        // Format 2: DIR -r N URL
        [Dir, RFlag, Num, Url] => parse_old_style(tokens[0], tokens[3], Some(tokens[2]), map)?,
        // Format 3: DIR -rN URL
        [Dir, RNum, Url] => {
            parse_old_style(tokens[0], tokens[2], Some(&tokens[1][2..]), map)?
        }
        // Format 4: URL DIR.  A relative URL has no '://', making DIR DIR
        // indistinguishable from it; SVN takes that case as format 4 too.
        [Url, Dir] | [Dir, Dir] => {
            parse_new_style(tokens[1], tokens[0], None, main_repo, parent_dir, map)?
        }
        // Format 5: -r N URL DIR
        [RFlag, Num, Url, Dir] | [RFlag, Num, Dir, Dir] => {
            parse_new_style(tokens[3], tokens[2], Some(tokens[1]), main_repo, parent_dir, map)?
        }
        // Format 6: -rN URL DIR
        [RNum, Url, Dir] | [RNum, Dir, Dir] => parse_new_style(
            tokens[2],
            tokens[1],
            Some(&tokens[0][2..]),
            main_repo,
            parent_dir,
            map,
        )?,
        _ => return Err(ParseError::UnknownFormat(signature(&types))),
    };
    if ed.srcrepo == main_repo {
        if ed.srcrev.is_none() {
            ed.srcrev = Some(main_repo_rev.saturating_sub(1));
        }
        if ed.srcpeg.is_none() {
            ed.srcpeg = Some(main_repo_rev.saturating_sub(1));
        }
    }
    Ok(ed)
}

//  Old-style: the -r argument is both the peg and the operative revision.
fn parse_old_style(
    dir_token: &str,
    url_token: &str,
    rev_token: Option<&str>,
    map: &ExternalsMap,
) -> Result<ExternalsDescription, ParseError> {
    let (repo, path) = map.lookup(url_token)?;
    ExternalsDescription::new(dir_token, repo, rev_token, &path, rev_token)
}

fn parse_new_style(
    dir_token: &str,
    url_token: &str,
    rev_token: Option<&str>,
    main_repo: &Path,
    parent_dir: &str,
    map: &ExternalsMap,
) -> Result<ExternalsDescription, ParseError> {
    let (url, peg) = match url_token.split_once('@') {
        Some((url, peg)) => (url, Some(peg)),
        None => (url_token, None),
    };
    let mut resolved: Option<(PathBuf, String)> = None;
    let mut lookup_url: Option<String> = None;
    if url.starts_with('/') {
        // Covers both '//host/...' and '/path/...'.
        return Err(ParseError::Invalid(
            "scheme-relative and server-relative externals URLs are not supported".to_owned(),
        ));
    } else if let Some(rest) = url.strip_prefix("../") {
        // Relative to the directory the property is set on.
        resolved = Some((
            main_repo.to_path_buf(),
            format!("{}/{}", parent_dir, rest),
        ));
    } else if let Some(rest) = url.strip_prefix("^/") {
        if rest.starts_with("../") {
            // Ascend past the owning repo root, then let the externals map
            // decide where the sibling repository's root actually is.
            let mut rest = rest;
            let mut root = main_repo.to_string_lossy().into_owned();
            while let Some(up) = rest.strip_prefix("../") {
                rest = up;
                if root == "/" {
                    return Err(ParseError::Invalid(
                        "tried to go above the filesystem root while resolving an externals url"
                            .to_owned(),
                    ));
                }
                match root.rfind('/') {
                    Some(0) => root = "/".to_owned(),
                    Some(pos) => root.truncate(pos),
                    None => {
                        return Err(ParseError::Invalid(
                            "tried to go above the filesystem root while resolving an externals url"
                                .to_owned(),
                        ))
                    }
                }
            }
            lookup_url = Some(util::file_url(Path::new(&root), Some(rest), None, true));
        } else {
            // Relative to the root of the owning repository.
            resolved = Some((main_repo.to_path_buf(), rest.to_owned()));
        }
    } else {
        lookup_url = Some(url.to_owned());
    }
    let (repo, path) = match resolved {
        Some(pair) => pair,
        None => map.lookup(lookup_url.as_deref().expect("lookup url set"))?,
    };
    ExternalsDescription::new(dir_token, repo, rev_token, &path, peg)
}

/// Parse a whole svn:externals property value.
///
/// Unparseable lines and lines whose source does not exist are logged and
/// skipped; the rest are keyed by destination path.
pub fn parse(
    main_repo: &Path,
    main_repo_rev: u32,
    parent_dir: &str,
    description: &str,
    map: &ExternalsMap,
    repos: &dyn Repos,
) -> Result<IndexMap<String, ExternalsDescription>> {
    let mut descriptions = IndexMap::new();
    for line in description.split('\n') {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let ed = match parse_line(main_repo, main_repo_rev, parent_dir, line, map) {
            Ok(ed) => ed,
            Err(e) => {
                warn!("{}: {}", e, line);
                continue;
            }
        };
        if repos.source_exists(&ed.srcrepo, ed.srcrev, &ed.srcpath)? {
            descriptions.insert(ed.dstpath.clone(), ed);
        } else {
            warn!("{:?} points to a non-existent location", ed);
        }
    }
    Ok(descriptions)
}

/// The parsed svn:externals property of repo/rev/path; a missing property
/// is an empty set.
pub fn from_rev(
    repo: &Path,
    rev: u32,
    path: &str,
    map: &ExternalsMap,
    repos: &dyn Repos,
) -> Result<IndexMap<String, ExternalsDescription>> {
    let value = repos.externals_property(repo, rev, path)?;
    parse(repo, rev, path, &value, map, repos)
}

/// Classify how the externals of a directory changed between two revisions.
///
/// Returns (added, changed, deleted).  A description whose source
/// repository changed cannot be diffed and becomes a delete plus an add.
/// Peg revisions are ignored unless `include_peg` is set, since the
/// reconstruction tools cannot use them.
pub fn diff(
    old: &IndexMap<String, ExternalsDescription>,
    new: &IndexMap<String, ExternalsDescription>,
    include_peg: bool,
) -> (
    Vec<ExternalsDescription>,
    Vec<(ExternalsDescription, ExternalsDescription)>,
    Vec<ExternalsDescription>,
) {
    let mut added = Vec::new();
    let mut changed = Vec::new();
    let mut deleted = Vec::new();
    for (dstpath, new_descr) in new {
        match old.get(dstpath) {
            Some(old_descr) => {
                if old_descr.srcrepo != new_descr.srcrepo {
                    deleted.push(old_descr.clone());
                    added.push(new_descr.clone());
                } else if old_descr.srcpath != new_descr.srcpath
                    || old_descr.srcrev != new_descr.srcrev
                    || (include_peg && old_descr.srcpeg != new_descr.srcpeg)
                {
                    changed.push((old_descr.clone(), new_descr.clone()));
                }
            }
            None => added.push(new_descr.clone()),
        }
    }
    for (dstpath, old_descr) in old {
        if !new.contains_key(dstpath) {
            deleted.push(old_descr.clone());
        }
    }
    (added, changed, deleted)
}

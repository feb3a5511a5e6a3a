
//  The narrow interface between the filter engine and a local repository,
//  plus its implementation on top of the svn and svnlook command-line
//  tools.  The engine is tested against an in-memory implementation and
//  never spawns a process itself.

use std::env;
use std::ffi::OsStr;
use std::fmt::Display;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::OnceLock;
use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use indexmap::IndexMap;
use roxmltree::Document;
use tracing::debug;
use crate::record::{Action, NodeKind, Record, RecordSource};
use crate::util::{self, Rev, SvError};

/// What happened to a path's contents between two revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentsOp {
    Add,
    Modify,
    Delete,
}

/// One entry of a summarized diff: a contents operation, a properties
/// modification, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathChange {
    pub contents: Option<ContentsOp>,
    pub props_modified: bool,
}

/// Read access to local repositories.
///
/// Revisions are `Rev`; `None` asks for HEAD.  `externals_property` and
/// `source_exists` are allowed to fail underneath (a missing property or
/// path is an answer, not an error); everything else propagates failures.
pub trait Repos {
    /// All nodes at and below `path`, keyed by path relative to it (the
    /// root is the empty string), parents before children.
    fn list_tree(&self, repo: &Path, rev: Rev, path: &str)
        -> Result<IndexMap<String, NodeKind>>;

    /// File contents and their MD5 hex digest.
    fn read_file(&self, repo: &Path, rev: Rev, path: &str) -> Result<(Vec<u8>, String)>;

    fn read_properties(
        &self,
        repo: &Path,
        rev: Rev,
        path: &str,
    ) -> Result<IndexMap<String, String>>;

    /// Summarize changes between two points of the same repository, keyed
    /// by path relative to the diffed roots.  Children of deleted
    /// directories are suppressed.
    fn diff_paths(
        &self,
        repo: &Path,
        old_path: &str,
        old_rev: u32,
        new_path: &str,
        new_rev: u32,
    ) -> Result<IndexMap<String, PathChange>>;

    /// The svn:externals property value, or an empty string when unset.
    fn externals_property(&self, repo: &Path, rev: u32, path: &str) -> Result<String>;

    fn source_exists(&self, repo: &Path, rev: Rev, path: &str) -> Result<bool>;

    /// Depth-first add records recreating repo/rev/srcpath under
    /// `dstpath`, as if the subtree had been added to the dump by hand.
    ///
    /// This is what makes a usable svndumpfilter replacement: a copyfrom
    /// whose source was filtered away cannot be resolved by the loader, so
    /// the copy is turned into plain adds.  Internalizing an external is
    /// the same operation with a different destination.
    fn materialize_subtree(
        &self,
        repo: &Path,
        rev: Rev,
        srcpath: &str,
        dstpath: &str,
        source: RecordSource,
    ) -> Result<Vec<Record>> {
        let mut output = Vec::new();
        for (rel, kind) in self.list_tree(repo, rev, srcpath)? {
            let full = if rel.is_empty() {
                srcpath.to_owned()
            } else if srcpath.is_empty() {
                rel.clone()
            } else {
                format!("{}/{}", srcpath, rel)
            };
            let node_path = if rel.is_empty() {
                dstpath.to_owned()
            } else {
                format!("{}/{}", dstpath, rel)
            };
            let mut record = Record::node(&node_path, Action::Add, kind, source);
            if kind == NodeKind::File {
                let (text, md5_hex) = self.read_file(repo, rev, &full)?;
                record.set_header("Text-content-md5", md5_hex);
                record.text = Some(text);
            }
            let props = self.read_properties(repo, rev, &full)?;
            record.props = Some(props.into_iter().map(|(k, v)| (k, Some(v))).collect());
            output.push(record);
        }
        Ok(output)
    }
}

//  Names of the external tools, overridable through the environment.
fn svn_cmd() -> &'static String {
    static SVN_CMD: OnceLock<String> = OnceLock::new();
    SVN_CMD.get_or_init(|| env::var("SVDUMP_SVN").unwrap_or("svn".to_string()))
}

fn svnlook_cmd() -> &'static String {
    static SVNLOOK_CMD: OnceLock<String> = OnceLock::new();
    SVNLOOK_CMD.get_or_init(|| env::var("SVDUMP_SVNLOOK").unwrap_or("svnlook".to_string()))
}

//  Runs a tool to completion; stdout is fully drained before the exit
//  code is visible to the caller.
fn run_tool<S>(cmd: &str, args: &[S]) -> Result<Output>
where
    S: AsRef<OsStr> + Display,
{
    debug!(
        "executing {} {}",
        cmd,
        args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(" ")
    );
    Ok(Command::new(cmd).args(args).output()?)
}

fn require_success(output: Output) -> Result<Vec<u8>> {
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(SvError::SvnError(output).into())
    }
}

/// Repository access through the svn and svnlook binaries.
pub struct SvnRepos;

impl Repos for SvnRepos {
    fn list_tree(
        &self,
        repo: &Path,
        rev: Rev,
        path: &str,
    ) -> Result<IndexMap<String, NodeKind>> {
        let mut args = vec!["tree".to_owned(), "--full-paths".to_owned()];
        if let Some(rev) = rev {
            args.push(format!("-r{}", rev));
        }
        args.push(repo.to_string_lossy().into_owned());
        args.push(path.to_owned());
        let stdout = require_success(run_tool(svnlook_cmd(), &args)?)?;
        Ok(parse_tree(path, &stdout))
    }

    fn read_file(&self, repo: &Path, rev: Rev, path: &str) -> Result<(Vec<u8>, String)> {
        let mut args = vec!["cat".to_owned()];
        if let Some(rev) = rev {
            args.push(format!("-r{}", rev));
        }
        args.push(repo.to_string_lossy().into_owned());
        args.push(path.to_owned());
        let stdout = require_success(run_tool(svnlook_cmd(), &args)?)?;
        let digest = format!("{:x}", md5::compute(&stdout));
        Ok((stdout, digest))
    }

    fn read_properties(
        &self,
        repo: &Path,
        rev: Rev,
        path: &str,
    ) -> Result<IndexMap<String, String>> {
        let url = util::file_url(repo, Some(path), rev, true);
        let args = vec![
            "proplist".to_owned(),
            "-v".to_owned(),
            "--xml".to_owned(),
            url,
        ];
        let stdout = require_success(run_tool(svn_cmd(), &args)?)?;
        parse_proplist_xml(&stdout)
    }

    fn diff_paths(
        &self,
        repo: &Path,
        old_path: &str,
        old_rev: u32,
        new_path: &str,
        new_rev: u32,
    ) -> Result<IndexMap<String, PathChange>> {
        let args = vec![
            "diff".to_owned(),
            "--summarize".to_owned(),
            format!("--old={}", util::file_url(repo, Some(old_path), Some(old_rev), true)),
            format!("--new={}", util::file_url(repo, Some(new_path), Some(new_rev), true)),
        ];
        let stdout = require_success(run_tool(svn_cmd(), &args)?)?;
        // The output paths are %-quoted URLs; the unquoted prefix length
        // tells how much to strip once each line is decoded.
        let prefix_len = util::file_url(repo, Some(old_path), None, false).len() + 1;
        parse_diff_summary(prefix_len, &stdout)
    }

    fn externals_property(&self, repo: &Path, rev: u32, path: &str) -> Result<String> {
        let args = vec![
            "propget".to_owned(),
            format!("-r{}", rev),
            repo.to_string_lossy().into_owned(),
            "svn:externals".to_owned(),
            path.to_owned(),
        ];
        let output = run_tool(svnlook_cmd(), &args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            // The property not existing is an answer, not a failure.
            debug!("svnlook propget exited {:?} for {}", output.status.code(), path);
            Ok(String::new())
        }
    }

    fn source_exists(&self, repo: &Path, rev: Rev, path: &str) -> Result<bool> {
        // svn info can be very slow for old revisions; ls is enough since
        // only the exit code matters.
        let args = vec!["ls".to_owned(), util::file_url(repo, Some(path), rev, true)];
        let output = run_tool(svn_cmd(), &args)?;
        if !output.status.success() {
            debug!("svn ls exited {:?} for {}", output.status.code(), path);
        }
        Ok(output.status.success())
    }
}

//  svnlook tree --full-paths output: one path per line, directories with a
//  trailing slash, the listed root first.
fn parse_tree(srcpath: &str, output: &[u8]) -> IndexMap<String, NodeKind> {
    let text = String::from_utf8_lossy(output);
    let mut nodes = IndexMap::new();
    let root_dir = format!("{}/", srcpath);
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        if line == root_dir || (srcpath.is_empty() && line == "/") {
            nodes.insert(String::new(), NodeKind::Dir);
            continue;
        }
        if line == srcpath {
            nodes.insert(String::new(), NodeKind::File);
            continue;
        }
        let rel = if srcpath.is_empty() {
            line
        } else {
            match line.strip_prefix(root_dir.as_str()) {
                Some(rel) => rel,
                None => continue,
            }
        };
        match rel.strip_suffix('/') {
            Some(dir) => nodes.insert(dir.to_owned(), NodeKind::Dir),
            None => nodes.insert(rel.to_owned(), NodeKind::File),
        };
    }
    nodes
}

//  svn proplist -v --xml output; binary values arrive base64-encoded.
fn parse_proplist_xml(output: &[u8]) -> Result<IndexMap<String, String>> {
    let text = String::from_utf8_lossy(output);
    let doc = Document::parse(&text)?;
    let mut props = IndexMap::new();
    for node in doc.descendants().filter(|n| n.has_tag_name("property")) {
        let Some(name) = node.attribute("name") else {
            continue;
        };
        let raw = node.text().unwrap_or("");
        let value = if node.attribute("encoding") == Some("base64") {
            let decoded = BASE64
                .decode(raw.trim().as_bytes())
                .map_err(|e| SvError::General(format!("invalid base64 property value: {}", e)))?;
            String::from_utf8_lossy(&decoded).into_owned()
        } else {
            raw.to_owned()
        };
        props.insert(name.to_owned(), value);
    }
    Ok(props)
}

//  svn diff --summarize output: two status columns, whitespace, a %-quoted
//  URL.  Deletes are collected separately so children of deleted
//  directories can be folded into their parent.
fn parse_diff_summary(prefix_len: usize, output: &[u8]) -> Result<IndexMap<String, PathChange>> {
    let text = String::from_utf8_lossy(output);
    let mut deleted: IndexMap<String, PathChange> = IndexMap::new();
    let mut changes: IndexMap<String, PathChange> = IndexMap::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let bytes = line.as_bytes();
        let contents = match bytes.first() {
            Some(b' ') => None,
            Some(b'A') => Some(ContentsOp::Add),
            Some(b'M') => Some(ContentsOp::Modify),
            Some(b'D') => Some(ContentsOp::Delete),
            _ => {
                return Err(SvError::General(format!(
                    "unknown contents operation in svn diff line '{}'",
                    line
                ))
                .into())
            }
        };
        let props_modified = match bytes.get(1) {
            Some(b' ') | None => false,
            Some(b'M') => true,
            _ => {
                return Err(SvError::General(format!(
                    "unknown properties operation in svn diff line '{}'",
                    line
                ))
                .into())
            }
        };
        let url = match line.find("file://") {
            Some(pos) => &line[pos..],
            None => {
                return Err(SvError::General(format!(
                    "missing file:// URL in svn diff line '{}'",
                    line
                ))
                .into())
            }
        };
        let decoded = util::unquote_url(url);
        let path = if decoded.len() > prefix_len {
            decoded[prefix_len..].to_owned()
        } else {
            String::new()
        };
        let change = PathChange { contents, props_modified };
        if contents == Some(ContentsOp::Delete) {
            deleted.insert(path, change);
        } else {
            changes.insert(path, change);
        }
    }
    let deleted_paths: Vec<String> = deleted.keys().cloned().collect();
    for path in deleted_paths {
        if let Some(pos) = path.rfind('/') {
            if deleted.contains_key(&path[..pos]) {
                continue;
            }
        }
        let change = deleted[&path];
        changes.insert(path, change);
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_parse_directory_root() {
        let output = b"trunk/foo/\ntrunk/foo/file1\ntrunk/foo/subdir/\ntrunk/foo/subdir/x\n";
        let nodes = parse_tree("trunk/foo", output);
        assert_eq!(nodes[""], NodeKind::Dir);
        assert_eq!(nodes["file1"], NodeKind::File);
        assert_eq!(nodes["subdir"], NodeKind::Dir);
        assert_eq!(nodes["subdir/x"], NodeKind::File);
        assert_eq!(nodes.len(), 4);
    }

    #[test]
    fn tree_parse_file_root() {
        let nodes = parse_tree("trunk/foo.txt", b"trunk/foo.txt\n");
        assert_eq!(nodes[""], NodeKind::File);
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn tree_parse_repo_root() {
        let nodes = parse_tree("", b"/\nfoo/\nfoo/bar\n");
        assert_eq!(nodes[""], NodeKind::Dir);
        assert_eq!(nodes["foo"], NodeKind::Dir);
        assert_eq!(nodes["foo/bar"], NodeKind::File);
    }

    #[test]
    fn proplist_xml_parse() {
        let xml = br#"<?xml version="1.0"?>
<properties>
<target path="file:///svn/zoo/trunk">
<property name="svn:externals">lib http://host/other/lib</property>
<property name="blob" encoding="base64">aGVsbG8=</property>
</target>
</properties>"#;
        let props = parse_proplist_xml(xml).unwrap();
        assert_eq!(props["svn:externals"], "lib http://host/other/lib");
        assert_eq!(props["blob"], "hello");
    }

    #[test]
    fn diff_summary_parse() {
        // prefix is file:///svn/zoo/old plus the trailing slash
        let prefix_len = "file:///svn/zoo/old/".len();
        let output = b"M       file:///svn/zoo/old/modified\n\
                       A       file:///svn/zoo/old/added\n\
                       MM      file:///svn/zoo/old/both\n\
                       \x20M      file:///svn/zoo/old/props%20only\n";
        let changes = parse_diff_summary(prefix_len, output).unwrap();
        assert_eq!(
            changes["modified"],
            PathChange { contents: Some(ContentsOp::Modify), props_modified: false }
        );
        assert_eq!(
            changes["added"],
            PathChange { contents: Some(ContentsOp::Add), props_modified: false }
        );
        assert_eq!(
            changes["both"],
            PathChange { contents: Some(ContentsOp::Modify), props_modified: true }
        );
        assert_eq!(
            changes["props only"],
            PathChange { contents: None, props_modified: true }
        );
    }

    #[test]
    fn diff_summary_suppresses_children_of_deleted_dirs() {
        let prefix_len = "file:///svn/zoo/old/".len();
        let output = b"D       file:///svn/zoo/old/dir\n\
                       D       file:///svn/zoo/old/dir/child\n\
                       D       file:///svn/zoo/old/dir/child/grandchild\n\
                       D       file:///svn/zoo/old/lonely\n";
        let changes = parse_diff_summary(prefix_len, output).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes["dir"],
            PathChange { contents: Some(ContentsOp::Delete), props_modified: false }
        );
        assert!(changes.contains_key("lonely"));
    }

    #[test]
    fn diff_summary_rejects_unknown_ops() {
        assert!(parse_diff_summary(0, b"X       file:///svn/zoo/x\n").is_err());
        assert!(parse_diff_summary(0, b"AX      file:///svn/zoo/x\n").is_err());
        assert!(parse_diff_summary(0, b"A       no-url-here\n").is_err());
    }

    //  In-memory adapter exercising the provided materialize_subtree.
    struct MemRepos {
        nodes: IndexMap<String, (NodeKind, Vec<u8>, Vec<(String, String)>)>,
    }

    impl Repos for MemRepos {
        fn list_tree(
            &self,
            _repo: &Path,
            _rev: Rev,
            path: &str,
        ) -> Result<IndexMap<String, NodeKind>> {
            let mut out = IndexMap::new();
            for (node, (kind, _, _)) in &self.nodes {
                let rel = if node == path {
                    String::new()
                } else if path.is_empty() {
                    node.clone()
                } else if let Some(rel) = node.strip_prefix(&format!("{}/", path)) {
                    rel.to_owned()
                } else {
                    continue;
                };
                out.insert(rel, *kind);
            }
            Ok(out)
        }

        fn read_file(&self, _repo: &Path, _rev: Rev, path: &str) -> Result<(Vec<u8>, String)> {
            let (_, text, _) = &self.nodes[path];
            Ok((text.clone(), format!("{:x}", md5::compute(text))))
        }

        fn read_properties(
            &self,
            _repo: &Path,
            _rev: Rev,
            path: &str,
        ) -> Result<IndexMap<String, String>> {
            let (_, _, props) = &self.nodes[path];
            Ok(props.iter().cloned().collect())
        }

        fn diff_paths(
            &self,
            _repo: &Path,
            _old_path: &str,
            _old_rev: u32,
            _new_path: &str,
            _new_rev: u32,
        ) -> Result<IndexMap<String, PathChange>> {
            unimplemented!()
        }

        fn externals_property(&self, _repo: &Path, _rev: u32, _path: &str) -> Result<String> {
            unimplemented!()
        }

        fn source_exists(&self, _repo: &Path, _rev: Rev, _path: &str) -> Result<bool> {
            unimplemented!()
        }
    }

    #[test]
    fn materialize_reparents_and_checksums() {
        let mut nodes = IndexMap::new();
        nodes.insert("".to_owned(), (NodeKind::Dir, Vec::new(), Vec::new()));
        nodes.insert(
            "foo".to_owned(),
            (NodeKind::Dir, Vec::new(), vec![("fooprop".to_owned(), "fooval".to_owned())]),
        );
        nodes.insert(
            "foo/file1".to_owned(),
            (
                NodeKind::File,
                b"file1_contents".to_vec(),
                vec![("file1prop".to_owned(), "file1val".to_owned())],
            ),
        );
        nodes.insert(
            "foo/file2".to_owned(),
            (NodeKind::File, b"file2_contents".to_vec(), Vec::new()),
        );
        nodes.insert("foo/subdir".to_owned(), (NodeKind::Dir, Vec::new(), Vec::new()));
        let repos = MemRepos { nodes };

        let records = repos
            .materialize_subtree(Path::new("/svn/zoo"), Some(5), "", "bar", RecordSource::Copy)
            .unwrap();
        assert_eq!(records.len(), 5);
        let root = &records[0];
        assert_eq!(root.header("Node-path"), Some("bar"));
        assert_eq!(root.header("Node-kind"), Some("dir"));
        assert_eq!(root.header("Node-action"), Some("add"));
        assert!(root.props.as_ref().unwrap().is_empty());
        assert!(root.text.is_none());
        assert_eq!(root.source, RecordSource::Copy);
        let foo = &records[1];
        assert_eq!(foo.header("Node-path"), Some("bar/foo"));
        assert_eq!(
            foo.props.as_ref().unwrap()["fooprop"],
            Some("fooval".to_owned())
        );
        let file1 = &records[2];
        assert_eq!(file1.header("Node-path"), Some("bar/foo/file1"));
        assert_eq!(file1.header("Node-kind"), Some("file"));
        assert_eq!(
            file1.header("Text-content-md5"),
            Some(format!("{:x}", md5::compute(b"file1_contents")).as_str())
        );
        assert_eq!(file1.text.as_deref(), Some(b"file1_contents".as_slice()));
        assert_eq!(
            file1.props.as_ref().unwrap()["file1prop"],
            Some("file1val".to_owned())
        );
    }

    #[test]
    fn materialize_single_file_subtree() {
        let mut nodes = IndexMap::new();
        nodes.insert("foo/bar".to_owned(), (NodeKind::File, b"foo".to_vec(), Vec::new()));
        let repos = MemRepos { nodes };
        let records = repos
            .materialize_subtree(
                Path::new("/svn/zoo"),
                Some(5),
                "foo/bar",
                "baz",
                RecordSource::Externals,
            )
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header("Node-path"), Some("baz"));
        assert_eq!(records[0].source, RecordSource::Externals);
    }
}

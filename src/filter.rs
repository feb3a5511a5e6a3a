
//  The revision-at-a-time pipeline: read a revision's records, filter them
//  by path, dereference copies whose sources were filtered away,
//  internalize externals, flatten duplicate actions, and emit.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use anyhow::Result;
use indexmap::IndexMap;
use tracing::{debug, warn};
use crate::externals::{self, ExternalsDescription, ExternalsMap};
use crate::flatten::flatten_multiple_actions;
use crate::pathfilter::{PathFilter, PathVerdict};
use crate::record::{self, Action, NodeKind, Record, RecordSource};
use crate::repos::{ContentsOp, Repos};
use crate::util::SvError;

/// Filters one dump stream.  The streams are borrowed, never closed.
pub struct Filter {
    /// Local root of the repository the dump came from; required as soon
    /// as a copy or external has to be synthesized from it.
    pub repo: Option<PathBuf>,
    pub paths: PathFilter,
    /// Omit revisions whose action list filtered down to nothing.
    pub drop_empty_revs: bool,
    /// Input-to-output revision renumbering, populated while filtering.
    /// Only meaningful together with `drop_empty_revs`; an empty map
    /// rewrites nothing.
    pub revmap: Option<HashMap<u32, u32>>,
    /// Enables externals internalization when non-empty.
    pub externals_map: Option<ExternalsMap>,
    /// Properties stripped from every emitted record.
    pub delete_properties: Vec<String>,
    /// Revisions whose actions are dropped wholesale.
    pub truncate_revs: HashSet<u32>,
    /// Per-revision paths whose actions are dropped.
    pub drop_actions: HashMap<u32, HashSet<String>>,
    /// Per-revision paths that get a delete appended.
    pub force_delete: HashMap<u32, Vec<String>>,
    pub repos: Box<dyn Repos>,
}

impl Filter {
    pub fn new(repo: Option<PathBuf>, paths: PathFilter, repos: Box<dyn Repos>) -> Filter {
        Filter {
            repo,
            paths,
            drop_empty_revs: false,
            revmap: None,
            externals_map: None,
            delete_properties: Vec::new(),
            truncate_revs: HashSet::new(),
            drop_actions: HashMap::new(),
            force_delete: HashMap::new(),
            repos,
        }
    }

    fn repo(&self) -> Result<&Path> {
        self.repo.as_deref().ok_or_else(|| {
            SvError::General(
                "--repo is required to synthesize records from the repository".to_owned(),
            )
            .into()
        })
    }

    /// Filter the whole dump stream from `input` to `output`.
    pub fn run(&mut self, input: &mut dyn BufRead, output: &mut dyn Write) -> Result<()> {
        // The dump-format header passes through unchanged.
        let mut record = match record::read_record(input)? {
            Some(record) => record,
            None => return Ok(()),
        };
        while record.header("Revision-number").is_none() {
            record.write(output, self.revmap.as_ref())?;
            record = match record::read_record(input)? {
                Some(record) => record,
                None => return Ok(()),
            };
        }

        let mut revhdr = Some(record);
        let mut current_output_rev = 0u32;
        while let Some(mut hdr) = revhdr.take() {
            let mut contents = Vec::new();
            let next = loop {
                match record::read_record(input)? {
                    None => break None,
                    Some(record) if record.header("Revision-number").is_some() => {
                        break Some(record)
                    }
                    Some(record) => contents.push(record),
                }
            };
            let revision_number = hdr.revision_number().expect("revision header")?;
            let mut contents = self.filter_rev(revision_number, contents)?;

            // Only written revisions advance the output numbering, so a
            // dropped revision maps to the last written number and copies
            // from it resolve to the nearest surviving ancestor.
            let should_write = !contents.is_empty() || !self.drop_empty_revs;
            if should_write {
                current_output_rev += 1;
            }
            if self.drop_empty_revs {
                if let Some(revmap) = self.revmap.as_mut() {
                    revmap.insert(revision_number, current_output_rev);
                }
            }
            if should_write {
                hdr.write(output, self.revmap.as_ref())?;
                for record in &mut contents {
                    record.write(output, self.revmap.as_ref())?;
                }
            }
            revhdr = next;
        }
        Ok(())
    }

    fn filter_rev(&self, revision_number: u32, contents: Vec<Record>) -> Result<Vec<Record>> {
        debug!("filtering r{}", revision_number);
        if self.truncate_revs.contains(&revision_number) {
            warn!("truncating known bad revision r{}", revision_number);
            return Ok(Vec::new());
        }
        let mut new_contents = Vec::new();
        for record in contents {
            if let Some(dropped) = self.drop_actions.get(&revision_number) {
                if dropped.contains(record.node_path()?) {
                    continue;
                }
            }
            new_contents.extend(self.filter_record(revision_number, record)?);
        }
        flatten_multiple_actions(revision_number, &mut new_contents)?;
        if let Some(paths) = self.force_delete.get(&revision_number) {
            for path in paths {
                new_contents.push(Record::delete(path, RecordSource::Dump));
            }
        }
        // Property removal runs last so synthesized records are covered.
        if !self.delete_properties.is_empty() {
            for record in &mut new_contents {
                for prop in &self.delete_properties {
                    record.delete_property(prop);
                }
            }
        }
        Ok(new_contents)
    }

    fn filter_record(&self, revision_number: u32, record: Record) -> Result<Vec<Record>> {
        let mut record = record;
        let path = record.node_path()?.to_owned();
        match self.paths.check(&path) {
            PathVerdict::Excluded => return Ok(Vec::new()),
            PathVerdict::ParentOfIncluded => {
                // Possible parents of included paths are coerced into
                // propertyless directories, since included children may
                // yet be added below them.
                match record.action()? {
                    Action::Change => return Ok(Vec::new()),
                    Action::Add | Action::Replace => {
                        if record.header("Node-kind") == Some("file") {
                            let action = record.action()?;
                            record = Record::node(&path, action, NodeKind::Dir, record.source);
                        } else {
                            record.props = None;
                        }
                    }
                    Action::Delete => {}
                }
            }
            PathVerdict::Included => {}
        }
        let copyless_records = if record.header("Node-copyfrom-path").is_some() {
            self.fix_copy_from(record)?
        } else {
            vec![record]
        };
        let enabled = self.externals_map.as_ref().is_some_and(|map| !map.is_empty());
        let mut output = Vec::new();
        for record in copyless_records {
            if !enabled || record.does_not_affect_externals() {
                output.push(record);
            } else {
                output.extend(self.internalize_externals(revision_number, record)?);
            }
        }
        Ok(output)
    }

    /// Replace copies from filtered-out sources with adds.
    fn fix_copy_from(&self, mut record: Record) -> Result<Vec<Record>> {
        let dstpath = record.node_path()?.to_owned();
        let srcpath = record
            .header("Node-copyfrom-path")
            .expect("checked by caller")
            .to_owned();
        let srcrev: u32 = {
            let value = record.header("Node-copyfrom-rev").ok_or_else(|| {
                SvError::General(format!("copy of {} has no Node-copyfrom-rev", dstpath))
            })?;
            value.parse().map_err(|_| {
                SvError::General(format!("invalid Node-copyfrom-rev '{}'", value))
            })?
        };

        if self.paths.is_included(&srcpath) {
            // The source survives filtering; the loader can resolve it.
            return Ok(vec![record]);
        }
        if self.paths.is_parent_of_included(&dstpath) && srcpath == dstpath {
            // Copying a parent placeholder onto itself: the source was
            // filtered exactly like the destination, so the copy holds.
            return Ok(vec![record]);
        }

        let repo = self.repo()?;
        let mut output = Vec::new();
        if self.paths.is_included(&dstpath) {
            output.extend(self.repos.materialize_subtree(
                repo,
                Some(srcrev),
                &srcpath,
                &dstpath,
                RecordSource::Copy,
            )?);
        } else {
            // Only parts of the copied tree are wanted.
            let (empty_dirs, recursive_dirs) =
                self.filter_copied_paths(srcrev, &srcpath, &dstpath)?;
            for dir in empty_dirs {
                let dir_path = if dir.is_empty() {
                    dstpath.clone()
                } else {
                    format!("{}/{}", dstpath, dir)
                };
                output.push(Record::node(
                    &dir_path,
                    Action::Add,
                    NodeKind::Dir,
                    RecordSource::Copy,
                ));
            }
            for dir in recursive_dirs {
                let (src, dst) = if dir.is_empty() {
                    (srcpath.clone(), dstpath.clone())
                } else {
                    (format!("{}/{}", srcpath, dir), format!("{}/{}", dstpath, dir))
                };
                output.extend(self.repos.materialize_subtree(
                    repo,
                    Some(srcrev),
                    &src,
                    &dst,
                    RecordSource::Copy,
                )?);
            }
        }
        if record.text.is_some() {
            // The copy carried new contents on top; keep them as a change
            // following the synthesized adds.
            record.set_header("Node-action", Action::Change.as_str());
            record.delete_header("Node-copyfrom-rev");
            record.delete_header("Node-copyfrom-path");
            record.delete_header("Text-copy-source-md5");
            record.delete_header("Text-copy-source-sha1");
            output.push(record);
        }
        Ok(output)
    }

    /// Sort the copied subtree into directories to create empty and
    /// subtrees to import recursively, per the path filter.
    fn filter_copied_paths(
        &self,
        srcrev: u32,
        srcpath: &str,
        dstpath: &str,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let mut empty_dirs = Vec::new();
        let mut recursive_dirs: Vec<String> = Vec::new();
        let nodes = self.repos.list_tree(self.repo()?, Some(srcrev), srcpath)?;
        let mut paths: Vec<String> = nodes.into_keys().collect();
        paths.sort(); // parents sort before their children
        for path in paths {
            let full_path = if path.is_empty() {
                dstpath.to_owned()
            } else {
                format!("{}/{}", dstpath, path)
            };
            match self.paths.check(&full_path) {
                PathVerdict::ParentOfIncluded => empty_dirs.push(path),
                PathVerdict::Included => {
                    let covered = recursive_dirs
                        .iter()
                        .any(|parent| path.starts_with(&format!("{}/", parent)));
                    if !covered {
                        recursive_dirs.push(path);
                    }
                }
                PathVerdict::Excluded => {}
            }
        }
        Ok((empty_dirs, recursive_dirs))
    }

    /// Splice the content referenced by svn:externals into the stream.
    ///
    /// The incoming record is always kept; the svn:externals property
    /// itself is not rewritten, so a loader sees both the literal files
    /// and the live external.
    fn internalize_externals(
        &self,
        revision_number: u32,
        record: Record,
    ) -> Result<Vec<Record>> {
        let repo = self.repo()?;
        let map = self.externals_map.as_ref().expect("enabled by caller");
        let path = record.node_path()?.to_owned();
        let new_value = record
            .props
            .as_ref()
            .and_then(|props| props.get("svn:externals"))
            .and_then(|value| value.as_deref())
            .unwrap_or("");
        let new_externals = if new_value.is_empty() {
            // Absent, empty, or deleted: whatever the previous revision
            // had is going away.
            IndexMap::new()
        } else {
            externals::parse(repo, revision_number, &path, new_value, map, self.repos.as_ref())?
        };
        let prev_externals = if revision_number > 0 {
            externals::from_rev(repo, revision_number - 1, &path, map, self.repos.as_ref())?
        } else {
            IndexMap::new()
        };
        let (mut added, changed, mut deleted) =
            externals::diff(&prev_externals, &new_externals, false);
        debug!(
            "externals for {}: added {:?}, changed {:?}, deleted {:?}",
            path, added, changed, deleted
        );
        let mut output = vec![record];
        // Changes first: some of them degrade into a delete plus an add.
        for (old, new) in changed {
            if old.srcrev.is_none()
                || (new.srcrepo == repo && self.paths.is_included(&new.srcpath))
            {
                // Without the old revision there is nothing to diff
                // against, and a source included by the filter is cheaper
                // to recopy than to update in place.
                deleted.push(old);
                added.push(new);
                continue;
            }
            if new.srcrev.is_none() {
                warn!(
                    "cannot guess a revision for external {:?}; content not updated",
                    new
                );
                continue;
            }
            output.extend(self.apply_externals_change(&path, &old, &new)?);
        }
        for description in deleted {
            output.push(Record::delete(
                &format!("{}/{}", path, description.dstpath),
                RecordSource::Externals,
            ));
        }
        for description in added {
            if description.srcrepo == repo && self.paths.is_included(&description.srcpath) {
                // Same repository, included source: a plain copy suffices.
                let Some(srcrev) = description.srcrev else {
                    warn!("cannot guess a revision for external {:?}", description);
                    continue;
                };
                let mut copy = Record::node(
                    &format!("{}/{}", path, description.dstpath),
                    Action::Add,
                    NodeKind::Dir,
                    RecordSource::Externals,
                );
                copy.set_header("Node-copyfrom-path", description.srcpath.as_str());
                copy.set_header("Node-copyfrom-rev", srcrev.to_string());
                output.push(copy);
            } else {
                output.extend(self.repos.materialize_subtree(
                    &description.srcrepo,
                    description.srcrev,
                    &description.srcpath,
                    &format!("{}/{}", path, description.dstpath),
                    RecordSource::Externals,
                )?);
            }
        }
        Ok(output)
    }

    /// Synthesize the minimal records turning the content of `old` into
    /// the content of `new` under the external's destination.
    fn apply_externals_change(
        &self,
        path: &str,
        old: &ExternalsDescription,
        new: &ExternalsDescription,
    ) -> Result<Vec<Record>> {
        debug_assert_eq!(old.srcrepo, new.srcrepo);
        let old_rev = old.srcrev.expect("checked by caller");
        let new_rev = new.srcrev.expect("checked by caller");
        let changes =
            self.repos
                .diff_paths(&new.srcrepo, &old.srcpath, old_rev, &new.srcpath, new_rev)?;
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let mut output = Vec::new();
        for (chpath, change) in &changes {
            if change.contents == Some(ContentsOp::Delete) {
                output.push(Record::delete(
                    &format!("{}/{}/{}", path, new.dstpath, chpath),
                    RecordSource::Externals,
                ));
            }
        }
        // Materialize the new state, then cut it down to what changed:
        // adds stay adds, modifications become changes, untouched text or
        // props are dropped, untouched children are omitted entirely.
        let dst = format!("{}/{}", path, new.dstpath);
        let add_records = self.repos.materialize_subtree(
            &new.srcrepo,
            new.srcrev,
            &new.srcpath,
            &dst,
            RecordSource::Externals,
        )?;
        for mut record in add_records {
            let record_path = record.node_path()?.to_owned();
            let rel = record_path.get(dst.len() + 1..).unwrap_or("");
            let Some(change) = changes.get(rel) else {
                continue;
            };
            match change.contents {
                Some(ContentsOp::Add) => {}
                Some(ContentsOp::Modify) => {
                    record.set_header("Node-action", Action::Change.as_str())
                }
                None => record.text = None,
                Some(ContentsOp::Delete) => {
                    return Err(SvError::General(format!(
                        "unexpected delete for {} in externals diff",
                        rel
                    ))
                    .into())
                }
            }
            if !change.props_modified && change.contents != Some(ContentsOp::Add) {
                record.props = None;
            }
            output.push(record);
        }
        Ok(output)
    }
}

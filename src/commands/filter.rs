
use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use anyhow::Result;
use clap::Parser;
use crate::externals::ExternalsMap;
use crate::filter;
use crate::pathfilter::PathFilter;
use crate::repos::SvnRepos;
use crate::util;

/// Filter a dump stream from stdin to stdout.
#[derive(Debug, Parser)]
#[command(
    author,
    help_template = crate::app::HELP_TEMPLATE,
    after_help = "\
    Reads an SVN dump stream on stdin, applies the requested operations,\n\
    and writes the resulting stream to stdout.  With no operations given\n\
    the stream is validated and passed through unchanged.\n\n\
    --include patterns are split on '/' and each piece must match one\n\
    whole path segment, so 'branches/v.*/web' includes branches/v1/web\n\
    but not branches/v1/test/web.  Copy operations whose source falls\n\
    outside the included paths are replaced by add operations built from\n\
    --repo, which is why --repo is usually needed with --include."
)]
pub struct Filter {
    /// Only include paths matching this regular expression (may be used
    /// multiple times).
    #[arg(long = "include", value_name = "REGEX")]
    include: Vec<String>,

    /// Path of the local SVN repo that produced the dump stream.
    #[arg(long, value_name = "PATH")]
    repo: Option<PathBuf>,

    /// File mapping URLs used by svn:externals to local repository
    /// paths; enables internalizing externals.  Format is one local repo
    /// per line: PATH [URL ...].
    #[arg(long = "externals-map", value_name = "FILE")]
    externals_map: Option<PathBuf>,

    /// Delete an SVN property (such as svn:keywords) from all paths (may
    /// be used multiple times).
    #[arg(long = "delete-property", value_name = "PROPNAME")]
    delete_property: Vec<String>,

    /// Drop all changes made in a particular revision but keep the
    /// commit message (DANGEROUS; may be used multiple times).
    #[arg(long = "truncate-rev", value_name = "REVNUM")]
    truncate_rev: Vec<u32>,

    /// Drop all actions for PATH in REV (may be used multiple times).
    #[arg(long = "drop-action", value_name = "REV:PATH")]
    drop_action: Vec<String>,

    /// Insert a delete action for PATH at the end of REV (may be used
    /// multiple times).
    #[arg(long = "force-delete", value_name = "REV:PATH")]
    force_delete: Vec<String>,

    /// Omit revisions whose action list is empty after filtering instead
    /// of emitting them with date, author, and message intact.
    #[arg(long = "drop-empty-revs")]
    drop_empty_revs: bool,

    /// Renumber revisions sequentially over the gaps left by
    /// --drop-empty-revs.  Only sound when filtering the entire history
    /// in one pass.
    #[arg(long = "renumber-revs")]
    renumber_revs: bool,

    /// Log verbosely to stderr.
    #[arg(long)]
    debug: bool,
}

impl Filter {
    pub fn run(&mut self) -> Result<()> {
        util::init_logging(self.debug);

        let repo = match &self.repo {
            Some(path) => {
                // The engine builds file:// URLs from this, so it must be
                // absolute and carry no trailing slash.
                let text = path.to_string_lossy();
                let trimmed = text.trim_end_matches('/');
                let trimmed = if trimmed.is_empty() { "/" } else { trimmed };
                Some(std::path::absolute(trimmed)?)
            }
            None => None,
        };

        let mut engine =
            filter::Filter::new(repo, PathFilter::new(&self.include)?, Box::new(SvnRepos));
        engine.drop_empty_revs = self.drop_empty_revs;
        if self.renumber_revs {
            engine.revmap = Some(HashMap::new());
        }
        if let Some(path) = &self.externals_map {
            engine.externals_map = Some(ExternalsMap::load(path)?);
        }
        engine.delete_properties = self.delete_property.clone();
        engine.truncate_revs = self.truncate_rev.iter().copied().collect();
        for spec in &self.drop_action {
            let (rev, path) = util::parse_rev_path(spec)?;
            engine.drop_actions.entry(rev).or_default().insert(path);
        }
        for spec in &self.force_delete {
            let (rev, path) = util::parse_rev_path(spec)?;
            engine.force_delete.entry(rev).or_default().push(path);
        }

        let stdin = io::stdin();
        let mut input = stdin.lock();
        let stdout = io::stdout();
        let mut output = BufWriter::new(stdout.lock());
        engine.run(&mut input, &mut output)?;
        output.flush()?;
        Ok(())
    }
}


use std::collections::BTreeSet;
use std::io::{self, BufRead, BufWriter, Write};
use anyhow::Result;
use clap::Parser;
use crate::record;
use crate::util;

/// Print only the given revisions of a dump stream.
#[derive(Debug, Parser)]
#[command(
    author,
    help_template = crate::app::HELP_TEMPLATE,
    after_help = "\
    Reads an SVN dump stream on stdin and writes only the requested\n\
    revisions' records to stdout.  Every action record is tagged with a\n\
    synthetic Record-index header counting from zero within its\n\
    revision, which makes records easy to refer to when building\n\
    --drop-action and --force-delete arguments for the filter."
)]
pub struct Grab {
    /// Revisions to print, as in "5,7-9,12".  Omit to print every
    /// revision.
    #[arg(value_name = "REVISIONS")]
    revisions: Option<String>,
}

impl Grab {
    pub fn run(&mut self) -> Result<()> {
        util::init_logging(false);
        let revs = match &self.revisions {
            Some(text) => Some(util::parse_rev_set(text)?),
            None => None,
        };
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let stdout = io::stdout();
        let mut output = BufWriter::new(stdout.lock());
        grab_stream(revs.as_ref(), &mut input, &mut output)?;
        output.flush()?;
        Ok(())
    }
}

fn includes(revs: Option<&BTreeSet<u32>>, rev: u32) -> bool {
    revs.map_or(true, |revs| revs.contains(&rev))
}

fn grab_stream(
    revs: Option<&BTreeSet<u32>>,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<()> {
    let maxrev = revs.and_then(|revs| revs.iter().next_back().copied());
    let mut revnum: Option<u32> = None;
    let mut action_index = 0u32;
    while let Some(mut record) = record::read_record(input)? {
        if let Some(parsed) = record.revision_number() {
            let rev = parsed?;
            revnum = Some(rev);
            action_index = 0;
            if includes(revs, rev) {
                record.write(output, None)?;
            } else if maxrev.is_some_and(|max| rev > max) {
                // Nothing left to find past the highest requested revision.
                break;
            }
        } else if let Some(rev) = revnum {
            if includes(revs, rev) {
                record.set_header("Record-index", action_index.to_string());
                record.write(output, None)?;
                action_index += 1;
            }
        }
    }
    Ok(())
}

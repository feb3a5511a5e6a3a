
//  Within one revision a path must end up with a single coherent action.
//  Copy dereferencing and externals internalization both synthesize
//  records, so a path can accumulate several; this module merges them.
//
//  +----------------------------------------------------------------+
//  |      2nd action |  delete  |   add    |  change  |  replace    |
//  | 1st action      |          |          |          |             |
//  |----------------------------------------------------------------|
//  | delete          |    !     | replace  |    !     |    !        |
//  | add             |  none *  |   2nd    |   add    |    !        |
//  | change          |    !     |    !     |  change  |    !        |
//  | replace         |    !     |    !     | replace  |    !        |
//  +----------------------------------------------------------------+
//  merge kinds fold the second record into the first; `!` refuses.
//  * (add, delete) cancels, except that an externals-sourced add followed
//    by a dump-sourced delete is reordered to (delete, add) and kept: the
//    stream does not know the delete has to come first when a real
//    directory turns into an external in one revision.

use anyhow::Result;
use indexmap::IndexMap;
use thiserror::Error;
use tracing::warn;
use crate::record::{Action, Record, RecordSource};

#[derive(Error, Debug)]
pub enum FlattenError {
    #[error("found ({first}, {second}) for path {path} in r{rev}")]
    UnsupportedPair {
        first: Action,
        second: Action,
        path: String,
        rev: u32,
    },
    #[error("cannot merge ({first}, change) when Text-delta is true for path {path} in r{rev}")]
    DeltaMerge {
        first: Action,
        path: String,
        rev: u32,
    },
}

/// Collapse every path's records down to one action (or to the reordered
/// delete-plus-add pair), editing `contents` in place.
pub fn flatten_multiple_actions(revision_number: u32, contents: &mut Vec<Record>) -> Result<()> {
    let mut groups: IndexMap<String, Vec<usize>> = IndexMap::new();
    for (id, record) in contents.iter().enumerate() {
        groups
            .entry(record.node_path()?.to_owned())
            .or_default()
            .push(id);
    }
    if groups.values().all(|group| group.len() < 2) {
        return Ok(());
    }
    let mut slots: Vec<Option<Record>> =
        std::mem::take(contents).into_iter().map(Some).collect();
    let mut order: Vec<usize> = (0..slots.len()).collect();
    for (path, mut group) in groups {
        while group.len() > 1 {
            collapse_first_pair(revision_number, &path, &mut slots, &mut order, &mut group)?;
        }
    }
    *contents = order.into_iter().filter_map(|id| slots[id].take()).collect();
    Ok(())
}

fn collapse_first_pair(
    rev: u32,
    path: &str,
    slots: &mut [Option<Record>],
    order: &mut Vec<usize>,
    group: &mut Vec<usize>,
) -> Result<()> {
    let first_id = group[0];
    let second_id = group[1];
    let first_action = slots[first_id].as_ref().expect("live record").action()?;
    let second_action = slots[second_id].as_ref().expect("live record").action()?;
    match (first_action, second_action) {
        (Action::Add, Action::Add) => {
            // Two copies landed on the same path; the second wins.
            warn!("found (add, add) - deleting first for path {} in r{}", path, rev);
            slots[first_id] = None;
            order.retain(|&id| id != first_id);
            group.remove(0);
        }
        (Action::Add | Action::Change | Action::Replace, Action::Change) => {
            warn!(
                "found ({}, change) - merging for path {} in r{}",
                first_action, path, rev
            );
            let second = slots[second_id].take().expect("live record");
            merge_change(
                slots[first_id].as_mut().expect("live record"),
                second,
                first_action,
                path,
                rev,
            )?;
            order.retain(|&id| id != second_id);
            group.remove(1);
        }
        (Action::Add, Action::Delete) => {
            let first_source = slots[first_id].as_ref().expect("live record").source;
            let second_source = slots[second_id].as_ref().expect("live record").source;
            if first_source == RecordSource::Externals && second_source == RecordSource::Dump {
                warn!(
                    "found externals add followed by regular delete - moving the delete \
                     before the add for path {} in r{}",
                    path, rev
                );
                order.retain(|&id| id != second_id);
                let pos = order
                    .iter()
                    .position(|&id| id == first_id)
                    .expect("first record still in order");
                order.insert(pos, second_id);
                // The moved delete is settled; only the add keeps merging.
                group.remove(1);
            } else {
                warn!(
                    "found (add, delete) - dropping both for path {} in r{}",
                    path, rev
                );
                slots[first_id] = None;
                slots[second_id] = None;
                order.retain(|&id| id != first_id && id != second_id);
                group.drain(0..2);
            }
        }
        (Action::Delete, Action::Add) => {
            warn!(
                "converting (delete, add) to replace for path {} in r{}",
                path, rev
            );
            slots[second_id]
                .as_mut()
                .expect("live record")
                .set_header("Node-action", Action::Replace.as_str());
            slots[first_id] = None;
            order.retain(|&id| id != first_id);
            group.remove(0);
        }
        (Action::Change, Action::Add)
        | (Action::Change, Action::Delete)
        | (Action::Change, Action::Replace)
        | (Action::Delete, Action::Delete)
        | (Action::Delete, Action::Change)
        | (Action::Delete, Action::Replace)
        | (Action::Add, Action::Replace)
        | (Action::Replace, Action::Add)
        | (Action::Replace, Action::Delete)
        | (Action::Replace, Action::Replace) => {
            return Err(FlattenError::UnsupportedPair {
                first: first_action,
                second: second_action,
                path: path.to_owned(),
                rev,
            }
            .into());
        }
    }
    Ok(())
}

//  Folds a later change record into an earlier add/change/replace.
fn merge_change(
    first: &mut Record,
    second: Record,
    first_action: Action,
    path: &str,
    rev: u32,
) -> Result<(), FlattenError> {
    let second_text_delta = second.header("Text-delta") == Some("true");
    let second_prop_delta = second.header("Prop-delta") == Some("true");
    let second_md5 = second.header("Text-content-md5").map(str::to_owned);
    let Record {
        props: second_props,
        text: second_text,
        ..
    } = second;
    if let Some(text) = second_text {
        if second_text_delta {
            // The first record's content is already literal; a delta
            // against unknown loader state cannot be applied here.
            return Err(FlattenError::DeltaMerge {
                first: first_action,
                path: path.to_owned(),
                rev,
            });
        }
        first.text = Some(text);
        first.delete_header("Text-delta");
        match second_md5 {
            Some(md5) => first.set_header("Text-content-md5", md5),
            None => first.delete_header("Text-content-md5"),
        }
    }
    if let Some(second_props) = second_props {
        if first.props.is_none() {
            first.props = Some(second_props);
        } else if second_prop_delta {
            let first_prop_delta = first.header("Prop-delta") == Some("true");
            let props = first.props.as_mut().expect("props checked above");
            for (key, value) in second_props {
                props.insert(key, value);
            }
            if !first_prop_delta {
                // The merged record declares properties outright, so
                // deletions are applied, not recorded.
                props.retain(|_, value| value.is_some());
            }
        } else {
            first.props = Some(second_props);
        }
    }
    Ok(())
}

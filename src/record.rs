
//  Parsing, fixing and serializing of single dump-stream records.
//  The wire format is described in the Subversion notes:
//  http://svn.apache.org/repos/asf/subversion/trunk/notes/dump-load-format.txt

use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, Write};
use anyhow::Result;
use indexmap::IndexMap;
use thiserror::Error;
use crate::util::SvError;

/// Failure to parse a record's property block.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct PropsParseError(pub String);

/// Which subsystem produced a record.  Only the action flattener cares,
/// and only to tell a dump-stream delete from an internalized external.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// Read from the dump stream being filtered.
    Dump,
    /// Synthesized to dereference a copy action.
    Copy,
    /// Synthesized to internalize an external.
    Externals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Change,
    Delete,
    Replace,
}

impl Action {
    pub fn parse(text: &str) -> Option<Action> {
        match text {
            "add" => Some(Action::Add),
            "change" => Some(Action::Change),
            "delete" => Some(Action::Delete),
            "replace" => Some(Action::Replace),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Change => "change",
            Action::Delete => "delete",
            Action::Replace => "replace",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One RFC822-ish headers-plus-data unit of an SVN dump stream.
///
/// `headers` and `props` round-trip in insertion order.  A property value
/// of `None` is a deletion entry (`D` on the wire).  `text` holds the raw
/// content bytes.
#[derive(Debug, Clone)]
pub struct Record {
    pub headers: IndexMap<String, String>,
    pub props: Option<IndexMap<String, Option<String>>>,
    pub text: Option<Vec<u8>>,
    pub source: RecordSource,
}

//  source is deliberately left out, as it never reaches the wire.
impl PartialEq for Record {
    fn eq(&self, other: &Record) -> bool {
        self.headers == other.headers
            && self.props == other.props
            && self.text == other.text
    }
}

impl Record {
    pub fn new(source: RecordSource) -> Record {
        Record {
            headers: IndexMap::new(),
            props: None,
            text: None,
            source,
        }
    }

    pub fn node(path: &str, action: Action, kind: NodeKind, source: RecordSource) -> Record {
        let mut record = Record::new(source);
        record.set_header("Node-path", path);
        record.set_header("Node-action", action.as_str());
        record.set_header("Node-kind", kind.as_str());
        record
    }

    pub fn delete(path: &str, source: RecordSource) -> Record {
        let mut record = Record::new(source);
        record.set_header("Node-path", path);
        record.set_header("Node-action", Action::Delete.as_str());
        record
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_owned(), value.into());
    }

    /// Remove a header if present, preserving the order of the rest.
    pub fn delete_header(&mut self, name: &str) {
        self.headers.shift_remove(name);
    }

    pub fn node_path(&self) -> Result<&str> {
        self.header("Node-path")
            .ok_or_else(|| SvError::General("record has no Node-path header".to_owned()).into())
    }

    pub fn action(&self) -> Result<Action> {
        let text = self
            .header("Node-action")
            .ok_or_else(|| SvError::General("record has no Node-action header".to_owned()))?;
        Action::parse(text)
            .ok_or_else(|| SvError::General(format!("unknown Node-action '{}'", text)).into())
    }

    pub fn revision_number(&self) -> Option<Result<u32>> {
        self.header("Revision-number").map(|text| {
            text.parse::<u32>().map_err(|_| {
                SvError::General(format!("invalid Revision-number '{}'", text)).into()
            })
        })
    }

    pub fn set_property(&mut self, name: &str, value: Option<&str>) {
        self.props
            .get_or_insert_with(IndexMap::new)
            .insert(name.to_owned(), value.map(str::to_owned));
    }

    pub fn delete_property(&mut self, name: &str) {
        if let Some(props) = &mut self.props {
            props.shift_remove(name);
        }
    }

    /// Serialize the property block, or an empty buffer when there is none.
    fn prop_text(&self) -> Vec<u8> {
        let Some(props) = &self.props else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (key, val) in props {
            match val {
                Some(val) => {
                    out.extend_from_slice(
                        format!("K {}\n{}\nV {}\n{}\n", key.len(), key, val.len(), val)
                            .as_bytes(),
                    );
                }
                None => {
                    out.extend_from_slice(format!("D {}\n{}\n", key.len(), key).as_bytes());
                }
            }
        }
        out.extend_from_slice(b"PROPS-END\n");
        out
    }

    /// Recompute the headers that depend on the property block or text body,
    /// and run revision numbers through the remap.
    ///
    /// MD5 is good enough to detect corruption, is what older repositories
    /// support, and the content is never modified here, so an existing
    /// checksum header is always left alone.
    fn fix_headers(
        &mut self,
        proptext: &[u8],
        revmap: Option<&HashMap<u32, u32>>,
    ) -> Result<()> {
        if proptext.is_empty() {
            self.delete_header("Prop-content-length");
        } else {
            self.set_header("Prop-content-length", proptext.len().to_string());
        }
        if self.text.is_none() {
            self.delete_header("Text-content-length");
            self.delete_header("Text-content-md5");
            self.delete_header("Text-content-sha1");
            self.delete_header("Text-delta");
        } else {
            let textlen = self.text.as_ref().map_or(0, Vec::len);
            self.set_header("Text-content-length", textlen.to_string());
            // For Text-delta: true the checksum covers the whole file, so
            // the digest of the delta bytes must never be filled in.
            if !self.headers.contains_key("Text-content-md5")
                && self.header("Text-delta") != Some("true")
            {
                let digest = md5::compute(self.text.as_ref().expect("text present"));
                self.set_header("Text-content-md5", format!("{:x}", digest));
            }
        }
        let textlen = self.text.as_ref().map_or(0, Vec::len);
        if proptext.is_empty() && self.text.is_none() {
            self.delete_header("Content-length");
        } else {
            self.set_header("Content-length", (proptext.len() + textlen).to_string());
        }
        if let Some(revmap) = revmap.filter(|map| !map.is_empty()) {
            for name in ["Revision-number", "Node-copyfrom-rev"] {
                let Some(value) = self.headers.get(name) else {
                    continue;
                };
                let old: u32 = value.parse().map_err(|_| {
                    SvError::General(format!("invalid {} '{}'", name, value))
                })?;
                let new = revmap.get(&old).ok_or_else(|| {
                    SvError::General(format!(
                        "r{} is not in the revision map; was the full history processed?",
                        old
                    ))
                })?;
                self.set_header(name, new.to_string());
            }
        }
        Ok(())
    }

    /// Write the record, fixing dependent headers first.
    pub fn write(
        &mut self,
        out: &mut dyn Write,
        revmap: Option<&HashMap<u32, u32>>,
    ) -> Result<()> {
        let proptext = self.prop_text();
        self.fix_headers(&proptext, revmap)?;
        for (key, val) in &self.headers {
            write!(out, "{}: {}\n", key, val)?;
        }
        out.write_all(b"\n")?;
        out.write_all(&proptext)?;
        if let Some(text) = &self.text {
            out.write_all(text)?;
            out.write_all(b"\n")?;
        }
        if self.headers.contains_key("Prop-content-length")
            || self.headers.contains_key("Text-content-length")
            || self.headers.contains_key("Content-length")
        {
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Can this record be proven to leave svn:externals untouched?
    ///
    /// The property can be deleted merely by being omitted from a non-delta
    /// properties block, so a directory change with a properties block that
    /// does not mention svn:externals still cannot be ruled out.
    pub fn does_not_affect_externals(&self) -> bool {
        if self.header("Node-action") == Some("delete") {
            // Deletes are recursive; any externals go down with the node.
            return true;
        }
        if self.header("Node-kind") != Some("dir") {
            // Only directories carry externals.
            return true;
        }
        let Some(props) = &self.props else {
            return true;
        };
        if props.contains_key("svn:externals") {
            return false;
        }
        if self.header("Node-action") == Some("add") {
            // Adds declare their properties explicitly.
            return true;
        }
        if self.header("Prop-delta") == Some("true") {
            // A delta deletes explicitly, and there is no entry for it here.
            return true;
        }
        false
    }
}

/// Read one record, or `None` on a clean end of stream.
pub fn read_record(stream: &mut dyn BufRead) -> Result<Option<Record>> {
    let Some(mut record) = read_headers(stream)? else {
        return Ok(None);
    };
    let pcl = match record.header("Prop-content-length") {
        Some(value) => value.parse::<usize>().map_err(|_| {
            SvError::General(format!("invalid Prop-content-length '{}'", value))
        })?,
        None => 0,
    };
    if pcl > 0 {
        let mut block = vec![0u8; pcl];
        stream.read_exact(&mut block)?;
        record.props = Some(parse_props(&block)?);
    }
    let tcl = match record.header("Text-content-length") {
        Some(value) => Some(value.parse::<usize>().map_err(|_| {
            SvError::General(format!("invalid Text-content-length '{}'", value))
        })?),
        None => None,
    };
    if let Some(tcl) = tcl {
        let mut text = vec![0u8; tcl];
        stream.read_exact(&mut text)?;
        record.text = Some(text);
    }
    Ok(Some(record))
}

fn read_headers(stream: &mut dyn BufRead) -> Result<Option<Record>> {
    let mut record = Record::new(RecordSource::Dump);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = stream.read_until(b'\n', &mut line)?;
        if n == 0 {
            // EOF is fine between records, fatal in the middle of one.
            if record.headers.is_empty() {
                return Ok(None);
            }
            return Err(SvError::General(
                "reached end of stream while reading record headers".to_owned(),
            )
            .into());
        }
        if line == b"\n" {
            if record.headers.is_empty() {
                continue; // stray blank line before the record
            }
            return Ok(Some(record));
        }
        let text = std::str::from_utf8(&line)
            .map_err(|_| SvError::General("record header is not valid UTF-8".to_owned()))?;
        let text = text.strip_suffix('\n').unwrap_or(text);
        let (key, val) = text.split_once(": ").ok_or_else(|| {
            SvError::General(format!("malformed record header '{}'", text))
        })?;
        record.headers.insert(key.to_owned(), val.to_owned());
    }
}

/// Parse a property block.
///
/// Entries are `K <len>\n<name>\nV <len>\n<value>\n` pairs or `D
/// <len>\n<name>\n` deletions, terminated by `PROPS-END\n`.  Lengths are
/// byte counts and every mismatch is fatal.
pub fn parse_props(data: &[u8]) -> Result<IndexMap<String, Option<String>>, PropsParseError> {
    let mut props = IndexMap::new();
    let mut index = 0usize;
    loop {
        let rest = &data[index..];
        let wantval = if rest.starts_with(b"K ") {
            true
        } else if rest.starts_with(b"D ") {
            false
        } else if rest.starts_with(b"PROPS-END\n") {
            break;
        } else {
            return Err(PropsParseError(format!(
                "unrecognised property entry at byte {}",
                index
            )));
        };
        let name = read_counted(data, &mut index, "name")?;
        let value = if wantval {
            if !data[index..].starts_with(b"V ") {
                return Err(PropsParseError(format!(
                    "expected \"V ...\" at byte {}",
                    index
                )));
            }
            Some(read_counted(data, &mut index, "value")?)
        } else {
            None
        };
        props.insert(name, value);
    }
    if data.len() != index + b"PROPS-END\n".len() {
        return Err(PropsParseError(
            "trailing bytes after PROPS-END".to_owned(),
        ));
    }
    Ok(props)
}

//  Reads one `X <len>\n<bytes>\n` entry starting at *index, leaving *index
//  just past the trailing newline.
fn read_counted(data: &[u8], index: &mut usize, what: &str) -> Result<String, PropsParseError> {
    let nlpos = data[*index..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|p| *index + p)
        .ok_or_else(|| PropsParseError(format!("missing newline after {} length", what)))?;
    let len: usize = std::str::from_utf8(&data[*index + 2..nlpos])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| PropsParseError(format!("invalid {} length", what)))?;
    let end = nlpos + 1 + len;
    if data.get(end) != Some(&b'\n') {
        return Err(PropsParseError(format!("missing newline after {}", what)));
    }
    let bytes = &data[nlpos + 1..end];
    let text = std::str::from_utf8(bytes)
        .map_err(|_| PropsParseError(format!("{} is not valid UTF-8", what)))?;
    *index = end + 1;
    Ok(text.to_owned())
}

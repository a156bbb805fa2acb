use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    error::{PipelineError, Result},
    types::GestureId,
};

pub const FALLBACK_LABEL: &str = "Unknown sign";

/// Gesture glosses keyed by the 1-based decimal string of the classifier id.
///
/// JSON tables are a flat object (`{"1": "hello"}`); `.csv` label files take
/// the first column of each row, row `i` becoming key `i + 1`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelTable {
    entries: HashMap<String, String>,
}

impl LabelTable {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|source| PipelineError::LabelTableRead {
            path: path.to_path_buf(),
            source,
        })?;
        let contents = contents.trim_start_matches('\u{feff}');

        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv {
            Ok(Self::from_csv(contents))
        } else {
            Self::from_json(contents).map_err(|reason| PipelineError::LabelTableFormat {
                path: path.to_path_buf(),
                reason,
            })
        }
    }

    fn from_json(contents: &str) -> std::result::Result<Self, String> {
        let entries: HashMap<String, String> =
            serde_json::from_str(contents).map_err(|err| err.to_string())?;
        Ok(Self { entries })
    }

    fn from_csv(contents: &str) -> Self {
        let entries = first_csv_fields(contents)
            .into_iter()
            .enumerate()
            .map(|(idx, label)| ((idx + 1).to_string(), label))
            .collect();
        Self { entries }
    }

    pub fn key_for(id: GestureId) -> String {
        (id + 1).to_string()
    }

    pub fn get(&self, id: GestureId) -> Option<&str> {
        self.entries.get(&Self::key_for(id)).map(String::as_str)
    }

    /// Label for `id`, or the fallback gloss when the table has no entry.
    pub fn resolve(&self, id: GestureId) -> (String, bool) {
        match self.get(id) {
            Some(label) => (label.to_string(), true),
            None => (FALLBACK_LABEL.to_string(), false),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelTable {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// First field of every CSV record.
///
/// Quoted fields may span commas and line breaks; `""` inside them is a
/// literal quote. A trailing line break does not start another record.
fn first_csv_fields(contents: &str) -> Vec<String> {
    let mut records = Vec::new();
    let mut field = String::new();
    let mut in_first = true;
    let mut quoted = false;
    let mut chars = contents.chars().peekable();
    let mut pending = false;

    while let Some(c) = chars.next() {
        pending = true;
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    if in_first {
                        field.push('"');
                    }
                }
                '"' => quoted = false,
                _ if in_first => field.push(c),
                _ => {}
            }
            continue;
        }
        match c {
            '"' => quoted = true,
            ',' => in_first = false,
            '\r' | '\n' => {
                if c == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                records.push(std::mem::take(&mut field));
                in_first = true;
                pending = false;
            }
            _ if in_first => field.push(c),
            _ => {}
        }
    }
    if pending {
        records.push(field);
    }
    records
}

/// Where the dispatcher reads the table from on every classification.
#[derive(Clone, Debug)]
pub struct LabelSource {
    path: PathBuf,
}

impl LabelSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<LabelTable> {
        LabelTable::load(&self.path)
    }
}

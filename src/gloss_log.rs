use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
};

use crate::error::{PipelineError, Result};

/// Append-only, newline-delimited record of every classified gloss.
///
/// Each line is written with a single `write_all` on a file opened in append
/// mode, so other readers of the same file only ever see whole lines. The
/// file is never truncated or rewritten here.
#[derive(Debug)]
pub struct GlossLog {
    path: PathBuf,
    file: Option<File>,
}

impl GlossLog {
    /// Does not touch the file; it is opened on the first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Line breaks inside `label` become spaces so one gloss stays one line.
    pub fn append(&mut self, label: &str) -> Result<()> {
        let mut line = label
            .trim_end_matches(['\r', '\n'])
            .replace("\r\n", " ")
            .replace(['\r', '\n'], " ");
        line.push('\n');

        let result = self
            .file()
            .and_then(|file| file.write_all(line.as_bytes()).and_then(|_| file.flush()));

        result.map_err(|source| {
            // Reopen on the next append in case the file was moved away.
            self.file = None;
            PipelineError::GlossLog {
                path: self.path.clone(),
                source,
            }
        })
    }

    fn file(&mut self) -> std::io::Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(std::io::Error::other("gloss log not open")),
        }
    }
}

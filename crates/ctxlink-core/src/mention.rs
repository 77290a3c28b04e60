use crate::protocol::MentionParams;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MentionError {
    #[error("mention path is empty")]
    EmptyPath,
    #[error("mention path does not exist: {0}")]
    MissingPath(PathBuf),
    #[error("line range is inverted: start {start} > end {end}")]
    InvertedRange { start: u32, end: u32 },
    #[error("end line {0} given without a start line")]
    EndWithoutStart(u32),
    #[error("line numbers are 1-indexed, got 0")]
    ZeroLine,
}

/// A file (and optional zero-indexed line range) to hand to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    file_path: String,
    start_line: Option<u32>,
    end_line: Option<u32>,
}

impl Mention {
    /// `start_line`/`end_line` are zero-indexed.
    pub fn new(
        file_path: impl Into<String>,
        start_line: Option<u32>,
        end_line: Option<u32>,
    ) -> Result<Self, MentionError> {
        let file_path = file_path.into();
        if file_path.trim().is_empty() {
            return Err(MentionError::EmptyPath);
        }
        match (start_line, end_line) {
            (None, Some(end)) => return Err(MentionError::EndWithoutStart(end)),
            (Some(start), Some(end)) if start > end => {
                return Err(MentionError::InvertedRange { start, end })
            }
            _ => {}
        }
        Ok(Self {
            file_path,
            start_line,
            end_line,
        })
    }

    /// Build from 1-indexed editor lines.
    pub fn from_editor_lines(
        file_path: impl Into<String>,
        start_line: Option<u32>,
        end_line: Option<u32>,
    ) -> Result<Self, MentionError> {
        let to_zero = |line: Option<u32>| match line {
            Some(0) => Err(MentionError::ZeroLine),
            Some(line) => Ok(Some(line - 1)),
            None => Ok(None),
        };
        Self::new(file_path, to_zero(start_line)?, to_zero(end_line)?)
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn start_line(&self) -> Option<u32> {
        self.start_line
    }

    pub fn end_line(&self) -> Option<u32> {
        self.end_line
    }

    pub fn to_params(&self) -> MentionParams {
        MentionParams {
            file_path: self.file_path.clone(),
            line_start: self.start_line,
            line_end: self.end_line,
        }
    }
}

/// Resolve a path the way the agent expects it: relative to the workspace
/// when inside it, with a trailing `/` for directories.
///
/// Returns the formatted path and whether it names a directory.
pub fn format_mention_path(path: &Path, workspace: &Path) -> Result<(String, bool), MentionError> {
    if path.as_os_str().is_empty() {
        return Err(MentionError::EmptyPath);
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    };
    let metadata = std::fs::metadata(&absolute).map_err(|_| MentionError::MissingPath(absolute.clone()))?;
    let is_dir = metadata.is_dir();

    let mut formatted = match absolute.strip_prefix(workspace) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative.display().to_string(),
        Ok(_) => ".".to_string(),
        Err(_) => absolute.display().to_string(),
    };
    if is_dir && !formatted.ends_with('/') {
        formatted.push('/');
    }
    Ok((formatted, is_dir))
}

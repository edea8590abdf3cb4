//! Append-only diagnostic text attached to module builds and link calls

use crate::error::{ForgeResult, IsaForgeError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildLog {
    records: Vec<String>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record; empty text is ignored
    pub fn append_string(&mut self, text: &str) {
        let text = text.trim_end_matches('\0');
        if text.is_empty() {
            return;
        }
        self.records.push(text.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }

    /// Records joined by newlines
    pub fn as_string(&self) -> String {
        self.records.join("\n")
    }

    /// C-style query: without a buffer, `size` receives the required size
    /// including the NUL terminator. With a buffer of at least that size the
    /// text is copied and NUL-terminated.
    pub fn get_string(&self, size: &mut usize, buffer: Option<&mut [u8]>) -> ForgeResult<()> {
        let text = self.as_string();
        let required = text.len() + 1;

        let Some(buffer) = buffer else {
            *size = required;
            return Ok(());
        };

        let provided = (*size).min(buffer.len());
        if provided < required {
            return Err(IsaForgeError::InvalidSize { required, provided });
        }

        buffer[..text.len()].copy_from_slice(text.as_bytes());
        buffer[text.len()] = 0;
        *size = required;
        Ok(())
    }

    /// Release the log; records are dropped with it
    pub fn destroy(self) {}
}

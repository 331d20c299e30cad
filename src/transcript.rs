use log::debug;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The persisted transcript file for the active session.
///
/// One lock covers both uses of the file: the engine appending finalized
/// lines and a late-joining listener reading history back. Paragraphs are
/// blank-line delimited, flushed on every final write.
pub struct TranscriptStore {
    inner: Mutex<Option<OpenTranscript>>,
}

struct OpenTranscript {
    path: PathBuf,
    file: File,
}

impl TranscriptStore {
    pub fn new() -> Self {
        TranscriptStore {
            inner: Mutex::new(None),
        }
    }

    /// Open (append mode) the transcript file for a new session.
    pub fn open_session(&self, path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!("Transcript file opened: {:?}", path);
        *self.inner.lock().unwrap() = Some(OpenTranscript {
            path: path.to_path_buf(),
            file,
        });
        Ok(())
    }

    /// Close the session file. Idempotent.
    pub fn close_session(&self) {
        *self.inner.lock().unwrap() = None;
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    /// Append one finalized line as its own paragraph and flush.
    pub fn append_final(&self, text: &str) -> std::io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(open) = guard.as_mut() {
            writeln!(open.file, "{}\n", text.trim())?;
            open.file.flush()?;
        }
        Ok(())
    }

    /// Re-render the persisted history for a reload payload, one `<p>`
    /// paragraph per finalized line.
    pub fn render_history(&self) -> Option<String> {
        let guard = self.inner.lock().unwrap();
        let open = guard.as_ref()?;
        let contents = std::fs::read_to_string(&open.path).ok()?;
        Some(render_paragraphs(&contents))
    }
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn render_paragraphs(contents: &str) -> String {
    let trimmed = contents.trim_end_matches('\n');
    format!("<p>{}</p>", trimmed.replace("\n\n", "</p><p>"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_render() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Transcript-test.txt");

        let store = TranscriptStore::new();
        store.open_session(&path).unwrap();
        store.append_final("first line").unwrap();
        store.append_final("  second line ").unwrap();

        assert_eq!(
            store.render_history().unwrap(),
            "<p>first line</p><p>second line</p>"
        );

        store.close_session();
        assert!(store.render_history().is_none());
    }

    #[test]
    fn test_append_without_session_is_noop() {
        let store = TranscriptStore::new();
        store.append_final("orphan").unwrap();
        assert!(!store.is_open());
    }
}

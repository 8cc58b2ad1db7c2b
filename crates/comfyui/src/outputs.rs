//! Classification and selection of prompt outputs.
//!
//! A finished history entry maps node ids to whatever each output node
//! produced. Video-combine nodes report either `videos` or `gifs` (the
//! latter is the image-sequence field name, used for every animated
//! format). Selection is independent of map order: the candidate with
//! the highest [`OutputKind`] wins, and among equals the last node id in
//! sorted order wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// One finished entry from `/history/{prompt_id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<PromptStatus>,
}

/// Execution status reported alongside the outputs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
}

impl HistoryEntry {
    /// Whether the engine itself flagged the render as failed.
    pub fn reported_error(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.status_str == "error")
    }
}

/// Output record of a single node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub gifs: Option<Vec<OutputFile>>,
    #[serde(default)]
    pub videos: Option<Vec<OutputFile>>,
}

/// A file the server wrote to its output directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl OutputFile {
    /// Location of the file under the server's output directory.
    pub fn local_path(&self, output_dir: &Path) -> PathBuf {
        if self.subfolder.is_empty() {
            output_dir.join(&self.filename)
        } else {
            output_dir.join(&self.subfolder).join(&self.filename)
        }
    }

    /// Lowercased extension of the filename, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.filename)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }
}

/// Media kind of an output record, ordered by selection priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OutputKind {
    Unknown,
    AnimatedImage,
    Video,
}

/// A classified output record.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputCandidate {
    pub node_id: String,
    pub kind: OutputKind,
    /// First file of the matching field, if the field was non-empty.
    pub file: Option<OutputFile>,
}

/// Tag a node's output. A non-empty `videos` list outranks `gifs`; an
/// empty list counts as absent.
pub fn classify(node_id: &str, output: &NodeOutput) -> OutputCandidate {
    let (kind, files) = match (&output.videos, &output.gifs) {
        (Some(videos), _) if !videos.is_empty() => (OutputKind::Video, Some(videos)),
        (_, Some(gifs)) if !gifs.is_empty() => (OutputKind::AnimatedImage, Some(gifs)),
        _ => (OutputKind::Unknown, None),
    };
    OutputCandidate {
        node_id: node_id.to_string(),
        kind,
        file: files.and_then(|f| f.first().cloned()),
    }
}

/// Pick the artifact to publish, or `None` if no node produced a video
/// or animated image.
pub fn resolve_output(outputs: &BTreeMap<String, NodeOutput>) -> Option<OutputCandidate> {
    outputs
        .iter()
        .map(|(node_id, output)| classify(node_id, output))
        .filter(|c| c.kind != OutputKind::Unknown && c.file.is_some())
        // `max_by_key` keeps the last of equal maxima.
        .max_by_key(|c| c.kind)
}

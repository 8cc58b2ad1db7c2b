//! Job template loading and parameter binding.
//!
//! A template is a ComfyUI API-format workflow: a JSON object mapping node
//! ids to `{"class_type": ..., "inputs": {...}}`. Binding overwrites named
//! `(node, input)` slots with per-job values and returns a fresh
//! [`BoundJob`]; the template itself is never mutated. Values are written
//! as-is, only the presence of the target slot is checked.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use serde_json::{Map, Value};

/// Errors from loading or binding a job template.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Failed to read job template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job template is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Job template must be a JSON object of nodes")]
    NotAnObject,

    #[error("Job template has no node '{0}'")]
    UnknownNode(String),

    #[error("Node '{0}' has no inputs object")]
    MissingInputs(String),

    #[error("Node '{node}' has no input '{input}'")]
    UnknownInput { node: String, input: String },
}

// ---------------------------------------------------------------------------
// Template and bound job
// ---------------------------------------------------------------------------

/// A parameterized workflow, keyed by node id.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    nodes: Map<String, Value>,
}

impl JobTemplate {
    /// Read and parse a template file. Called once per job so edits to
    /// the file take effect without a restart.
    pub async fn load(path: &Path) -> Result<Self, TemplateError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TemplateError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        raw.parse()
    }

    pub fn from_value(value: Value) -> Result<Self, TemplateError> {
        match value {
            Value::Object(nodes) => Ok(Self { nodes }),
            _ => Err(TemplateError::NotAnObject),
        }
    }

    pub fn nodes(&self) -> &Map<String, Value> {
        &self.nodes
    }
}

impl FromStr for JobTemplate {
    type Err = TemplateError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::from_value(serde_json::from_str(raw)?)
    }
}

/// A template with all per-job parameters applied, ready for submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BoundJob(Value);

impl BoundJob {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn input(&self, node: &str, input: &str) -> Option<&Value> {
        self.0.get(node)?.get("inputs")?.get(input)
    }
}

// ---------------------------------------------------------------------------
// Overlay
// ---------------------------------------------------------------------------

/// A single `(node, input)` location in a template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slot {
    pub node: String,
    pub input: String,
}

impl Slot {
    pub fn new(node: &str, input: &str) -> Self {
        Self {
            node: node.to_string(),
            input: input.to_string(),
        }
    }
}

/// Ordered list of slot assignments. Later entries win on conflict.
#[derive(Debug, Clone, Default)]
pub struct ParamOverlay {
    entries: Vec<(Slot, Value)>,
}

impl ParamOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, slot: Slot, value: impl Into<Value>) -> &mut Self {
        self.entries.push((slot, value.into()));
        self
    }

    pub fn entries(&self) -> &[(Slot, Value)] {
        &self.entries
    }
}

/// Apply `overlay` to a copy of `template`.
///
/// Fails on the first slot whose node, `inputs` object, or input name is
/// absent; nothing is partially applied because the copy is discarded.
pub fn bind(template: &JobTemplate, overlay: &ParamOverlay) -> Result<BoundJob, TemplateError> {
    let mut nodes = template.nodes.clone();

    for (slot, value) in overlay.entries() {
        let node = nodes
            .get_mut(&slot.node)
            .ok_or_else(|| TemplateError::UnknownNode(slot.node.clone()))?;
        let inputs = node
            .get_mut("inputs")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| TemplateError::MissingInputs(slot.node.clone()))?;
        let target = inputs
            .get_mut(&slot.input)
            .ok_or_else(|| TemplateError::UnknownInput {
                node: slot.node.clone(),
                input: slot.input.clone(),
            })?;
        *target = value.clone();
    }

    Ok(BoundJob(Value::Object(nodes)))
}

// ---------------------------------------------------------------------------
// Workflow bindings
// ---------------------------------------------------------------------------

/// Operational parameters locked for reproducible output.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedParams {
    pub steps: u32,
    pub cfg: f64,
    pub frame_rate: u32,
    pub height: u32,
}

impl Default for FixedParams {
    fn default() -> Self {
        Self {
            steps: 6,
            cfg: 1.0,
            frame_rate: 16,
            height: 640,
        }
    }
}

/// Where each parameter lives in the image-to-video template.
///
/// The duration node encodes a range; writing the same value to both
/// ends pins it to a scalar.
#[derive(Debug, Clone)]
pub struct WorkflowBindings {
    pub image: Slot,
    pub duration_start: Slot,
    pub duration_end: Slot,
    pub steps: Vec<Slot>,
    pub cfg: Vec<Slot>,
    pub frame_rate: Slot,
    pub height: Slot,
}

impl Default for WorkflowBindings {
    fn default() -> Self {
        Self {
            image: Slot::new("52", "image"),
            duration_start: Slot::new("548", "start"),
            duration_end: Slot::new("548", "end"),
            steps: vec![Slot::new("57", "steps"), Slot::new("58", "steps")],
            cfg: vec![Slot::new("57", "cfg"), Slot::new("58", "cfg")],
            frame_rate: Slot::new("551", "frame_rate"),
            height: Slot::new("50", "height"),
        }
    }
}

/// Build the overlay for one job: fixed parameters first, then the
/// caller's image reference and duration.
pub fn build_overlay(
    bindings: &WorkflowBindings,
    fixed: &FixedParams,
    image_name: &str,
    duration_secs: f64,
) -> ParamOverlay {
    let mut overlay = ParamOverlay::new();

    for slot in &bindings.steps {
        overlay.set(slot.clone(), fixed.steps);
    }
    for slot in &bindings.cfg {
        overlay.set(slot.clone(), fixed.cfg);
    }
    overlay
        .set(bindings.frame_rate.clone(), fixed.frame_rate)
        .set(bindings.height.clone(), fixed.height)
        .set(bindings.image.clone(), image_name)
        .set(bindings.duration_start.clone(), duration_secs)
        .set(bindings.duration_end.clone(), duration_secs);

    overlay
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Percentage box templates and their JSON persistence.
//!
//! A template file is a JSON list of objects carrying `id`, `x`, `y`, `width`
//! and `height`, all percentages of the screen. Extra keys are tolerated; only
//! `label` is kept, for rendering.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::RegistrationError;

const REQUIRED_KEYS: [&str; 5] = ["id", "x", "y", "width", "height"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateBox {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl TemplateBox {
    pub fn new(id: impl Into<String>, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            width,
            height,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Parses a template document. Items that are not objects or lack a required
/// key are skipped; a document yielding no usable box is an error.
pub fn parse_template(json: &str) -> Result<Vec<TemplateBox>, RegistrationError> {
    let doc: Value = serde_json::from_str(json)
        .map_err(|e| RegistrationError::TemplateLoad(format!("invalid JSON: {e}")))?;

    let items = doc
        .as_array()
        .ok_or_else(|| RegistrationError::TemplateLoad("template JSON must be a list".to_string()))?;

    let mut boxes = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match item.as_object().and_then(parse_box) {
            Some(b) => boxes.push(b),
            None => debug!("skipping template item {idx}: missing or malformed keys"),
        }
    }

    if boxes.is_empty() {
        return Err(RegistrationError::TemplateLoad(
            "no valid boxes found in template".to_string(),
        ));
    }
    Ok(boxes)
}

fn parse_box(obj: &Map<String, Value>) -> Option<TemplateBox> {
    if !REQUIRED_KEYS.iter().all(|k| obj.contains_key(*k)) {
        return None;
    }
    let id = id_string(&obj["id"]);
    let label = obj.get("label").and_then(Value::as_str).map(str::to_string);
    Some(TemplateBox {
        id,
        x: as_number(&obj["x"])?,
        y: as_number(&obj["y"])?,
        width: as_number(&obj["width"])?,
        height: as_number(&obj["height"])?,
        label,
    })
}

/// Any JSON value becomes an id. Null and booleans use Python spelling.
fn id_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn load_template<P: AsRef<Path>>(path: P) -> Result<Vec<TemplateBox>, RegistrationError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| {
        RegistrationError::TemplateLoad(format!("cannot read '{}': {e}", path.display()))
    })?;
    parse_template(&text).map_err(|e| match e {
        RegistrationError::TemplateLoad(msg) => {
            RegistrationError::TemplateLoad(format!("'{}': {msg}", path.display()))
        }
        other => other,
    })
}

/// Loads a template, substituting `fallback` when loading fails. The
/// substitution is logged; callers choose the fallback explicitly.
pub fn load_template_or<P: AsRef<Path>>(path: P, fallback: Vec<TemplateBox>) -> Vec<TemplateBox> {
    match load_template(path) {
        Ok(boxes) => boxes,
        Err(e) => {
            warn!("{e}; using fallback template with {} boxes", fallback.len());
            fallback
        }
    }
}

/// Writes the boxes as pretty-printed JSON. Empty ids become `box_N` and
/// missing labels `Box N` (1-based).
pub fn save_template<P: AsRef<Path>>(path: P, boxes: &[TemplateBox]) -> Result<(), RegistrationError> {
    let normalized: Vec<TemplateBox> = boxes
        .iter()
        .enumerate()
        .map(|(i, b)| {
            let mut b = b.clone();
            if b.id.is_empty() {
                b.id = format!("box_{}", i + 1);
            }
            if b.label.is_none() {
                b.label = Some(format!("Box {}", i + 1));
            }
            b
        })
        .collect();

    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let text = serde_json::to_string_pretty(&normalized)?;
    fs::write(path, text)?;
    Ok(())
}

/// `*.json` files directly inside `dir`, most recently modified first.
pub fn list_templates<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>, RegistrationError> {
    let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if !is_json || !path.is_file() {
            continue;
        }
        let modified = fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((modified, path));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(entries.into_iter().map(|(_, p)| p).collect())
}

/// Built-in eleven-box screen layout, used as an explicit fallback.
pub fn default_template_boxes() -> Vec<TemplateBox> {
    [
        ("box_1", 1.54, 4.62, 4.39, 3.48),
        ("box_2", 1.6, 11.09, 4.22, 3.44),
        ("box_3", 1.51, 17.56, 4.45, 3.3),
        ("box_4", 1.62, 23.98, 4.27, 3.35),
        ("box_5", 1.46, 36.95, 4.45, 3.26),
        ("box_6", 1.56, 43.37, 4.33, 3.39),
        ("box_7", 1.45, 49.83, 4.39, 3.44),
        ("box_8", 1.56, 56.23, 4.27, 3.26),
        ("box_9", 1.59, 62.56, 4.27, 3.26),
        ("box_10", 1.54, 68.76, 4.33, 3.3),
        ("box_11", 9.79, 0.04, 4.36, 3.37),
    ]
    .into_iter()
    .map(|(id, x, y, w, h)| TemplateBox::new(id, x, y, w, h))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_skips_incomplete_items() {
        let boxes = parse_template(
            r#"[
                {"id": "a", "x": 1, "y": 2, "width": 3, "height": 4, "label": "A", "color": "red"},
                {"id": "b", "x": 1, "y": 2, "width": 3},
                "not an object",
                {"id": 7, "x": "5.5", "y": 0, "width": 10, "height": 10}
            ]"#,
        )
        .unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].label.as_deref(), Some("A"));
        assert_eq!(boxes[1].id, "7");
        assert_eq!(boxes[1].x, 5.5);
    }

    #[test]
    fn any_id_value_is_kept() {
        let boxes = parse_template(
            r#"[
                {"id": null, "x": 1, "y": 2, "width": 3, "height": 4},
                {"id": true, "x": true, "y": false, "width": 3, "height": 4},
                {"id": [1, 2], "x": 1, "y": 2, "width": 3, "height": 4},
                {"id": {"k": "v"}, "x": 1, "y": 2, "width": 3, "height": 4},
                {"id": 2.5, "x": 1, "y": 2, "width": 3, "height": 4}
            ]"#,
        )
        .unwrap();
        let ids: Vec<&str> = boxes.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["None", "True", "[1,2]", r#"{"k":"v"}"#, "2.5"]);
        assert_eq!((boxes[1].x, boxes[1].y), (1.0, 0.0));
    }

    #[test]
    fn rejects_non_list_and_empty() {
        assert!(matches!(
            parse_template(r#"{"id": "a"}"#),
            Err(RegistrationError::TemplateLoad(_))
        ));
        assert!(matches!(
            parse_template(r#"[{"x": 1}]"#),
            Err(RegistrationError::TemplateLoad(_))
        ));
        assert!(matches!(parse_template("[oops"), Err(RegistrationError::TemplateLoad(_))));
    }

    #[test]
    fn save_then_load_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");
        let mut boxes = default_template_boxes();
        boxes.push(TemplateBox::new("", 0.1 + 0.2, 1.0 / 3.0, 12.345678901234567, 1e-7));

        save_template(&path, &boxes).unwrap();
        let loaded = load_template(&path).unwrap();

        assert_eq!(loaded.len(), boxes.len());
        for (orig, back) in boxes.iter().zip(&loaded) {
            assert_eq!(orig.x.to_bits(), back.x.to_bits());
            assert_eq!(orig.y.to_bits(), back.y.to_bits());
            assert_eq!(orig.width.to_bits(), back.width.to_bits());
            assert_eq!(orig.height.to_bits(), back.height.to_bits());
        }
        assert_eq!(loaded[11].id, "box_12");
        assert_eq!(loaded[0].label.as_deref(), Some("Box 1"));
    }

    #[test]
    fn fallback_used_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let boxes = load_template_or(dir.path().join("missing.json"), default_template_boxes());
        assert_eq!(boxes.len(), 11);
    }

    #[test]
    fn lists_only_json_files() {
        let dir = tempfile::tempdir().unwrap();
        save_template(dir.path().join("one.json"), &default_template_boxes()).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let listed = list_templates(dir.path()).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].ends_with("one.json"));
    }
}

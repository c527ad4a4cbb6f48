//! Class-id → label index.

use crate::DetectionError;
use std::collections::HashMap;
use std::path::Path;

/// Maps model class ids to human-readable labels.
pub type LabelIndex = HashMap<i64, String>;

/// Load a label index from a text file with one `"{id} {label}"` record per
/// line.
///
/// Blank lines are ignored; a line that does not parse as an id followed by
/// a label is rejected. Detections whose class id is missing from the index
/// are skipped silently downstream.
pub fn load_label_index(path: &Path) -> Result<LabelIndex, DetectionError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| DetectionError::Labels(format!("{}: {e}", path.display())))?;

    let mut index = LabelIndex::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ' ');
        let id = parts
            .next()
            .and_then(|raw| raw.parse::<i64>().ok())
            .ok_or_else(|| {
                DetectionError::Labels(format!(
                    "{}:{}: malformed record '{line}'",
                    path.display(),
                    line_no + 1
                ))
            })?;
        let label = parts.next().map(str::trim).unwrap_or_default();
        if label.is_empty() {
            return Err(DetectionError::Labels(format!(
                "{}:{}: missing label for id {id}",
                path.display(),
                line_no + 1
            )));
        }
        index.insert(id, label.to_string());
    }
    Ok(index)
}

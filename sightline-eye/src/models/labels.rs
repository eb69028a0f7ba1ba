//! Class label tables

use std::sync::Arc;

/// Immutable, cheaply clonable list of class labels indexed by class id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
    labels: Arc<[String]>,
}

impl LabelTable {
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels: labels.into(),
        }
    }

    /// Parse a label file: one label per line, blank lines and `#` comments skipped
    pub fn parse(content: &str) -> Self {
        let labels = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self::new(labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&str> {
        self.labels.get(id).map(String::as_str)
    }

    /// Label for `id`, or `class_<id>` when the table has no entry
    pub fn label(&self, id: usize) -> String {
        match self.get(id) {
            Some(label) => label.to_string(),
            None => format!("class_{}", id),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

impl Default for LabelTable {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FromIterator<String> for LabelTable {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let table = LabelTable::parse("# coco\nperson\n\n  bicycle  \n# trailing\ncar\n");
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(1), Some("bicycle"));
        assert_eq!(table.iter().collect::<Vec<_>>(), vec!["person", "bicycle", "car"]);
    }

    #[test]
    fn test_label_fallback() {
        let table: LabelTable = vec!["walk".to_string()].into_iter().collect();
        assert_eq!(table.label(0), "walk");
        assert_eq!(table.label(7), "class_7");
    }
}

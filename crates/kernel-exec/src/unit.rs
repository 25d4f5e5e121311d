//! Code units and line-range selection.

use serde::{Deserialize, Serialize};

use crate::splitter::SyntaxError;

/// How a unit is treated when the session reaches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    /// Evaluates to a value; the kernel may publish an execute result.
    Expression,
    /// Runs for effect only.
    Statement,
    /// A bare string literal. Rendered as markdown without touching the kernel.
    MarkdownLiteral { text: String },
    /// Source that could not be parsed. Reported without touching the kernel.
    SyntaxError { message: String },
}

impl UnitKind {
    /// Whether units of this kind are sent to the kernel.
    pub fn is_executable(&self) -> bool {
        matches!(self, UnitKind::Expression | UnitKind::Statement)
    }
}

/// One independently executable chunk of a script.
///
/// Line numbers are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub index: usize,
    pub line_start: usize,
    pub line_end: usize,
    pub source: String,
    pub kind: UnitKind,
}

impl CodeUnit {
    /// Unit standing in for a whole script that failed to parse.
    pub fn from_syntax_error(script: &str, error: &SyntaxError) -> Self {
        let line_count = script.lines().count().max(1);
        let line = error.line.clamp(1, line_count);
        Self {
            index: 0,
            line_start: line,
            line_end: line,
            source: script.lines().nth(line - 1).unwrap_or_default().to_string(),
            kind: UnitKind::SyntaxError {
                message: error.to_string(),
            },
        }
    }

    pub fn to_ref(&self) -> UnitRef {
        UnitRef {
            index: self.index,
            line_start: self.line_start,
            line_end: self.line_end,
        }
    }
}

/// Position of a unit within its script, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRef {
    pub index: usize,
    pub line_start: usize,
    pub line_end: usize,
}

impl From<&CodeUnit> for UnitRef {
    fn from(unit: &CodeUnit) -> Self {
        unit.to_ref()
    }
}

/// Inclusive 1-based line window used to run part of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub from: usize,
    pub to: usize,
}

impl LineRange {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    /// True when `start..=end` shares at least one line with this range.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        !(end < self.from || start > self.to)
    }
}

/// Keep units overlapping `range` and renumber them from zero.
///
/// With no range every unit is kept, still renumbered.
pub fn select_units(units: Vec<CodeUnit>, range: Option<LineRange>) -> Vec<CodeUnit> {
    units
        .into_iter()
        .filter(|unit| {
            range
                .map(|r| r.overlaps(unit.line_start, unit.line_end))
                .unwrap_or(true)
        })
        .enumerate()
        .map(|(index, unit)| CodeUnit { index, ..unit })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(index: usize, line_start: usize, line_end: usize) -> CodeUnit {
        CodeUnit {
            index,
            line_start,
            line_end,
            source: format!("x{}", index),
            kind: UnitKind::Statement,
        }
    }

    #[test]
    fn test_overlap_inclusive_bounds() {
        let range = LineRange::new(3, 5);
        assert!(range.overlaps(1, 3));
        assert!(range.overlaps(5, 9));
        assert!(range.overlaps(4, 4));
        assert!(range.overlaps(1, 10));
        assert!(!range.overlaps(1, 2));
        assert!(!range.overlaps(6, 7));
    }

    #[test]
    fn test_select_units_reindexes() {
        let units = vec![unit(0, 1, 1), unit(1, 2, 4), unit(2, 5, 5), unit(3, 6, 8)];
        let selected = select_units(units, Some(LineRange::new(3, 5)));

        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].index, 0);
        assert_eq!(selected[0].line_start, 2);
        assert_eq!(selected[1].index, 1);
        assert_eq!(selected[1].line_start, 5);
        assert_eq!(selected[1].source, "x2");
    }

    #[test]
    fn test_select_units_without_range_keeps_all() {
        let units = vec![unit(4, 1, 1), unit(9, 2, 2)];
        let selected = select_units(units, None);
        assert_eq!(
            selected.iter().map(|u| u.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_select_units_empty_window() {
        let units = vec![unit(0, 1, 1), unit(1, 2, 2)];
        assert!(select_units(units, Some(LineRange::new(10, 12))).is_empty());
    }

    #[test]
    fn test_unit_kind_serialization() {
        let json = serde_json::to_string(&UnitKind::Statement).unwrap();
        assert_eq!(json, r#"{"kind":"statement"}"#);

        let json = serde_json::to_string(&UnitKind::MarkdownLiteral {
            text: "# Title".into(),
        })
        .unwrap();
        assert_eq!(json, r##"{"kind":"markdown_literal","text":"# Title"}"##);
    }

    #[test]
    fn test_from_syntax_error_points_at_line() {
        let script = "a = 1\nb = (\n";
        let error = SyntaxError::new(2, "'(' was never closed");
        let unit = CodeUnit::from_syntax_error(script, &error);
        assert_eq!(unit.line_start, 2);
        assert_eq!(unit.line_end, 2);
        assert_eq!(unit.source, "b = (");
        assert!(matches!(unit.kind, UnitKind::SyntaxError { .. }));
        assert!(!unit.kind.is_executable());
    }
}

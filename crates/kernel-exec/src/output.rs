//! Conversion of kernel output into display items.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::MimeBundle;

/// MIME types tried after images, highest priority first.
const TEXT_PRIORITY: [&str; 4] = [
    "text/html",
    "text/markdown",
    "application/json",
    "text/plain",
];

/// A single piece of rendered output.
///
/// `kind` is a MIME type, a stream name (`stdout`/`stderr`) or `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputItem {
    pub kind: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl OutputItem {
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
            width: None,
            height: None,
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self::new("text/markdown", text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new("error", text)
    }

    pub fn is_error(&self) -> bool {
        self.kind == "error"
    }

    pub fn is_stream(&self) -> bool {
        self.kind == "stdout" || self.kind == "stderr"
    }
}

/// Pick the best representation in a MIME bundle.
///
/// Images win over everything, then HTML, markdown, JSON and plain text.
/// Returns `None` when the bundle has nothing renderable.
pub fn from_mime_bundle(data: &MimeBundle, metadata: &MimeBundle) -> Option<OutputItem> {
    let mime = data
        .keys()
        .find(|k| k.starts_with("image/"))
        .map(String::as_str)
        .or_else(|| {
            TEXT_PRIORITY
                .iter()
                .copied()
                .find(|k| data.contains_key(*k))
        })?;

    let value = data.get(mime)?;
    let content = match (mime, value) {
        ("application/json", v) => v.to_string(),
        (_, Value::String(s)) => s.clone(),
        // nbformat allows multiline strings as arrays of lines
        (_, Value::Array(parts)) if parts.iter().all(Value::is_string) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .concat(),
        (_, v) => v.to_string(),
    };

    let mut item = OutputItem::new(mime, content);
    if mime.starts_with("image/") {
        if let Some(dims) = metadata.get(mime) {
            item.width = dimension(dims, "width");
            item.height = dimension(dims, "height");
        }
    }
    Some(item)
}

fn dimension(dims: &Value, key: &str) -> Option<u32> {
    dims.get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

/// Append stream text, merging with the previous item when it is the same stream.
pub fn append_stream(outputs: &mut Vec<OutputItem>, name: &str, text: &str) {
    match outputs.last_mut() {
        Some(last) if last.kind == name => last.content.push_str(text),
        _ => outputs.push(OutputItem::new(name, text)),
    }
}

/// Apply the items of a `StreamUpdate` to previously received output.
pub fn extend_output(outputs: &mut Vec<OutputItem>, added: Vec<OutputItem>) {
    for item in added {
        if item.is_stream() {
            append_stream(outputs, &item.kind, &item.content);
        } else {
            outputs.push(item);
        }
    }
}

/// Render a kernel error as a single ANSI-free text item.
pub fn error_output(ename: &str, evalue: &str, traceback: &[String]) -> OutputItem {
    let text = if traceback.is_empty() {
        format!("{}: {}", ename, evalue)
    } else {
        traceback.join("\n")
    };
    OutputItem::error(strip_ansi(&text))
}

static ANSI_ESCAPE: OnceLock<Option<Regex>> = OnceLock::new();

fn ansi_regex() -> Option<&'static Regex> {
    ANSI_ESCAPE
        .get_or_init(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").ok())
        .as_ref()
}

/// Remove ANSI escape sequences (colors, cursor movement) from text.
pub fn strip_ansi(text: &str) -> String {
    match ansi_regex() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(value: Value) -> MimeBundle {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_image_takes_priority() {
        let data = bundle(json!({
            "text/plain": "<Figure>",
            "text/html": "<div/>",
            "image/png": "iVBORw0KGgo=",
        }));
        let metadata = bundle(json!({ "image/png": { "width": 640, "height": 480 } }));

        let item = from_mime_bundle(&data, &metadata).unwrap();
        assert_eq!(item.kind, "image/png");
        assert_eq!(item.content, "iVBORw0KGgo=");
        assert_eq!(item.width, Some(640));
        assert_eq!(item.height, Some(480));
    }

    #[test]
    fn test_html_over_markdown_over_plain() {
        let data = bundle(json!({ "text/plain": "x", "text/markdown": "**x**" }));
        let item = from_mime_bundle(&data, &MimeBundle::new()).unwrap();
        assert_eq!(item.kind, "text/markdown");

        let data = bundle(json!({ "text/plain": "x", "text/html": "<b>x</b>" }));
        let item = from_mime_bundle(&data, &MimeBundle::new()).unwrap();
        assert_eq!(item.kind, "text/html");
        assert_eq!(item.content, "<b>x</b>");
    }

    #[test]
    fn test_json_is_serialized() {
        let data = bundle(json!({ "application/json": { "a": [1, 2] }, "text/plain": "{}" }));
        let item = from_mime_bundle(&data, &MimeBundle::new()).unwrap();
        assert_eq!(item.kind, "application/json");
        assert_eq!(item.content, r#"{"a":[1,2]}"#);
    }

    #[test]
    fn test_multiline_array_joined() {
        let data = bundle(json!({ "text/plain": ["line 1\n", "line 2"] }));
        let item = from_mime_bundle(&data, &MimeBundle::new()).unwrap();
        assert_eq!(item.content, "line 1\nline 2");
    }

    #[test]
    fn test_unknown_bundle_is_skipped() {
        let data = bundle(json!({ "application/vnd.custom+json": {} }));
        assert!(from_mime_bundle(&data, &MimeBundle::new()).is_none());
    }

    #[test]
    fn test_stream_coalescing() {
        let mut outputs = Vec::new();
        append_stream(&mut outputs, "stdout", "a\n");
        append_stream(&mut outputs, "stdout", "b\n");
        append_stream(&mut outputs, "stderr", "warn\n");
        append_stream(&mut outputs, "stdout", "c\n");

        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].content, "a\nb\n");
        assert_eq!(outputs[1].kind, "stderr");
        assert_eq!(outputs[2].content, "c\n");
    }

    #[test]
    fn test_error_output_strips_ansi() {
        let traceback = vec![
            "\x1b[0;31mZeroDivisionError\x1b[0m".to_string(),
            "division by zero".to_string(),
        ];
        let item = error_output("ZeroDivisionError", "division by zero", &traceback);
        assert!(item.is_error());
        assert_eq!(item.content, "ZeroDivisionError\ndivision by zero");
    }

    #[test]
    fn test_error_output_without_traceback() {
        let item = error_output("NameError", "name 'x' is not defined", &[]);
        assert_eq!(item.content, "NameError: name 'x' is not defined");
    }

    #[test]
    fn test_strip_ansi_cursor_codes() {
        assert_eq!(strip_ansi("\x1b[2K\x1b[1Gdone"), "done");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_output_item_serialization_skips_dimensions() {
        let json = serde_json::to_string(&OutputItem::new("stdout", "hi")).unwrap();
        assert_eq!(json, r#"{"kind":"stdout","content":"hi"}"#);
    }
}

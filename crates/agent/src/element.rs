//! Display elements and the JSON answer format that references them.
//!
//! Tools deposit tables and graphics into a per-request [`Resources`] table
//! and hand the model an identifier. The model's final answer is a JSON
//! object listing text items and references to those identifiers, which
//! [`unparse_answer`] resolves back into [`Element`]s.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

/// One piece of a shell answer, in display order.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// Literal text. Anything the model writes ends up here, Markdown included.
    Text(String),
    /// A picture encoded as a string.
    Graphics { id: String, content: String },
    Table {
        id: String,
        rows: Vec<Map<String, Value>>,
    },
}

impl Element {
    pub fn kind(&self) -> &'static str {
        match self {
            Element::Text(_) => "text",
            Element::Graphics { .. } => "graphics",
            Element::Table { .. } => "table",
        }
    }
}

/// Flatten elements to the text stored in history for the model to see.
///
/// Graphics and tables become placeholders naming their identifier.
pub fn textify(elements: &[Element]) -> String {
    elements
        .iter()
        .map(|element| match element {
            Element::Text(text) => text.clone(),
            Element::Graphics { id, .. } => format!("\nDiagram {id}\n"),
            Element::Table { id, .. } => format!("\nTable {id}\n"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// The model's answer could not be turned into elements.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Wrong answer: {0}")]
pub struct WrongAnswer(pub String);

/// Tables and graphics produced by tools during one request attempt.
///
/// Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    items: Arc<Mutex<HashMap<String, Element>>>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a table and return its fresh identifier.
    pub async fn add_table(&self, rows: Vec<Map<String, Value>>) -> String {
        let id = fresh_id();
        debug!(id = %id, rows = rows.len(), "Stored table resource");
        self.items.lock().await.insert(
            id.clone(),
            Element::Table {
                id: id.clone(),
                rows,
            },
        );
        id
    }

    /// Store a graphic and return its fresh identifier.
    pub async fn add_graphics(&self, content: impl Into<String>) -> String {
        let id = fresh_id();
        debug!(id = %id, "Stored graphics resource");
        self.items.lock().await.insert(
            id.clone(),
            Element::Graphics {
                id: id.clone(),
                content: content.into(),
            },
        );
        id
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// A copy of the current contents.
    pub async fn snapshot(&self) -> HashMap<String, Element> {
        self.items.lock().await.clone()
    }
}

/// The last 12 hex digits of a random UUID. Short enough for a model to
/// copy back reliably.
fn fresh_id() -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full[full.len() - 12..].to_string()
}

/// Pull a JSON object out of a model answer.
///
/// Accepts either an answer that is entirely a JSON object or one that
/// contains exactly one ```` ```json ```` fenced block holding an object.
pub fn extract_json(text: &str) -> Option<Map<String, Value>> {
    let text = text.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        return Some(map);
    }

    let blocks = json_blocks(text);
    match blocks.as_slice() {
        [only] => match serde_json::from_str::<Value>(only.trim()) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

/// Bodies of all ```` ```json ```` fences. The opening tag is matched
/// case-insensitively and must be followed by whitespace ending in a
/// newline; a body ends at the first newline followed by a closing fence.
fn json_blocks(text: &str) -> Vec<&str> {
    const OPEN: &str = "```json";
    const CLOSE: &str = "\n```";

    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();
    let mut blocks = Vec::new();
    let mut pos = 0;

    while let Some(found) = lower[pos..].find(OPEN) {
        let after_tag = pos + found + OPEN.len();
        let rest = &text[after_tag..];
        let ws_len = rest.len() - rest.trim_start().len();
        let Some(newline) = rest[..ws_len].rfind('\n') else {
            pos = after_tag;
            continue;
        };
        let body_start = after_tag + newline + 1;
        // An empty body closes on the newline before `body_start`, which
        // only exists if the opening whitespace held a second newline.
        let search_from = if rest[..newline].contains('\n') {
            body_start - 1
        } else {
            body_start
        };
        let Some(close_at) = text[search_from..].find(CLOSE).map(|i| search_from + i) else {
            break;
        };
        blocks.push(&text[body_start..close_at.max(body_start)]);
        pos = close_at + CLOSE.len();
    }
    blocks
}

/// Turn a model answer into elements, resolving resource references.
///
/// The answer must hold a JSON object with an `items` list. Each item is
/// `{"type": "text", "text": ...}`, `{"type": "graphics", "graphics": id}`
/// or `{"type": "table", "table": id}`, where `id` names a resource of the
/// matching kind.
pub fn unparse_answer(
    resources: &HashMap<String, Element>,
    text: &str,
) -> Result<Vec<Element>, WrongAnswer> {
    debug!(answer = text, resources = resources.len(), "Unparsing answer");
    let object = extract_json(text).ok_or_else(|| {
        WrongAnswer("Could not extract a JSON object from the answer string".into())
    })?;
    let items = object
        .get("items")
        .ok_or_else(|| WrongAnswer("'items' not a member of the result".into()))?;
    let Value::Array(items) = items else {
        return Err(WrongAnswer(format!("Result {items} is not a JSON list")));
    };

    items
        .iter()
        .map(|item| unparse_item(resources, item))
        .collect()
}

fn unparse_item(resources: &HashMap<String, Element>, item: &Value) -> Result<Element, WrongAnswer> {
    let Value::Object(fields) = item else {
        return Err(WrongAnswer("Element not a dictionary".into()));
    };
    let kind = fields
        .get("type")
        .ok_or_else(|| WrongAnswer("Field 'type' missing".into()))?;

    match kind.as_str() {
        Some("text") => match fields.get("text") {
            Some(Value::String(text)) => Ok(Element::Text(text.clone())),
            _ => Err(WrongAnswer(
                "Type is text but no 'text' field with string type available".into(),
            )),
        },
        Some(kind @ ("graphics" | "table")) => {
            let reference = fields.get(kind).ok_or_else(|| {
                WrongAnswer(format!("Type is '{kind}' but no '{kind}' field is present in {item}"))
            })?;
            let found = reference
                .as_str()
                .and_then(|id| resources.get(id))
                .ok_or_else(|| {
                    WrongAnswer(format!(
                        "'{kind}' field in {item} does not point to anything in resources"
                    ))
                })?;
            if found.kind() != kind {
                return Err(WrongAnswer(format!(
                    "'{kind}' field in {item} points to a {} resource",
                    found.kind()
                )));
            }
            Ok(found.clone())
        }
        _ => Err(WrongAnswer(format!(
            "Unexpected value of 'type' field in {item}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn textify_uses_placeholders() {
        let elements = vec![
            Element::Text("Here:".into()),
            Element::Table {
                id: "t1".into(),
                rows: vec![],
            },
            Element::Graphics {
                id: "g1".into(),
                content: "png".into(),
            },
        ];
        assert_eq!(textify(&elements), "Here: \nTable t1\n \nDiagram g1\n");
        assert_eq!(textify(&[]), "");
    }

    #[test]
    fn extract_whole_object() {
        let map = extract_json("  {\"items\": []} \n").unwrap();
        assert!(map.contains_key("items"));
        assert!(extract_json("[1, 2]").is_none());
        assert!(extract_json("just words").is_none());
    }

    #[test]
    fn extract_single_fenced_block() {
        let text = "Sure, here you go:\n```JSON  \n{\"items\": [1]}\n```\nBye.";
        assert_eq!(extract_json(text).unwrap()["items"], json!([1]));
    }

    #[test]
    fn extract_rejects_two_blocks() {
        let text = "```json\n{\"a\": 1}\n```\nand\n```json\n{\"b\": 2}\n```";
        assert!(extract_json(text).is_none());
    }

    #[test]
    fn extract_requires_newline_after_tag() {
        assert!(extract_json("```json {\"a\": 1}\n```").is_none());
    }

    #[test]
    fn unparse_text_items() {
        let answer = r#"{"items": [{"type": "text", "text": "one"}, {"type": "text", "text": "two"}]}"#;
        let elements = unparse_answer(&HashMap::new(), answer).unwrap();
        assert_eq!(
            elements,
            vec![Element::Text("one".into()), Element::Text("two".into())]
        );
    }

    #[tokio::test]
    async fn unparse_resolves_resources() {
        let resources = Resources::new();
        let table = resources.add_table(vec![row(&[("n", json!(1))])]).await;
        let graphic = resources.add_graphics("iVBOR").await;
        assert_eq!(table.len(), 12);
        assert_ne!(table, graphic);

        let answer = json!({"items": [
            {"type": "graphics", "graphics": graphic},
            {"type": "table", "table": table},
        ]})
        .to_string();
        let elements = unparse_answer(&resources.snapshot().await, &answer).unwrap();
        assert_eq!(elements[0].kind(), "graphics");
        assert!(matches!(&elements[1], Element::Table { rows, .. } if rows.len() == 1));
    }

    #[tokio::test]
    async fn unparse_rejects_kind_mismatch() {
        let resources = Resources::new();
        let table = resources.add_table(vec![]).await;
        let answer = json!({"items": [{"type": "graphics", "graphics": table}]}).to_string();
        let err = unparse_answer(&resources.snapshot().await, &answer).unwrap_err();
        assert!(err.0.contains("points to a table resource"), "{err}");
    }

    #[test]
    fn unparse_failures_are_wrong_answers() {
        let empty = HashMap::new();
        let cases = [
            ("no json here", "Could not extract"),
            (r#"{"other": 1}"#, "'items' not a member"),
            (r#"{"items": 3}"#, "not a JSON list"),
            (r#"{"items": [3]}"#, "not a dictionary"),
            (r#"{"items": [{}]}"#, "'type' missing"),
            (r#"{"items": [{"type": "text", "text": 1}]}"#, "string type"),
            (r#"{"items": [{"type": "table"}]}"#, "no 'table' field"),
            (r#"{"items": [{"type": "table", "table": "nope"}]}"#, "does not point"),
            (r#"{"items": [{"type": "video"}]}"#, "Unexpected value"),
        ];
        for (answer, expected) in cases {
            let err = unparse_answer(&empty, answer).unwrap_err();
            assert!(err.0.contains(expected), "{answer}: {err}");
        }
    }
}

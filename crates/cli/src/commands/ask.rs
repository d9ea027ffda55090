//! `parley ask`: one shell request over a history file.

use std::path::Path;

use anyhow::Context;
use parley_agent::{Driver, Element, Shell};
use parley_config::AppConfig;
use serde_json::Value;
use tracing::debug;

use crate::tools;

pub async fn run(config: &AppConfig, utterance: &str, history: &Path) -> anyhow::Result<()> {
    let llm = parley_providers::create_llm(config)?;
    let shell = tools::with_shell_tools(Shell::new(Driver::new(llm), &config.shell));
    let elements = ask(&shell, utterance, history).await?;
    println!("{}", render(&elements));
    Ok(())
}

/// Run the request and rewrite `history` with the updated records.
pub async fn ask(shell: &Shell, utterance: &str, history: &Path) -> anyhow::Result<Vec<Element>> {
    let records = read_history(history).await?;
    let (elements, records) = shell.request(&records, utterance).await?;
    let json = serde_json::to_string_pretty(&records)?;
    tokio::fs::write(history, json)
        .await
        .with_context(|| format!("writing history to {}", history.display()))?;
    debug!(records = records.len(), path = %history.display(), "History saved");
    Ok(elements)
}

async fn read_history(path: &Path) -> anyhow::Result<Vec<Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading history from {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON list of history records", path.display()))
}

/// Plain-text rendering of answer elements.
pub fn render(elements: &[Element]) -> String {
    let mut out = Vec::new();
    for element in elements {
        match element {
            Element::Text(text) => out.push(text.clone()),
            Element::Graphics { id, content } => {
                out.push(format!("[diagram {id}, {} bytes]", content.len()))
            }
            Element::Table { rows, .. } => out.push(render_table(rows)),
        }
    }
    out.join("\n\n")
}

fn render_table(rows: &[serde_json::Map<String, Value>]) -> String {
    let Some(first) = rows.first() else {
        return "(empty table)".into();
    };
    let headings: Vec<&String> = first.keys().collect();
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            headings
                .iter()
                .map(|h| match row.get(*h) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                })
                .collect()
        })
        .collect();

    let widths: Vec<usize> = headings
        .iter()
        .enumerate()
        .map(|(i, h)| {
            cells
                .iter()
                .map(|row| row[i].chars().count())
                .chain([h.chars().count()])
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: Vec<&str>| {
        values
            .iter()
            .zip(&widths)
            .map(|(v, &w)| format!("{v:<w$}"))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![line(headings.iter().map(|h| h.as_str()).collect())];
    lines.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    for row in &cells {
        lines.push(line(row.iter().map(String::as_str).collect()));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_text_and_tables() {
        let row = |a: Value, b: Value| {
            let mut map = serde_json::Map::new();
            map.insert("n".into(), b);
            map.insert("name".into(), a);
            map
        };
        let elements = vec![
            Element::Text("Counts:".into()),
            Element::Table {
                id: "t".into(),
                rows: vec![row(json!("alpha"), json!(1)), row(json!("b"), json!(22))],
            },
        ];
        assert_eq!(
            render(&elements),
            "Counts:\n\nn  | name\n---+------\n1  | alpha\n22 | b"
        );
    }

    #[test]
    fn renders_empty_table_and_graphics() {
        let elements = vec![
            Element::Table {
                id: "t".into(),
                rows: vec![],
            },
            Element::Graphics {
                id: "g".into(),
                content: "abcd".into(),
            },
        ];
        assert_eq!(render(&elements), "(empty table)\n\n[diagram g, 4 bytes]");
    }
}

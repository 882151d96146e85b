//! Outstanding-task detection from the producing agent's JSONL transcript.
//!
//! Two task mechanisms are understood: the latest `TodoWrite` list wins
//! wholesale, while `TaskCreate`/`TaskUpdate` calls are replayed in order to
//! rebuild the task table. Anything not `completed` is outstanding.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

/// One unfinished todo or task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingItem {
    pub status: String,
    pub content: String,
    /// Set for task-system entries, absent for `TodoWrite` todos.
    pub task_id: Option<String>,
}

impl OutstandingItem {
    pub fn render(&self) -> String {
        match &self.task_id {
            Some(id) => format!("  - [{}] (Task #{id}) {}", self.status, self.content),
            None => format!("  - [{}] {}", self.status, self.content),
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedTask {
    id: String,
    subject: String,
    description: String,
    status: String,
}

/// Task table keyed by id; `order` keeps first-seen order for reporting.
#[derive(Debug, Default)]
struct TaskLedger {
    latest_todos: Vec<Value>,
    tasks: BTreeMap<String, TrackedTask>,
    order: Vec<String>,
    next_task_id: u64,
}

impl TaskLedger {
    fn apply(&mut self, tool: &str, input: &Value) {
        match tool {
            "TodoWrite" => {
                if let Some(todos) = input.get("todos").and_then(Value::as_array)
                    && !todos.is_empty()
                {
                    self.latest_todos = todos.clone();
                }
            }
            "TaskCreate" => {
                self.next_task_id += 1;
                let id = self.next_task_id.to_string();
                let task = TrackedTask {
                    id: id.clone(),
                    subject: str_field(input, "subject").unwrap_or_default(),
                    description: str_field(input, "description").unwrap_or_default(),
                    status: "pending".to_string(),
                };
                self.insert(id, task);
            }
            "TaskUpdate" => {
                let Some(id) = task_id(input) else {
                    return;
                };
                if !self.tasks.contains_key(&id) {
                    let placeholder = TrackedTask {
                        id: id.clone(),
                        subject: format!("Task {id}"),
                        description: String::new(),
                        status: "pending".to_string(),
                    };
                    self.insert(id.clone(), placeholder);
                }
                let Some(task) = self.tasks.get_mut(&id) else {
                    return;
                };
                if let Some(status) = str_field(input, "status") {
                    task.status = status;
                }
                if let Some(subject) = str_field(input, "subject") {
                    task.subject = subject;
                }
                if let Some(description) = str_field(input, "description") {
                    task.description = description;
                }
            }
            _ => {}
        }
    }

    /// A create replaces any entry with the same id, keeping its position.
    fn insert(&mut self, id: String, task: TrackedTask) {
        if self.tasks.insert(id.clone(), task).is_none() {
            self.order.push(id);
        }
    }

    fn outstanding(&self) -> Vec<OutstandingItem> {
        let todos = self.latest_todos.iter().filter_map(|todo| {
            let status = str_field(todo, "status").unwrap_or_default();
            (status != "completed").then(|| OutstandingItem {
                status,
                content: str_field(todo, "content").unwrap_or_default(),
                task_id: None,
            })
        });
        let tasks = self
            .order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|task| task.status != "completed")
            .map(|task| {
                let content = if !task.subject.is_empty() {
                    task.subject.clone()
                } else if !task.description.is_empty() {
                    task.description.clone()
                } else {
                    format!("Task {}", task.id)
                };
                OutstandingItem {
                    status: task.status.clone(),
                    content,
                    task_id: Some(task.id.clone()),
                }
            });
        todos.chain(tasks).collect()
    }
}

/// Scan a transcript for unfinished todos and tasks.
///
/// A missing transcript has no outstanding items. Malformed lines are skipped;
/// an unreadable file is an error.
pub fn find_outstanding(path: &Path) -> Result<Vec<OutstandingItem>> {
    if !path.exists() {
        debug!(path = %path.display(), "no transcript");
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("open transcript {}", path.display()))?;
    let mut ledger = TaskLedger::default();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read transcript {}", path.display()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        for (tool, input) in tool_calls(&entry) {
            ledger.apply(&tool, &input);
        }
    }
    let outstanding = ledger.outstanding();
    debug!(outstanding = outstanding.len(), "transcript scanned");
    Ok(outstanding)
}

/// Tool calls carried by one transcript entry, in order.
fn tool_calls(entry: &Value) -> Vec<(String, Value)> {
    let kind = entry.get("type").and_then(Value::as_str);
    let blocks = match kind {
        Some("assistant") => entry
            .get("message")
            .and_then(|message| message.get("content")),
        Some("message") => entry.get("content"),
        Some("tool_use") => {
            let name = non_empty_str(entry, "name").or_else(|| non_empty_str(entry, "tool_name"));
            let input = non_empty_object(entry, "input")
                .or_else(|| non_empty_object(entry, "tool_input"))
                .unwrap_or(Value::Null);
            return name.map(|name| vec![(name, input)]).unwrap_or_default();
        }
        _ => None,
    };
    let Some(blocks) = blocks.and_then(Value::as_array) else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
        .filter_map(|block| {
            let name = non_empty_str(block, "name")?;
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            Some((name, input))
        })
        .collect()
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn non_empty_str(value: &Value, key: &str) -> Option<String> {
    str_field(value, key).filter(|s| !s.is_empty())
}

fn non_empty_object(value: &Value, key: &str) -> Option<Value> {
    value
        .get(key)
        .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
        .cloned()
}

fn task_id(input: &Value) -> Option<String> {
    match input.get("taskId")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write_transcript(lines: &[Value]) -> (tempfile::TempDir, std::path::PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("transcript.jsonl");
        let mut body: Vec<String> = lines.iter().map(Value::to_string).collect();
        body.insert(1.min(body.len()), "{not json".to_string());
        fs::write(&path, body.join("\n")).expect("write");
        (temp, path)
    }

    fn assistant_tool(name: &str, input: Value) -> Value {
        json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "name": name, "input": input}]}
        })
    }

    #[test]
    fn latest_todo_write_wins() {
        let (_temp, path) = write_transcript(&[
            assistant_tool(
                "TodoWrite",
                json!({"todos": [{"content": "old", "status": "pending"}]}),
            ),
            assistant_tool(
                "TodoWrite",
                json!({"todos": [
                    {"content": "write tests", "status": "completed"},
                    {"content": "fix parser", "status": "in_progress"}
                ]}),
            ),
        ]);
        let items = find_outstanding(&path).expect("scan");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].render(), "  - [in_progress] fix parser");
    }

    #[test]
    fn task_create_and_update_are_replayed() {
        let (_temp, path) = write_transcript(&[
            assistant_tool("TaskCreate", json!({"subject": "first"})),
            json!({"type": "message", "content": [
                {"type": "tool_use", "name": "TaskCreate", "input": {"subject": "second"}}
            ]}),
            json!({"type": "tool_use", "tool_name": "TaskUpdate",
                   "tool_input": {"taskId": "1", "status": "completed"}}),
            assistant_tool("TaskUpdate", json!({"taskId": "7", "status": "in_progress"})),
        ]);
        let rendered: Vec<String> = find_outstanding(&path)
            .expect("scan")
            .iter()
            .map(OutstandingItem::render)
            .collect();
        assert_eq!(
            rendered,
            vec![
                "  - [pending] (Task #2) second".to_string(),
                "  - [in_progress] (Task #7) Task 7".to_string(),
            ]
        );
    }

    #[test]
    fn all_completed_is_clean() {
        let (_temp, path) = write_transcript(&[
            assistant_tool("TaskCreate", json!({"subject": "only"})),
            assistant_tool("TaskUpdate", json!({"taskId": "1", "status": "completed"})),
        ]);
        assert!(find_outstanding(&path).expect("scan").is_empty());
    }

    #[test]
    fn create_replaces_placeholder_from_earlier_update() {
        let (_temp, path) = write_transcript(&[
            assistant_tool("TaskUpdate", json!({"taskId": "1", "status": "in_progress"})),
            assistant_tool("TaskCreate", json!({"subject": "wire the parser"})),
            assistant_tool("TaskUpdate", json!({"taskId": "1", "status": "completed"})),
        ]);
        assert!(find_outstanding(&path).expect("scan").is_empty());
    }

    #[test]
    fn missing_transcript_is_clean() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(
            find_outstanding(&temp.path().join("absent.jsonl"))
                .expect("scan")
                .is_empty()
        );
    }
}

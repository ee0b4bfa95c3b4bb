//! The task registry and the task-list file format.
//!
//! A task-list file is CSV with one task per line: `<task_name>[,<data>]`.
//! Blank lines and lines with an empty first field are ignored. Every name
//! must exist in the registry or the whole file is rejected.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::schedule::{NamedTask, Task};
use crate::tasks::flask::Flask;
use crate::tasks::pfpflask::PfpFlask;
use crate::tasks::tank::Tank;
use crate::tasks::zero::Zero;

/// One line of a task-list file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEntry {
    pub name: String,
    pub data: Option<String>,
}

impl TaskEntry {
    pub fn new(name: impl Into<String>) -> Self {
        TaskEntry {
            name: name.into(),
            data: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TaskListError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown task {name:?}")]
    UnknownTask { name: String },
}

/// Name -> task factory map. Built once at startup and read-only afterwards.
#[derive(Default)]
pub struct Registry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock bench wiring: flasks on SSV 3..8, tanks on the
    /// high-pressure positions 13..16, zero gas on 9, and a 12-flask PFP
    /// package on SSV 1.
    pub fn standard() -> Self {
        let mut registry = Registry::new();
        for flask in 1..=6u8 {
            registry.register(format!("Flask {flask}"), Arc::new(Flask::new(flask + 2)));
        }
        for tank in 1..=4u8 {
            registry.register(format!("Tank {tank}"), Arc::new(Tank::new(tank + 12)));
        }
        registry.register("Zero", Arc::new(Zero));
        for flask in 1..=12u8 {
            registry.register(format!("PFP Flask {flask}"), Arc::new(PfpFlask::new(flask, 1)));
        }
        registry
    }

    /// Register a task under a name. Startup-time only.
    pub fn register(&mut self, name: impl Into<String>, task: Arc<dyn Task>) {
        self.tasks.insert(name.into(), task);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    /// Registered names, sorted for display.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Load a task-list file, rejecting it entirely on any unknown name.
    pub fn load_task_list(&self, path: &Path) -> Result<Vec<TaskEntry>, TaskListError> {
        let content = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let Some(entry) = parse_line(line) else {
                continue;
            };
            if self.get(&entry.name).is_none() {
                return Err(TaskListError::UnknownTask { name: entry.name });
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Resolve entries to schedulable tasks.
    pub fn resolve(&self, entries: &[TaskEntry]) -> Result<Vec<NamedTask>, TaskListError> {
        entries
            .iter()
            .map(|entry| {
                self.get(&entry.name)
                    .map(|task| NamedTask::new(entry.name.as_str(), task))
                    .ok_or_else(|| TaskListError::UnknownTask {
                        name: entry.name.clone(),
                    })
            })
            .collect()
    }
}

fn parse_line(line: &str) -> Option<TaskEntry> {
    let (name, data) = match line.split_once(',') {
        Some((name, data)) => (name.trim(), Some(data.trim())),
        None => (line.trim(), None),
    };
    if name.is_empty() {
        return None;
    }
    Some(TaskEntry {
        name: name.to_string(),
        data: data.filter(|data| !data.is_empty()).map(str::to_string),
    })
}

/// Save a task list: one task per line, data comma-joined after the name.
pub fn save_task_list(path: &Path, entries: &[TaskEntry]) -> std::io::Result<()> {
    let mut content = String::new();
    for entry in entries {
        content.push_str(&entry.name);
        if let Some(data) = &entry.data {
            content.push(',');
            content.push_str(data);
        }
        content.push('\n');
    }
    std::fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_knows_the_bench() {
        let registry = Registry::standard();
        assert!(registry.get("Flask 1").is_some());
        assert!(registry.get("Tank 4").is_some());
        assert!(registry.get("Zero").is_some());
        assert!(registry.get("PFP Flask 12").is_some());
        assert!(registry.get("Flask 99").is_none());
    }

    #[test]
    fn blank_and_empty_name_lines_are_ignored() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line(" , data"), None);
        assert_eq!(
            parse_line("Zero"),
            Some(TaskEntry::new("Zero".to_string()))
        );
        assert_eq!(
            parse_line("PFP Flask 3, 12"),
            Some(TaskEntry {
                name: "PFP Flask 3".to_string(),
                data: Some("12".to_string()),
            })
        );
    }

    #[test]
    fn unknown_name_rejects_the_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.csv");
        std::fs::write(&path, "Zero\nNot A Task\nFlask 1\n").unwrap();
        let registry = Registry::standard();
        match registry.load_task_list(&path) {
            Err(TaskListError::UnknownTask { name }) => assert_eq!(name, "Not A Task"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn load_save_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.csv");
        std::fs::write(&path, "\nZero\nFlask 2 , note \n\nTank 1\n").unwrap();
        let registry = Registry::standard();

        let entries = registry.load_task_list(&path).unwrap();
        let saved = dir.path().join("saved.csv");
        save_task_list(&saved, &entries).unwrap();
        let reloaded = registry.load_task_list(&saved).unwrap();
        assert_eq!(entries, reloaded);
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded[1].name, "Flask 2");
        assert_eq!(reloaded[1].data.as_deref(), Some("note"));
    }

    #[test]
    fn resolve_produces_named_tasks() {
        let registry = Registry::standard();
        let entries = vec![TaskEntry::new("Zero"), TaskEntry::new("Flask 1")];
        let tasks = registry.resolve(&entries).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name.as_deref(), Some("Zero"));
    }
}

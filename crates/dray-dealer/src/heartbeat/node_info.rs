//! Tolerant parsing of a node's info reply.
//!
//! The reply is a JSON tree describing the apps a node runs and the tasks
//! each app exposes. Nodes of different vintages disagree on optional
//! fields, so anything that does not match is skipped with a warning
//! instead of failing the whole reply.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

/// Task type the dealer can talk to.
const NATIVE_SERVER: &str = "native-server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Transport address of the task.
    pub endpoint: String,
    /// Route token addressing this task instance.
    pub route: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppInfo {
    pub running: bool,
    pub tasks: BTreeMap<String, TaskInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub apps: BTreeMap<String, AppInfo>,
}

impl NodeInfo {
    /// Parse an info reply. Returns `None` only when the bytes are not a
    /// JSON object at all.
    pub fn parse(bytes: &[u8], source: &str) -> Option<NodeInfo> {
        let value: Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(source, error = %e, "malformed info reply");
                return None;
            }
        };
        let root = match value.as_object() {
            Some(root) => root,
            None => {
                warn!(source, "info reply is not an object");
                return None;
            }
        };

        let mut info = NodeInfo::default();
        let Some(apps) = root.get("apps").and_then(Value::as_object) else {
            debug!(source, "info reply carries no apps");
            return Some(info);
        };

        for (app_name, app_value) in apps {
            let Some(app) = app_value.as_object() else {
                warn!(source, app = %app_name, "app entry is not an object, skipped");
                continue;
            };

            let running = match app.get("running") {
                Some(Value::Bool(running)) => *running,
                other => {
                    warn!(source, app = %app_name, field = ?other, "unreadable running flag, assuming stopped");
                    false
                }
            };

            let mut tasks = BTreeMap::new();
            if let Some(raw_tasks) = app.get("tasks").and_then(Value::as_object) {
                for (task_name, task_value) in raw_tasks {
                    match parse_task(task_value) {
                        Some(task) => {
                            tasks.insert(task_name.clone(), task);
                        }
                        None => {
                            debug!(source, app = %app_name, task = %task_name, "task skipped");
                        }
                    }
                }
            }

            info.apps
                .insert(app_name.clone(), AppInfo { running, tasks });
        }

        Some(info)
    }
}

fn parse_task(value: &Value) -> Option<TaskInfo> {
    let task = value.as_object()?;
    let kind = task.get("type").and_then(Value::as_str)?;
    if kind != NATIVE_SERVER {
        return None;
    }
    let endpoint = task.get("endpoint").and_then(Value::as_str)?;
    let route = task.get("route").and_then(Value::as_str)?;
    Some(TaskInfo {
        endpoint: endpoint.to_owned(),
        route: route.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_reply() {
        let reply = br#"{
            "apps": {
                "karma_app": {
                    "running": true,
                    "tasks": {
                        "h1": { "type": "native-server", "endpoint": "10.0.0.1:6000", "route": "node-a/h1" },
                        "h2": { "type": "native-server", "endpoint": "10.0.0.1:6001", "route": "node-a/h2" }
                    }
                },
                "stopped_app": { "running": false, "tasks": {} }
            }
        }"#;

        let info = NodeInfo::parse(reply, "10.0.0.1:5555").unwrap();
        assert_eq!(info.apps.len(), 2);

        let app = &info.apps["karma_app"];
        assert!(app.running);
        assert_eq!(app.tasks.len(), 2);
        assert_eq!(app.tasks["h1"].route, "node-a/h1");
        assert!(!info.apps["stopped_app"].running);
    }

    #[test]
    fn non_native_tasks_are_skipped() {
        let reply = br#"{
            "apps": {
                "a": {
                    "running": true,
                    "tasks": {
                        "web": { "type": "http-server", "endpoint": "x", "route": "y" },
                        "ok": { "type": "native-server", "endpoint": "10.0.0.1:6000", "route": "r" }
                    }
                }
            }
        }"#;
        let info = NodeInfo::parse(reply, "test").unwrap();
        assert_eq!(info.apps["a"].tasks.len(), 1);
        assert!(info.apps["a"].tasks.contains_key("ok"));
    }

    #[test]
    fn missing_fields_do_not_fail_the_reply() {
        let reply = br#"{
            "apps": {
                "a": {
                    "tasks": {
                        "broken": { "type": "native-server", "endpoint": "x" }
                    }
                }
            }
        }"#;
        let info = NodeInfo::parse(reply, "test").unwrap();
        assert!(!info.apps["a"].running);
        assert!(info.apps["a"].tasks.is_empty());
    }

    #[test]
    fn garbage_is_none() {
        assert!(NodeInfo::parse(b"not json", "test").is_none());
        assert!(NodeInfo::parse(b"[1,2,3]", "test").is_none());
    }

    #[test]
    fn empty_apps_is_a_valid_reply() {
        let info = NodeInfo::parse(b"{}", "test").unwrap();
        assert!(info.apps.is_empty());
    }
}

//! State assertion plugin.
//!
//! Nodes report application fields with `field-set`; scheduled `check-state`
//! events compare a reported field against an expected value. Every check is
//! recorded and, when an output path is configured, written to a JSON summary
//! on close.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use super::{Capabilities, Plugin, PluginError, PluginEvent};
use crate::common::config::EventAction;

/// Outcome of one `check-state` assertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateEvent {
    pub time_ms: u64,
    pub address: String,
    pub key: String,
    pub expected: String,
    /// Value last reported by the node, if any.
    pub actual: Option<String>,
    pub result: bool,
    /// Why the check could not be evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
struct Summary<'a> {
    generated: String,
    passed: usize,
    failed: usize,
    events: &'a [StateEvent],
}

#[derive(Debug, Default)]
pub struct StateManager {
    fields: HashMap<String, BTreeMap<String, String>>,
    events: Vec<StateEvent>,
    output: Option<PathBuf>,
}

impl StateManager {
    pub fn new(output: Option<PathBuf>) -> Self {
        StateManager {
            output,
            ..Self::default()
        }
    }

    /// Last value of `name` reported by `address`.
    pub fn field(&self, address: &str, name: &str) -> Option<&str> {
        self.fields.get(address)?.get(name).map(String::as_str)
    }

    pub fn events(&self) -> &[StateEvent] {
        &self.events
    }

    pub fn failed(&self) -> usize {
        self.events.iter().filter(|e| !e.result).count()
    }

    fn check(&mut self, time_ms: u64, address: &str, data: &BTreeMap<String, String>) {
        let key = data.get("key").cloned().unwrap_or_default();
        let expected = data.get("value").cloned().unwrap_or_default();
        let actual = self.field(address, &key).map(str::to_string);

        let error = if key.is_empty() {
            Some("check-state needs a 'key'".to_string())
        } else if actual.is_none() {
            Some(format!("{} never reported '{}'", address, key))
        } else {
            None
        };
        let result = error.is_none() && actual.as_deref() == Some(expected.as_str());

        if result {
            log::info!("t={} ms: {} {} == {:?}", time_ms, address, key, expected);
        } else {
            log::warn!("t={} ms: {} {} expected {:?}, found {:?}", time_ms, address, key, expected, actual);
        }
        self.events.push(StateEvent {
            time_ms,
            address: address.to_string(),
            key,
            expected,
            actual,
            result,
            error,
        });
    }

    fn write_summary(&self, path: &Path) -> Result<(), PluginError> {
        let failed = self.failed();
        let summary = Summary {
            generated: chrono::Local::now().to_rfc3339(),
            passed: self.events.len() - failed,
            failed,
            events: &self.events,
        };
        let json = serde_json::to_string_pretty(&summary).map_err(|e| PluginError::Io(e.to_string()))?;
        fs::write(path, json).map_err(|e| PluginError::Io(format!("{}: {}", path.display(), e)))?;
        log::info!("State summary written to {}", path.display());
        Ok(())
    }
}

impl Plugin for StateManager {
    fn name(&self) -> &str {
        "state"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            event: true,
            ..Capabilities::default()
        }
    }

    fn on_event(&mut self, time_ms: u64, address: &str, event: &PluginEvent) -> Result<(), PluginError> {
        match event {
            PluginEvent::FieldSet { name, value } => {
                let value = String::from_utf8_lossy(value).into_owned();
                self.fields.entry(address.to_string()).or_default().insert(name.to_string(), value);
            }
            PluginEvent::Scheduled {
                action: EventAction::CheckState,
                data,
                ..
            } => self.check(time_ms, address, data),
            PluginEvent::Scheduled {
                action: EventAction::SetLocation,
                ..
            }
            | PluginEvent::NodeEvent { .. } => {}
        }
        Ok(())
    }

    fn on_close(&mut self) -> Result<(), PluginError> {
        log::info!("State checks: {} passed, {} failed", self.events.len() - self.failed(), self.failed());
        match &self.output {
            Some(path) => self.write_summary(path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_data(key: &str, value: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("key".to_string(), key.to_string()), ("value".to_string(), value.to_string())])
    }

    fn scheduled(data: &BTreeMap<String, String>) -> PluginEvent<'_> {
        PluginEvent::Scheduled {
            action: EventAction::CheckState,
            data,
            comment: "",
        }
    }

    #[test]
    fn checks_compare_last_reported_field() {
        let mut state = StateManager::new(None);
        state
            .on_event(
                10,
                "a",
                &PluginEvent::FieldSet {
                    name: "role",
                    value: b"leader",
                },
            )
            .unwrap();
        assert_eq!(state.field("a", "role"), Some("leader"));

        let ok = check_data("role", "leader");
        let wrong = check_data("role", "follower");
        let unknown = check_data("height", "3");
        state.on_event(20, "a", &scheduled(&ok)).unwrap();
        state.on_event(20, "a", &scheduled(&wrong)).unwrap();
        state.on_event(20, "a", &scheduled(&unknown)).unwrap();
        state.on_event(20, "b", &scheduled(&ok)).unwrap();

        let results: Vec<bool> = state.events().iter().map(|e| e.result).collect();
        assert_eq!(results, vec![true, false, false, false]);
        assert_eq!(state.events()[1].actual.as_deref(), Some("leader"));
        assert!(state.events()[2].error.is_some());
        assert_eq!(state.failed(), 3);
    }

    #[test]
    fn set_location_events_are_ignored() {
        let mut state = StateManager::new(None);
        let data = BTreeMap::new();
        let event = PluginEvent::Scheduled {
            action: EventAction::SetLocation,
            data: &data,
            comment: "move",
        };
        state.on_event(0, "a", &event).unwrap();
        assert!(state.events().is_empty());
    }

    #[test]
    fn summary_is_written_on_close() {
        let path = std::env::temp_dir().join(format!("state-summary-{}.json", std::process::id()));
        let mut state = StateManager::new(Some(path.clone()));
        let data = check_data("k", "v");
        state.on_event(5, "a", &scheduled(&data)).unwrap();
        state.on_close().unwrap();

        let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["failed"], 1);
        assert_eq!(written["passed"], 0);
        assert_eq!(written["events"][0]["key"], "k");
        assert!(written["generated"].is_string());
        fs::remove_file(&path).unwrap();
    }
}

//! Scripted collaborators for unit tests.

use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::config::{BackupConfig, CleanupFlags};
use crate::image::{ImageCreator, ImageRequest};
use crate::qmp::{Command, Transport};
use crate::{BackupError, Result};

/// Transport that answers from a per-command script and records every call.
/// Unscripted commands succeed with `{}`.
#[derive(Default)]
pub struct FakeTransport {
    script: Mutex<HashMap<&'static str, VecDeque<std::result::Result<Value, String>>>>,
    calls: Mutex<Vec<Command>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure with QMP error description `desc` for `execute`.
    pub fn fail(self, execute: &'static str, desc: &str) -> Self {
        self.push(execute, Err(desc.to_string()));
        self
    }

    /// Queue a successful reply for `execute`.
    pub fn reply(self, execute: &'static str, value: Value) -> Self {
        self.push(execute, Ok(value));
        self
    }

    /// Answer the next `query-block` with one device of `size` bytes.
    pub fn with_device(self, device: &str, size: u64) -> Self {
        self.reply(
            "query-block",
            json!([{ "device": device, "inserted": { "image": { "virtual-size": size } } }]),
        )
    }

    fn push(&self, execute: &'static str, outcome: std::result::Result<Value, String>) {
        self.script
            .lock()
            .unwrap()
            .entry(execute)
            .or_default()
            .push_back(outcome);
    }

    pub fn calls(&self) -> Vec<Command> {
        self.calls.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.calls().iter().map(|c| c.execute).collect()
    }

    pub fn count(&self, execute: &str) -> usize {
        self.calls().iter().filter(|c| c.execute == execute).count()
    }
}

impl Transport for FakeTransport {
    async fn execute(&self, command: &Command) -> Result<Value> {
        self.calls.lock().unwrap().push(command.clone());

        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(command.execute)
            .and_then(VecDeque::pop_front);

        match next {
            Some(Ok(value)) => Ok(value),
            Some(Err(desc)) => Err(BackupError::Qmp {
                command: command.execute.to_string(),
                class: "GenericError".to_string(),
                desc,
            }),
            None => Ok(json!({})),
        }
    }
}

/// Image creator that records requests instead of running `qemu-img`.
#[derive(Default)]
pub struct FakeImages {
    requests: Mutex<Vec<ImageRequest>>,
    failure: Option<String>,
}

impl FakeImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(output: &str) -> Self {
        Self {
            requests: Mutex::default(),
            failure: Some(output.to_string()),
        }
    }

    pub fn requests(&self) -> Vec<ImageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ImageCreator for FakeImages {
    async fn create(&self, request: &ImageRequest) -> Result<()> {
        self.requests.lock().unwrap().push(request.clone());

        match &self.failure {
            Some(output) => Err(BackupError::ImageCreation {
                path: request.path.clone(),
                status: "exit status: 1".to_string(),
                output: output.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Configuration for a backup of `drive0` under `base` at `level`.
pub fn backup_config(base: impl Into<PathBuf>, level: i32) -> BackupConfig {
    BackupConfig::new(
        "drive0",
        "/run/qmp.sock",
        Some(base.into()),
        level,
        CleanupFlags::default(),
    )
    .unwrap()
}

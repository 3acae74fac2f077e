// Callback plugin system for conductor

use std::fs::{File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::executor::ledger::TaskResult;
use crate::executor::PlayReport;

/// Trait for callback plugins that can hook into the play lifecycle
#[async_trait]
pub trait CallbackPlugin: Send + Sync {
    /// Get the name of this plugin
    fn name(&self) -> &str;

    // Play lifecycle
    async fn on_play_start(&self, _play: &str, _hosts: &[String]) {}
    async fn on_play_complete(&self, _report: &PlayReport) {}

    // Batch lifecycle
    async fn on_batch_start(&self, _batch: usize, _hosts: &[String]) {}

    // Task lifecycle
    async fn on_task_start(&self, _host: &str, _task: &str) {}
    async fn on_task_result(&self, _result: &TaskResult) {}

    // Handler lifecycle
    async fn on_handler_start(&self, _host: &str, _handler: &str) {}
}

/// Manager for callback plugins
pub struct CallbackManager {
    plugins: Vec<Box<dyn CallbackPlugin>>,
}

impl CallbackManager {
    /// Create a new callback manager
    pub fn new() -> Self {
        CallbackManager {
            plugins: Vec::new(),
        }
    }

    /// Add a callback plugin
    pub fn add(&mut self, plugin: Box<dyn CallbackPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn with_plugin(mut self, plugin: Box<dyn CallbackPlugin>) -> Self {
        self.add(plugin);
        self
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Call on_play_start on all plugins
    pub async fn on_play_start(&self, play: &str, hosts: &[String]) {
        for plugin in &self.plugins {
            plugin.on_play_start(play, hosts).await;
        }
    }

    /// Call on_play_complete on all plugins
    pub async fn on_play_complete(&self, report: &PlayReport) {
        for plugin in &self.plugins {
            plugin.on_play_complete(report).await;
        }
    }

    /// Call on_batch_start on all plugins
    pub async fn on_batch_start(&self, batch: usize, hosts: &[String]) {
        for plugin in &self.plugins {
            plugin.on_batch_start(batch, hosts).await;
        }
    }

    /// Call on_task_start on all plugins
    pub async fn on_task_start(&self, host: &str, task: &str) {
        for plugin in &self.plugins {
            plugin.on_task_start(host, task).await;
        }
    }

    /// Call on_task_result on all plugins
    pub async fn on_task_result(&self, result: &TaskResult) {
        for plugin in &self.plugins {
            plugin.on_task_result(result).await;
        }
    }

    /// Call on_handler_start on all plugins
    pub async fn on_handler_start(&self, host: &str, handler: &str) {
        for plugin in &self.plugins {
            plugin.on_handler_start(host, handler).await;
        }
    }
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

// ========== Built-in Plugins ==========

/// JSON log callback - appends one JSON event per line to a file
pub struct JsonLogCallback {
    file: Arc<Mutex<File>>,
}

impl JsonLogCallback {
    /// Create a new JSON log callback that writes to the specified file
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(JsonLogCallback {
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn write_event(&self, event: serde_json::Value) {
        let mut file = self.file.lock();
        if let Ok(json) = serde_json::to_string(&event) {
            let _ = writeln!(file, "{}", json);
            let _ = file.flush();
        }
    }
}

#[async_trait]
impl CallbackPlugin for JsonLogCallback {
    fn name(&self) -> &str {
        "json_log"
    }

    async fn on_play_start(&self, play: &str, hosts: &[String]) {
        self.write_event(json!({
            "event": "play_start",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "play": play,
            "hosts": hosts,
        }));
    }

    async fn on_play_complete(&self, report: &PlayReport) {
        self.write_event(json!({
            "event": "play_complete",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "play": report.play_name,
            "success": report.success,
            "abort_reason": report.abort_reason,
            "hosts": report.recap.hosts,
            "unfinished_hosts": report.unfinished_hosts,
        }));
    }

    async fn on_batch_start(&self, batch: usize, hosts: &[String]) {
        self.write_event(json!({
            "event": "batch_start",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "batch": batch,
            "hosts": hosts,
        }));
    }

    async fn on_task_start(&self, host: &str, task: &str) {
        self.write_event(json!({
            "event": "task_start",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "host": host,
            "task": task,
        }));
    }

    async fn on_task_result(&self, result: &TaskResult) {
        self.write_event(json!({
            "event": "task_result",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "result": result,
        }));
    }

    async fn on_handler_start(&self, host: &str, handler: &str) {
        self.write_event(json!({
            "event": "handler_start",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "host": host,
            "handler": handler,
        }));
    }
}

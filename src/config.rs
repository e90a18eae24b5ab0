//! Service configuration and cancellation context

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::watch;

/// Option key carrying the run-as account password
pub const PASSWORD_OPTION: &str = "Password";

/// Description of the service to register and run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name
    pub name: String,

    /// Name shown by the service manager, falls back to `name`
    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub description: String,

    /// Account the service runs as
    #[serde(default)]
    pub user_name: Option<String>,

    /// Arguments passed to the executable when the manager launches it
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Executable to register, defaults to the running binary
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Free-form options (may carry a "Password" string)
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,

    /// Restart the service automatically when it fails
    #[serde(default)]
    pub restart_on_failure: bool,

    /// Cancels an interactive run
    #[serde(skip)]
    pub context: ShutdownContext,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            description: String::new(),
            user_name: None,
            arguments: Vec::new(),
            executable: None,
            options: HashMap::new(),
            restart_on_failure: false,
            context: ShutdownContext::default(),
        }
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service configuration {:?}", path))?;
        let config: ServiceConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse service configuration {:?}", path))?;
        if config.name.trim().is_empty() {
            anyhow::bail!("Service configuration {:?} has an empty name", path);
        }
        Ok(config)
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_user(mut self, user_name: impl Into<String>, password: Option<&str>) -> Self {
        self.user_name = Some(user_name.into());
        if let Some(password) = password {
            self.options.insert(
                PASSWORD_OPTION.to_string(),
                serde_json::Value::String(password.to_string()),
            );
        }
        self
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn with_restart_on_failure(mut self, enabled: bool) -> Self {
        self.restart_on_failure = enabled;
        self
    }

    pub fn with_context(mut self, context: ShutdownContext) -> Self {
        self.context = context;
        self
    }

    /// Display name, or the service name when none is set
    pub fn display_name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(display) if !display.is_empty() => display,
            _ => &self.name,
        }
    }

    /// Password from the options map; non-string values are ignored
    pub fn password(&self) -> Option<&str> {
        self.options.get(PASSWORD_OPTION).and_then(|v| v.as_str())
    }
}

/// Cancellation signal for an interactive run.
///
/// The default context never cancels. Contexts created with
/// [`ShutdownContext::new`] complete once the paired trigger fires;
/// dropping the trigger without firing it leaves the context pending.
#[derive(Debug, Clone, Default)]
pub struct ShutdownContext {
    receiver: Option<watch::Receiver<bool>>,
}

/// Fires the paired [`ShutdownContext`]
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl ShutdownContext {
    pub fn new() -> (ShutdownTrigger, Self) {
        let (sender, receiver) = watch::channel(false);
        (
            ShutdownTrigger { sender },
            Self {
                receiver: Some(receiver),
            },
        )
    }

    /// A context that never completes
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    /// Wait until the context is cancelled
    pub async fn cancelled(&self) {
        let Some(receiver) = &self.receiver else {
            return std::future::pending().await;
        };
        let mut receiver = receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            // Trigger dropped without firing
            std::future::pending::<()>().await;
        }
    }
}

impl ShutdownTrigger {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

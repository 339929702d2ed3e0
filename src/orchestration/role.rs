use crate::config::{Config, RoleConfig};

/// Command line used to launch workers for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    role: String,
    base_command: Vec<String>,
    append_prompt: bool,
    stdin_messages: bool,
}

impl WorkerCommand {
    pub fn new(role: &str, config: &RoleConfig) -> Self {
        Self {
            role: role.to_string(),
            base_command: config.command.clone(),
            append_prompt: config.append_prompt,
            stdin_messages: config.stdin_messages,
        }
    }

    pub fn from_config(config: &Config, role: &str) -> Self {
        Self::new(role, &config.role(role))
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    /// Whether the worker reads bus messages from stdin.
    pub fn stdin_messages(&self) -> bool {
        self.stdin_messages
    }

    /// Full argv for a task, with the prompt appended when configured.
    pub fn command(&self, prompt: &str) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        if self.append_prompt {
            cmd.push(prompt.to_string());
        }
        cmd
    }

    /// Whether the binary resolves. Paths are checked when the worker starts.
    pub fn is_available(&self) -> bool {
        self.binary().contains('/') || which::which(self.binary()).is_ok()
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::new(crate::core::DEFAULT_ROLE, &RoleConfig::default())
    }
}

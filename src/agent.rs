use crate::config::Config;

/// The agent CLI that executes tasks and answers bid requests.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCommand {
    base_command: Vec<String>,
}

impl AgentCommand {
    pub fn from_config(config: &Config) -> Self {
        Self::parse(config.effective_command())
    }

    pub fn parse(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
        }
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    /// Arguments after the binary for a non-interactive, JSON-output run.
    pub fn headless_args(&self, prompt: &str) -> Vec<String> {
        let mut args: Vec<String> = self.base_command.iter().skip(1).cloned().collect();
        args.extend([
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ]);
        args
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

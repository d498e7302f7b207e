// ABOUTME: Shell command declarations, their normalized form, and step status types
// ABOUTME: Commands iterate prepare commands first and the main command last

use serde::{Deserialize, Serialize};

/// One declared command as written in lesson metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSchema {
    /// `"npm install"`
    Plain(String),
    /// `["npm install", "Installing dependencies"]`
    Titled(String, String),
    /// `{ "command": "npm install", "title": "Installing dependencies" }`
    Object { command: String, title: String },
}

/// Commands block of lesson metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandsSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_commands: Option<Vec<CommandSchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_command: Option<CommandSchema>,
}

/// A normalized shell command.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Command {
    pub shell_command: String,
    pub title: String,
}

impl Command {
    pub fn new(shell_command: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            shell_command: shell_command.into(),
            title: title.into(),
        }
    }

    /// Runnable iff the shell command is non-empty.
    pub fn is_runnable(&self) -> bool {
        !self.shell_command.is_empty()
    }
}

/// Commands are identified by their shell command alone.
impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.shell_command == other.shell_command
    }
}

impl From<&CommandSchema> for Command {
    fn from(schema: &CommandSchema) -> Self {
        match schema {
            CommandSchema::Plain(command) => Command::new(command.clone(), command.clone()),
            CommandSchema::Titled(command, title) => Command::new(command.clone(), title.clone()),
            CommandSchema::Object { command, title } => {
                Command::new(command.clone(), title.clone())
            }
        }
    }
}

impl From<&str> for Command {
    fn from(command: &str) -> Self {
        Command::new(command, command)
    }
}

/// Ordered execution plan: prepare commands, then at most one main command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commands {
    pub prepare_commands: Vec<Command>,
    pub main_command: Option<Command>,
}

impl Commands {
    pub fn new(prepare_commands: Vec<Command>, main_command: Option<Command>) -> Self {
        Self {
            prepare_commands,
            main_command,
        }
    }

    pub fn len(&self) -> usize {
        self.prepare_commands.len() + usize::from(self.main_command.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.prepare_commands.iter().chain(self.main_command.iter())
    }
}

impl From<&CommandsSchema> for Commands {
    fn from(schema: &CommandsSchema) -> Self {
        let prepare_commands = schema
            .prepare_commands
            .iter()
            .flatten()
            .map(Command::from)
            .collect();
        let main_command = schema.main_command.as_ref().map(Command::from);
        Commands::new(prepare_commands, main_command)
    }
}

impl<'a> IntoIterator for &'a Commands {
    type Item = &'a Command;
    type IntoIter = std::iter::Chain<std::slice::Iter<'a, Command>, std::option::Iter<'a, Command>>;

    fn into_iter(self) -> Self::IntoIter {
        self.prepare_commands.iter().chain(self.main_command.iter())
    }
}

/// Status of one step of the command pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Idle => "idle",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// One entry of the step list, index-aligned with [`Commands`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub title: String,
    pub status: StepStatus,
}

impl Step {
    pub fn new(title: impl Into<String>, status: StepStatus) -> Self {
        Self {
            title: title.into(),
            status,
        }
    }

    pub fn with_status(&self, status: StepStatus) -> Self {
        Self {
            title: self.title.clone(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_all_command_shapes() {
        let schema: CommandsSchema = serde_json::from_str(
            r#"{
                "prepareCommands": [
                    "npm install",
                    ["npm run build", "Building"],
                    { "command": "npm test", "title": "Testing" }
                ],
                "mainCommand": "npm run start"
            }"#,
        )
        .unwrap();

        let commands = Commands::from(&schema);
        let titles: Vec<&str> = commands.iter().map(|c| c.title.as_str()).collect();
        let shells: Vec<&str> = commands.iter().map(|c| c.shell_command.as_str()).collect();

        assert_eq!(titles, vec!["npm install", "Building", "Testing", "npm run start"]);
        assert_eq!(
            shells,
            vec!["npm install", "npm run build", "npm test", "npm run start"]
        );
        assert_eq!(commands.len(), 4);
    }

    #[test]
    fn test_main_command_comes_last() {
        let commands = Commands::new(vec!["a".into(), "b".into()], Some("main".into()));
        let order: Vec<&str> = (&commands)
            .into_iter()
            .map(|c| c.shell_command.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "main"]);
    }

    #[test]
    fn test_absent_commands_are_omitted() {
        let schema = CommandsSchema::default();
        let commands = Commands::from(&schema);
        assert!(commands.is_empty());
        assert_eq!(commands.iter().count(), 0);

        let only_main = Commands::new(vec![], Some("npm start".into()));
        assert_eq!(only_main.len(), 1);
    }

    #[test]
    fn test_command_equality_ignores_title() {
        assert_eq!(
            Command::new("npm install", "Install"),
            Command::new("npm install", "Other title")
        );
        assert_ne!(Command::new("npm install", "x"), Command::new("npm ci", "x"));
    }

    #[test]
    fn test_runnable() {
        assert!(Command::from("ls").is_runnable());
        assert!(!Command::new("", "Nothing").is_runnable());
        assert!(Command::new("   ", "Blank").is_runnable());
    }

    #[test]
    fn test_step_status_serialization() {
        let step = Step::new("Install", StepStatus::Running);
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["status"], "running");
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Idle.is_terminal());
    }
}

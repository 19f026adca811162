use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistConfig {
    #[serde(default = "default_commands")]
    pub commands: Vec<String>,
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self {
            commands: default_commands(),
        }
    }
}

fn default_commands() -> Vec<String> {
    default_command_names()
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_command_names() -> &'static [&'static str] {
    &[
        "ls", "echo", "pwd", "cat", "mkdir", "touch", "rm", "cp", "mv", "grep", "find", "python",
        "python3", "pip", "cd", "wc",
    ]
}

/// Leading-token allow-list.
///
/// Only the first whitespace-separated token is checked, so `ls ; rm -rf /`
/// passes while `ls; rm -rf /` does not (its token is `ls;`). This is
/// advisory, not a sandbox.
#[derive(Debug, Clone)]
pub struct Allowlist {
    commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllowlistError {
    #[error("Empty command.")]
    Empty,
    #[error("Command '{0}' is not allowed.")]
    CommandDenied(String),
}

impl Allowlist {
    pub fn from_config(cfg: AllowlistConfig) -> Self {
        Self {
            commands: cfg.commands,
        }
    }

    pub fn evaluate(&self, command: &str) -> Result<(), AllowlistError> {
        let Some(base) = command.split_whitespace().next() else {
            return Err(AllowlistError::Empty);
        };
        if self.commands.iter().any(|allowed| allowed == base) {
            Ok(())
        } else {
            Err(AllowlistError::CommandDenied(base.to_string()))
        }
    }
}

impl Default for Allowlist {
    fn default() -> Self {
        Self::from_config(AllowlistConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_unlisted_command() {
        let allowlist = Allowlist::from_config(AllowlistConfig {
            commands: vec!["ls".into()],
        });
        let result = allowlist.evaluate("rm -rf /tmp/foo");
        assert_eq!(result, Err(AllowlistError::CommandDenied("rm".into())));
    }

    #[test]
    fn allows_matching_command() {
        let allowlist = Allowlist::from_config(AllowlistConfig {
            commands: vec!["ls".into()],
        });
        assert!(allowlist.evaluate("ls -la /var").is_ok());
    }

    #[test]
    fn rejects_blank_command() {
        let allowlist = Allowlist::default();
        assert_eq!(allowlist.evaluate("   \n"), Err(AllowlistError::Empty));
        assert_eq!(allowlist.evaluate(""), Err(AllowlistError::Empty));
    }

    #[test]
    fn only_checks_leading_token() {
        let allowlist = Allowlist::default();
        assert!(allowlist.evaluate("ls; rm -rf /").is_err());
        assert!(allowlist.evaluate("ls ; rm -rf /").is_ok());
    }

    #[test]
    fn prefix_of_allowed_name_is_not_allowed() {
        let allowlist = Allowlist::default();
        assert!(allowlist.evaluate("lsblk").is_err());
    }
}

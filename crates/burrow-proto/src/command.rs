//! Control-plane command messages
//!
//! Commands travel as JSON inside the command handshake frame:
//!
//! ```json
//! {"action": "add", "serverInfo": {"name": "svc1", "addr": "127.0.0.1:9001"}}
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors decoding a command message
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("malformed request json")]
    MalformedJson(#[source] serde_json::Error),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Backend description carried by `add` and `remove`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub tunnel: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub website: bool,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_website(mut self, website: bool) -> Self {
        self.website = website;
        self
    }

    /// The explicit path if one was given, otherwise `"/" + name`
    pub fn route_path(&self) -> Option<String> {
        match &self.path {
            Some(path) if !path.is_empty() => Some(path.clone()),
            _ if !self.name.is_empty() => Some(format!("/{}", self.name)),
            _ => None,
        }
    }
}

/// Raw wire shape of a command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(
        default,
        alias = "shutdownTimeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub shutdown_timeout_seconds: Option<u64>,
}

/// A decoded control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add(ServerInfo),
    Remove(ServerInfo),
    /// Stop accepting; `grace` arms a hard deadline for the drain
    Shutdown { grace: Option<Duration> },
}

impl Command {
    pub fn action(&self) -> &'static str {
        match self {
            Command::Add(_) => "add",
            Command::Remove(_) => "remove",
            Command::Shutdown { .. } => "shutdown",
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CommandError> {
        let message: CommandMessage =
            serde_json::from_slice(bytes).map_err(CommandError::MalformedJson)?;
        Self::try_from(message)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CommandError> {
        serde_json::to_vec(&CommandMessage::from(self.clone())).map_err(CommandError::Encode)
    }
}

impl TryFrom<CommandMessage> for Command {
    type Error = CommandError;

    fn try_from(message: CommandMessage) -> Result<Self, Self::Error> {
        match message.action.as_str() {
            "add" => Ok(Command::Add(message.server_info.unwrap_or_default())),
            "remove" => Ok(Command::Remove(message.server_info.unwrap_or_default())),
            "shutdown" => Ok(Command::Shutdown {
                grace: message
                    .shutdown_timeout_seconds
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
            }),
            other => Err(CommandError::InvalidAction(other.to_string())),
        }
    }
}

impl From<Command> for CommandMessage {
    fn from(command: Command) -> Self {
        let action = command.action().to_string();
        match command {
            Command::Add(info) | Command::Remove(info) => CommandMessage {
                action,
                server_info: Some(info),
                shutdown_timeout_seconds: None,
            },
            Command::Shutdown { grace } => CommandMessage {
                action,
                server_info: None,
                shutdown_timeout_seconds: grace.map(|g| g.as_secs()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_add() {
        let json = br#"{"action":"add","serverInfo":{"name":"svc1","addr":"127.0.0.1:9001","secure":true}}"#;
        let command = Command::from_json(json).unwrap();
        assert_eq!(
            command,
            Command::Add(ServerInfo::new("svc1", "127.0.0.1:9001").with_secure(true))
        );
    }

    #[test]
    fn test_parse_shutdown_timeout() {
        let command =
            Command::from_json(br#"{"action":"shutdown","shutdownTimeoutSeconds":5}"#).unwrap();
        assert_eq!(
            command,
            Command::Shutdown {
                grace: Some(Duration::from_secs(5))
            }
        );

        let command = Command::from_json(br#"{"action":"shutdown","shutdownTimeout":0}"#).unwrap();
        assert_eq!(command, Command::Shutdown { grace: None });
    }

    #[test]
    fn test_invalid_action() {
        let err = Command::from_json(br#"{"action":"reboot"}"#).unwrap_err();
        assert_eq!(err.to_string(), "invalid action: reboot");
    }

    #[test]
    fn test_malformed_json() {
        let err = Command::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, CommandError::MalformedJson(_)));
        assert_eq!(err.to_string(), "malformed request json");
    }

    #[test]
    fn test_missing_server_info_defaults() {
        let command = Command::from_json(br#"{"action":"remove"}"#).unwrap();
        assert_eq!(command, Command::Remove(ServerInfo::default()));
    }

    #[test]
    fn test_route_path() {
        assert_eq!(
            ServerInfo::new("svc1", "x").route_path().as_deref(),
            Some("/svc1")
        );
        assert_eq!(
            ServerInfo::new("svc1", "x")
                .with_path("/other")
                .route_path()
                .as_deref(),
            Some("/other")
        );
        assert_eq!(ServerInfo::default().route_path(), None);
    }

    #[test]
    fn test_to_json_uses_wire_names() {
        let json = Command::Add(ServerInfo::new("svc1", "127.0.0.1:9001"))
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["action"], "add");
        assert_eq!(value["serverInfo"]["name"], "svc1");
        assert_eq!(value["serverInfo"]["addr"], "127.0.0.1:9001");
        assert!(value.get("shutdownTimeoutSeconds").is_none());
    }
}

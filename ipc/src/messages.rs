//! Typed messages exchanged between the Core and its satellites.
//!
//! Every document on the wire is an envelope `{"type": ..., "payload": ...}`
//! carrying exactly one payload variant. Field names and enum casing are
//! wire contract: Tray commands are lowercase (`start`, `kill`, `exit`)
//! while GUI commands are capitalized (`Start`). The asymmetry is kept for
//! compatibility with existing senders; do not unify the two enums.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    /// The bytes are not a JSON envelope with `type` and `payload`.
    #[error("invalid message envelope: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    /// The payload is missing a required field or a field has the wrong
    /// type for the given message type.
    #[error("malformed {message_type} payload: {source}")]
    MalformedPayload {
        message_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// The wire envelope. Exactly one payload variant per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    TrayCommand(TrayCommand),
    GuiCommand(GuiCommand),
    GuiInit(GuiInit),
    ProcessStatus(ProcessStatus),
    ErrorOccurred(ErrorOccurred),
}

impl Message {
    /// The value of the envelope's `type` field.
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::TrayCommand(_) => TrayCommand::TYPE,
            Message::GuiCommand(_) => GuiCommand::TYPE,
            Message::GuiInit(_) => GuiInit::TYPE,
            Message::ProcessStatus(_) => ProcessStatus::TYPE,
            Message::ErrorOccurred(_) => ErrorOccurred::TYPE,
        }
    }
}

/// A lifecycle command for a single application instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrayCommand {
    /// Opaque handle naming the managed instance. Must not be empty for
    /// `kill` and `exit`; an empty identifier on `start` lets the Core pick
    /// one.
    #[serde(default)]
    pub identifier: String,
    pub command: TrayCommandKind,
    /// Required for `start`, empty otherwise.
    #[serde(default)]
    pub executable: String,
    #[serde(default)]
    pub base_directory: String,
    #[serde(default)]
    pub current_working_directory: String,
    #[serde(default)]
    pub commandline_arguments: String,
}

impl TrayCommand {
    pub const TYPE: &'static str = "TrayCommand";
}

/// Lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrayCommandKind {
    #[default]
    Start,
    Kill,
    Exit,
}

/// A cluster-scoped command from the GUI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuiCommand {
    pub command: GuiCommandKind,
    /// Names the application to launch from the Core's catalog.
    pub application_identifier: String,
    /// Selects a named configuration variant; empty means the default.
    #[serde(default)]
    pub configuration_identifier: String,
    /// The logical grouping the launched instance belongs to.
    pub cluster_identifier: String,
}

impl GuiCommand {
    pub const TYPE: &'static str = "GuiCommand";
}

/// Capitalized on the wire, unlike [`TrayCommandKind`]. Only `Start` is
/// defined so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuiCommandKind {
    Start,
}

/// Snapshot sent by the Core to a GUI immediately after it connects, before
/// the GUI may issue any command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuiInit {
    pub applications: Vec<ApplicationInfo>,
    pub clusters: Vec<String>,
    /// The live registry at the time of the handshake.
    pub processes: Vec<ProcessInfo>,
}

impl GuiInit {
    pub const TYPE: &'static str = "GuiInit";
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub name: String,
    pub identifier: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub configurations: Vec<ConfigurationInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigurationInfo {
    pub name: String,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub identifier: String,
    #[serde(default)]
    pub cluster: String,
    pub status: String,
}

/// State-transition notification broadcast by the Core to connected GUIs.
/// Status strings are the registry states (`Starting`, `Running`,
/// `Exiting`, `Terminated`) plus `FailedToStart` for a launch that never
/// reached `Running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub identifier: String,
    pub status: String,
}

impl ProcessStatus {
    pub const TYPE: &'static str = "ProcessStatus";
}

/// Reply sent to a command sender whose command failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorOccurred {
    pub error: String,
}

impl ErrorOccurred {
    pub const TYPE: &'static str = "ErrorOccurred";
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    message_type: String,
    payload: serde_json::Value,
}

/// Decodes one message from a frame payload. The envelope is checked first,
/// then the payload is parsed according to the `type` tag, so unknown types
/// and malformed payloads are reported as distinct errors.
pub fn parse(bytes: &[u8]) -> Result<Message, MessageError> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(MessageError::InvalidJson)?;
    match envelope.message_type.as_str() {
        TrayCommand::TYPE => payload(envelope.payload, TrayCommand::TYPE).map(Message::TrayCommand),
        GuiCommand::TYPE => payload(envelope.payload, GuiCommand::TYPE).map(Message::GuiCommand),
        GuiInit::TYPE => payload(envelope.payload, GuiInit::TYPE).map(Message::GuiInit),
        ProcessStatus::TYPE => {
            payload(envelope.payload, ProcessStatus::TYPE).map(Message::ProcessStatus)
        }
        ErrorOccurred::TYPE => {
            payload(envelope.payload, ErrorOccurred::TYPE).map(Message::ErrorOccurred)
        }
        _ => Err(MessageError::UnknownType(envelope.message_type)),
    }
}

fn payload<T: DeserializeOwned>(
    value: serde_json::Value,
    message_type: &'static str,
) -> Result<T, MessageError> {
    serde_json::from_value(value).map_err(|source| MessageError::MalformedPayload {
        message_type,
        source,
    })
}

/// Encodes one message as an envelope document. Exact inverse of [`parse`].
pub fn serialize(message: &Message) -> Result<Vec<u8>, MessageError> {
    serde_json::to_vec(message).map_err(MessageError::Serialize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let bytes = serialize(&message).unwrap();
        assert_eq!(parse(&bytes).unwrap(), message);
    }

    #[test]
    fn tray_command_roundtrip() {
        roundtrip(Message::TrayCommand(TrayCommand {
            identifier: "12345".into(),
            command: TrayCommandKind::Exit,
            executable: "/bin/app".into(),
            base_directory: "/opt".into(),
            current_working_directory: "/tmp".into(),
            commandline_arguments: "--fullscreen".into(),
        }));
    }

    #[test]
    fn gui_command_roundtrip() {
        roundtrip(Message::GuiCommand(GuiCommand {
            command: GuiCommandKind::Start,
            application_identifier: "itunes".into(),
            configuration_identifier: String::new(),
            cluster_identifier: "mock".into(),
        }));
    }

    #[test]
    fn gui_init_roundtrip() {
        roundtrip(Message::GuiInit(GuiInit {
            applications: vec![ApplicationInfo {
                name: "iTunes".into(),
                identifier: "itunes".into(),
                tags: vec!["media".into()],
                clusters: vec!["mock".into()],
                configurations: vec![ConfigurationInfo {
                    name: "Default".into(),
                    identifier: String::new(),
                }],
            }],
            clusters: vec!["mock".into()],
            processes: vec![ProcessInfo {
                identifier: "12345".into(),
                cluster: "mock".into(),
                status: "Running".into(),
            }],
        }));
    }

    #[test]
    fn status_and_error_roundtrip() {
        roundtrip(Message::ProcessStatus(ProcessStatus {
            identifier: "12345".into(),
            status: "Terminated".into(),
        }));
        roundtrip(Message::ErrorOccurred(ErrorOccurred {
            error: "no instance with identifier '12345'".into(),
        }));
    }

    #[test]
    fn parses_observed_tray_traffic() {
        // Byte layout as sent by existing tray senders.
        let raw = br#"{"type": "TrayCommand", "payload": {"identifier": "12345", "command": "exit", "executable": "/bin/app", "baseDirectory": "", "currentWorkingDirectory": "", "commandlineArguments": ""}}"#;
        let message = parse(raw).unwrap();
        match message {
            Message::TrayCommand(command) => {
                assert_eq!(command.identifier, "12345");
                assert_eq!(command.command, TrayCommandKind::Exit);
                assert_eq!(command.executable, "/bin/app");
            }
            other => panic!("expected TrayCommand, got {other:?}"),
        }
    }

    #[test]
    fn parses_observed_gui_traffic() {
        let raw = br#"{"type": "GuiCommand", "payload": {"command": "Start", "application_identifier": "itunes", "configuration_identifier": "", "cluster_identifier": "mock"}}"#;
        match parse(raw).unwrap() {
            Message::GuiCommand(command) => {
                assert_eq!(command.command, GuiCommandKind::Start);
                assert_eq!(command.application_identifier, "itunes");
                assert_eq!(command.cluster_identifier, "mock");
            }
            other => panic!("expected GuiCommand, got {other:?}"),
        }
    }

    #[test]
    fn command_casing_is_asymmetric_on_the_wire() {
        let tray = serialize(&Message::TrayCommand(TrayCommand {
            command: TrayCommandKind::Start,
            ..TrayCommand::default()
        }))
        .unwrap();
        assert!(String::from_utf8(tray).unwrap().contains(r#""command":"start""#));

        let gui = serialize(&Message::GuiCommand(GuiCommand {
            command: GuiCommandKind::Start,
            application_identifier: "itunes".into(),
            configuration_identifier: String::new(),
            cluster_identifier: "mock".into(),
        }))
        .unwrap();
        assert!(String::from_utf8(gui).unwrap().contains(r#""command":"Start""#));
    }

    #[test]
    fn tray_fields_use_wire_names() {
        let bytes = serialize(&Message::TrayCommand(TrayCommand::default())).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        for key in [
            "baseDirectory",
            "currentWorkingDirectory",
            "commandlineArguments",
        ] {
            assert!(text.contains(key), "missing wire key {key}");
        }
    }

    #[test]
    fn unknown_type_is_reported() {
        let raw = br#"{"type": "TrayStatus", "payload": {}}"#;
        assert!(matches!(
            parse(raw),
            Err(MessageError::UnknownType(t)) if t == "TrayStatus"
        ));
    }

    #[test]
    fn malformed_payload_is_reported() {
        let raw = br#"{"type": "TrayCommand", "payload": {"command": "reboot"}}"#;
        assert!(matches!(
            parse(raw),
            Err(MessageError::MalformedPayload {
                message_type: "TrayCommand",
                ..
            })
        ));
    }

    #[test]
    fn missing_envelope_fields_are_invalid() {
        assert!(matches!(
            parse(br#"{"payload": {}}"#),
            Err(MessageError::InvalidJson(_))
        ));
        assert!(matches!(parse(b"not json"), Err(MessageError::InvalidJson(_))));
    }
}

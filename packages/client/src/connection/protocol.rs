//! Wire protocol
//!
//! Everything the agent speaks: the `/info` and `/update` HTTP payloads, the
//! `/upload` request body, the outbound text commands, and the inbound
//! websocket frames. Frames are decoded into typed [`AgentEvent`]s exactly
//! once, at the channel boundary; a single frame may carry several
//! independent fields and therefore fan out into several events.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reply to `GET {base}/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub update_url: String,
    pub http: Option<String>,
    pub https: Option<String>,
    pub ws: Option<String>,
    pub wss: Option<String>,
}

/// Reply to `POST {base}/update`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateReply {
    #[serde(default)]
    pub ok: bool,
    pub error: Option<String>,
}

/// One entry of a device-list frame. Field names follow the agent's JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "IsOpen", default)]
    pub is_open: bool,
    #[serde(rename = "VendorID", default)]
    pub vendor_id: Option<String>,
    #[serde(rename = "ProductID", default)]
    pub product_id: Option<String>,
    #[serde(rename = "SerialNumber", default)]
    pub serial_number: Option<String>,
}

/// Serial and network ports as last reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList {
    pub serial: Vec<PortInfo>,
    pub network: Vec<PortInfo>,
}

/// Structural comparison used to decide whether a device list is worth
/// republishing: same names with the same open flags, in the same order.
pub fn ports_equal(a: &[PortInfo], b: &[PortInfo]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.name == y.name && x.is_open == y.is_open)
}

/// An inbound websocket frame, decoded field-by-field. Any subset of the
/// fields may be present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentFrame {
    #[serde(rename = "Ports")]
    pub ports: Option<Vec<PortInfo>>,
    #[serde(rename = "Network")]
    pub network: Option<bool>,
    /// Serial monitor data chunk.
    #[serde(rename = "D")]
    pub serial_data: Option<String>,
    #[serde(rename = "ProgrammerStatus")]
    pub programmer_status: Option<String>,
    #[serde(rename = "Flash")]
    pub flash: Option<String>,
    #[serde(rename = "Msg")]
    pub msg: Option<String>,
    /// Either the commandline of a starting flash or a serial open/close
    /// acknowledgement, depending on the surrounding fields.
    #[serde(rename = "Cmd")]
    pub cmd: Option<String>,
    #[serde(rename = "DownloadStatus")]
    pub download_status: Option<String>,
    /// Fatal upload error.
    #[serde(rename = "Err")]
    pub fatal_error: Option<String>,
    #[serde(rename = "Error")]
    pub error: Option<String>,
}

/// Agent-reported phase of an in-progress flashing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgrammerReport {
    pub status: String,
    pub flash: Option<String>,
    pub msg: Option<String>,
    pub cmd: Option<String>,
}

/// Serial monitor handshake acknowledgements carried on the `Cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialAck {
    Opened,
    OpenFailed,
    Closed,
    CloseFailed,
}

impl SerialAck {
    fn from_cmd(cmd: &str) -> Option<Self> {
        match cmd {
            "Open" => Some(SerialAck::Opened),
            "OpenFail" => Some(SerialAck::OpenFailed),
            "Close" => Some(SerialAck::Closed),
            "CloseFail" => Some(SerialAck::CloseFailed),
            _ => None,
        }
    }
}

/// A typed event extracted from an [`AgentFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    DeviceList { network: bool, ports: Vec<PortInfo> },
    SerialData(String),
    Programmer(ProgrammerReport),
    Download { status: String, msg: Option<String> },
    UploadFatal(String),
    Error(String),
    SerialAck(SerialAck),
}

impl AgentFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Fan the frame out into its independent events, in a fixed order.
    pub fn events(&self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        if let Some(ports) = &self.ports {
            events.push(AgentEvent::DeviceList {
                network: self.network.unwrap_or(false),
                ports: ports.clone(),
            });
        }
        if let Some(data) = &self.serial_data {
            events.push(AgentEvent::SerialData(data.clone()));
        }
        if let Some(status) = &self.programmer_status {
            events.push(AgentEvent::Programmer(ProgrammerReport {
                status: status.clone(),
                flash: self.flash.clone(),
                msg: self.msg.clone(),
                cmd: self.cmd.clone(),
            }));
        }
        if let Some(status) = &self.download_status {
            events.push(AgentEvent::Download {
                status: status.clone(),
                msg: self.msg.clone(),
            });
        }
        if let Some(err) = &self.fatal_error {
            events.push(AgentEvent::UploadFatal(err.clone()));
        }
        if let Some(error) = &self.error {
            events.push(AgentEvent::Error(error.clone()));
        }
        if let Some(ack) = self.cmd.as_deref().and_then(SerialAck::from_cmd) {
            events.push(AgentEvent::SerialAck(ack));
        }
        events
    }
}

/// Outbound text commands on the persistent channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Send { port: String, message: String },
    Open { port: String, baudrate: u32 },
    Close { port: String },
    DownloadTool {
        name: String,
        version: String,
        package: String,
        strategy: String,
    },
    KillUpload,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::List => write!(f, "list"),
            Command::Send { port, message } => write!(f, "send {} {}", port, message),
            Command::Open { port, baudrate } => write!(f, "open {} {} timed", port, baudrate),
            Command::Close { port } => write!(f, "close {}", port),
            Command::DownloadTool {
                name,
                version,
                package,
                strategy,
            } => write!(f, "downloadtool {} {} {} {}", name, version, package, strategy),
            Command::KillUpload => write!(f, "killupload"),
        }
    }
}

/// A flag that callers may supply either as a boolean or as the strings
/// `"true"`/`"false"`; anything else reads as unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Text(String),
}

impl FlagValue {
    pub fn is_set(&self) -> bool {
        match self {
            FlagValue::Bool(b) => *b,
            FlagValue::Text(s) => s == "true",
        }
    }
}

/// Remote-upload credentials for network targets.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// The `extra` options bag of an upload request.
#[derive(Debug, Clone, Serialize)]
pub struct ExtraOptions {
    pub auth: AuthOptions,
    pub wait_for_upload_port: bool,
    pub use_1200bps_touch: bool,
    pub network: bool,
    pub ssh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params_verbose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params_quiet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraFile {
    pub filename: String,
    pub hex: String,
}

/// Body of `POST {base}/upload`.
#[derive(Debug, Clone, Serialize)]
pub struct UploadPayload {
    pub board: String,
    pub port: String,
    pub commandline: String,
    pub signature: String,
    pub hex: String,
    pub filename: String,
    pub extra: ExtraOptions,
    pub extrafiles: Vec<ExtraFile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_fans_out_into_independent_events() {
        let frame = AgentFrame::parse(
            r#"{
                "Ports": [{"Name": "/dev/ttyACM0", "IsOpen": false}],
                "Error": "port closed: trying to close"
            }"#,
        )
        .unwrap();

        let events = frame.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            AgentEvent::DeviceList { network: false, ports } if ports.len() == 1
        ));
        assert!(matches!(&events[1], AgentEvent::Error(e) if e.contains("trying to close")));
    }

    #[test]
    fn programmer_frame_keeps_flash_and_commandline() {
        let frame = AgentFrame::parse(
            r#"{"ProgrammerStatus": "Starting", "Cmd": "avrdude -patmega328p", "Flash": null}"#,
        )
        .unwrap();

        match &frame.events()[0] {
            AgentEvent::Programmer(report) => {
                assert_eq!(report.status, "Starting");
                assert_eq!(report.cmd.as_deref(), Some("avrdude -patmega328p"));
                assert!(report.flash.is_none());
            }
            other => panic!("expected programmer event, got {:?}", other),
        }
    }

    #[test]
    fn open_ack_is_decoded_from_cmd_field() {
        let frame = AgentFrame::parse(r#"{"Cmd": "OpenFail"}"#).unwrap();
        assert_eq!(
            frame.events(),
            vec![AgentEvent::SerialAck(SerialAck::OpenFailed)]
        );
    }

    #[test]
    fn commands_render_to_wire_text() {
        assert_eq!(Command::List.to_string(), "list");
        assert_eq!(
            Command::Send {
                port: "/dev/ttyACM0".into(),
                message: "y\n".into()
            }
            .to_string(),
            "send /dev/ttyACM0 y\n"
        );
        assert_eq!(
            Command::Open {
                port: "/dev/ttyACM0".into(),
                baudrate: 9600
            }
            .to_string(),
            "open /dev/ttyACM0 9600 timed"
        );
        assert_eq!(
            Command::DownloadTool {
                name: "bossac".into(),
                version: "1.7.0".into(),
                package: "boardlink".into(),
                strategy: "keep".into()
            }
            .to_string(),
            "downloadtool bossac 1.7.0 boardlink keep"
        );
        assert_eq!(Command::KillUpload.to_string(), "killupload");
    }

    #[test]
    fn flag_values_coerce_from_bool_and_string() {
        assert!(FlagValue::Bool(true).is_set());
        assert!(!FlagValue::Bool(false).is_set());
        assert!(FlagValue::Text("true".into()).is_set());
        assert!(!FlagValue::Text("false".into()).is_set());
        assert!(!FlagValue::Text("yes".into()).is_set());

        let from_json: Vec<FlagValue> = serde_json::from_str(r#"[true, "true", "no"]"#).unwrap();
        assert_eq!(
            from_json.iter().map(FlagValue::is_set).collect::<Vec<_>>(),
            vec![true, true, false]
        );
    }

    #[test]
    fn absent_auth_credentials_are_omitted_from_the_payload() {
        let payload = UploadPayload {
            board: "boardlink:samd:mkr1000".into(),
            port: "/dev/ttyACM0".into(),
            commandline: "bossac -p {port}".into(),
            signature: "abc".into(),
            hex: "AAAA".into(),
            filename: "sketch.bin".into(),
            extra: ExtraOptions {
                auth: AuthOptions::default(),
                wait_for_upload_port: true,
                use_1200bps_touch: true,
                network: false,
                ssh: false,
                params_verbose: Some("-v".into()),
                params_quiet: None,
                verbose: None,
            },
            extrafiles: vec![],
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["extra"]["auth"], serde_json::json!({}));
        assert_eq!(value["extra"]["wait_for_upload_port"], true);
        assert!(value["extra"].get("params_quiet").is_none());
    }

    #[test]
    fn device_lists_compare_by_name_and_open_flag() {
        let a = vec![PortInfo {
            name: "/dev/ttyACM0".into(),
            is_open: false,
            vendor_id: Some("0x2341".into()),
            product_id: None,
            serial_number: None,
        }];
        let mut b = a.clone();
        b[0].vendor_id = None;
        assert!(ports_equal(&a, &b));

        b[0].is_open = true;
        assert!(!ports_equal(&a, &b));

        let c = vec![];
        assert!(!ports_equal(&a, &c));
    }
}

//! Message model shared by both ends of a plugin connection.
//!
//! A [`PluginMessage`] is a `class`/`name` pair plus a flat map of values and
//! is serialized as one JSON document. Control traffic is decoded once into
//! [`InternalMessage`] (host <-> child) or [`BaseMessage`] (child <-> plugin
//! instance) so the controllers match on variants instead of strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Class of the control channel between the host and the child process.
pub const MESSAGE_CLASS_INTERNAL: &str = "internal";
/// Class of the control channel between the child process and its plugin instance.
pub const MESSAGE_CLASS_BASE: &str = "base";

const BLOCKING_REQUEST: &str = "blocking_request";
const BLOCKING_RESPONSE: &str = "blocking_response";

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to parse message: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("{class}:{name} is missing required field '{field}'")]
    MissingField {
        class: String,
        name: String,
        field: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMessage {
    class: String,
    name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    params: Map<String, Value>,
}

impl PluginMessage {
    pub fn new(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn internal(name: impl Into<String>) -> Self {
        Self::new(MESSAGE_CLASS_INTERNAL, name)
    }

    pub fn base(name: impl Into<String>) -> Self {
        Self::new(MESSAGE_CLASS_BASE, name)
    }

    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        serde_json::from_str(raw).map_err(MessageError::Parse)
    }

    pub fn generate(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(MessageError::Serialize)
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_class(&self, class: &str) -> bool {
        self.class == class
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_value(key, value);
        self
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn has_value(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.value(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.value(key).and_then(Value::as_f64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.value(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.value(key).and_then(Value::as_bool)
    }

    /// Marks the message as one whose sender waits for a reply.
    pub fn into_blocking_request(self) -> Self {
        self.with_value(BLOCKING_REQUEST, true)
    }

    /// Marks the message as the reply that releases a blocked sender.
    pub fn into_blocking_response(self) -> Self {
        self.with_value(BLOCKING_RESPONSE, true)
    }

    pub fn is_blocking_request(&self) -> bool {
        self.has_value(BLOCKING_REQUEST)
    }

    pub fn is_blocking_response(&self) -> bool {
        self.has_value(BLOCKING_RESPONSE)
    }

    fn required_str(&self, field: &'static str) -> Result<String, MessageError> {
        self.get_str(field)
            .map(str::to_string)
            .ok_or_else(|| self.missing(field))
    }

    fn required_f64(&self, field: &'static str) -> Result<f64, MessageError> {
        self.get_f64(field).ok_or_else(|| self.missing(field))
    }

    fn required_usize(&self, field: &'static str) -> Result<usize, MessageError> {
        self.get_u64(field)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| self.missing(field))
    }

    fn required_versions(&self) -> Result<BTreeMap<String, String>, MessageError> {
        let versions = self
            .value("versions")
            .and_then(Value::as_object)
            .ok_or_else(|| self.missing("versions"))?;
        Ok(versions
            .iter()
            .map(|(class, version)| {
                let version = match version {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (class.clone(), version)
            })
            .collect())
    }

    fn missing(&self, field: &'static str) -> MessageError {
        MessageError::MissingField {
            class: self.class.clone(),
            name: self.name.clone(),
            field,
        }
    }
}

fn versions_value(versions: &BTreeMap<String, String>) -> Value {
    Value::Object(
        versions
            .iter()
            .map(|(class, version)| (class.clone(), Value::String(version.clone())))
            .collect(),
    )
}

/// Control messages exchanged between the host and the child process.
#[derive(Debug, Clone, PartialEq)]
pub enum InternalMessage {
    Hello,
    LoadPlugin {
        file: String,
        dir: String,
    },
    LoadPluginResponse {
        versions: BTreeMap<String, String>,
        plugin_version: Option<String>,
    },
    ShmAdd {
        name: String,
        size: usize,
    },
    /// `error` is set when the child could not attach the segment.
    ShmAddResponse {
        name: String,
        error: Option<String>,
    },
    ShmRemove {
        name: String,
    },
    ShmRemoveResponse {
        name: String,
    },
    SleepTime {
        time: f64,
    },
    Heartbeat {
        cpu_usage: f64,
    },
    ShutdownPlugin,
    Goodbye,
    /// A control message this side does not know; kept for forward compatibility.
    Unrecognized(String),
}

impl InternalMessage {
    /// Decodes an `internal` class message. Unknown names map to `Unrecognized`.
    pub fn decode(message: &PluginMessage) -> Result<Self, MessageError> {
        let decoded = match message.name() {
            "hello" => Self::Hello,
            "load_plugin" => Self::LoadPlugin {
                file: message.required_str("file")?,
                dir: message.required_str("dir")?,
            },
            "load_plugin_response" => Self::LoadPluginResponse {
                versions: message.required_versions()?,
                plugin_version: message.get_str("plugin_version").map(str::to_string),
            },
            "shm_add" => Self::ShmAdd {
                name: message.required_str("name")?,
                size: message.required_usize("size")?,
            },
            "shm_add_response" => Self::ShmAddResponse {
                name: message.required_str("name")?,
                error: message.get_str("error").map(str::to_string),
            },
            "shm_remove" => Self::ShmRemove {
                name: message.required_str("name")?,
            },
            "shm_remove_response" => Self::ShmRemoveResponse {
                name: message.required_str("name")?,
            },
            "sleep_time" => Self::SleepTime {
                time: message.required_f64("time")?,
            },
            "heartbeat" => Self::Heartbeat {
                cpu_usage: message.required_f64("cpu_usage")?,
            },
            "shutdown_plugin" => Self::ShutdownPlugin,
            "goodbye" => Self::Goodbye,
            other => Self::Unrecognized(other.to_string()),
        };
        Ok(decoded)
    }

    pub fn to_message(&self) -> PluginMessage {
        match self {
            Self::Hello => PluginMessage::internal("hello"),
            Self::LoadPlugin { file, dir } => PluginMessage::internal("load_plugin")
                .with_value("file", file.as_str())
                .with_value("dir", dir.as_str()),
            Self::LoadPluginResponse {
                versions,
                plugin_version,
            } => {
                let mut message = PluginMessage::internal("load_plugin_response")
                    .with_value("versions", versions_value(versions));
                if let Some(version) = plugin_version {
                    message.set_value("plugin_version", version.as_str());
                }
                message
            }
            Self::ShmAdd { name, size } => PluginMessage::internal("shm_add")
                .with_value("name", name.as_str())
                .with_value("size", *size),
            Self::ShmAddResponse { name, error } => {
                let mut message =
                    PluginMessage::internal("shm_add_response").with_value("name", name.as_str());
                if let Some(error) = error {
                    message.set_value("error", error.as_str());
                }
                message
            }
            Self::ShmRemove { name } => {
                PluginMessage::internal("shm_remove").with_value("name", name.as_str())
            }
            Self::ShmRemoveResponse { name } => {
                PluginMessage::internal("shm_remove_response").with_value("name", name.as_str())
            }
            Self::SleepTime { time } => {
                PluginMessage::internal("sleep_time").with_value("time", *time)
            }
            Self::Heartbeat { cpu_usage } => {
                PluginMessage::internal("heartbeat").with_value("cpu_usage", *cpu_usage)
            }
            Self::ShutdownPlugin => PluginMessage::internal("shutdown_plugin"),
            Self::Goodbye => PluginMessage::internal("goodbye"),
            Self::Unrecognized(name) => PluginMessage::internal(name.as_str()),
        }
    }
}

/// Messages between the child controller and the plugin instance it hosts.
#[derive(Debug, Clone, PartialEq)]
pub enum BaseMessage {
    Init,
    InitResponse {
        versions: BTreeMap<String, String>,
        plugin_version: Option<String>,
    },
    /// Grants the plugin a slice of `time` seconds.
    Idle {
        time: f64,
    },
    Cleanup,
    Goodbye,
    ShmAdded {
        name: String,
        size: usize,
        address: usize,
    },
    ShmRemove {
        name: String,
    },
    ShmRemoveResponse {
        name: String,
    },
    ForceExit,
    Unrecognized(String),
}

impl BaseMessage {
    pub fn decode(message: &PluginMessage) -> Result<Self, MessageError> {
        let decoded = match message.name() {
            "init" => Self::Init,
            "init_response" => Self::InitResponse {
                versions: message.required_versions()?,
                plugin_version: message.get_str("plugin_version").map(str::to_string),
            },
            "idle" => Self::Idle {
                time: message.required_f64("time")?,
            },
            "cleanup" => Self::Cleanup,
            "goodbye" => Self::Goodbye,
            "shm_added" => Self::ShmAdded {
                name: message.required_str("name")?,
                size: message.required_usize("size")?,
                address: message.required_usize("address")?,
            },
            "shm_remove" => Self::ShmRemove {
                name: message.required_str("name")?,
            },
            "shm_remove_response" => Self::ShmRemoveResponse {
                name: message.required_str("name")?,
            },
            "force_exit" => Self::ForceExit,
            other => Self::Unrecognized(other.to_string()),
        };
        Ok(decoded)
    }

    pub fn to_message(&self) -> PluginMessage {
        match self {
            Self::Init => PluginMessage::base("init"),
            Self::InitResponse {
                versions,
                plugin_version,
            } => {
                let mut message = PluginMessage::base("init_response")
                    .with_value("versions", versions_value(versions));
                if let Some(version) = plugin_version {
                    message.set_value("plugin_version", version.as_str());
                }
                message
            }
            Self::Idle { time } => PluginMessage::base("idle").with_value("time", *time),
            Self::Cleanup => PluginMessage::base("cleanup"),
            Self::Goodbye => PluginMessage::base("goodbye"),
            Self::ShmAdded {
                name,
                size,
                address,
            } => PluginMessage::base("shm_added")
                .with_value("name", name.as_str())
                .with_value("size", *size)
                .with_value("address", *address),
            Self::ShmRemove { name } => {
                PluginMessage::base("shm_remove").with_value("name", name.as_str())
            }
            Self::ShmRemoveResponse { name } => {
                PluginMessage::base("shm_remove_response").with_value("name", name.as_str())
            }
            Self::ForceExit => PluginMessage::base("force_exit"),
            Self::Unrecognized(name) => PluginMessage::base(name.as_str()),
        }
    }
}

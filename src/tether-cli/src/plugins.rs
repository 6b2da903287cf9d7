use std::collections::BTreeMap;
use std::path::Path;
use tether_plugin::{BaseMessage, ChildError, Outbox, PluginInstance, PluginLoader, PluginMessage};
use tracing::{debug, info, warn};

pub const ECHO_PLUGIN: &str = "echo";
pub const ECHO_CLASS: &str = "echo";
const ECHO_VERSION: &str = "1.0";

/// Plugins compiled into the `tether` binary, looked up by file name.
#[derive(Debug, Default)]
pub struct BuiltinLoader;

impl PluginLoader for BuiltinLoader {
    fn load(&mut self, dir: &Path, file: &str) -> Result<Box<dyn PluginInstance>, ChildError> {
        match file {
            ECHO_PLUGIN => {
                info!(dir = %dir.display(), "loading builtin echo plugin");
                Ok(Box::new(EchoPlugin::default()))
            }
            other => Err(ChildError::Load {
                dir: dir.to_path_buf(),
                file: other.to_string(),
                reason: "no builtin plugin with that name".to_string(),
            }),
        }
    }
}

/// Sends every non-control message straight back to the host.
#[derive(Debug, Default)]
pub struct EchoPlugin {
    echoed: u64,
    segments: BTreeMap<String, usize>,
}

impl PluginInstance for EchoPlugin {
    fn receive_message(&mut self, message: &PluginMessage, outbox: &mut Outbox) {
        if !message.is_class(tether_plugin::MESSAGE_CLASS_BASE) {
            self.echoed += 1;
            outbox.send(message.clone());
            return;
        }
        match BaseMessage::decode(message) {
            Ok(BaseMessage::Init) => {
                let mut versions = BTreeMap::new();
                versions.insert(ECHO_CLASS.to_string(), ECHO_VERSION.to_string());
                outbox.send(
                    BaseMessage::InitResponse {
                        versions,
                        plugin_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                    }
                    .to_message(),
                );
            }
            Ok(BaseMessage::Idle { .. }) => {}
            Ok(BaseMessage::ShmAdded { name, size, .. }) => {
                info!(%name, size, "shared memory available");
                self.segments.insert(name, size);
            }
            Ok(BaseMessage::ShmRemove { name }) => {
                self.segments.remove(&name);
                outbox.send(BaseMessage::ShmRemoveResponse { name }.to_message());
            }
            Ok(BaseMessage::Cleanup) => {
                info!(echoed = self.echoed, "echo plugin cleaning up");
                outbox.send(BaseMessage::Goodbye.to_message());
            }
            Ok(BaseMessage::ForceExit) => warn!("host forced the echo plugin out"),
            Ok(other) => debug!(?other, "ignoring control message"),
            Err(err) => warn!(error = %err, "malformed control message"),
        }
    }
}

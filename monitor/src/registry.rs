use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::warn;

use crate::channel::Channel;
use crate::options::parse_start_spec;
use crate::recorder::{RecorderOptions, RecorderSession};

lazy_static! {
    pub static ref SESSIONS: SessionRegistry = SessionRegistry::new();
}

/// Process-wide map of active recorder sessions keyed by exact channel
/// name. The registry owns the sessions; lookups are O(1) and a name
/// only ever matches itself.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<RecorderSession>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session under its channel name, returning whatever
    /// was registered there before.
    pub fn insert(&self, session: Arc<RecorderSession>) -> Option<Arc<RecorderSession>> {
        self.sessions
            .write()
            .insert(session.target_name().to_string(), session)
    }

    pub fn get(&self, name: &str) -> Option<Arc<RecorderSession>> {
        self.sessions.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<RecorderSession>> {
        self.sessions.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Start a recorder on `target` from a `filename|options|command`
/// argument string and register it. A session already recording the
/// same channel is stopped and replaced.
pub fn start_recorder(target: &Channel, args: &str) -> Result<Arc<RecorderSession>> {
    let spec = parse_start_spec(args);
    let opts = RecorderOptions {
        bridged_only: spec.options.bridged_only,
        append: spec.options.append,
        read_volume: spec.options.read_volume,
        write_volume: spec.options.write_volume,
        post_command: spec.command,
        ..RecorderOptions::default()
    };
    let session = RecorderSession::start(target, spec.filename.as_deref().unwrap_or(""), opts)?;
    if let Some(previous) = SESSIONS.insert(session.clone()) {
        warn!(
            channel = target.name(),
            "replacing an active recorder session"
        );
        previous.request_stop();
    }
    Ok(session)
}

/// Stop and unregister the recorder on a named channel.
///
/// The wait for the worker is bounded; on timeout the attempt is
/// abandoned with a warning and the session is left registered. The
/// worker's own teardown is not affected either way.
pub async fn stop_recorder(name: &str) -> Result<()> {
    let session = SESSIONS
        .get(name)
        .ok_or_else(|| anyhow!("no recorder session on channel {name}"))?;
    session.request_stop();
    if session.wait_stopped().await {
        SESSIONS.remove(name);
        Ok(())
    } else {
        warn!(
            channel = name,
            "recorder session did not stop within the retry bound"
        );
        Err(anyhow!("recorder session on {name} did not stop in time"))
    }
}

/// Administrative command surface: `start <channel-name> [<args>]` and
/// `stop <channel-name>`. The engine supplies the name-to-channel
/// resolver.
pub async fn handle_command<F>(line: &str, resolve: F) -> Result<String>
where
    F: Fn(&str) -> Option<Channel>,
{
    let mut parts = line.trim().splitn(3, char::is_whitespace);
    let verb = parts.next().unwrap_or("");
    let name = parts
        .next()
        .ok_or_else(|| anyhow!("missing channel name"))?;
    let args = parts.next().unwrap_or("");

    match verb {
        "start" => {
            let channel =
                resolve(name).ok_or_else(|| anyhow!("no channel named {name}"))?;
            let session = start_recorder(&channel, args)?;
            Ok(format!(
                "recording {} to {}",
                name,
                session.path().display()
            ))
        }
        "stop" => {
            stop_recorder(name).await?;
            Ok(format!("stopped recording on {name}"))
        }
        verb => Err(anyhow!("unknown command {verb}")),
    }
}

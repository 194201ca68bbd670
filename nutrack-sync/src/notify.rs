//! Notification bus
//!
//! The engine only knows [`Broadcaster::publish`]. Which transport carries
//! the events is decided once at process start.

use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Entity whose cached views must be reloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    FoodItems,
    ConsumedFoodItems,
    Profiles,
    UserSettings,
}

impl Entity {
    /// Entities invalidated by a download, in publish order
    pub const ALL: [Entity; 4] = [
        Entity::ConsumedFoodItems,
        Entity::FoodItems,
        Entity::Profiles,
        Entity::UserSettings,
    ];
}

impl std::str::FromStr for Entity {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "food_items" => Ok(Entity::FoodItems),
            "consumed_food_items" => Ok(Entity::ConsumedFoodItems),
            "profiles" => Ok(Entity::Profiles),
            "user_settings" => Ok(Entity::UserSettings),
            other => Err(crate::Error::InvalidConfig(format!("Unknown entity: {}", other))),
        }
    }
}

/// Event published to the rest of the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    RemoteFileUpdated,
    ShowSyncConflict,
    Invalidated(Entity),
}

impl Event {
    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::RemoteFileUpdated => "REMOTE_FILE_UPDATED",
            Event::ShowSyncConflict => "SHOW_SYNC_CONFLICT",
            Event::Invalidated(Entity::FoodItems) => "food_items_updated",
            Event::Invalidated(Entity::ConsumedFoodItems) => "consumed_food_items_updated",
            Event::Invalidated(Entity::Profiles) => "profiles_updated",
            Event::Invalidated(Entity::UserSettings) => "user_settings_updated",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publish side of the notification bus
pub trait Broadcaster: Send + Sync {
    /// Fire and forget. Delivery failures are logged, never returned.
    fn publish(&self, event: Event);
}

/// In-process fan-out over a tokio broadcast channel
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<Event>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn publish(&self, event: Event) {
        match self.tx.send(event) {
            Ok(n) => debug!("Published {} to {} subscribers", event, n),
            Err(_) => debug!("Published {} with no subscribers", event),
        }
    }
}

#[derive(Serialize)]
struct StdioMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a str,
}

/// One JSON object per line on a writer, for a host process reading stdout
pub struct StdioBroadcaster<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> StdioBroadcaster<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl StdioBroadcaster<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> Broadcaster for StdioBroadcaster<W> {
    fn publish(&self, event: Event) {
        let message = StdioMessage {
            kind: "sse-message",
            data: event.as_str(),
        };

        let mut out = self.out.lock();
        let written = serde_json::to_writer(&mut *out, &message)
            .map_err(std::io::Error::from)
            .and_then(|_| out.write_all(b"\n"))
            .and_then(|_| out.flush());

        if let Err(e) = written {
            warn!("Failed to write {} to stdio: {}", event, e);
        }
    }
}

/// Notification transport selected at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Channel,
    Stdio,
}

impl Transport {
    /// Stdio when the host process asks for IPC through `USE_ELECTRON_IPC`.
    pub fn from_env() -> Self {
        match std::env::var("USE_ELECTRON_IPC") {
            Ok(v) if v == "true" || v == "1" => Transport::Stdio,
            _ => Transport::Channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_names() {
        assert_eq!(Event::RemoteFileUpdated.as_str(), "REMOTE_FILE_UPDATED");
        assert_eq!(Event::ShowSyncConflict.as_str(), "SHOW_SYNC_CONFLICT");
        assert_eq!(
            Event::Invalidated(Entity::ConsumedFoodItems).to_string(),
            "consumed_food_items_updated"
        );
        assert_eq!(Event::Invalidated(Entity::UserSettings).as_str(), "user_settings_updated");
    }

    #[test]
    fn test_entity_names() {
        assert_eq!("profiles".parse::<Entity>().unwrap(), Entity::Profiles);
        assert_eq!(
            "consumed_food_items".parse::<Entity>().unwrap(),
            Entity::ConsumedFoodItems
        );
        assert!("dishes".parse::<Entity>().is_err());
    }

    #[tokio::test]
    async fn test_channel_fan_out() {
        let bus = ChannelBroadcaster::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::ShowSyncConflict);

        assert_eq!(a.recv().await.unwrap(), Event::ShowSyncConflict);
        assert_eq!(b.recv().await.unwrap(), Event::ShowSyncConflict);
    }

    #[test]
    fn test_channel_without_subscribers_does_not_panic() {
        ChannelBroadcaster::default().publish(Event::RemoteFileUpdated);
    }

    #[test]
    fn test_stdio_writes_json_lines() {
        let bus = StdioBroadcaster::new(Vec::new());
        bus.publish(Event::RemoteFileUpdated);
        bus.publish(Event::Invalidated(Entity::FoodItems));

        let out = String::from_utf8(bus.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"{"type":"sse-message","data":"REMOTE_FILE_UPDATED"}"#,
                r#"{"type":"sse-message","data":"food_items_updated"}"#,
            ]
        );
    }
}

use serde::Serialize;
use strum::{Display, EnumIter, EnumString};
use tokio::sync::broadcast;

/// Subsystems a client can subscribe to with `idle`. Events are carried as
/// bit flags so one broadcast message can cover several subsystems.
#[derive(
    Debug, Display, EnumIter, EnumString, Serialize, Clone, Copy, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubSystem {
    Database,
    Update,
    StoredPlaylist,
    Playlist,
    Player,
    Mixer,
    Output,
    Options,
    Sticker,
}

impl SubSystem {
    pub const fn flag(self) -> u32 {
        match self {
            SubSystem::Database => 0x1,
            SubSystem::Update => 0x2,
            SubSystem::StoredPlaylist => 0x4,
            SubSystem::Playlist => 0x8,
            SubSystem::Player => 0x10,
            SubSystem::Mixer => 0x20,
            SubSystem::Output => 0x40,
            SubSystem::Options => 0x80,
            SubSystem::Sticker => 0x100,
        }
    }

    pub fn mask(subsystems: &[SubSystem]) -> u32 {
        subsystems.iter().fold(0, |mask, s| mask | s.flag())
    }

    pub const ALL: u32 = 0x1ff;
}

/// Fan-out of subsystem-change events to all client sessions. Every session
/// subscribes once at connect and latches received flags into its own
/// pending mask; `idle` then drains that mask.
#[derive(Debug, Clone)]
pub struct IdleBus {
    tx: broadcast::Sender<u32>,
}

impl IdleBus {
    pub fn new() -> Self {
        // clients that lag behind simply see "everything changed"
        let (tx, _) = broadcast::channel(64);
        IdleBus { tx }
    }

    pub fn emit(&self, subsystem: SubSystem) {
        self.emit_mask(subsystem.flag());
    }

    pub fn emit_mask(&self, flags: u32) {
        if flags != 0 {
            // no receivers is fine, nobody is connected
            let _ = self.tx.send(flags);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<u32> {
        self.tx.subscribe()
    }
}

impl Default for IdleBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Names for a pending mask, in flag order, for `changed:` lines.
pub fn flags_to_subsystems(flags: u32) -> Vec<SubSystem> {
    use strum::IntoEnumIterator;
    SubSystem::iter().filter(|s| flags & s.flag() != 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn masks() {
        let mask = SubSystem::mask(&[SubSystem::Player, SubSystem::Options]);
        assert_eq!(mask, 0x90);
        assert_eq!(
            flags_to_subsystems(mask),
            vec![SubSystem::Player, SubSystem::Options]
        );
    }

    #[test]
    fn protocol_names() {
        assert_eq!(SubSystem::StoredPlaylist.to_string(), "stored_playlist");
        assert_eq!(
            SubSystem::from_str("stored_playlist").unwrap(),
            SubSystem::StoredPlaylist
        );
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = IdleBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SubSystem::Database);
        assert_eq!(rx.recv().await.unwrap(), SubSystem::Database.flag());
    }
}

use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::Deserialize;

/// Who is connected to which voice channel, as last reported by the gateway.
///
/// The REST API cannot list voice channel members, so occupancy comes from
/// voice-state events. Until a full snapshot has been applied the roster
/// answers "unknown" rather than "empty".
#[derive(Default)]
pub struct VoiceRoster {
    state: RwLock<RosterState>,
}

#[derive(Default)]
struct RosterState {
    synced: bool,
    /// A full snapshot has been applied at least once.
    seeded: bool,
    by_user: HashMap<u64, u64>,
}

/// A single `VOICE_STATE_UPDATE` (or a voice state from a guild snapshot).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoiceStateUpdate {
    pub user_id: u64,
    /// `None` when the user left voice.
    pub channel_id: Option<u64>,
}

#[derive(Deserialize)]
struct RawVoiceState {
    user_id: String,
    channel_id: Option<String>,
}

impl VoiceStateUpdate {
    /// Parse a gateway voice-state payload (snowflakes are strings on the wire).
    pub fn from_gateway(raw: &serde_json::Value) -> Option<Self> {
        let raw = RawVoiceState::deserialize(raw).ok()?;
        let user_id = raw.user_id.parse().ok()?;
        let channel_id = match raw.channel_id {
            Some(c) => Some(c.parse().ok()?),
            None => None,
        };
        Some(Self {
            user_id,
            channel_id,
        })
    }
}

impl VoiceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RosterState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RosterState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace everything with a full snapshot and mark the roster trustworthy.
    pub fn replace_all(&self, states: impl IntoIterator<Item = VoiceStateUpdate>) {
        let mut st = self.write();
        st.by_user = states
            .into_iter()
            .filter_map(|s| s.channel_id.map(|c| (s.user_id, c)))
            .collect();
        st.synced = true;
        st.seeded = true;
    }

    pub fn apply(&self, update: VoiceStateUpdate) {
        let mut st = self.write();
        match update.channel_id {
            Some(channel) => st.by_user.insert(update.user_id, channel),
            None => st.by_user.remove(&update.user_id),
        };
    }

    /// Gateway connection lost: events may have been missed.
    pub fn invalidate(&self) {
        self.write().synced = false;
    }

    /// Session resumed: missed events were replayed, so a seeded roster is
    /// current again.
    pub fn resume(&self) {
        let mut st = self.write();
        st.synced = st.seeded;
    }

    pub fn is_synced(&self) -> bool {
        self.read().synced
    }

    /// `None` while the roster cannot be trusted.
    pub fn occupants(&self, channel_id: u64) -> Option<usize> {
        let st = self.read();
        if !st.synced {
            return None;
        }
        Some(st.by_user.values().filter(|c| **c == channel_id).count())
    }
}

//! The few gateway dispatches the bot acts on, parsed from the raw JSON the
//! shard hands us.

use serde::Deserialize;
use serde_json::Value;

use crate::{interactions::InteractionEvent, roster::VoiceStateUpdate};

const OP_DISPATCH: u8 = 0;

#[derive(Clone, Debug, PartialEq)]
pub enum GatewayEvent {
    Ready {
        application_id: u64,
    },
    Resumed,
    /// `GUILD_CREATE`: full guild state, including who sits in voice.
    GuildSnapshot {
        guild_id: u64,
        voice_states: Vec<VoiceStateUpdate>,
    },
    VoiceState {
        guild_id: Option<u64>,
        update: VoiceStateUpdate,
    },
    Interaction(InteractionEvent),
}

#[derive(Deserialize)]
struct RawPayload {
    op: u8,
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    d: Value,
}

/// `None` for non-dispatch opcodes and events we ignore.
pub fn parse_dispatch(text: &str) -> Option<GatewayEvent> {
    let raw: RawPayload = serde_json::from_str(text).ok()?;
    if raw.op != OP_DISPATCH {
        return None;
    }
    let d = raw.d;

    match raw.t.as_deref()? {
        "READY" => Some(GatewayEvent::Ready {
            application_id: snowflake(d.pointer("/application/id")?)?,
        }),
        "RESUMED" => Some(GatewayEvent::Resumed),
        "GUILD_CREATE" => {
            // Outage placeholder, no state attached.
            if d.get("unavailable").and_then(Value::as_bool) == Some(true) {
                return None;
            }
            let voice_states = d
                .get("voice_states")
                .and_then(Value::as_array)
                .map(|states| {
                    states
                        .iter()
                        .filter_map(VoiceStateUpdate::from_gateway)
                        .collect()
                })
                .unwrap_or_default();
            Some(GatewayEvent::GuildSnapshot {
                guild_id: snowflake(d.get("id")?)?,
                voice_states,
            })
        }
        "VOICE_STATE_UPDATE" => Some(GatewayEvent::VoiceState {
            guild_id: d.get("guild_id").and_then(snowflake),
            update: VoiceStateUpdate::from_gateway(&d)?,
        }),
        "INTERACTION_CREATE" => InteractionEvent::from_gateway(&d).map(GatewayEvent::Interaction),
        _ => None,
    }
}

/// Snowflakes travel as decimal strings.
pub(crate) fn snowflake(v: &Value) -> Option<u64> {
    v.as_str()?.parse().ok()
}

//! Slash commands: their registration payload and the mapping from an
//! incoming interaction to a `CommandRequest`.

use serde_json::{json, Value};

use tcb_core::{
    commands::{CommandParseError, CommandRequest},
    config::LifetimePolicy,
    domain::{OwnerId, ResourceKind},
};

use crate::gateway::snowflake;

const INTERACTION_APPLICATION_COMMAND: u64 = 2;

const COMMAND_CHAT_INPUT: u8 = 1;
const OPTION_STRING: u8 = 3;
const OPTION_INTEGER: u8 = 4;

/// Default member permission for `/flush`: administrators only.
const ADMINISTRATOR: u64 = 1 << 3;

pub const NEW_VOICE_CHANNEL: &str = "new_voice_channel";
pub const NEW_TEXT_CHANNEL: &str = "new_text_channel";
pub const CHANNEL_STATUS: &str = "channel_status";
pub const FLUSH: &str = "flush";

const OPT_CHANNEL_NAME: &str = "channel_name";
const OPT_LIFETIME: &str = "lifetime";

/// An application-command interaction.
#[derive(Clone, Debug, PartialEq)]
pub struct InteractionEvent {
    pub id: u64,
    pub application_id: u64,
    pub token: String,
    pub guild_id: Option<u64>,
    pub user_id: u64,
    pub command: String,
    pub options: Vec<(String, Value)>,
}

impl InteractionEvent {
    pub fn from_gateway(d: &Value) -> Option<Self> {
        if d.get("type")?.as_u64()? != INTERACTION_APPLICATION_COMMAND {
            return None;
        }
        // Guild interactions carry `member.user`, DMs carry `user`.
        let user = d
            .pointer("/member/user/id")
            .or_else(|| d.pointer("/user/id"))?;
        let data = d.get("data")?;
        let options = data
            .get("options")
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .filter_map(|o| {
                        Some((o.get("name")?.as_str()?.to_string(), o.get("value")?.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            id: snowflake(d.get("id")?)?,
            application_id: snowflake(d.get("application_id")?)?,
            token: d.get("token")?.as_str()?.to_string(),
            guild_id: d.get("guild_id").and_then(snowflake),
            user_id: snowflake(user)?,
            command: data.get("name")?.as_str()?.to_string(),
            options,
        })
    }

    fn option(&self, name: &str) -> Option<&Value> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn to_request(&self) -> Result<CommandRequest, CommandParseError> {
        let owner = OwnerId(self.user_id);
        let kind = match self.command.as_str() {
            NEW_VOICE_CHANNEL => ResourceKind::Voice,
            NEW_TEXT_CHANNEL => ResourceKind::Text,
            FLUSH => return Ok(CommandRequest::FlushAll { requester: owner }),
            CHANNEL_STATUS => return Ok(CommandRequest::Status { owner }),
            other => return Err(CommandParseError::UnknownCommand(other.to_string())),
        };

        let name = self
            .option(OPT_CHANNEL_NAME)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| CommandParseError::MissingName(self.command.clone()))?
            .to_string();
        // Out-of-range values still reach the lifetime check and get its error.
        let lifetime_hours = self
            .option(OPT_LIFETIME)
            .and_then(Value::as_i64)
            .map(|h| u32::try_from(h).unwrap_or(if h < 0 { 0 } else { u32::MAX }));

        Ok(match kind {
            ResourceKind::Voice => CommandRequest::CreateVoice {
                owner,
                name,
                lifetime_hours,
            },
            ResourceKind::Text => CommandRequest::CreateText {
                owner,
                name,
                lifetime_hours,
            },
        })
    }
}

/// Guild command set, bounded by the configured lifetimes.
pub fn command_definitions(lifetimes: &LifetimePolicy) -> Value {
    let create = |name: &str, kind: ResourceKind, what: &str| {
        let bounds = lifetimes.bounds(kind);
        json!({
            "name": name,
            "type": COMMAND_CHAT_INPUT,
            "description": format!("Create a temporary {what} channel"),
            "options": [
                {
                    "type": OPTION_STRING,
                    "name": OPT_CHANNEL_NAME,
                    "description": "Channel name",
                    "required": true,
                    "max_length": 100,
                },
                {
                    "type": OPTION_INTEGER,
                    "name": OPT_LIFETIME,
                    "description": format!(
                        "Hours until the channel is removed (default {}h)",
                        lifetimes.default_hours
                    ),
                    "required": false,
                    "min_value": bounds.min_hours,
                    "max_value": bounds.max_hours,
                },
            ],
        })
    };

    json!([
        create(NEW_VOICE_CHANNEL, ResourceKind::Voice, "voice"),
        create(NEW_TEXT_CHANNEL, ResourceKind::Text, "text"),
        {
            "name": CHANNEL_STATUS,
            "type": COMMAND_CHAT_INPUT,
            "description": "Show your temporary channels and when they expire",
        },
        {
            "name": FLUSH,
            "type": COMMAND_CHAT_INPUT,
            "description": "Delete every temporary channel",
            "default_member_permissions": ADMINISTRATOR.to_string(),
        },
    ])
}

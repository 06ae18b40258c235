//! Discord adapter (REST v10 over reqwest).
//!
//! Implements the `tcb-core` ChannelProvider port. Voice occupancy is not
//! exposed over REST, so it is answered from a [`VoiceRoster`] that the
//! gateway connection in [`router`] keeps up to date; the same connection
//! delivers slash commands.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};

pub mod gateway;
pub mod interactions;
pub mod roster;
pub mod router;

pub use roster::{VoiceRoster, VoiceStateUpdate};
pub use router::{run_gateway, GatewayRouter};

use tcb_core::{
    config::Config,
    domain::{ChannelId, ChannelRef, OwnerPermissions, ResourceKind},
    provider::{ChannelProvider, ProviderError, ProviderResult},
};

const VIEW_CHANNEL: u64 = 1 << 10;
const MANAGE_CHANNELS: u64 = 1 << 4;
/// Shown as "Manage Permissions" on channel overwrites.
const MANAGE_ROLES: u64 = 1 << 28;

const CHANNEL_TYPE_TEXT: u8 = 0;
const CHANNEL_TYPE_VOICE: u8 = 2;
const CHANNEL_TYPE_ANNOUNCEMENT: u8 = 5;
const CHANNEL_TYPE_STAGE: u8 = 13;

const OVERWRITE_ROLE: u8 = 0;
const OVERWRITE_MEMBER: u8 = 1;

/// Longest server-requested back-off we are willing to sleep through.
const MAX_RETRY_WAIT: Duration = Duration::from_secs(30);

const CALLBACK_DEFERRED_MESSAGE: u8 = 5;
const MESSAGE_FLAG_EPHEMERAL: u64 = 1 << 6;
const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Deserialize)]
struct ApiChannel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: u8,
}

pub struct DiscordProvider {
    http: reqwest::Client,
    api_base: String,
    token: String,
    guild_id: u64,
    category_id: Option<u64>,
    /// Total time one call may spend, retries included.
    call_budget: Duration,
    roster: Arc<VoiceRoster>,
}

impl DiscordProvider {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let token = cfg
            .discord_bot_token
            .clone()
            .context("DISCORD_BOT_TOKEN is not set")?;
        let guild_id = cfg
            .discord_guild_id
            .context("DISCORD_GUILD_ID is not set")?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("DiscordBot (tcb, ", env!("CARGO_PKG_VERSION"), ")"))
            .timeout(cfg.provider_timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            api_base: cfg.discord_api_base.trim_end_matches('/').to_string(),
            token,
            guild_id,
            category_id: cfg.discord_category_id,
            call_budget: cfg.provider_timeout,
            roster: Arc::new(VoiceRoster::new()),
        })
    }

    /// Shared handle for whatever feeds voice-state events.
    pub fn roster(&self) -> Arc<VoiceRoster> {
        self.roster.clone()
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    /// Replace the guild's slash commands with `commands`.
    pub async fn register_commands(&self, application_id: u64, commands: &Value) -> ProviderResult<()> {
        let path = format!(
            "/applications/{application_id}/guilds/{}/commands",
            self.guild_id
        );
        let resp = self
            .with_retry(|| self.request(Method::PUT, &path).json(commands))
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Acknowledge an interaction; the answer follows through
    /// `edit_interaction_response`.
    pub async fn defer_interaction(&self, interaction_id: u64, token: &str) -> ProviderResult<()> {
        let path = format!("/interactions/{interaction_id}/{token}/callback");
        let body = json!({
            "type": CALLBACK_DEFERRED_MESSAGE,
            "data": { "flags": MESSAGE_FLAG_EPHEMERAL },
        });
        let resp = self
            .with_retry(|| self.request(Method::POST, &path).json(&body))
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn edit_interaction_response(
        &self,
        application_id: u64,
        token: &str,
        content: &str,
    ) -> ProviderResult<()> {
        let path = format!("/webhooks/{application_id}/{token}/messages/@original");
        let body = json!({ "content": clip_message(content) });
        let resp = self
            .with_retry(|| self.request(Method::PATCH, &path).json(&body))
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .header(AUTHORIZATION, format!("Bot {}", self.token))
    }

    fn map_transport(e: reqwest::Error) -> ProviderError {
        ProviderError::Unavailable(format!("discord request failed: {e}"))
    }

    /// Send, retrying once when Discord answers 429 and the back-off still
    /// fits in the call budget.
    async fn with_retry(&self, mut build: impl FnMut() -> RequestBuilder) -> ProviderResult<Response> {
        const MAX_RETRIES: usize = 1;
        let started = Instant::now();
        let mut attempts = 0usize;
        loop {
            let resp = build().send().await.map_err(Self::map_transport)?;
            if resp.status() != StatusCode::TOO_MANY_REQUESTS || attempts >= MAX_RETRIES {
                return Ok(resp);
            }

            let header = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp.text().await.unwrap_or_default();
            let wait = retry_after(header.as_deref(), &body);
            if !retry_fits(wait, started.elapsed(), self.call_budget) {
                return Err(ProviderError::Unavailable(format!(
                    "rate limited for {wait:?}"
                )));
            }

            attempts += 1;
            tracing::debug!("discord rate limit, retrying in {wait:?}");
            sleep(wait).await;
        }
    }

    /// Turn a non-2xx response into a ProviderError.
    async fn check(resp: Response) -> ProviderResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status.as_u16(), &body))
    }
}

fn status_error(status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());

    if status == 429 || status >= 500 {
        ProviderError::Unavailable(format!("discord returned {status}: {message}"))
    } else {
        ProviderError::Rejected { status, message }
    }
}

/// A retry must leave room for the second request inside the budget.
fn retry_fits(wait: Duration, elapsed: Duration, budget: Duration) -> bool {
    wait <= MAX_RETRY_WAIT && elapsed + wait < budget
}

fn clip_message(content: &str) -> String {
    if content.chars().count() <= MAX_MESSAGE_CHARS {
        return content.to_string();
    }
    let mut clipped: String = content.chars().take(MAX_MESSAGE_CHARS - 1).collect();
    clipped.push('…');
    clipped
}

/// Body `retry_after` wins over the header; both are seconds, possibly fractional.
fn retry_after(header: Option<&str>, body: &str) -> Duration {
    let from_body = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("retry_after").and_then(Value::as_f64));
    let from_header = header.and_then(|h| h.trim().parse::<f64>().ok());

    from_body
        .or(from_header)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(Duration::from_secs(1))
}

fn channel_kind(api_type: u8) -> Option<ResourceKind> {
    match api_type {
        CHANNEL_TYPE_VOICE | CHANNEL_TYPE_STAGE => Some(ResourceKind::Voice),
        CHANNEL_TYPE_TEXT | CHANNEL_TYPE_ANNOUNCEMENT => Some(ResourceKind::Text),
        _ => None,
    }
}

fn api_type(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::Voice => CHANNEL_TYPE_VOICE,
        ResourceKind::Text => CHANNEL_TYPE_TEXT,
    }
}

fn to_channel_ref(raw: ApiChannel) -> ProviderResult<ChannelRef> {
    let id = raw.id.parse::<u64>().map_err(|_| {
        ProviderError::Unavailable(format!("discord returned bad channel id {:?}", raw.id))
    })?;
    // Categories, threads and the like are not something we create; report
    // them as text so a stale record still gets cleaned up.
    let kind = channel_kind(raw.kind).unwrap_or(ResourceKind::Text);
    Ok(ChannelRef {
        id: ChannelId(id),
        name: raw.name.unwrap_or_default(),
        kind,
    })
}

fn permission_overwrites(guild_id: u64, perms: &OwnerPermissions) -> Vec<Value> {
    let mut owner_allow = 0u64;
    if perms.owner_can_view {
        owner_allow |= VIEW_CHANNEL;
    }
    if perms.owner_can_manage {
        owner_allow |= MANAGE_CHANNELS | MANAGE_ROLES;
    }

    let mut overwrites = vec![json!({
        "id": perms.owner.0.to_string(),
        "type": OVERWRITE_MEMBER,
        "allow": owner_allow.to_string(),
        "deny": "0",
    })];
    // The @everyone role shares the guild's id.
    if perms.hide_from_everyone {
        overwrites.push(json!({
            "id": guild_id.to_string(),
            "type": OVERWRITE_ROLE,
            "allow": "0",
            "deny": VIEW_CHANNEL.to_string(),
        }));
    }
    overwrites
}

fn create_body(
    guild_id: u64,
    category_id: Option<u64>,
    kind: ResourceKind,
    name: &str,
    perms: &OwnerPermissions,
) -> Value {
    let mut body = json!({
        "name": name,
        "type": api_type(kind),
        "permission_overwrites": permission_overwrites(guild_id, perms),
    });
    if let Some(parent) = category_id {
        body["parent_id"] = Value::String(parent.to_string());
    }
    body
}

#[async_trait]
impl ChannelProvider for DiscordProvider {
    async fn resolve(&self, id: ChannelId) -> ProviderResult<Option<ChannelRef>> {
        let path = format!("/channels/{id}");
        let resp = self.with_retry(|| self.request(Method::GET, &path)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let raw: ApiChannel = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(Self::map_transport)?;
        to_channel_ref(raw).map(Some)
    }

    async fn occupant_count(&self, channel: &ChannelRef) -> ProviderResult<usize> {
        if channel.kind == ResourceKind::Text {
            return Ok(0);
        }
        self.roster
            .occupants(channel.id.0)
            .ok_or_else(|| ProviderError::Unavailable("voice roster not synced".to_string()))
    }

    async fn create_channel(
        &self,
        kind: ResourceKind,
        name: &str,
        permissions: &OwnerPermissions,
    ) -> ProviderResult<ChannelRef> {
        let path = format!("/guilds/{}/channels", self.guild_id);
        let body = create_body(self.guild_id, self.category_id, kind, name, permissions);
        let resp = self
            .with_retry(|| self.request(Method::POST, &path).json(&body))
            .await?;
        let raw: ApiChannel = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(Self::map_transport)?;
        let mut channel = to_channel_ref(raw)?;
        channel.kind = kind;
        tracing::info!(channel = %channel.id, kind = %kind, "discord channel created");
        Ok(channel)
    }

    async fn delete_channel(&self, channel: &ChannelRef) -> ProviderResult<()> {
        let path = format!("/channels/{}", channel.id);
        let resp = self.with_retry(|| self.request(Method::DELETE, &path)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            tracing::debug!(channel = %channel.id, "channel already gone");
            return Ok(());
        }
        Self::check(resp).await?;
        Ok(())
    }
}

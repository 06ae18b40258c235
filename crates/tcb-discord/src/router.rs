//! Gateway ingress: keeps the voice roster current and answers slash
//! commands through the core `CommandSurface`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use twilight_gateway::{Message, Shard};
use twilight_model::gateway::{Intents, ShardId};

use tcb_core::{
    commands::{CommandResponse, CommandSurface},
    config::LifetimePolicy,
};

use crate::{
    gateway::{parse_dispatch, GatewayEvent},
    interactions::{command_definitions, InteractionEvent},
    DiscordProvider,
};

#[derive(Clone)]
pub struct GatewayRouter {
    provider: Arc<DiscordProvider>,
    surface: Arc<CommandSurface>,
    lifetimes: LifetimePolicy,
}

impl GatewayRouter {
    pub fn new(
        provider: Arc<DiscordProvider>,
        surface: Arc<CommandSurface>,
        lifetimes: LifetimePolicy,
    ) -> Self {
        Self {
            provider,
            surface,
            lifetimes,
        }
    }

    /// Handle one raw gateway message.
    pub fn dispatch(&self, text: &str) {
        if let Some(event) = parse_dispatch(text) {
            self.handle_event(event);
        }
    }

    pub fn handle_event(&self, event: GatewayEvent) {
        let guild = self.provider.guild_id();
        let roster = self.provider.roster();

        match event {
            GatewayEvent::Ready { application_id } => {
                tracing::info!(application_id, "gateway session ready");
                let provider = self.provider.clone();
                let commands = command_definitions(&self.lifetimes);
                tokio::spawn(async move {
                    match provider.register_commands(application_id, &commands).await {
                        Ok(()) => tracing::info!("slash commands registered"),
                        Err(e) => tracing::error!("registering slash commands failed: {e}"),
                    }
                });
            }
            GatewayEvent::Resumed => {
                roster.resume();
                tracing::info!("gateway session resumed");
            }
            GatewayEvent::GuildSnapshot {
                guild_id,
                voice_states,
            } if guild_id == guild => {
                let connected = voice_states.len();
                roster.replace_all(voice_states);
                tracing::info!(connected, "voice roster synced");
            }
            GatewayEvent::GuildSnapshot { guild_id, .. } => {
                tracing::debug!(guild_id, "ignoring foreign guild");
            }
            GatewayEvent::VoiceState { guild_id, update } => {
                if guild_id == Some(guild) {
                    roster.apply(update);
                }
            }
            GatewayEvent::Interaction(ev) => {
                if ev.guild_id != Some(guild) {
                    tracing::debug!(interaction = ev.id, "ignoring interaction outside the guild");
                    return;
                }
                let router = self.clone();
                tokio::spawn(async move { router.answer(ev).await });
            }
        }
    }

    /// Connection dropped; occupancy is unknown until the session is back.
    pub fn disconnected(&self) {
        self.provider.roster().invalidate();
    }

    async fn answer(&self, ev: InteractionEvent) {
        // Discord wants an acknowledgement within three seconds.
        if let Err(e) = self.provider.defer_interaction(ev.id, &ev.token).await {
            tracing::warn!(interaction = ev.id, "could not acknowledge interaction: {e}");
            return;
        }

        let response = match ev.to_request() {
            Ok(request) => self.surface.handle(request).await,
            Err(e) => CommandResponse::Error {
                reason: e.to_string(),
            },
        };

        if let Err(e) = self
            .provider
            .edit_interaction_response(ev.application_id, &ev.token, &response.to_string())
            .await
        {
            tracing::warn!(interaction = ev.id, "could not deliver reply: {e}");
        }
    }
}

/// Hold the gateway connection until `cancel` fires or the shard hits a
/// fatal error (bad token, disallowed intents).
pub async fn run_gateway(router: GatewayRouter, cancel: CancellationToken) -> anyhow::Result<()> {
    let intents = Intents::GUILDS | Intents::GUILD_VOICE_STATES;
    let mut shard = Shard::new(
        ShardId::ONE,
        router.provider.token().to_string(),
        intents,
    );
    tracing::info!("connecting to the Discord gateway");

    let res = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            message = shard.next_message() => message,
        };

        match message {
            Ok(Message::Text(text)) => router.dispatch(&text),
            Ok(Message::Close(frame)) => {
                tracing::warn!(?frame, "gateway connection closed, reconnecting");
                router.disconnected();
            }
            Err(e) if e.is_fatal() => {
                break Err(anyhow::anyhow!("discord gateway failed: {e}"));
            }
            Err(e) => tracing::warn!("gateway receive error: {e}"),
        }
    };

    router.disconnected();
    tracing::info!("gateway stopped");
    res
}

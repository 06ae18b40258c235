//! Command surface: structured requests in, result variants out.
//!
//! Platform adapters turn their own interactions into `CommandRequest`s (or
//! feed slash-style text through `parse_command`) and render the returned
//! `CommandResponse`. No error type from below this layer escapes it.

use std::{fmt, sync::Arc};

use crate::{
    domain::{ChannelId, ChannelRef, OwnerId, OwnerRecord, ResourceKind},
    lifecycle::{CreateOutcome, FlushReport, LifecycleManager},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandRequest {
    CreateVoice {
        owner: OwnerId,
        name: String,
        lifetime_hours: Option<u32>,
    },
    CreateText {
        owner: OwnerId,
        name: String,
        lifetime_hours: Option<u32>,
    },
    FlushAll {
        requester: OwnerId,
    },
    Status {
        owner: OwnerId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandResponse {
    Created {
        handle: ChannelId,
        name: String,
        kind: ResourceKind,
    },
    Conflict {
        existing: ChannelRef,
    },
    Flushed {
        report: FlushReport,
    },
    Status {
        record: Option<OwnerRecord>,
    },
    Error {
        reason: String,
    },
}

impl fmt::Display for CommandResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandResponse::Created { handle, name, kind } => {
                write!(f, "created {kind} channel {name} ({handle})")
            }
            CommandResponse::Conflict { existing } => write!(
                f,
                "already managing {} channel {} ({})",
                existing.kind, existing.name, existing.id
            ),
            CommandResponse::Flushed { report } => {
                write!(
                    f,
                    "flushed {} channel(s), {} delete(s) attempted",
                    report.count(),
                    report.attempted()
                )?;
                let failed = report.failed().count();
                if failed > 0 {
                    write!(f, ", {failed} failed")?;
                }
                if !report.uncleared_owners.is_empty() {
                    write!(
                        f,
                        ", {} record(s) could not be cleared",
                        report.uncleared_owners.len()
                    )?;
                }
                Ok(())
            }
            CommandResponse::Status { record } => {
                let entries = record.as_ref().map(OwnerRecord::entries).unwrap_or_default();
                if entries.is_empty() {
                    return write!(f, "no temporary channels");
                }
                let lines: Vec<String> = entries
                    .iter()
                    .map(|(kind, e)| {
                        format!(
                            "{kind} channel {} expires at {}",
                            e.channel_id,
                            e.expires_at.format("%Y-%m-%d %H:%M UTC")
                        )
                    })
                    .collect();
                write!(f, "{}", lines.join("\n"))
            }
            CommandResponse::Error { reason } => write!(f, "error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("not a command")]
    NotACommand,

    #[error("unknown command: /{0}")]
    UnknownCommand(String),

    #[error("/{0} needs a channel name")]
    MissingName(String),
}

/// Parse `/new_voice_channel <name> [hours]`, `/new_text_channel <name> [hours]`,
/// `/channel_status` or `/flush`.
///
/// A trailing integer is taken as the lifetime; everything before it is the
/// channel name.
pub fn parse_command(owner: OwnerId, text: &str) -> Result<CommandRequest, CommandParseError> {
    let text = text.trim();
    if !text.starts_with('/') {
        return Err(CommandParseError::NotACommand);
    }

    let mut parts = text.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    // `/cmd@botname` is accepted.
    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    let kind = match cmd.as_str() {
        "new_voice_channel" => ResourceKind::Voice,
        "new_text_channel" => ResourceKind::Text,
        "flush" => return Ok(CommandRequest::FlushAll { requester: owner }),
        "channel_status" => return Ok(CommandRequest::Status { owner }),
        _ => return Err(CommandParseError::UnknownCommand(cmd)),
    };

    let (name, lifetime_hours) = split_lifetime(rest);
    if name.is_empty() {
        return Err(CommandParseError::MissingName(cmd));
    }
    let name = name.to_string();

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

fn split_lifetime(args: &str) -> (&str, Option<u32>) {
    if let Some((head, last)) = args.rsplit_once(char::is_whitespace) {
        if let Ok(hours) = last.parse::<u32>() {
            return (head.trim(), Some(hours));
        }
    }
    (args, None)
}

pub struct CommandSurface {
    manager: Arc<LifecycleManager>,
}

impl CommandSurface {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self { manager }
    }

    pub async fn handle(&self, request: CommandRequest) -> CommandResponse {
        match request {
            CommandRequest::CreateVoice {
                owner,
                name,
                lifetime_hours,
            } => {
                self.create(owner, ResourceKind::Voice, &name, lifetime_hours)
                    .await
            }
            CommandRequest::CreateText {
                owner,
                name,
                lifetime_hours,
            } => {
                self.create(owner, ResourceKind::Text, &name, lifetime_hours)
                    .await
            }
            CommandRequest::FlushAll { requester } => {
                tracing::info!(requester = %requester, "flush requested");
                match self.manager.flush_all().await {
                    Ok(report) => CommandResponse::Flushed { report },
                    Err(e) => {
                        tracing::error!("flush failed: {e}");
                        CommandResponse::Error {
                            reason: e.to_string(),
                        }
                    }
                }
            }
            CommandRequest::Status { owner } => match self.manager.record(owner).await {
                Ok(record) => CommandResponse::Status { record },
                Err(e) => {
                    tracing::warn!(owner = %owner, "status lookup failed: {e}");
                    CommandResponse::Error {
                        reason: e.to_string(),
                    }
                }
            },
        }
    }

    /// Parse and run one text command.
    pub async fn handle_text(&self, owner: OwnerId, text: &str) -> CommandResponse {
        match parse_command(owner, text) {
            Ok(req) => self.handle(req).await,
            Err(e) => CommandResponse::Error {
                reason: e.to_string(),
            },
        }
    }

    async fn create(
        &self,
        owner: OwnerId,
        kind: ResourceKind,
        name: &str,
        lifetime_hours: Option<u32>,
    ) -> CommandResponse {
        let hours = lifetime_hours.unwrap_or(self.manager.lifetimes().default_hours);
        match self.manager.create(owner, kind, name, hours).await {
            Ok(CreateOutcome::Created(ch)) => CommandResponse::Created {
                handle: ch.id,
                name: ch.name,
                kind: ch.kind,
            },
            Ok(CreateOutcome::Conflict(existing)) => CommandResponse::Conflict { existing },
            Err(e) => {
                if e.is_store_failure() {
                    tracing::error!(owner = %owner, kind = %kind, "create failed: {e}");
                } else {
                    tracing::info!(owner = %owner, kind = %kind, "create refused: {e}");
                }
                CommandResponse::Error {
                    reason: e.to_string(),
                }
            }
        }
    }
}

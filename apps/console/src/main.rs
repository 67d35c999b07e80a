use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use composer_core::{
    alert_message, registry, AlertAllowList, AlertEvent, AlertQueue, ComposerEngine,
    ALERT_QUEUE_CAPACITY, MATCHES_COLLECTION,
};
use shared::domain::{ActionValue, Channel, MatchId};
use storage::{DocumentStore, Fields, Storage};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

mod config;

use config::load_settings;

#[derive(Parser, Debug)]
#[command(
    name = "composer-console",
    about = "Operator console for the score overlay composer"
)]
struct Cli {
    /// Overrides the configured database URL.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the match catalog.
    Matches,
    /// Toggle a cue for one channel of a match.
    Toggle {
        match_id: String,
        /// Action identifier: 4, 6, WICKET, WIDE_DELIVERY, FREE_HIT, SCORE_TABLE, COMMON.
        action: String,
        /// preview or live.
        channel: String,
    },
    /// Set or clear the common title banner for one channel.
    Title {
        match_id: String,
        channel: String,
        title: String,
    },
    /// Show a channel's control flags for a match.
    State { match_id: String, channel: String },
    /// Show the recent action history for a match.
    History { match_id: String },
    /// Watch a match's feed actions and print the alert queue until ctrl-c.
    Watch { match_id: String },
    /// Print the preview/live display endpoints for a match.
    Urls { match_id: String },
    /// Write a feed action onto a match record. Development helper: change
    /// notifications are in-process only, so pair it with `watch` in the
    /// same process or verify through `state`/`history`.
    Feed { match_id: String, action: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }

    let storage = Storage::new(&settings.database_url).await?;
    let store: Arc<dyn DocumentStore> = Arc::new(storage);
    let allow_list = AlertAllowList::new(settings.allowed_actions.clone());
    let engine = ComposerEngine::new(Arc::clone(&store), allow_list);

    match cli.command {
        Command::Matches => {
            let matches = engine.list_matches().await?;
            if matches.is_empty() {
                println!("no matches found");
            }
            for summary in matches {
                let when = summary.match_time.as_deref().unwrap_or("-");
                println!(
                    "{}  {}  {}  {}",
                    summary.id, summary.match_title, summary.location, when
                );
            }
        }
        Command::Toggle {
            match_id,
            action,
            channel,
        } => {
            let action = parse_action(&action)?;
            let channel = parse_channel(&channel)?;
            engine.select_match(MatchId::from(match_id)).await?;
            let now_on = engine.toggle(&action, channel).await?;
            println!(
                "{action} on {channel}: {}",
                if now_on { "active" } else { "inactive" }
            );
        }
        Command::Title {
            match_id,
            channel,
            title,
        } => {
            let channel = parse_channel(&channel)?;
            engine.select_match(MatchId::from(match_id)).await?;
            let now_on = engine.set_common_title(channel, &title).await?;
            println!(
                "common on {channel}: {}",
                if now_on { "active" } else { "inactive" }
            );
        }
        Command::State { match_id, channel } => {
            let channel = parse_channel(&channel)?;
            engine.select_match(MatchId::from(match_id)).await?;

            let snapshot = engine.channel_state(channel).await;
            for cue in registry::cues() {
                let active = snapshot
                    .get(cue.doc_key)
                    .map(|doc| doc.control)
                    .unwrap_or(false);
                println!(
                    "{:<10} {}",
                    cue.short_label,
                    if active { "active" } else { "inactive" }
                );
            }
            if let Some(record) = engine.ticker_record().await? {
                match record.ticker(channel) {
                    Some(value) => println!("ticker: {value}"),
                    None => println!("ticker: (empty)"),
                }
            }
        }
        Command::History { match_id } => {
            engine.select_match(MatchId::from(match_id)).await?;
            let entries = engine.refresh_history().await?;
            if entries.is_empty() {
                println!("no recent actions");
            }
            for entry in entries {
                println!(
                    "{}  {:<8} {}",
                    entry.timestamp.to_rfc3339(),
                    entry.mode,
                    entry.action
                );
            }
        }
        Command::Watch { match_id } => watch(&engine, MatchId::from(match_id)).await?,
        Command::Urls { match_id } => {
            let match_id = MatchId::from(match_id);
            for channel in Channel::ALL {
                println!("{channel}: {}", settings.display_url(channel, &match_id));
            }
        }
        Command::Feed { match_id, action } => {
            let action = parse_action(&action)?;
            let mut fields = Fields::new();
            fields.insert("last_action".to_string(), serde_json::to_value(&action)?);
            store.update(MATCHES_COLLECTION, &match_id, fields).await?;
            println!("feed action {action} written to {match_id}");
        }
    }

    Ok(())
}

async fn watch(engine: &Arc<ComposerEngine>, match_id: MatchId) -> Result<()> {
    let mut alerts = engine.alerts().subscribe_events();
    engine.select_match(match_id.clone()).await?;
    println!("watching {match_id}; ctrl-c to stop");

    let mut queue = AlertQueue::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                engine.alerts().detach().await;
                return Ok(());
            }
            event = alerts.recv() => match event {
                Ok(AlertEvent::Action { action, .. }) => {
                    queue.push(alert_message(&action));
                    println!("--- alerts ({} of {ALERT_QUEUE_CAPACITY}) ---", queue.len());
                    for alert in queue.alerts() {
                        println!("{}  {}", alert.timestamp.format("%H:%M:%S"), alert.message);
                    }
                }
                Ok(AlertEvent::SubscriptionClosed { match_id }) => {
                    warn!(%match_id, "alert stream closed; not reconnecting");
                    return Ok(());
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "alert consumer lagged");
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

fn parse_action(raw: &str) -> Result<ActionValue> {
    raw.parse::<ActionValue>().map_err(|err| anyhow!(err))
}

fn parse_channel(raw: &str) -> Result<Channel> {
    raw.parse::<Channel>().map_err(|err| anyhow!(err))
}

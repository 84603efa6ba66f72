use anyhow::Context;
use conversation_realtime_kit::{
    prelude::*,
    unread::source::DEFAULT_UNREAD_COUNT_PATH,
};
use std::sync::Arc;
use tracing::{info, warn};

// 1. Read the endpoint and token from the environment (or a .env file)

fn token_from_env() -> Option<Credential> {
    std::env::var("CHAT_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
        .map(Credential::from)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("monitor=info".parse()?)
                .add_directive("conversation_realtime_kit=info".parse()?),
        )
        .init();

    let base_url = std::env::var("CHAT_BASE_URL").unwrap_or_else(|_| {
        info!("CHAT_BASE_URL not found in environment, using default");
        "http://localhost:8000".to_string()
    });

    let config = match std::env::var("CHAT_CONFIG_JSON") {
        Ok(json) => ClientConfig::from_json_str(&json).context("invalid CHAT_CONFIG_JSON")?,
        Err(_) => ClientConfig::default().with_base_url(&base_url),
    };

    // 2. Build the client: tungstenite for the socket, reqwest for the REST fallback

    let source = HttpUnreadCountSource::new(&config.base_url, DEFAULT_UNREAD_COUNT_PATH, token_from_env)?;
    let client = RealtimeClient::builder(config, TungsteniteConnector, Arc::new(source))
        .credential_provider(token_from_env)
        .build()?;

    // 3. Subscribe to what the UI would render

    let _total = client.store().subscribe(Topic::TotalUnreadCount, |n| {
        if let Notification::TotalUnreadCount(total) = n {
            info!(total, "Unread total changed");
        }
    });
    let _messages = client.store().subscribe(Topic::Updates, |n| {
        if let Notification::Message(message) = n {
            info!(
                conversation_id = message.conversation_id,
                sender = ?message.sender_id,
                "New message: {}",
                message.body
            );
        }
    });
    let _per_conversation = client.store().subscribe(Topic::ConversationUnreadCount, |n| {
        if let Notification::ConversationUnreadCount { conversation_id, count } = n {
            info!(conversation_id, count, "Conversation unread count changed");
        }
    });
    client.router().on_typing(|event| {
        info!(user = ?event.user_id, is_typing = event.is_typing, "Typing");
    });

    // 4. Connect and report status changes until Ctrl-C

    client.connect_from_provider().await?;

    let mut status = client.status_receiver();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match (&current.last_error, current.terminal) {
                    (Some(error), true) => {
                        warn!(%error, "Connection gave up");
                        break;
                    }
                    (Some(error), false) => warn!(state = %current.state, %error, "Connection trouble"),
                    (None, _) => info!(state = %current.state, "Connection state"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

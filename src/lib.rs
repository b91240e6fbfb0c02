pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod store;
pub mod sync;

use chrono::Local;
use cli::{ Args, Command };
use config::ChatConfig;
use log::{ info, warn };
use models::chat::{ DeliveryStatus, LocalMessage, UserProfile };
use std::error::Error;
use sync::{ ChatClient, ConversationEntry };

pub use error::{ ChatError, StoreError };
pub use models::chat::ConversationId;
pub use store::{ DocumentStore, MemoryDocumentStore, RedisDocumentStore };

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Store Type: {}", args.store_type);
    info!("Store Host: {}", args.store_host);
    info!("Redis Prefix: {}", args.redis_prefix);
    info!("Chats Collection: {}", args.chats_collection);
    info!("Messages Collection: {}", args.messages_collection);
    info!("Users Collection: {}", args.users_collection);
    info!("Unread Update: {}", args.unread_update);
    info!("-------------------------");

    let config = ChatConfig::from_args(&args)?;
    let store = store::create_document_store(&args)?;
    let client = ChatClient::new(store, config);

    match args.command {
        Command::Send { from, to, text } => {
            match client.send_message(&from, &to, &text).await {
                Ok(client_id) => info!("Sent {} from {} to {}", client_id, from, to),
                Err(ChatError::EmptyMessage) => warn!("Not sending an empty message"),
                Err(e) => {
                    return Err(e.into());
                }
            }
        }
        Command::Open { user, with } => {
            let id = ConversationId::for_pair(&user, &with);
            if client.reset_unread(&id, &user).await? {
                info!("Cleared unread messages of {} in {}", user, id);
            } else {
                info!("No conversation between {} and {} yet", user, with);
            }
        }
        Command::Watch { user, with } => {
            let mut view = client.open_conversation(&user, &with).await?;
            loop {
                tokio::select! {
                    changed = view.changed() => {
                        print_messages(&user, &view.messages().await);
                        changed?;
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            view.close();
        }
        Command::List { user } => {
            let mut feed = client.conversation_feed(&user).await?;
            loop {
                tokio::select! {
                    entries = feed.next() => {
                        match entries {
                            Some(entries) => print_entries(&user, &entries),
                            None => break,
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            feed.cancel();
        }
        Command::Profile { id, name, username, photo_url, verified } => {
            let profile = UserProfile { id, name, username, photo_url, verified };
            client.put_profile(&profile).await?;
            info!("Stored profile {}", profile.id);
        }
    }

    Ok(())
}

fn print_messages(viewer: &str, messages: &[LocalMessage]) {
    println!("--- {} messages ---", messages.len());
    for message in messages {
        let who = if message.sender_id == viewer { "me" } else { message.sender_id.as_str() };
        let marker = match &message.status {
            DeliveryStatus::Committed => String::new(),
            DeliveryStatus::Pending => " (sending)".to_string(),
            DeliveryStatus::Failed { reason, .. } => format!(" (failed: {})", reason),
        };
        println!("[{}] {}: {}{}", message.timestamp.as_millis(), who, message.text, marker);
    }
}

fn print_entries(viewer: &str, entries: &[ConversationEntry]) {
    let now = Local::now();
    println!("--- {} conversations ---", entries.len());
    for entry in entries {
        let name = match &entry.other_user {
            Some(profile) => format!("{} (@{})", profile.name, profile.username),
            None => entry.summary.other_participant(viewer).unwrap_or("unknown").to_string(),
        };
        let dot = if entry.has_unread(viewer) { "* " } else { "  " };
        println!("{}{} · {} | {}", dot, name, entry.display_time(now), entry.preview(viewer));
    }
}

use clap::{ Parser, Subcommand };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Document Store Args ---
    /// Document store type (memory, redis)
    #[arg(long, env = "STORE_TYPE", default_value = "redis", global = true)]
    pub store_type: String,

    /// Document store host endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "STORE_HOST", default_value = "redis://127.0.0.1:6379", global = true)]
    pub store_host: String,

    /// Prefix for every Redis key the store writes.
    #[arg(long, env = "STORE_REDIS_PREFIX", default_value = "chat:", global = true)]
    pub redis_prefix: String,

    // --- Layout Args ---
    /// Collection holding one summary document per conversation.
    #[arg(long, env = "CHATS_COLLECTION", default_value = "chats", global = true)]
    pub chats_collection: String,

    /// Sub-collection under each summary holding its messages.
    #[arg(long, env = "MESSAGES_COLLECTION", default_value = "messages", global = true)]
    pub messages_collection: String,

    /// Collection holding user profiles.
    #[arg(long, env = "USERS_COLLECTION", default_value = "users", global = true)]
    pub users_collection: String,

    // --- Sync Args ---
    /// How sends bump the recipient's unread count (atomic, read-modify-write)
    #[arg(long, env = "UNREAD_UPDATE", default_value = "atomic", global = true)]
    pub unread_update: String,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Send a message from one user to another.
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        text: String,
    },

    /// Open a conversation, clearing the user's unread count.
    Open {
        #[arg(long)]
        user: String,
        #[arg(long = "with")]
        with: String,
    },

    /// Open a conversation and print its messages on every change until Ctrl-C.
    Watch {
        #[arg(long)]
        user: String,
        #[arg(long = "with")]
        with: String,
    },

    /// Print a user's conversation list on every change until Ctrl-C.
    List {
        #[arg(long)]
        user: String,
    },

    /// Create or replace a user profile.
    Profile {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        photo_url: Option<String>,
        #[arg(long, default_value = "false")]
        verified: bool,
    },
}

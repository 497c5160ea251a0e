use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::mailbox::MessageFormat;

/// Command-line options for mailwright.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// OAuth client id
    #[arg(long, env = "GOOGLE_CLIENT_ID", global = true)]
    pub client_id: Option<String>,

    /// OAuth client secret
    #[arg(long, env = "GOOGLE_CLIENT_SECRET", hide_env_values = true, global = true)]
    pub client_secret: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Acquire a new token by driving the provider login page.
    Authorize(AuthorizeArgs),
    /// List messages matching a query.
    List {
        #[command(flatten)]
        token: TokenArgs,
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Fetch one message.
    Get {
        #[command(flatten)]
        token: TokenArgs,
        #[arg(long)]
        id: String,
        #[arg(long, value_enum, default_value_t = MessageFormat::Raw)]
        format: MessageFormat,
    },
    /// Send a plain-text message.
    Send {
        #[command(flatten)]
        token: TokenArgs,
        #[arg(long)]
        to: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        message: String,
    },
    /// Delete a message permanently.
    Delete {
        #[command(flatten)]
        token: TokenArgs,
        #[arg(long)]
        id: String,
    },
    /// Wait until a query matches at least one message.
    Wait {
        #[command(flatten)]
        token: TokenArgs,
        #[command(flatten)]
        query: QueryArgs,
        /// Seconds to keep polling.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

#[derive(Args, Debug)]
pub struct TokenArgs {
    /// Token file name; defaults to `<client id>-token`.
    #[arg(long)]
    pub token_name: Option<String>,

    /// Token directory; defaults to ./tokens/ or MAILWRIGHT_TOKEN_DIR.
    #[arg(long)]
    pub token_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Gmail search query.
    #[arg(long, short)]
    pub query: Option<String>,

    /// Label id filter, repeatable.
    #[arg(long = "label")]
    pub labels: Vec<String>,

    #[arg(long)]
    pub max_results: Option<u32>,
}

#[derive(Args, Debug)]
pub struct AuthorizeArgs {
    #[arg(long, env = "MAILWRIGHT_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "MAILWRIGHT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Scope to request, repeatable.
    #[arg(long = "scope")]
    pub scopes: Vec<String>,

    #[command(flatten)]
    pub token: TokenArgs,

    #[arg(long)]
    pub redirect_domain: Option<String>,

    #[arg(long)]
    pub redirect_port: Option<u16>,

    #[arg(long)]
    pub redirect_path: Option<String>,

    /// chromedriver binary launched for the login.
    #[arg(long, default_value = "chromedriver")]
    pub webdriver: PathBuf,

    /// Use an already running WebDriver server instead of launching one.
    #[arg(long)]
    pub webdriver_url: Option<String>,

    /// Chrome binary, when not on the default path.
    #[arg(long)]
    pub browser_binary: Option<PathBuf>,

    /// Show the browser window.
    #[arg(long)]
    pub headful: bool,

    /// Overall limit for the whole acquisition, in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

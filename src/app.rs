use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::authenticator::Authenticator;
use crate::browser::{DriverSource, WebDriverConfig};
use crate::cli::{AuthorizeArgs, Cli, Command, QueryArgs, TokenArgs};
use crate::config::{AuthDefaults, NewTokenOptions, RedirectOptions};
use crate::mailbox::{wait_for, ListQuery, MailClient};
use crate::types::{ClientIdentity, CredentialToken, Message, MessageRef, OutgoingMessage};

pub async fn run(cli: Cli) -> Result<()> {
    let identity = ClientIdentity::new(
        cli.client_id
            .context("--client-id or GOOGLE_CLIENT_ID is required")?,
        cli.client_secret
            .context("--client-secret or GOOGLE_CLIENT_SECRET is required")?,
    );

    match cli.command {
        Command::Authorize(args) => authorize(identity, args).await,
        Command::List { token, query } => {
            let gmail = connect(identity, &token).await?;
            let messages = gmail.list(&list_query(query)).await?;
            print_refs(&messages);
            Ok(())
        }
        Command::Get { token, id, format } => {
            let gmail = connect(identity, &token).await?;
            let message = gmail.get(&id, format).await?;
            print_message(&message);
            Ok(())
        }
        Command::Send {
            token,
            to,
            from,
            subject,
            message,
        } => {
            let gmail = connect(identity, &token).await?;
            let sent = gmail
                .send(&OutgoingMessage {
                    to,
                    from,
                    subject,
                    body: message,
                })
                .await?;
            println!("Sent message {}", sent.id);
            Ok(())
        }
        Command::Delete { token, id } => {
            let gmail = connect(identity, &token).await?;
            gmail.delete(&id).await?;
            println!("Deleted message {id}");
            Ok(())
        }
        Command::Wait {
            token,
            query,
            timeout,
        } => {
            let gmail = connect(identity, &token).await?;
            let messages = wait_for(&gmail, &list_query(query), timeout).await?;
            print_refs(&messages);
            Ok(())
        }
    }
}

async fn authorize(identity: ClientIdentity, args: AuthorizeArgs) -> Result<()> {
    let driver = match args.webdriver_url {
        Some(url) => DriverSource::Remote { url },
        None => DriverSource::Spawn {
            binary: args.webdriver,
            port: 0,
        },
    };
    let browser = WebDriverConfig {
        driver,
        headless: !args.headful,
        browser_binary: args.browser_binary,
        ..WebDriverConfig::default()
    };
    let authenticator = Authenticator::new(identity, browser)?;

    let options = NewTokenOptions {
        username: args.username,
        password: args.password,
        scope: args.scopes,
        redirect: RedirectOptions {
            protocol: None,
            domain: args.redirect_domain,
            port: args.redirect_port,
            path: args.redirect_path,
        },
        token_name: args.token.token_name,
        token_directory: args.token.token_dir,
        timeout: args.timeout_secs.map(Duration::from_secs),
    };

    let token = authenticator.authorize_with_new_token(options).await?;
    print!("{}", render_token(&token));
    Ok(())
}

/// Loads the stored token; mailbox calls refresh it as needed.
async fn connect(identity: ClientIdentity, args: &TokenArgs) -> Result<Authenticator> {
    let defaults = AuthDefaults::load();
    let name = args
        .token_name
        .clone()
        .unwrap_or_else(|| format!("{}-token", identity.client_id));
    let directory = args
        .token_dir
        .clone()
        .unwrap_or_else(|| defaults.token_directory.clone());

    let authenticator = Authenticator::new(identity, WebDriverConfig::default())?;
    authenticator
        .authorize_with_token_file(&name, &directory)
        .await
        .with_context(|| format!("no usable token {name} in {}; run `authorize` first", directory.display()))?;
    info!("Loaded stored token");
    Ok(authenticator)
}

fn list_query(args: QueryArgs) -> ListQuery {
    ListQuery {
        q: args.query,
        label_ids: args.labels,
        max_results: args.max_results,
        ..ListQuery::default()
    }
}

fn render_token(token: &CredentialToken) -> String {
    let mut out = String::from("Token acquired\n");
    out.push_str(&format!("   Scope: {}\n", token.scope));
    if let Some(expiry) = token.expiry_date.and_then(DateTime::<Utc>::from_timestamp_millis) {
        out.push_str(&format!("   Expires: {}\n", expiry.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    if token.refresh_token.is_none() {
        out.push_str("   No refresh token returned; re-authorize once the access token expires\n");
    }
    out
}

fn print_refs(messages: &[MessageRef]) {
    if messages.is_empty() {
        println!("No messages found");
        return;
    }
    for (i, message) in messages.iter().enumerate() {
        println!(
            "{}. {} (thread {})",
            i + 1,
            message.id,
            message.thread_id.as_deref().unwrap_or("-")
        );
    }
}

fn print_message(message: &Message) {
    print!("{}", render_message(message));
}

fn render_message(message: &Message) -> String {
    let rule = "=".repeat(80);
    let mut out = format!("\n{rule}\nMessage {}\n{rule}\n", message.id);

    let date = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    out.push_str(&format!("Date: {date}\n"));
    if let Some(from) = message.header("From") {
        out.push_str(&format!("From: {from}\n"));
    }
    if let Some(subject) = message.header("Subject") {
        out.push_str(&format!("Subject: {subject}\n"));
    }
    if !message.label_ids.is_empty() {
        out.push_str(&format!("Labels: {}\n", message.label_ids.join(", ")));
    }

    match (&message.raw, &message.snippet) {
        (Some(raw), _) => out.push_str(&format!("\n{raw}\n")),
        (None, Some(snippet)) => out.push_str(&format!("\n{snippet}\n")),
        (None, None) => {}
    }
    out
}

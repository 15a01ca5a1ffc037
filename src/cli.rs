//! CLI interface for the study companion client
//!
//! Command parsing, display formatting and the interactive loop that
//! interleaves stdin with live updates from the social graph.

use std::collections::HashSet;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::error::RecvError;

use crate::client::StudyClient;
use crate::error::{ClientError, Result};
use crate::models::{
    Command, Complaint, ComplaintStats, FriendRequestView, FriendView, GroupMessageView, RecordId,
    StudySessionView,
};
use crate::remote::{AuthService, DataService};
use crate::services::Collection;

pub const HELP: &[&str] = &[
    "/login <email> <password>            sign in",
    "/register <email> <password> <name>  create an account",
    "/logout                              sign out",
    "/friends                             list friends",
    "/requests                            list pending friend requests",
    "/add <email>                         send a friend request",
    "/accept <id> | /reject <id>          answer a friend request",
    "/remove <name|email|id>              remove a friend",
    "/status <studying|break|offline> [subject]",
    "/who                                 who is studying",
    "/feed                                recent group messages",
    "/stats | /complaints [all|pending|resolved] | /reply <id> <text>   admin",
    "/quit                                exit",
    "Anything else is sent to the group chat; @name mentions a friend.",
];

/// Parse a command from user input
pub fn parse_command(input: &str) -> Result<Command> {
    Command::parse(input).map_err(ClientError::InvalidInput)
}

/// Format a chat message for display
pub fn format_message(message: &GroupMessageView) -> String {
    let marker = if message.mentions_me { "*" } else { " " };
    format!(
        "{}[{}] <{}> {}",
        marker,
        message.created_at.format("%H:%M"),
        message.author,
        message.message
    )
}

pub fn format_friend(friend: &FriendView) -> String {
    match &friend.email {
        Some(email) => format!("{} <{}> (since {})", friend.name, email, friend.since.format("%Y-%m-%d")),
        None => format!("{} (since {})", friend.name, friend.since.format("%Y-%m-%d")),
    }
}

pub fn format_request(request: &FriendRequestView) -> String {
    let email = request
        .other_email
        .as_deref()
        .map(|e| format!(" <{}>", e))
        .unwrap_or_default();
    format!("{} {}{} ({})", request.id, request.other_name, email, request.created_at.format("%Y-%m-%d"))
}

pub fn format_session(session: &StudySessionView) -> String {
    let who = if session.is_self {
        format!("{} (you)", session.name)
    } else {
        session.name.clone()
    };
    match &session.subject {
        Some(subject) => format!("{} - {}: {}", who, session.status, subject),
        None => format!("{} - {}", who, session.status),
    }
}

pub fn format_complaint(complaint: &Complaint) -> String {
    let status = if complaint.is_resolved() { "resolved" } else { "pending" };
    format!(
        "{} [{}/{}] {} - {} ({})",
        complaint.id,
        status,
        complaint.priority,
        complaint.subject,
        complaint.email,
        complaint.created_at.format("%Y-%m-%d %H:%M")
    )
}

pub fn format_stats(stats: &ComplaintStats) -> String {
    format!(
        "complaints: {} total, {} pending ({} urgent), {} resolved; users: {}",
        stats.total, stats.pending, stats.urgent_pending, stats.resolved, stats.users
    )
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Next line from stdin, `None` at EOF.
///
/// `next_line` keeps partial input across cancellation, so this is safe to
/// race against other events in `select!`.
pub async fn read_line_async(lines: &mut Lines<BufReader<Stdin>>) -> Result<Option<String>> {
    let line = lines.next_line().await?;
    Ok(line.map(|l| l.trim_end_matches('\r').to_string()))
}

/// Interactive loop: run commands from stdin and print feed messages and
/// request notices as they arrive.
pub async fn run_client_loop<A: AuthService, D: DataService>(client: &StudyClient<A, D>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut updates = client.social().updates();

    let mut seen: Option<HashSet<RecordId>> = None;
    let mut incoming = 0;

    match client.identity() {
        Some(identity) => println!("Signed in as {}", identity.email),
        None => println!("Not signed in. Use /login or /register."),
    }
    println!("Type /help for commands.");
    prompt();

    loop {
        tokio::select! {
            line = read_line_async(&mut lines) => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    prompt();
                    continue;
                }

                match parse_command(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => match client.execute(command).await {
                        Ok(output) => output.iter().for_each(|l| println!("{}", l)),
                        Err(e) => {
                            log::debug!("Command failed: {}", e);
                            println!("! {}", e.user_message());
                        }
                    },
                    Err(e) => println!("! {}", e.user_message()),
                }
                prompt();
            }
            update = updates.recv() => {
                match update {
                    Ok(Collection::GroupMessages) => {
                        let messages = client.social().group_messages().await;
                        // The backlog from the first load is available through /feed.
                        let backlog = seen.is_none();
                        let known = seen.get_or_insert_with(HashSet::new);
                        let fresh: Vec<_> = messages
                            .iter()
                            .filter(|m| known.insert(m.id) && !m.is_own && !backlog)
                            .collect();
                        if !fresh.is_empty() {
                            println!();
                            fresh.iter().for_each(|m| println!("{}", format_message(m)));
                            prompt();
                        }
                    }
                    Ok(Collection::Requests) => {
                        let count = client.social().incoming_requests().await.len();
                        if count > incoming {
                            println!();
                            println!("You have {} pending friend request(s). Type /requests to see them.", count);
                            prompt();
                        }
                        incoming = count;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("Skipped {} update notifications", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    println!("Goodbye!");
    Ok(())
}

/// Commands understood by the terminal client.

use super::{ComplaintFilter, RecordId, StudyStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Login { email: String, password: String },
    Register { email: String, password: String, name: String },
    Logout,
    Friends,
    Requests,
    Add(String),
    Accept(RecordId),
    Reject(RecordId),
    /// Friend to remove, by name, email or id.
    Remove(String),
    Status { status: StudyStatus, subject: Option<String> },
    Who,
    Feed,
    Stats,
    Complaints(ComplaintFilter),
    Reply { id: RecordId, text: String },
    Help,
    Message(String),
    Quit,
}

impl Command {
    /// Parse a command string
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();

        if !input.starts_with('/') {
            if input.is_empty() {
                return Err("Nothing to send".to_string());
            }
            return Ok(Command::Message(input.to_string()));
        }

        let (name, rest) = match input.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (input, ""),
        };

        match name {
            "/quit" | "/exit" => Ok(Command::Quit),
            "/help" => Ok(Command::Help),
            "/logout" => Ok(Command::Logout),
            "/friends" => Ok(Command::Friends),
            "/requests" => Ok(Command::Requests),
            "/who" => Ok(Command::Who),
            "/feed" => Ok(Command::Feed),
            "/stats" => Ok(Command::Stats),
            "/login" => {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(email), Some(password), None) => Ok(Command::Login {
                        email: email.to_string(),
                        password: password.to_string(),
                    }),
                    _ => Err("Usage: /login <email> <password>".to_string()),
                }
            }
            "/register" => {
                let mut parts = rest.splitn(3, char::is_whitespace);
                match (parts.next(), parts.next(), parts.next().map(str::trim)) {
                    (Some(email), Some(password), Some(name))
                        if !email.is_empty() && !name.is_empty() =>
                    {
                        Ok(Command::Register {
                            email: email.to_string(),
                            password: password.to_string(),
                            name: name.to_string(),
                        })
                    }
                    _ => Err("Usage: /register <email> <password> <full name>".to_string()),
                }
            }
            "/add" => {
                if rest.is_empty() || rest.contains(char::is_whitespace) {
                    return Err("Usage: /add <email>".to_string());
                }
                Ok(Command::Add(rest.to_string()))
            }
            "/accept" => RecordId::parse(rest)
                .map(Command::Accept)
                .map_err(|_| "Usage: /accept <request id>".to_string()),
            "/reject" => RecordId::parse(rest)
                .map(Command::Reject)
                .map_err(|_| "Usage: /reject <request id>".to_string()),
            "/remove" => {
                if rest.is_empty() {
                    return Err("Usage: /remove <friend name, email or id>".to_string());
                }
                Ok(Command::Remove(rest.to_string()))
            }
            "/status" => {
                let (status, subject) = match rest.split_once(char::is_whitespace) {
                    Some((status, subject)) => (status, Some(subject.trim().to_string())),
                    None => (rest, None),
                };
                let status = status
                    .parse::<StudyStatus>()
                    .map_err(|_| "Usage: /status <studying|break|offline> [subject]".to_string())?;
                Ok(Command::Status {
                    status,
                    subject: subject.filter(|s| !s.is_empty()),
                })
            }
            "/complaints" => rest
                .parse::<ComplaintFilter>()
                .map(Command::Complaints)
                .map_err(|e| e.to_string()),
            "/reply" => {
                let usage = || "Usage: /reply <complaint id> <text>".to_string();
                let (id, text) = rest.split_once(char::is_whitespace).ok_or_else(usage)?;
                let id = RecordId::parse(id).map_err(|_| usage())?;
                let text = text.trim();
                if text.is_empty() {
                    return Err(usage());
                }
                Ok(Command::Reply {
                    id,
                    text: text.to_string(),
                })
            }
            other => Err(format!("Unknown command: {}", other)),
        }
    }
}

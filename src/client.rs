/// Study companion client.
/// Wires the session manager, social graph and admin console together and
/// executes terminal commands against them.

use std::sync::Arc;

use crate::cli::{
    format_complaint, format_friend, format_message, format_request, format_session, format_stats,
    HELP,
};
use crate::error::{ClientError, Result};
use crate::models::{Command, Identity, UserId};
use crate::remote::{AuthService, DataService};
use crate::services::{AdminConsole, AuthSessionManager, SocialGraph};

pub struct StudyClient<A: AuthService, D: DataService> {
    session: AuthSessionManager<A, D>,
    social: Arc<SocialGraph<D>>,
    admin: AdminConsole<D>,
}

impl<A: AuthService, D: DataService> StudyClient<A, D> {
    pub fn new(auth: Arc<A>, data: Arc<D>, admins: Vec<String>) -> Self {
        let session = AuthSessionManager::new(auth, Arc::clone(&data));
        let social = Arc::new(SocialGraph::new(Arc::clone(&data), session.handle()));
        let admin = AdminConsole::new(data, session.handle(), admins);

        StudyClient {
            session,
            social,
            admin,
        }
    }

    /// Resume any stored session and start following identity changes.
    pub async fn initialize(&self) -> Option<Identity> {
        let identity = self.session.initialize().await;
        self.social.follow_session();
        identity
    }

    pub fn identity(&self) -> Option<Identity> {
        self.session.current()
    }

    pub fn social(&self) -> &Arc<SocialGraph<D>> {
        &self.social
    }

    pub fn admin(&self) -> &AdminConsole<D> {
        &self.admin
    }

    pub fn session(&self) -> &AuthSessionManager<A, D> {
        &self.session
    }

    /// Friends named by `@tokens` in a chat message.
    async fn resolve_mentions(&self, text: &str) -> Vec<UserId> {
        let mut mentions = Vec::new();
        for token in text.split_whitespace().filter(|t| t.starts_with('@')) {
            let token = token.trim_end_matches(|c: char| !c.is_alphanumeric());
            if let Some(friend) = self.social.find_friend(token).await {
                mentions.push(friend.friend_id);
            }
        }
        mentions
    }

    /// Run one command and return the lines to show.
    pub async fn execute(&self, command: Command) -> Result<Vec<String>> {
        let lines = match command {
            Command::Login { email, password } => {
                if self.session.login(&email, &password).await {
                    vec![format!("Signed in as {}", email.trim())]
                } else {
                    vec!["Login failed. Check your email and password.".to_string()]
                }
            }
            Command::Register {
                email,
                password,
                name,
            } => {
                let identity = self.session.register(&name, &email, &password, None, None).await?;
                vec![format!("Welcome, {}! Your account is ready.", identity.name)]
            }
            Command::Logout => {
                self.session.logout().await?;
                vec!["Signed out.".to_string()]
            }
            Command::Friends => {
                let friends = self.social.friends().await;
                if friends.is_empty() {
                    vec!["No friends yet. Use /add <email> to send a request.".to_string()]
                } else {
                    friends.iter().map(format_friend).collect()
                }
            }
            Command::Requests => {
                let incoming = self.social.incoming_requests().await;
                let outgoing = self.social.outgoing_requests().await;
                let mut lines = Vec::new();
                if incoming.is_empty() {
                    lines.push("No incoming friend requests.".to_string());
                } else {
                    lines.push("Incoming:".to_string());
                    lines.extend(incoming.iter().map(format_request));
                }
                if !outgoing.is_empty() {
                    lines.push("Sent:".to_string());
                    lines.extend(outgoing.iter().map(format_request));
                }
                lines
            }
            Command::Add(email) => {
                self.social.send_friend_request(&email).await?;
                vec![format!("Friend request sent to {}", email.trim())]
            }
            Command::Accept(id) => {
                self.social.accept_friend_request(id).await?;
                vec!["Friend request accepted.".to_string()]
            }
            Command::Reject(id) => {
                self.social.reject_friend_request(id).await?;
                vec!["Friend request rejected.".to_string()]
            }
            Command::Remove(target) => {
                let (friend_id, name) = match self.social.find_friend(&target).await {
                    Some(friend) => (friend.friend_id, friend.name),
                    None => match UserId::parse(&target) {
                        Ok(id) => (id, id.short()),
                        Err(_) => {
                            return Err(ClientError::InvalidInput(format!(
                                "No friend matches '{}'",
                                target
                            )))
                        }
                    },
                };
                self.social.remove_friend(friend_id).await?;
                vec![format!("Removed {} from your friends.", name)]
            }
            Command::Status { status, subject } => {
                self.social.update_study_status(status, subject).await?;
                vec![format!("Status set to {}.", status)]
            }
            Command::Who => {
                let sessions = self.social.study_sessions().await;
                if sessions.is_empty() {
                    vec!["Nobody is studying right now.".to_string()]
                } else {
                    sessions.iter().map(format_session).collect()
                }
            }
            Command::Feed => {
                let messages = self.social.group_messages().await;
                if messages.is_empty() {
                    vec!["No messages yet.".to_string()]
                } else {
                    messages.iter().map(format_message).collect()
                }
            }
            Command::Stats => {
                let stats = self.admin.load_stats().await?;
                vec![format_stats(&stats)]
            }
            Command::Complaints(filter) => {
                let complaints = self.admin.load_complaints(filter).await?;
                if complaints.is_empty() {
                    vec!["No complaints.".to_string()]
                } else {
                    complaints.iter().map(format_complaint).collect()
                }
            }
            Command::Reply { id, text } => {
                let complaint = self.admin.reply(id, &text).await?;
                vec![format!("Replied to \"{}\"; complaint resolved.", complaint.subject)]
            }
            Command::Help => HELP.iter().map(|l| l.to_string()).collect(),
            Command::Message(text) => {
                let mentions = self.resolve_mentions(&text).await;
                self.social.send_group_message(&text, mentions).await?;
                Vec::new()
            }
            Command::Quit => Vec::new(),
        };

        Ok(lines)
    }

    pub fn shutdown(&self) {
        self.social.shutdown();
        self.session.shutdown();
    }
}

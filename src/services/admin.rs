/// Admin complaint triage.
/// Access is limited to an allow-list of admin emails. Listing and counters
/// degrade to empty on failure; replying surfaces its errors.

use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::directory::UserDirectory;
use super::session::SessionHandle;
use crate::error::{ClientError, Result};
use crate::models::{
    decode_rows, Complaint, ComplaintFilter, ComplaintPriority, ComplaintStats, ComplaintStatus,
    Identity, NewComplaint, RecordId,
};
use crate::remote::{DataService, Filter, Query, Table};

#[derive(Debug, Clone, Default)]
struct AdminState {
    stats: ComplaintStats,
    complaints: Vec<Complaint>,
    filter: ComplaintFilter,
}

pub struct AdminConsole<D: DataService> {
    data: Arc<D>,
    directory: UserDirectory<D>,
    session: SessionHandle,
    admins: HashSet<String>,
    state: Mutex<AdminState>,
}

impl<D: DataService> AdminConsole<D> {
    pub fn new(data: Arc<D>, session: SessionHandle, admins: impl IntoIterator<Item = String>) -> Self {
        AdminConsole {
            directory: UserDirectory::new(Arc::clone(&data)),
            data,
            session,
            admins: admins
                .into_iter()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            state: Mutex::new(AdminState::default()),
        }
    }

    /// Whether the signed-in user is on the admin list.
    pub fn is_admin(&self) -> bool {
        self.session
            .current()
            .is_some_and(|me| self.admins.contains(&me.email.to_lowercase()))
    }

    fn require_admin(&self) -> Result<Identity> {
        let me = self.session.require()?;
        if self.admins.contains(&me.email.to_lowercase()) {
            Ok(me)
        } else {
            Err(ClientError::NotAdmin)
        }
    }

    pub async fn stats(&self) -> ComplaintStats {
        self.state.lock().await.stats
    }

    pub async fn complaints(&self) -> Vec<Complaint> {
        self.state.lock().await.complaints.clone()
    }

    pub async fn filter(&self) -> ComplaintFilter {
        self.state.lock().await.filter
    }

    async fn fetch_stats(&self) -> Result<ComplaintStats> {
        let rows = self
            .data
            .select(Table::Complaints, Query::new().columns("status,priority"))
            .await?;

        let mut stats = ComplaintStats {
            total: rows.len(),
            ..Default::default()
        };
        for row in &rows {
            let status: Option<ComplaintStatus> = row
                .get("status")
                .and_then(|v| serde_json::from_value(v.clone()).ok());
            let priority: Option<ComplaintPriority> = row
                .get("priority")
                .and_then(|v| serde_json::from_value(v.clone()).ok());

            match status {
                Some(ComplaintStatus::Pending) => {
                    stats.pending += 1;
                    if priority == Some(ComplaintPriority::Urgent) {
                        stats.urgent_pending += 1;
                    }
                }
                Some(ComplaintStatus::Resolved) => stats.resolved += 1,
                None => {}
            }
        }

        stats.users = self.directory.count().await?;
        Ok(stats)
    }

    /// Refresh the dashboard counters. Only the admin check can fail.
    pub async fn load_stats(&self) -> Result<ComplaintStats> {
        self.require_admin()?;

        let stats = match self.fetch_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                log::error!("Failed to load complaint stats: {}", e);
                ComplaintStats::default()
            }
        };

        self.state.lock().await.stats = stats;
        Ok(stats)
    }

    async fn fetch_complaints(&self, filter: ComplaintFilter) -> Result<Vec<Complaint>> {
        let mut query = Query::new().order_by("created_at", false);
        if let Some(status) = filter.status() {
            query = query.filter(Filter::eq("status", status.as_str()));
        }

        let rows = self.data.select(Table::Complaints, query).await?;
        decode_rows(rows)
    }

    /// Refresh the complaint list, newest first. Only the admin check can
    /// fail.
    pub async fn load_complaints(&self, filter: ComplaintFilter) -> Result<Vec<Complaint>> {
        self.require_admin()?;

        let complaints = match self.fetch_complaints(filter).await {
            Ok(complaints) => complaints,
            Err(e) => {
                log::error!("Failed to load complaints: {}", e);
                Vec::new()
            }
        };

        let mut state = self.state.lock().await;
        state.filter = filter;
        state.complaints = complaints.clone();
        Ok(complaints)
    }

    /// Resolve a pending complaint with a reply. The status change and the
    /// reply fields are written together, and only if the complaint is still
    /// pending.
    pub async fn reply(&self, id: RecordId, text: &str) -> Result<Complaint> {
        let admin = self.require_admin()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::InvalidInput("Reply cannot be empty".to_string()));
        }

        let patch = json!({
            "status": ComplaintStatus::Resolved,
            "admin_reply": text,
            "replied_at": Utc::now().to_rfc3339(),
            "replied_by": admin.email,
        });
        let updated = self
            .data
            .update(
                Table::Complaints,
                patch,
                Filter::eq("id", id).and(Filter::eq("status", ComplaintStatus::Pending.as_str())),
            )
            .await?;

        let Some(row) = updated.into_iter().next() else {
            let existing = self
                .data
                .select(
                    Table::Complaints,
                    Query::new().columns("id").filter(Filter::eq("id", id)).limit(1),
                )
                .await?;
            return Err(if existing.is_empty() {
                ClientError::NotFound(format!("complaint {}", id))
            } else {
                ClientError::AlreadyResolved(id.to_string())
            });
        };
        let complaint: Complaint = serde_json::from_value(row)?;

        log::info!("Complaint {} resolved by {}", id, admin.email);

        let filter = self.filter().await;
        self.load_complaints(filter).await?;
        self.load_stats().await?;
        Ok(complaint)
    }
}

/// Contact form submission. Needs no sign-in.
pub async fn submit_complaint<D: DataService>(data: &D, complaint: NewComplaint) -> Result<Complaint> {
    if !complaint.email.contains('@') {
        return Err(ClientError::InvalidInput(format!(
            "'{}' is not a valid email address",
            complaint.email
        )));
    }
    if complaint.subject.is_empty() {
        return Err(ClientError::InvalidInput("Subject is required".to_string()));
    }
    if complaint.message.is_empty() {
        return Err(ClientError::InvalidInput("Message is required".to_string()));
    }

    let row = serde_json::to_value(&complaint)?;
    let stored = data.insert(Table::Complaints, vec![row]).await?;
    let complaint = decode_rows::<Complaint>(stored)?
        .into_iter()
        .next()
        .ok_or_else(|| ClientError::Server("complaint insert returned no row".to_string()))?;

    log::info!("Complaint {} submitted ({})", complaint.id, complaint.priority);
    Ok(complaint)
}

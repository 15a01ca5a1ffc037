/// Batched user lookups for the views.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::Result;
use crate::models::{decode_rows, display_name, UserId, UserProfile};
use crate::remote::{DataService, Filter, Query, Table};

pub type UserMap = HashMap<UserId, UserProfile>;

pub struct UserDirectory<D: DataService> {
    data: Arc<D>,
}

impl<D: DataService> Clone for UserDirectory<D> {
    fn clone(&self) -> Self {
        UserDirectory {
            data: Arc::clone(&self.data),
        }
    }
}

impl<D: DataService> UserDirectory<D> {
    pub fn new(data: Arc<D>) -> Self {
        UserDirectory { data }
    }

    /// Profiles for a set of ids in one query. Duplicates are collapsed and an
    /// empty set never reaches the backend.
    pub async fn lookup(&self, ids: impl IntoIterator<Item = UserId>) -> Result<UserMap> {
        let ids: BTreeSet<UserId> = ids.into_iter().collect();
        if ids.is_empty() {
            return Ok(UserMap::new());
        }

        let rows = self
            .data
            .select(
                Table::Users,
                Query::new()
                    .columns("id,name,email")
                    .filter(Filter::in_list("id", ids)),
            )
            .await?;

        let profiles: Vec<UserProfile> = decode_rows(rows)?;
        Ok(profiles.into_iter().map(|p| (p.id, p)).collect())
    }

    /// Profile registered under `email`. Profile emails are stored
    /// lowercased, so the lookup ignores case and surrounding whitespace.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserProfile>> {
        let email = email.trim().to_lowercase();
        let rows = self
            .data
            .select(
                Table::Users,
                Query::new().filter(Filter::eq("email", email)).limit(1),
            )
            .await?;

        Ok(decode_rows::<UserProfile>(rows)?.into_iter().next())
    }

    /// Number of registered profiles.
    pub async fn count(&self) -> Result<usize> {
        let rows = self
            .data
            .select(Table::Users, Query::new().columns("id"))
            .await?;
        Ok(rows.len())
    }
}

/// Display name for `id`, falling back to a placeholder when the profile is
/// missing from `users`.
pub fn name_for(users: &UserMap, id: &UserId) -> String {
    match users.get(id) {
        Some(profile) => profile.display_name(),
        None => display_name(None, None, id),
    }
}

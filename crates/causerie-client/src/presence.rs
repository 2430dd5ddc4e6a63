//! Who else is in the chat, as last reported by the broker.

use std::collections::BTreeSet;

use tracing::debug;

use causerie_shared::UserId;

#[derive(Debug)]
pub struct PresenceTracker {
    local_user: UserId,
    members: BTreeSet<UserId>,
}

impl PresenceTracker {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            members: BTreeSet::new(),
        }
    }

    /// Replace the member set from a comma-separated snapshot. The local
    /// user and blank entries are left out.
    pub fn update(&mut self, raw: &str) -> &BTreeSet<UserId> {
        self.members = raw
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty() && *name != self.local_user.as_str())
            .map(UserId::from)
            .collect();
        debug!(count = self.members.len(), "Presence updated");
        &self.members
    }

    pub fn members(&self) -> &BTreeSet<UserId> {
        &self.members
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}

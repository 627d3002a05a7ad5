//! Contact list built from the server's history and presence snapshots.

use std::{cmp::Ordering, collections::HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{LocalIdentity, UserId},
    protocol::ContactSummary,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: UserId,
    pub email: String,
    pub username: String,
    pub online: bool,
    pub unread_count: u32,
    pub latest_timestamp: Option<DateTime<Utc>>,
}

impl Contact {
    /// Email when known, otherwise the username, otherwise the raw id.
    pub fn display_name(&self) -> &str {
        if !self.email.is_empty() {
            &self.email
        } else if !self.username.is_empty() {
            &self.username
        } else {
            self.user_id.as_str()
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SnapshotKind {
    History,
    Presence,
}

impl SnapshotKind {
    fn label(self) -> &'static str {
        match self {
            SnapshotKind::History => "history",
            SnapshotKind::Presence => "presence",
        }
    }
}

fn summary_identity(summary: &ContactSummary, kind: SnapshotKind) -> Option<UserId> {
    match &summary.user_id {
        Some(user_id) if !user_id.is_blank() => Some(user_id.clone()),
        _ => {
            warn!(
                snapshot = kind.label(),
                email = %summary.email,
                "roster: dropping contact summary without user id"
            );
            None
        }
    }
}

fn overlay_presence(existing: &mut Contact, summary: &ContactSummary) {
    if !summary.email.is_empty() {
        existing.email = summary.email.clone();
    }
    if !summary.username.is_empty() {
        existing.username = summary.username.clone();
    }
    if let Some(unread_count) = summary.unread_count {
        existing.unread_count = unread_count;
    }
    if let Some(latest) = summary.latest_timestamp {
        if existing.latest_timestamp.map_or(true, |known| latest > known) {
            existing.latest_timestamp = Some(latest);
        }
    }
    existing.online = true;
}

fn recency_order(a: &Contact, b: &Contact) -> Ordering {
    match (a.latest_timestamp, b.latest_timestamp) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Merges the two snapshots into an ordered, de-duplicated contact list.
///
/// Contacts with a last-message time come first, newest first; the rest keep
/// the order in which they were first seen. The local user is never listed.
pub fn merge_contacts(
    history: &[ContactSummary],
    presence: &[ContactSummary],
    local: &LocalIdentity,
) -> Vec<Contact> {
    let mut contacts: Vec<Contact> = Vec::with_capacity(history.len() + presence.len());
    let mut slots: HashMap<UserId, usize> = HashMap::new();

    for summary in history {
        let Some(user_id) = summary_identity(summary, SnapshotKind::History) else {
            continue;
        };
        if local.is(&user_id) {
            debug!(user_id = %user_id, "roster: skipping local user in history snapshot");
            continue;
        }
        let contact = Contact {
            user_id: user_id.clone(),
            email: summary.email.clone(),
            username: summary.username.clone(),
            online: false,
            unread_count: summary.unread_count.unwrap_or(0),
            latest_timestamp: summary.latest_timestamp,
        };
        match slots.get(&user_id) {
            Some(&slot) => contacts[slot] = contact,
            None => {
                slots.insert(user_id, contacts.len());
                contacts.push(contact);
            }
        }
    }

    for summary in presence {
        let Some(user_id) = summary_identity(summary, SnapshotKind::Presence) else {
            continue;
        };
        if local.is(&user_id) {
            continue;
        }
        match slots.get(&user_id) {
            Some(&slot) => overlay_presence(&mut contacts[slot], summary),
            None => {
                slots.insert(user_id.clone(), contacts.len());
                contacts.push(Contact {
                    user_id,
                    email: summary.email.clone(),
                    username: summary.username.clone(),
                    online: true,
                    unread_count: 0,
                    latest_timestamp: summary.latest_timestamp,
                });
            }
        }
    }

    contacts.sort_by(recency_order);
    contacts
}

/// Latest snapshot pair plus the merged view derived from it.
#[derive(Debug, Clone)]
pub struct Roster {
    local: LocalIdentity,
    history: Vec<ContactSummary>,
    presence: Vec<ContactSummary>,
    contacts: Vec<Contact>,
}

impl Roster {
    pub fn new(local: LocalIdentity) -> Self {
        Self {
            local,
            history: Vec::new(),
            presence: Vec::new(),
            contacts: Vec::new(),
        }
    }

    pub fn local_identity(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn apply_history(&mut self, users: Vec<ContactSummary>) -> &[Contact] {
        self.history = users;
        self.remerge()
    }

    pub fn apply_presence(&mut self, users: Vec<ContactSummary>) -> &[Contact] {
        self.presence = users;
        self.remerge()
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn find(&self, user_id: &UserId) -> Option<&Contact> {
        self.contacts.iter().find(|contact| &contact.user_id == user_id)
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.presence.clear();
        self.contacts.clear();
    }

    fn remerge(&mut self) -> &[Contact] {
        self.contacts = merge_contacts(&self.history, &self.presence, &self.local);
        debug!(
            contacts = self.contacts.len(),
            online = self.contacts.iter().filter(|c| c.online).count(),
            "roster: merged snapshots"
        );
        &self.contacts
    }
}

#[cfg(test)]
#[path = "tests/roster_tests.rs"]
mod tests;

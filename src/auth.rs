//! Role resolution from the configured allow and admin lists
//!
//! Admins can change the allow-list at runtime; changes live as long as the
//! process does.

use crate::session::Role;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

#[derive(Debug)]
pub struct AccessPolicy {
    /// No allow-list was configured: everyone is a user
    open: bool,
    allowed: RwLock<HashSet<String>>,
    admins: HashSet<String>,
}

impl AccessPolicy {
    pub fn new(allowed: HashSet<String>, admins: HashSet<String>) -> Self {
        Self {
            open: allowed.is_empty(),
            allowed: RwLock::new(allowed),
            admins,
        }
    }

    /// Role for `user_id`. A transport hint can lower the role, never raise it.
    pub fn resolve(&self, user_id: &str, hint: Option<Role>) -> Role {
        let granted = if self.admins.contains(user_id) {
            Role::Admin
        } else if self.open || self.read().contains(user_id) {
            Role::User
        } else {
            Role::Guest
        };

        match (granted, hint) {
            (Role::Guest, _) | (_, Some(Role::Guest)) => Role::Guest,
            (Role::Admin, Some(Role::User)) => Role::User,
            (granted, _) => granted,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Add `user_id` to the allow-list. False if it was already there.
    pub fn grant(&self, user_id: &str) -> bool {
        self.allowed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string())
    }

    /// Remove `user_id` from the allow-list. Admins cannot be removed.
    pub fn revoke(&self, user_id: &str) -> bool {
        if self.admins.contains(user_id) {
            return false;
        }
        self.allowed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id)
    }

    /// Allow-listed users and admins, sorted by id
    pub fn members(&self) -> Vec<(String, Role)> {
        let allowed = self.read();
        let mut members: Vec<(String, Role)> = allowed
            .iter()
            .filter(|id| !self.admins.contains(*id))
            .map(|id| (id.clone(), Role::User))
            .chain(self.admins.iter().map(|id| (id.clone(), Role::Admin)))
            .collect();
        members.sort_by(|a, b| a.0.cmp(&b.0));
        members
    }

    fn read(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        self.allowed.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::new(HashSet::new(), HashSet::new())
    }
}

impl Clone for AccessPolicy {
    fn clone(&self) -> Self {
        Self {
            open: self.open,
            allowed: RwLock::new(self.read().clone()),
            admins: self.admins.clone(),
        }
    }
}

//! Known members, keyed by identity token.
//!
//! Liveness is measured only on the local clock: each entry stores the
//! local instant its last heartbeat arrived. Remote timestamps are never
//! compared.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::membership::heartbeat::Heartbeat;
use crate::membership::member::{Member, MemberId};

/// What a received heartbeat changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    /// First heartbeat from this member.
    Added(Member),
    /// Known member, liveness refreshed.
    Refreshed,
    /// Leave notice from a known member.
    Left(Member),
    /// Our own heartbeat, or a leave notice for an unknown member.
    Ignored,
}

#[derive(Debug, Clone)]
struct Entry {
    member: Member,
    last_heard: Instant,
}

/// Concurrent membership table.
#[derive(Debug)]
pub struct MembershipTable {
    local_id: MemberId,
    members: DashMap<MemberId, Entry>,
    expiration: Duration,
}

impl MembershipTable {
    pub fn new(local_id: MemberId, expiration: Duration) -> Self {
        Self {
            local_id,
            members: DashMap::new(),
            expiration,
        }
    }

    pub fn local_id(&self) -> MemberId {
        self.local_id
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Apply a received heartbeat at local time `now`.
    pub fn observe(&self, heartbeat: Heartbeat, now: Instant) -> Observed {
        let Heartbeat { member, alive, .. } = heartbeat;
        if member.id == self.local_id {
            return Observed::Ignored;
        }
        if !alive {
            return match self.members.remove(&member.id) {
                Some((_, entry)) => Observed::Left(entry.member),
                None => Observed::Ignored,
            };
        }

        match self.members.entry(member.id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                // Address, ports and payload may change; identity does not.
                entry.member = member;
                entry.last_heard = now;
                Observed::Refreshed
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry {
                    member: member.clone(),
                    last_heard: now,
                });
                Observed::Added(member)
            }
        }
    }

    /// Remove every member silent for longer than the expiration.
    ///
    /// Each evicted member is returned by exactly one call.
    pub fn expire(&self, now: Instant) -> Vec<Member> {
        let stale: Vec<MemberId> = self
            .members
            .iter()
            .filter(|entry| self.is_stale(entry.value(), now))
            .map(|entry| *entry.key())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                self.members
                    .remove_if(&id, |_, entry| self.is_stale(entry, now))
                    .map(|(_, entry)| entry.member)
            })
            .collect()
    }

    fn is_stale(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_heard) > self.expiration
    }

    pub fn remove(&self, id: &MemberId) -> Option<Member> {
        self.members.remove(id).map(|(_, entry)| entry.member)
    }

    pub fn get(&self, id: &MemberId) -> Option<Member> {
        self.members.get(id).map(|entry| entry.member.clone())
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    /// Snapshot of all live members, excluding the local one.
    pub fn members(&self) -> Vec<Member> {
        self.members
            .iter()
            .map(|entry| entry.value().member.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

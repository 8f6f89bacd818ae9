//! Per-address registry of open links.

use rustc_hash::FxHashMap;

use crate::engine::LinkId;
use crate::frame::Role;

#[derive(Default)]
pub(crate) struct LinkRegistry {
    senders: FxHashMap<String, LinkId>,
    receivers: FxHashMap<String, LinkId>,
}

impl LinkRegistry {
    pub(crate) fn sender(&self, address: &str) -> Option<LinkId> {
        self.senders.get(address).copied()
    }

    pub(crate) fn insert_sender(&mut self, address: &str, link: LinkId) {
        self.senders.insert(address.to_owned(), link);
    }

    pub(crate) fn insert_receiver(&mut self, address: &str, link: LinkId) {
        self.receivers.insert(address.to_owned(), link);
    }

    /// Drop the registry entry for a finalized link, guarding against a
    /// newer link having taken the address over
    pub(crate) fn remove(&mut self, role: Role, address: &str, link: LinkId) {
        let map = match role {
            Role::Sender => &mut self.senders,
            Role::Receiver => &mut self.receivers,
        };
        if map.get(address) == Some(&link) {
            map.remove(address);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.senders.clear();
        self.receivers.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.senders.is_empty() && self.receivers.is_empty()
    }
}

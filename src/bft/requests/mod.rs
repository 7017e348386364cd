//! Bookkeeping of client requests as they travel from ingress to
//! garbage collection.
//!
//! A request is *finalized* once `f + 1` validators have propagated
//! the same digest, which guarantees at least one correct node has
//! seen the original request. Only finalized requests may enter a
//! batch. Entries stay around after ordering so duplicate deliveries
//! can be answered from the same reply, and are freed when a stable
//! checkpoint covers them.

use crate::bft::collections::{self, HashMap, HashSet};
use crate::bft::crypto::hash::Digest;
use crate::bft::message::{Request, RequestKey};
use crate::bft::registry::NodeId;

/// The lifecycle phase of a tracked request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RequestPhase {
    /// Received, propagation quorum not reached yet.
    Propagating,
    /// Propagated by a weak quorum; may be batched.
    Finalized,
    /// Ordered and committed to a ledger.
    Executed,
}

struct RequestEntry {
    request: Request,
    phase: RequestPhase,
    propagated_by: HashSet<NodeId>,
    // client connection to send the reply to, if the request
    // arrived on this node
    client: Option<String>,
}

/// Stores every request the node currently knows about, keyed by
/// digest.
pub struct RequestStore {
    entries: HashMap<Digest, RequestEntry>,
    by_key: HashMap<RequestKey, Digest>,
}

impl RequestStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entries: collections::hash_map(),
            by_key: collections::hash_map(),
        }
    }

    /// Record a request received directly from a client, remembering
    /// the connection to reply on.
    pub fn add_client_request(&mut self, request: Request, client: Option<String>) -> Digest {
        let digest = request.digest();
        let entry = self.entry_mut(request);
        if client.is_some() {
            entry.client = client;
        }
        digest
    }

    /// Record a PROPAGATE for a request, counting its sender towards
    /// finalization.
    ///
    /// Returns `true` if this propagation reached the weak quorum,
    /// finalizing the request.
    pub fn add_propagate(
        &mut self,
        request: Request,
        from: NodeId,
        weak_quorum: usize,
    ) -> bool {
        let entry = self.entry_mut(request);
        entry.propagated_by.insert(from);
        if entry.phase == RequestPhase::Propagating && entry.propagated_by.len() >= weak_quorum {
            entry.phase = RequestPhase::Finalized;
            true
        } else {
            false
        }
    }

    /// Whether the given node already propagated this request.
    pub fn has_propagated(&self, digest: &Digest, node: NodeId) -> bool {
        self.entries
            .get(digest)
            .map(|e| e.propagated_by.contains(&node))
            .unwrap_or(false)
    }

    /// Whether the given digest refers to a finalized request.
    pub fn is_finalized(&self, digest: &Digest) -> bool {
        self.entries
            .get(digest)
            .map(|e| e.phase != RequestPhase::Propagating)
            .unwrap_or(false)
    }

    /// Looks up a request by digest.
    pub fn get(&self, digest: &Digest) -> Option<&Request> {
        self.entries.get(digest).map(|e| &e.request)
    }

    /// Looks up the digest a request key resolves to.
    pub fn digest_of(&self, key: &RequestKey) -> Option<Digest> {
        self.by_key.get(key).copied()
    }

    /// The client connection a request arrived on, if any.
    pub fn client_of(&self, digest: &Digest) -> Option<&str> {
        self.entries.get(digest).and_then(|e| e.client.as_deref())
    }

    /// Marks a request as executed.
    pub fn mark_executed(&mut self, digest: &Digest) {
        if let Some(entry) = self.entries.get_mut(digest) {
            entry.phase = RequestPhase::Executed;
        }
    }

    /// The phase of a tracked request.
    pub fn phase(&self, digest: &Digest) -> Option<RequestPhase> {
        self.entries.get(digest).map(|e| e.phase)
    }

    /// Frees a request after a stable checkpoint covered it.
    pub fn free(&mut self, digest: &Digest) {
        if let Some(entry) = self.entries.remove(digest) {
            self.by_key.remove(entry.request.key());
        }
    }

    /// Number of tracked requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, request: Request) -> &mut RequestEntry {
        let digest = request.digest();
        self.by_key.insert(request.key().clone(), digest);
        self.entries.entry(digest).or_insert_with(|| RequestEntry {
            request,
            phase: RequestPhase::Propagating,
            propagated_by: collections::hash_set(),
            client: None,
        })
    }
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(req_id: u64) -> Request {
        Request::new(RequestKey::new("client-a", req_id), 7, vec![req_id as u8])
    }

    #[test]
    fn weak_quorum_of_propagates_finalizes() {
        let mut store = RequestStore::new();
        let req = request(1);
        let digest = req.digest();

        assert!(!store.add_propagate(req.clone(), NodeId::from(0), 2));
        assert!(!store.is_finalized(&digest));
        assert!(store.add_propagate(req.clone(), NodeId::from(1), 2));
        assert!(store.is_finalized(&digest));
        // further propagates report no transition
        assert!(!store.add_propagate(req, NodeId::from(2), 2));
    }

    #[test]
    fn repeated_propagates_from_one_node_count_once() {
        let mut store = RequestStore::new();
        let req = request(1);
        assert!(!store.add_propagate(req.clone(), NodeId::from(0), 2));
        assert!(!store.add_propagate(req.clone(), NodeId::from(0), 2));
        assert!(!store.is_finalized(&req.digest()));
    }

    #[test]
    fn freeing_forgets_the_key_mapping() {
        let mut store = RequestStore::new();
        let req = request(1);
        let key = req.key().clone();
        let digest = req.digest();
        store.add_propagate(req, NodeId::from(0), 1);
        assert_eq!(store.digest_of(&key), Some(digest));
        store.free(&digest);
        assert_eq!(store.digest_of(&key), None);
        assert!(store.is_empty());
    }
}

//! The simulated infrastructure: files and their replicas, storage
//! elements, network links, sites and the Rucio catalogue that owns all
//! files.
//!
//! Ownership is deliberately single-direction. The catalogue owns files,
//! storage elements own replicas; every back-reference (file to replica,
//! replica to storage element, transfer to replica) is a weak handle or an
//! index. Removing a replica therefore invalidates every in-flight transfer
//! that touched it without any explicit bookkeeping on the transfer side.

mod file;
mod link;
mod rucio;
mod site;
mod storage;

pub use file::{File, FileRef, PreRemoveTag, Replica, ReplicaRef};
pub use link::{NetworkLink, NetworkLinkRef};
pub use rucio::{FileListener, Rucio};
pub use site::{Site, SiteKind, SiteRef};
pub use storage::{Operation, StorageElement, StorageElementListener, StorageElementRef};

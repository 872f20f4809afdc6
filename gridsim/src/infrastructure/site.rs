//! Resource sites: grid data centres and cloud regions.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::clouds::BucketCostTracker;
use crate::common::{Ctx, Id, Space};
use crate::common::random::ValueGen;
use crate::infrastructure::storage::{StorageElement, StorageElementRef};

pub type SiteRef = Rc<Site>;

/// What kind of data centre a site represents. Cloud regions remember the
/// cloud they belong to; that name doubles as the `kind` column of the
/// Sites output table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteKind {
    Grid,
    CloudRegion { cloud_name: String },
}

impl SiteKind {
    pub fn label(&self) -> &str {
        match self {
            SiteKind::Grid => "grid",
            SiteKind::CloudRegion { cloud_name } => cloud_name,
        }
    }
}

/// A geographic or logical grouping of storage elements.
pub struct Site {
    id: Id,
    name: String,
    location_name: String,
    multi_location_idx: u8,
    kind: SiteKind,
    /// Profile attributes that were not consumed while loading.
    custom_config: RefCell<HashMap<String, String>>,
    storage_elements: RefCell<Vec<StorageElementRef>>,
}

impl Site {
    pub fn new(
        ctx: &Ctx,
        name: String,
        location_name: String,
        multi_location_idx: u8,
        kind: SiteKind,
    ) -> SiteRef {
        Rc::new(Site {
            id: ctx.ids.next(),
            name,
            location_name,
            multi_location_idx,
            kind,
            custom_config: RefCell::new(HashMap::new()),
            storage_elements: RefCell::new(Vec::new()),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location_name(&self) -> &str {
        &self.location_name
    }

    pub fn multi_location_idx(&self) -> u8 {
        self.multi_location_idx
    }

    pub fn kind(&self) -> &SiteKind {
        &self.kind
    }

    pub fn set_custom_config(&self, custom: HashMap<String, String>) {
        *self.custom_config.borrow_mut() = custom;
    }

    pub fn custom_config(&self) -> HashMap<String, String> {
        self.custom_config.borrow().clone()
    }

    /// Creates a storage element owned by this site. Cloud regions pass a
    /// cost tracker so the new bucket accrues storage and operation costs.
    pub fn create_storage_element(
        self: &Rc<Self>,
        ctx: &Ctx,
        name: String,
        allow_duplicate_replicas: bool,
        limit: Space,
        access_latency: ValueGen,
        cost: Option<BucketCostTracker>,
    ) -> StorageElementRef {
        let element = StorageElement::new(
            ctx,
            name,
            self,
            allow_duplicate_replicas,
            limit,
            access_latency,
            cost,
        );
        self.storage_elements.borrow_mut().push(Rc::clone(&element));
        element
    }

    pub fn storage_elements(&self) -> Vec<StorageElementRef> {
        self.storage_elements.borrow().clone()
    }
}

//! Shared primitives: identifier, time and space types, unit conversions and
//! the simulation context that replaces the globals a long-running simulator
//! tends to grow.

pub mod random;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::output::Output;

/// Object id, unique across *all* entity kinds.
pub type Id = u64;

/// Virtual time point. One tick is one second by convention.
pub type Tick = u64;

/// Byte count for sizes, volumes and bandwidths.
pub type Space = u64;

pub const ONE_MIB: f64 = 1_048_576.0;
pub const ONE_GIB: f64 = 1_073_741_824.0;

pub const SECONDS_PER_DAY: Tick = 86_400;
pub const SECONDS_PER_MONTH: Tick = 30 * SECONDS_PER_DAY;

pub fn bytes_to_gib(bytes: Space) -> f64 {
    bytes as f64 / ONE_GIB
}

pub fn gib_to_bytes(gib: f64) -> Space {
    (gib * ONE_GIB) as Space
}

pub fn days_to_seconds(days: f64) -> Tick {
    (days * SECONDS_PER_DAY as f64) as Tick
}

pub fn seconds_to_months(ticks: Tick) -> u32 {
    (ticks / SECONDS_PER_MONTH) as u32
}

/// Monotonic id source. Ids start at 1 so 0 can serve as a sentinel in
/// output rows.
#[derive(Debug, Default)]
pub struct IdGen {
    next: Cell<Id>,
}

impl IdGen {
    pub fn next(&self) -> Id {
        let id = self.next.get() + 1;
        self.next.set(id);
        id
    }
}

/// Everything that used to be process-wide state: the id counter, the random
/// number engine and the output sink. Created once when the simulation is
/// built and shared via [Ctx] handles.
pub struct SimContext {
    pub ids: IdGen,
    pub rng: RefCell<StdRng>,
    pub output: Rc<RefCell<Output>>,
}

/// Shared handle to the simulation context.
pub type Ctx = Rc<SimContext>;

impl SimContext {
    /// Builds a context around an output sink. The seed is logged so runs
    /// can be reproduced.
    pub fn new(output: Rc<RefCell<Output>>, seed: Option<u64>) -> Ctx {
        let seed = seed.unwrap_or_else(rand::random);
        log::info!("using rng seed: {}", seed);
        Rc::new(SimContext {
            ids: IdGen::default(),
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            output,
        })
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::output::{DummyDatabase, Output};

    pub(crate) fn test_ctx() -> Ctx {
        let output = Output::new(Box::new(DummyDatabase::default()), 64);
        SimContext::new(Rc::new(RefCell::new(output)), Some(42))
    }
}

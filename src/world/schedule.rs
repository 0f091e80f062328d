use downcast::{downcast_sync, AnySync};
use once_cell::sync::Lazy;

use crate::world::component::ComponentTypeIndex;
use crate::world::World;

/// Fixed per-tick stage order. `Tick`, `Update` and `PostUpdate` run their
/// systems in parallel where the declared accesses allow it;
/// `TickSequential` runs single-threaded in registration order with full
/// world access.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SystemStage {
    Tick,
    Update,
    TickSequential,
    PostUpdate,
}

/// Component containers a system reads and writes during parallel stages.
/// The scheduler serializes systems whose declarations conflict.
#[derive(Clone, Default)]
pub struct SystemAccess {
    pub reads: Vec<ComponentTypeIndex>,
    pub writes: Vec<ComponentTypeIndex>,
}

impl SystemAccess {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_read(mut self, ty: ComponentTypeIndex) -> Self {
        self.reads.push(ty);
        self
    }

    pub fn with_write(mut self, ty: ComponentTypeIndex) -> Self {
        self.writes.push(ty);
        self
    }

    pub fn conflicts_with(&self, other: &SystemAccess) -> bool {
        let hits = |a: &[ComponentTypeIndex], b: &[ComponentTypeIndex]| {
            a.iter().any(|ty| b.contains(ty))
        };
        hits(&self.writes, &other.writes)
            || hits(&self.writes, &other.reads)
            || hits(&self.reads, &other.writes)
    }
}

pub trait System: AnySync {
    fn name(&self) -> &'static str;

    fn access(&self) -> SystemAccess {
        SystemAccess::none()
    }

    fn tick(&mut self, _world: &World) {}
    fn update(&mut self, _world: &World) {}
    fn tick_sequential(&mut self, _world: &mut World) {}
    fn post_update(&mut self, _world: &World) {}
}
downcast_sync!(dyn System);

/// Shared worker pool for the parallel stages.
pub fn task_pool() -> &'static rayon::ThreadPool {
    static POOL: Lazy<rayon::ThreadPool> = Lazy::new(|| {
        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        rayon::ThreadPoolBuilder::new()
            .num_threads(hardware.max(4) - 1)
            .thread_name(|i| format!("yave-worker-{}", i))
            .build()
            .expect("Failed to build the worker pool.")
    });
    &POOL
}

fn run_stage_method(system: &mut Box<dyn System>, world: &World, stage: SystemStage) {
    match stage {
        SystemStage::Tick => system.tick(world),
        SystemStage::Update => system.update(world),
        SystemStage::PostUpdate => system.post_update(world),
        SystemStage::TickSequential => unreachable!("Sequential stage has its own path."),
    }
}

/// Runs one parallel stage: greedily batches systems so no two systems in a
/// batch conflict, then drains batch by batch on the worker pool.
pub(crate) fn run_parallel_stage(
    systems: &mut [Box<dyn System>],
    world: &World,
    stage: SystemStage,
) {
    let accesses = systems.iter().map(|s| s.access()).collect::<Vec<_>>();

    let mut batch_of = vec![0usize; systems.len()];
    let mut batch_accesses: Vec<Vec<&SystemAccess>> = Vec::new();
    for (i, access) in accesses.iter().enumerate() {
        let mut batch = batch_accesses.len();
        for (b, members) in batch_accesses.iter().enumerate() {
            if !members.iter().any(|m| m.conflicts_with(access)) {
                batch = b;
                break;
            }
        }
        if batch == batch_accesses.len() {
            batch_accesses.push(Vec::new());
        }
        batch_accesses[batch].push(access);
        batch_of[i] = batch;
    }
    let batch_count = batch_accesses.len();

    for round in 0..batch_count {
        let mut members = systems
            .iter_mut()
            .zip(&batch_of)
            .filter(|(_, b)| **b == round)
            .map(|(system, _)| system)
            .collect::<Vec<_>>();

        if members.len() == 1 {
            run_stage_method(members[0], world, stage);
            continue;
        }

        task_pool().scope(|scope| {
            for system in members.drain(..) {
                scope.spawn(move |_| run_stage_method(system, world, stage));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_conflicts() {
        let a = SystemAccess::none().with_write(0).with_read(1);
        let b = SystemAccess::none().with_read(0);
        let c = SystemAccess::none().with_read(1);

        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
        assert!(!b.conflicts_with(&c));
        assert!(a.conflicts_with(&c));
    }
}

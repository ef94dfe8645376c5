//! Chain scheduler: decides which queued task may be transmitted next.
//!
//! Tasks are appended to one or more chains in submission order. Within a
//! chain, a task becomes transmissible only once every earlier task on that
//! chain has itself been transmitted (or finished); a task on several chains
//! is gated by all of them. Each chain keeps a generation counter that is
//! bumped when its invoke-after fabric breaks, so that a resent task and its
//! suffix are re-chained against the rebuilt predecessor.

use std::collections::VecDeque;
use std::num::NonZeroU64;

use fxhash::FxHashMap;

/// Caller-defined identifier of a chain. Non-zero by construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChainId(NonZeroU64);

impl ChainId {
    /// Create a chain id. Returns `None` for zero.
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(ChainId)
    }

    /// The raw id value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Stable task identifier, valid until the task is finished and its storage
/// reclaimed. Ids are issued monotonically, so they order tasks by
/// submission and survive internal compaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TaskState {
    /// Queued, holding its query, not yet transmissible or not yet picked.
    Pending,
    /// Transmitted (or delegated to the caller); occupies a concurrency slot
    /// and is a valid invoke-after source while its query lives.
    Active,
    /// Terminal.
    Finished,
}

struct TaskSlot<T> {
    state: TaskState,
    /// Chains this task belongs to, paired with the generation stamped at
    /// the latest transmission.
    chains: Vec<(ChainId, u64)>,
    /// How many chain queues still hold this task.
    queue_refs: usize,
    extra: Option<T>,
}

struct ChainQueue {
    tasks: VecDeque<TaskId>,
    /// Position of the first not-yet-finished task.
    head: usize,
    /// Position of the next task to transmit.
    next: usize,
    generation: u64,
    /// The most recently transmitted task whose weak ref is the chain's
    /// current invoke-after target, if still active.
    last_sent: Option<TaskId>,
}

impl ChainQueue {
    fn new() -> Self {
        ChainQueue {
            tasks: VecDeque::new(),
            head: 0,
            next: 0,
            generation: 0,
            last_sent: None,
        }
    }
}

/// A task handed out by [`ChainScheduler::start_next_task`], together with
/// the per-chain predecessors to attach as invoke-after targets.
#[derive(Debug)]
pub struct StartedTask {
    /// The task that just transitioned to its in-flight state.
    pub task_id: TaskId,
    /// Immediate predecessors, one per chain where a transmissible one
    /// exists, deduplicated, in the task's chain order.
    pub parents: Vec<TaskId>,
}

/// Scheduler over chained tasks with a bounded concurrency window.
pub struct ChainScheduler<T> {
    tasks: FxHashMap<TaskId, TaskSlot<T>>,
    chains: FxHashMap<ChainId, ChainQueue>,
    next_task_id: u64,
    /// Tasks in the Active state.
    active: usize,
    /// Tasks not yet Finished.
    live: usize,
    max_active: usize,
}

impl<T> ChainScheduler<T> {
    /// Create a scheduler admitting at most `max_active` simultaneously
    /// active tasks.
    pub fn new(max_active: usize) -> Self {
        ChainScheduler {
            tasks: FxHashMap::default(),
            chains: FxHashMap::default(),
            next_task_id: 1,
            active: 0,
            live: 0,
            max_active,
        }
    }

    /// Append a task to every chain in `chains` (duplicates ignored).
    pub fn create_task(&mut self, chains: &[ChainId], extra: T) -> TaskId {
        assert!(!chains.is_empty(), "a task must belong to at least one chain");
        let task_id = TaskId(self.next_task_id);
        self.next_task_id += 1;

        let mut memberships = Vec::with_capacity(chains.len());
        for &chain_id in chains {
            if memberships.iter().any(|&(c, _)| c == chain_id) {
                continue;
            }
            let chain = self.chains.entry(chain_id).or_insert_with(ChainQueue::new);
            chain.tasks.push_back(task_id);
            memberships.push((chain_id, chain.generation));
        }

        self.tasks.insert(
            task_id,
            TaskSlot {
                state: TaskState::Pending,
                queue_refs: memberships.len(),
                chains: memberships,
                extra: Some(extra),
            },
        );
        self.live += 1;
        task_id
    }

    /// Pick the earliest runnable task across all chains, transition it to
    /// Active, and return it with its invoke-after predecessors. `None` when
    /// nothing is runnable (all chains stalled, or the concurrency cap is
    /// reached).
    pub fn start_next_task(&mut self) -> Option<StartedTask> {
        if self.active >= self.max_active {
            return None;
        }

        // Per-chain scan position: the first non-finished task at or past
        // `next`. A chain whose scan lands on an active task is stalled.
        let mut heads: FxHashMap<ChainId, TaskId> = FxHashMap::default();
        for (&chain_id, chain) in self.chains.iter_mut() {
            if let Some(task_id) = scan(chain, &self.tasks) {
                heads.insert(chain_id, task_id);
            }
        }

        let mut best: Option<TaskId> = None;
        for &task_id in heads.values() {
            let slot = &self.tasks[&task_id];
            if slot.state != TaskState::Pending {
                continue;
            }
            if !slot
                .chains
                .iter()
                .all(|(chain_id, _)| heads.get(chain_id) == Some(&task_id))
            {
                continue;
            }
            if best.map_or(true, |b| task_id < b) {
                best = Some(task_id);
            }
        }
        let task_id = best?;

        let memberships: Vec<ChainId> = self.tasks[&task_id]
            .chains
            .iter()
            .map(|&(chain_id, _)| chain_id)
            .collect();

        let mut parents = Vec::new();
        let mut stamped = Vec::with_capacity(memberships.len());
        for chain_id in memberships {
            let chain = self.chains.get_mut(&chain_id).expect("member chain exists");
            debug_assert_eq!(chain.tasks.get(chain.next), Some(&task_id));
            chain.next += 1;
            if let Some(parent) = chain.last_sent {
                let transmissible = self
                    .tasks
                    .get(&parent)
                    .is_some_and(|slot| slot.state == TaskState::Active);
                if transmissible && !parents.contains(&parent) {
                    parents.push(parent);
                }
            }
            chain.last_sent = Some(task_id);
            stamped.push((chain_id, chain.generation));
        }

        let slot = self.tasks.get_mut(&task_id).expect("picked task exists");
        slot.state = TaskState::Active;
        slot.chains = stamped;
        self.active += 1;

        Some(StartedTask { task_id, parents })
    }

    /// Mark a Pending task Active without transmitting it: it keeps its
    /// queue position and concurrency slot while its disposition is
    /// delegated to the caller.
    pub fn defer_task(&mut self, task_id: TaskId) {
        let slot = self.tasks.get_mut(&task_id).expect("task is live");
        assert_eq!(slot.state, TaskState::Pending, "only a pending task can be deferred");
        slot.state = TaskState::Active;
        self.active += 1;
    }

    /// Mark a task Finished and advance its chains past their finished
    /// prefixes, compacting storage where worthwhile.
    pub fn finish_task(&mut self, task_id: TaskId) {
        let slot = self.tasks.get_mut(&task_id).expect("task is live");
        assert_ne!(slot.state, TaskState::Finished, "task finished twice");
        if slot.state == TaskState::Active {
            self.active -= 1;
        }
        slot.state = TaskState::Finished;
        slot.extra = None;
        self.live -= 1;

        let memberships: Vec<ChainId> = slot.chains.iter().map(|&(c, _)| c).collect();
        for chain_id in memberships {
            let chain = self.chains.get_mut(&chain_id).expect("member chain exists");
            while let Some(&t) = chain.tasks.get(chain.head) {
                if self.tasks[&t].state == TaskState::Finished {
                    chain.head += 1;
                } else {
                    break;
                }
            }
            if chain.next < chain.head {
                chain.next = chain.head;
            }
            if chain.head == chain.tasks.len() {
                // Chain fully finished: release everything and drop it.
                let count = chain.tasks.len();
                release_prefix(chain, &mut self.tasks, count);
                self.chains.remove(&chain_id);
            } else if chain.head * 2 > chain.tasks.len() && chain.tasks.len() > 5 {
                let head = chain.head;
                release_prefix(chain, &mut self.tasks, head);
            }
        }
    }

    /// Return an Active task to Pending. For every chain whose invoke-after
    /// fabric this task was part of (generation match), rewind the
    /// transmission cursor to the head, clear the invoke-after target, and
    /// bump the generation so the suffix is re-chained.
    pub fn reset_task(&mut self, task_id: TaskId) {
        let slot = self.tasks.get_mut(&task_id).expect("task is live");
        assert_eq!(slot.state, TaskState::Active, "only an active task can be reset");
        slot.state = TaskState::Pending;
        self.active -= 1;

        let memberships = slot.chains.clone();
        for (chain_id, stamped_generation) in memberships {
            let chain = self.chains.get_mut(&chain_id).expect("member chain exists");
            if stamped_generation == chain.generation {
                chain.generation += 1;
                chain.next = chain.head;
                chain.last_sent = None;
            }
        }
    }

    /// Caller-associated state of a live task.
    pub fn get_task_extra(&self, task_id: TaskId) -> Option<&T> {
        self.tasks.get(&task_id).and_then(|slot| slot.extra.as_ref())
    }

    /// Mutable caller-associated state of a live task.
    pub fn get_task_extra_mut(&mut self, task_id: TaskId) -> Option<&mut T> {
        self.tasks
            .get_mut(&task_id)
            .and_then(|slot| slot.extra.as_mut())
    }

    /// Whether the task exists and is not finished.
    pub fn is_live(&self, task_id: TaskId) -> bool {
        self.tasks
            .get(&task_id)
            .is_some_and(|slot| slot.state != TaskState::Finished)
    }

    /// Number of not-yet-finished tasks.
    pub fn live_tasks(&self) -> usize {
        self.live
    }

    /// Number of tasks currently holding a concurrency slot.
    pub fn active_tasks(&self) -> usize {
        self.active
    }

    /// Ids of all live tasks, in submission order.
    pub fn live_task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, slot)| slot.state != TaskState::Finished)
            .map(|(&id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    /// Tasks ordered after `task_id` on any of its chains, visited in chain
    /// order and deduplicated across chains.
    pub fn successors_of(&self, task_id: TaskId) -> Vec<TaskId> {
        let Some(slot) = self.tasks.get(&task_id) else {
            return Vec::new();
        };
        let mut successors = Vec::new();
        for &(chain_id, _) in &slot.chains {
            let Some(chain) = self.chains.get(&chain_id) else {
                continue;
            };
            let Some(pos) = chain.tasks.iter().position(|&t| t == task_id) else {
                continue;
            };
            for &t in chain.tasks.iter().skip(pos + 1) {
                if self.tasks[&t].state != TaskState::Finished && !successors.contains(&t) {
                    successors.push(t);
                }
            }
        }
        successors
    }

    /// Visit every live task, in submission order.
    pub fn for_each(&mut self, mut f: impl FnMut(TaskId, &mut T)) {
        for task_id in self.live_task_ids() {
            if let Some(extra) = self.get_task_extra_mut(task_id) {
                f(task_id, extra);
            }
        }
    }
}

/// Advance `chain.next` past finished tasks and return the task the scan
/// lands on, if any.
fn scan<T>(chain: &mut ChainQueue, tasks: &FxHashMap<TaskId, TaskSlot<T>>) -> Option<TaskId> {
    if chain.next < chain.head {
        chain.next = chain.head;
    }
    while let Some(&task_id) = chain.tasks.get(chain.next) {
        if tasks[&task_id].state == TaskState::Finished {
            chain.next += 1;
        } else {
            return Some(task_id);
        }
    }
    None
}

/// Pop the first `count` entries of the chain queue, dropping task slots
/// that no chain references anymore.
fn release_prefix<T>(
    chain: &mut ChainQueue,
    tasks: &mut FxHashMap<TaskId, TaskSlot<T>>,
    count: usize,
) {
    for _ in 0..count {
        let task_id = chain.tasks.pop_front().expect("prefix within bounds");
        let slot = tasks.get_mut(&task_id).expect("queued task exists");
        slot.queue_refs -= 1;
        if slot.queue_refs == 0 && slot.state == TaskState::Finished {
            tasks.remove(&task_id);
        }
    }
    chain.head -= count;
    chain.next -= count;
}

//! Assigns guest instances to scheduling and binding cycles.
//!
//! Every guest is in exactly one place at any time:
//!
//! - the **scheduled** slot, tagged with the scheduling cycle (and pod) it
//!   serves. At most one scheduling cycle is active, so one slot suffices.
//! - a **binding** entry keyed by pod UID. Binding cycles for different
//!   pods run concurrently, each on its own guest.
//! - the **free** list.
//!
//! Transitions: `free → scheduled → {free | binding} → free`. A binding
//! cycle takes over the scheduled guest so the guest-side state built
//! during scheduling stays visible to PreBind/Bind/PostBind.
//!
//! # Retention
//!
//! A scheduled cycle may be marked as retained for its pod's binding
//! cycle. When the next scheduling cycle starts, a retained guest is
//! parked under the pod's binding key instead of being reused; an
//! unretained one is simply re-tagged for the new cycle.
//!
//! - [`Retention::Firm`]: the pod is certain to reach a stage that
//!   releases the guest (PostBind or Unreserve). Parked until released.
//! - [`Retention::Tentative`]: the pod may be abandoned without any
//!   releasing stage. At most [`PARKED_LIMIT`] tentative guests are
//!   parked; the oldest is reclaimed to the free list beyond that, and a
//!   later binding cycle for its pod gets [`Claim::Reclaimed`].
//!
//! The pool lock only covers bookkeeping. Guest calls are serialized by
//! each guest's own mutex, which callers hold through [`Pooled::lock`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use kubewasm_core::CycleId;

/// Tentatively retained guests parked at once.
pub const PARKED_LIMIT: usize = 8;

/// Reclaimed pod UIDs remembered so their binding cycles fail.
const RECLAIMED_MEMORY: usize = 1024;

/// Creates guests on demand.
pub trait GuestFactory: Send + Sync {
    type Guest: Send;

    fn create(&self, id: u64) -> anyhow::Result<Self::Guest>;
}

/// A guest handle shared between the pool and the cycle using it.
pub struct Pooled<G> {
    id: u64,
    guest: Arc<Mutex<G>>,
}

impl<G> Clone for Pooled<G> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            guest: Arc::clone(&self.guest),
        }
    }
}

impl<G> Pooled<G> {
    fn new(id: u64, guest: G) -> Self {
        Self {
            id,
            guest: Arc::new(Mutex::new(guest)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Exclusive access to the guest for one call. A panic during an
    /// earlier call does not make the guest unusable.
    pub fn lock(&self) -> MutexGuard<'_, G> {
        self.guest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// How a scheduled guest is kept for its pod's binding cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Retention {
    Tentative,
    Firm,
}

/// Outcome of looking up the guest for a binding cycle.
pub enum Claim<G> {
    /// The guest that scheduled the pod, now held for its binding cycle.
    Held(Pooled<G>),
    /// The guest that scheduled the pod was reclaimed before binding.
    Reclaimed,
    /// No guest of this pool took part in scheduling the pod.
    Unscheduled,
}

struct Scheduled<G> {
    cycle: CycleId,
    pod_uid: String,
    retention: Option<Retention>,
    guest: Pooled<G>,
}

struct PoolState<G> {
    scheduled: Option<Scheduled<G>>,
    binding: HashMap<String, Pooled<G>>,
    free: Vec<Pooled<G>>,
    /// Pods whose binding guest is tentatively parked, oldest first.
    parked: VecDeque<String>,
    reclaimed: VecDeque<String>,
}

impl<G> Default for PoolState<G> {
    fn default() -> Self {
        Self {
            scheduled: None,
            binding: HashMap::new(),
            free: Vec::new(),
            parked: VecDeque::new(),
            reclaimed: VecDeque::new(),
        }
    }
}

impl<G> PoolState<G> {
    fn unpark(&mut self, pod_uid: &str) -> bool {
        let before = self.parked.len();
        self.parked.retain(|uid| uid != pod_uid);
        self.parked.len() != before
    }

    fn park(&mut self, pod_uid: String, guest: Pooled<G>, retention: Retention) {
        if self.binding.contains_key(&pod_uid) {
            warn!(guest = guest.id, pod = %pod_uid, "pod already has a binding guest; freeing retained guest");
            self.free.push(guest);
            return;
        }
        debug!(guest = guest.id, pod = %pod_uid, ?retention, "parking retained guest for binding");
        self.binding.insert(pod_uid.clone(), guest);
        if retention == Retention::Tentative {
            self.parked.push_back(pod_uid);
        }
        while self.parked.len() > PARKED_LIMIT {
            let Some(uid) = self.parked.pop_front() else { break };
            if let Some(guest) = self.binding.remove(&uid) {
                warn!(guest = guest.id, pod = %uid, "reclaiming guest parked for a binding cycle that never started");
                self.free.push(guest);
            }
            self.reclaimed.push_back(uid);
            if self.reclaimed.len() > RECLAIMED_MEMORY {
                self.reclaimed.pop_front();
            }
        }
    }

    /// A pod being scheduled again was abandoned by its previous cycle;
    /// its tentatively parked guest goes back to the free list.
    fn reclaim_rescheduled(&mut self, pod_uid: &str) {
        if self.unpark(pod_uid) {
            if let Some(guest) = self.binding.remove(pod_uid) {
                debug!(guest = guest.id, pod = %pod_uid, "pod rescheduled; freeing its parked guest");
                self.free.push(guest);
            }
        }
        self.reclaimed.retain(|uid| uid != pod_uid);
    }
}

pub struct GuestPool<F: GuestFactory> {
    factory: F,
    state: Mutex<PoolState<F::Guest>>,
    next_id: AtomicU64,
    created: AtomicU64,
}

impl<F: GuestFactory> GuestPool<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<F::Guest>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create(&self) -> anyhow::Result<Pooled<F::Guest>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guest = self.factory.create(id)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(guest = id, "created guest");
        Ok(Pooled::new(id, guest))
    }

    /// Create one guest and park it on the free list.
    pub fn prewarm(&self) -> anyhow::Result<()> {
        let guest = self.create()?;
        self.lock().free.push(guest);
        Ok(())
    }

    /// Run `f` on a guest outside any cycle, such as for `enqueue`.
    pub fn with_free<R>(&self, f: impl FnOnce(&mut F::Guest) -> R) -> anyhow::Result<R> {
        let popped = self.lock().free.pop();
        let pooled = match popped {
            Some(guest) => guest,
            None => self.create()?,
        };
        let result = f(&mut pooled.lock());
        self.lock().free.push(pooled);
        Ok(result)
    }

    /// The guest serving scheduling cycle `cycle` for pod `pod_uid`.
    ///
    /// Calls within one cycle always get the same guest.
    pub fn acquire_for_scheduling(&self, cycle: CycleId, pod_uid: &str) -> anyhow::Result<Pooled<F::Guest>> {
        {
            let mut state = self.lock();
            if let Some(guest) = Self::take_slot(&mut state, cycle, pod_uid) {
                return Ok(guest);
            }
            if let Some(guest) = state.free.pop() {
                debug!(guest = guest.id, %cycle, "reusing free guest for scheduling");
                return Ok(Self::install(&mut state, cycle, pod_uid, guest));
            }
        }

        // Instantiate outside the lock.
        let created = self.create()?;
        let mut state = self.lock();
        if let Some(guest) = Self::take_slot(&mut state, cycle, pod_uid) {
            state.free.push(created);
            return Ok(guest);
        }
        Ok(Self::install(&mut state, cycle, pod_uid, created))
    }

    /// Resolve the scheduled slot for a new acquisition. Returns the guest
    /// to use if the slot can serve `cycle`; otherwise leaves the slot empty.
    fn take_slot(state: &mut PoolState<F::Guest>, cycle: CycleId, pod_uid: &str) -> Option<Pooled<F::Guest>> {
        let slot = state.scheduled.as_ref()?;
        if slot.cycle == cycle {
            return Some(slot.guest.clone());
        }

        let previous = state.scheduled.take()?;
        match previous.retention {
            None => {
                debug!(guest = previous.guest.id, from = %previous.cycle, to = %cycle, "re-tagging unretained guest");
                state.reclaim_rescheduled(pod_uid);
                let guest = previous.guest;
                state.scheduled = Some(Scheduled {
                    cycle,
                    pod_uid: pod_uid.to_string(),
                    retention: None,
                    guest: guest.clone(),
                });
                Some(guest)
            }
            Some(retention) => {
                state.park(previous.pod_uid, previous.guest, retention);
                state.reclaim_rescheduled(pod_uid);
                None
            }
        }
    }

    fn install(
        state: &mut PoolState<F::Guest>,
        cycle: CycleId,
        pod_uid: &str,
        guest: Pooled<F::Guest>,
    ) -> Pooled<F::Guest> {
        state.scheduled = Some(Scheduled {
            cycle,
            pod_uid: pod_uid.to_string(),
            retention: None,
            guest: guest.clone(),
        });
        guest
    }

    /// Keep the guest of scheduling cycle `cycle` for the pod's binding
    /// cycle. A firm retention is never downgraded.
    pub fn retain(&self, cycle: CycleId, retention: Retention) {
        let mut state = self.lock();
        match state.scheduled.as_mut() {
            Some(slot) if slot.cycle == cycle => {
                slot.retention = slot.retention.max(Some(retention));
            }
            _ => debug!(%cycle, "retain for a cycle that no longer holds the scheduled guest"),
        }
    }

    /// Look up the guest for the binding cycle of `pod_uid` in one step:
    /// its binding entry, else the scheduled slot if it is tagged for this
    /// pod (which is then taken over).
    pub fn claim_for_binding(&self, pod_uid: &str) -> Claim<F::Guest> {
        let mut state = self.lock();
        if let Some(guest) = state.binding.get(pod_uid).cloned() {
            state.unpark(pod_uid);
            return Claim::Held(guest);
        }

        if state.scheduled.as_ref().is_some_and(|slot| slot.pod_uid == pod_uid) {
            if let Some(slot) = state.scheduled.take() {
                debug!(guest = slot.guest.id, pod = %pod_uid, "binding cycle takes over scheduled guest");
                state.binding.insert(pod_uid.to_string(), slot.guest.clone());
                return Claim::Held(slot.guest);
            }
        }

        if state.reclaimed.iter().any(|uid| uid == pod_uid) {
            Claim::Reclaimed
        } else {
            Claim::Unscheduled
        }
    }

    /// The guest serving the binding cycle of `pod_uid`.
    ///
    /// # Panics
    ///
    /// If no guest that scheduled the pod is held. Binding always follows
    /// scheduling, so this is a caller bug.
    pub fn acquire_for_binding(&self, pod_uid: &str) -> Pooled<F::Guest> {
        match self.claim_for_binding(pod_uid) {
            Claim::Held(guest) => guest,
            Claim::Reclaimed | Claim::Unscheduled => {
                panic!("binding cycle for pod {pod_uid} started without a scheduled guest")
            }
        }
    }

    /// A binding guest for a pod no guest of this pool scheduled: the
    /// pod's existing binding guest, else a free or new one.
    pub fn acquire_detached(&self, pod_uid: &str) -> anyhow::Result<Pooled<F::Guest>> {
        {
            let mut state = self.lock();
            if let Some(guest) = state.binding.get(pod_uid) {
                return Ok(guest.clone());
            }
            if let Some(guest) = state.free.pop() {
                state.binding.insert(pod_uid.to_string(), guest.clone());
                return Ok(guest);
            }
        }

        let created = self.create()?;
        let mut state = self.lock();
        if let Some(guest) = state.binding.get(pod_uid) {
            let guest = guest.clone();
            state.free.push(created);
            return Ok(guest);
        }
        state.binding.insert(pod_uid.to_string(), created.clone());
        Ok(created)
    }

    /// End the binding cycle of `pod_uid`, returning its guest to the free
    /// list. A scheduled slot still tagged for the pod is no longer retained.
    pub fn release(&self, pod_uid: &str) {
        let mut state = self.lock();
        state.unpark(pod_uid);
        if let Some(slot) = state.scheduled.as_mut().filter(|slot| slot.pod_uid == pod_uid) {
            slot.retention = None;
        }
        match state.binding.remove(pod_uid) {
            Some(guest) => {
                debug!(guest = guest.id, pod = %pod_uid, "guest released");
                state.free.push(guest);
            }
            None => debug!(pod = %pod_uid, "release for a pod without a binding guest"),
        }
    }

    // ── Diagnostics ───────────────────────────────────────────────

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    pub fn binding_count(&self) -> usize {
        self.lock().binding.len()
    }

    /// Id of the guest in the scheduled slot.
    pub fn scheduled_guest(&self) -> Option<u64> {
        self.lock().scheduled.as_ref().map(|slot| slot.guest.id)
    }

    pub fn total_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

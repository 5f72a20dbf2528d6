// Environment Pool
//
// Fixed-capacity table of environment records with an intrusive free list
// and generation-tagged identifiers.
//
// Key responsibilities:
// - Hand out free slots in slot order at boot, LIFO once slots are recycled
// - Mint identifiers whose generation changes on every reuse of a slot
// - Resolve identifiers back to records, rejecting free slots and stale ids
// - Enforce the "self or parent" rule for permission-checked lookups
// - Track which record, if any, is currently running
//
// Identifier layout (32 bits):
//
//   31                          12 11             0
//   +-----------------------------+----------------+
//   |         generation          |   slot index   |
//   +-----------------------------+----------------+
//
// The slot index only uses the low log2(N) bits; generations advance in
// steps of 1 << GENERATION_SHIFT and never reach zero, so id 0 is free to
// mean "the caller".
//
// Correctness notes:
// - `status == Free` is checked before the stored id; released slots keep
//   their last id until the next allocation bumps the generation
// - Releasing the running record reinstalls the kernel root before any
//   frame goes back to the allocator

use core::fmt;

use x86_64::structures::paging::PhysFrame;

use crate::arch::Machine;
use crate::interrupts::trap::TrapFrame;
use crate::mm::addrspace::AddressSpace;
use crate::mm::{FrameAllocator, USTACKTOP};
use crate::{log_debug, log_info, log_warn};

/// Default number of environment slots.
pub const NENV: usize = 1024;

pub const GENERATION_SHIFT: u32 = 12;

const LOG_ORIGIN: &str = "env";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(u32);

impl EnvId {
    /// Shorthand for "the environment making the request".
    pub const CURRENT: EnvId = EnvId(0);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn generation(self) -> u32 {
        self.0 >> GENERATION_SHIFT
    }

    pub const fn slot(self, capacity: usize) -> usize {
        self.0 as usize & (capacity - 1)
    }

    /// Identifier for the next occupant of `slot`, given the id it held last.
    fn next(previous: EnvId, slot: usize, capacity: usize) -> EnvId {
        let mut generation =
            (previous.0.wrapping_add(1 << GENERATION_SHIFT) & !((capacity as u32) - 1)) as i32;
        if generation <= 0 {
            generation = 1 << GENERATION_SHIFT;
        }
        EnvId(generation as u32 | slot as u32)
    }
}

impl fmt::LowerHex for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Free,
    Runnable,
    Running,
    Dying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvType {
    User,
    Kernel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvError {
    PoolExhausted,
    OutOfMemory,
    UnknownEnvironment,
    PermissionDenied,
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvError::PoolExhausted => f.write_str("no free environment slots"),
            EnvError::OutOfMemory => f.write_str("out of memory building address space"),
            EnvError::UnknownEnvironment => f.write_str("bad environment"),
            EnvError::PermissionDenied => f.write_str("environment is not the caller or its child"),
        }
    }
}

#[derive(Debug)]
pub struct Env {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub status: EnvStatus,
    pub env_type: EnvType,
    pub runs: u32,
    pub address_space: Option<AddressSpace>,
    pub saved_frame: TrapFrame,
    free_link: Option<usize>,
}

const FREE_ENV: Env = Env {
    id: EnvId(0),
    parent_id: EnvId(0),
    status: EnvStatus::Free,
    env_type: EnvType::User,
    runs: 0,
    address_space: None,
    saved_frame: TrapFrame::zero(),
    free_link: None,
};

pub struct EnvPool<const N: usize> {
    envs: [Env; N],
    free_head: Option<usize>,
    free_count: usize,
    current: Option<usize>,
    // Slot of the last running environment once it has been released.
    last: Option<usize>,
}

impl<const N: usize> EnvPool<N> {
    const VALID_CAPACITY: () = assert!(
        N.is_power_of_two() && N <= 1 << GENERATION_SHIFT,
        "pool capacity must be a power of two that fits below the generation bits"
    );

    /// Every slot free, linked in slot order so the first allocation takes
    /// slot 0.
    pub const fn new() -> Self {
        let () = Self::VALID_CAPACITY;

        let mut envs = [FREE_ENV; N];
        let mut slot = 0;
        while slot + 1 < N {
            envs[slot].free_link = Some(slot + 1);
            slot += 1;
        }

        Self {
            envs,
            free_head: if N > 0 { Some(0) } else { None },
            free_count: N,
            current: None,
            last: None,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn current(&self) -> Option<&Env> {
        self.current.map(|slot| &self.envs[slot])
    }

    pub fn current_mut(&mut self) -> Option<&mut Env> {
        match self.current {
            Some(slot) => Some(&mut self.envs[slot]),
            None => None,
        }
    }

    /// Id of the running environment, or 0 when the kernel itself is acting.
    pub fn current_id(&self) -> EnvId {
        self.current().map_or(EnvId::CURRENT, |env| env.id)
    }

    fn resolve(&self, id: EnvId, check_perm: bool) -> Result<usize, EnvError> {
        if id == EnvId::CURRENT {
            return self.current.ok_or(EnvError::UnknownEnvironment);
        }

        let slot = id.slot(N);
        let env = &self.envs[slot];
        if env.status == EnvStatus::Free {
            log_debug!(LOG_ORIGIN, "lookup {}: slot {} is free", id, slot);
            return Err(EnvError::UnknownEnvironment);
        }
        if env.id != id {
            log_debug!(LOG_ORIGIN, "lookup {}: stale, slot {} now holds {}", id, slot, env.id);
            return Err(EnvError::UnknownEnvironment);
        }

        if check_perm {
            let caller = self.current.ok_or(EnvError::PermissionDenied)?;
            if slot != caller && env.parent_id != self.envs[caller].id {
                return Err(EnvError::PermissionDenied);
            }
        }

        Ok(slot)
    }

    /// Resolve `id` to its record. Id 0 names the running environment. With
    /// `check_perm`, only the caller itself or one of its children resolves.
    pub fn lookup(&self, id: EnvId, check_perm: bool) -> Result<&Env, EnvError> {
        self.resolve(id, check_perm).map(|slot| &self.envs[slot])
    }

    pub fn lookup_mut(&mut self, id: EnvId, check_perm: bool) -> Result<&mut Env, EnvError> {
        let slot = self.resolve(id, check_perm)?;
        Ok(&mut self.envs[slot])
    }

    /// Take a free slot, give it a fresh address space and a new id, and
    /// leave it `Runnable` with a user-mode frame that has no entry point.
    pub fn allocate<A: FrameAllocator + ?Sized>(
        &mut self,
        frames: &mut A,
        kernel_root: PhysFrame,
        parent_id: EnvId,
    ) -> Result<&mut Env, EnvError> {
        let slot = self.free_head.ok_or(EnvError::PoolExhausted)?;
        let space = AddressSpace::build(frames, kernel_root).map_err(|_| EnvError::OutOfMemory)?;
        let creator = self.current_id();

        let env = &mut self.envs[slot];
        self.free_head = env.free_link.take();
        self.free_count -= 1;

        env.id = EnvId::next(env.id, slot, N);
        env.parent_id = parent_id;
        env.status = EnvStatus::Runnable;
        env.env_type = EnvType::User;
        env.runs = 0;
        env.address_space = Some(space);
        env.saved_frame = TrapFrame::new_user(USTACKTOP);

        log_info!(LOG_ORIGIN, "[{:08x}] new env {:08x}", creator, env.id);
        Ok(env)
    }

    /// Tear down `id`'s address space and put its slot back at the head of
    /// the free list.
    pub fn release<M: Machine + ?Sized>(
        &mut self,
        machine: &mut M,
        kernel_root: PhysFrame,
        id: EnvId,
    ) -> Result<(), EnvError> {
        let slot = self.resolve(id, false)?;
        let destroyer = self.current_id();

        if self.current == Some(slot) {
            // SAFETY: the boot root maps the kernel half this code runs from.
            unsafe { machine.switch_root(kernel_root) };
            self.current = None;
            self.last = Some(slot);
        }

        let env = &mut self.envs[slot];
        if let Some(space) = env.address_space.take() {
            if machine.active_root() == space.root() {
                log_warn!(LOG_ORIGIN, "env {} root still active at release", env.id);
                unsafe { machine.switch_root(kernel_root) };
            }
            let frames = space.release(machine);
            log_debug!(LOG_ORIGIN, "env {} returned {} frames", env.id, frames);
        }

        env.status = EnvStatus::Free;
        env.free_link = self.free_head;
        self.free_head = Some(slot);
        self.free_count += 1;

        log_info!(LOG_ORIGIN, "[{:08x}] free env {:08x}", destroyer, env.id);
        Ok(())
    }

    /// Mark `id` as the running environment, demoting whoever ran before.
    /// Returns the record so the caller can install its address space.
    pub fn activate(&mut self, id: EnvId) -> Result<&mut Env, EnvError> {
        let slot = self.resolve(id, false)?;

        if let Some(previous) = self.current {
            if previous != slot && self.envs[previous].status == EnvStatus::Running {
                self.envs[previous].status = EnvStatus::Runnable;
            }
        }

        self.current = Some(slot);
        self.last = None;
        let env = &mut self.envs[slot];
        env.status = EnvStatus::Running;
        env.runs += 1;
        Ok(env)
    }

    /// First `Runnable` record after the current slot, wrapping around. The
    /// current record itself comes last. With nothing current the scan starts
    /// after the slot of the environment that last ran.
    pub fn next_runnable(&self) -> Option<EnvId> {
        let start = self.current.or(self.last).map_or(0, |slot| slot + 1);
        (0..N)
            .map(|step| (start + step) % N)
            .map(|slot| &self.envs[slot])
            .find(|env| env.status == EnvStatus::Runnable)
            .map(|env| env.id)
    }

    pub fn running_count(&self) -> usize {
        self.envs
            .iter()
            .filter(|env| env.status == EnvStatus::Running)
            .count()
    }
}

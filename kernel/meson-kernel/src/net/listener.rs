//! Stream socket rendezvous.
//!
//! A [`Listener`] pairs connectors with acceptors through a fixed set of
//! backlog slots. Whoever arrives first occupies a free slot with the pipe
//! it will read from and waits; the second party scans the slots in order,
//! takes the waiting pipe and leaves its own. Each side ends up writing
//! into the pipe the other one created.

use alloc::sync::Arc;
use alloc::vec::Vec;

use meson_core::kwarn;
use meson_core::sync::{SpinLock, WaitQueue};

use crate::config::LISTEN_BACKLOG_MAX;
use crate::errno::{Errno, KResult};
use crate::poll::{PollMsg, Pollers, Ready};
use crate::pipe::Pipe;
use crate::sched::KillSignal;

/// Which side of the rendezvous a caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// `connect`.
    Connector,
    /// `accept`.
    Acceptor,
}

#[derive(Default)]
struct Slot {
    conn: Option<Arc<Pipe>>,
    acc: Option<Arc<Pipe>>,
    err: Option<Errno>,
}

impl Slot {
    fn is_free(&self) -> bool {
        self.conn.is_none() && self.acc.is_none()
    }

    /// Half-set by `role`: the side that is waiting here.
    fn waiting(&self, role: Role) -> bool {
        match role {
            Role::Connector => self.conn.is_some() && self.acc.is_none(),
            Role::Acceptor => self.acc.is_some() && self.conn.is_none(),
        }
    }

    fn mine(&mut self, role: Role) -> &mut Option<Arc<Pipe>> {
        match role {
            Role::Connector => &mut self.conn,
            Role::Acceptor => &mut self.acc,
        }
    }

    fn theirs(&mut self, role: Role) -> &mut Option<Arc<Pipe>> {
        match role {
            Role::Connector => &mut self.acc,
            Role::Acceptor => &mut self.conn,
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

enum Claim {
    Paired(Arc<Pipe>),
    Waiting(usize),
}

/// Drops this side's ends of a pipe it can no longer use.
fn release(pipe: &Pipe, rd: isize, wd: isize) {
    if let Err(e) = pipe.reopen(rd, wd) {
        kwarn!("net: releasing a rendezvous pipe failed: {}", e);
    }
}

struct ListenerState {
    slots: Vec<Slot>,
    opens: usize,
    ready_connectors: usize,
    pollers: Pollers,
}

/// A listening stream socket's backlog.
pub struct Listener {
    id: usize,
    ino: u64,
    state: SpinLock<ListenerState>,
    cond: WaitQueue,
}

impl Listener {
    /// Creates a listener with `backlog` slots. A backlog outside
    /// `0..=LISTEN_BACKLOG_MAX` is clamped to the maximum, and an empty
    /// backlog still gets one slot.
    pub fn new(id: usize, ino: u64, backlog: isize) -> Self {
        let slots = match usize::try_from(backlog) {
            Ok(n) if n <= LISTEN_BACKLOG_MAX => n.max(1),
            _ => LISTEN_BACKLOG_MAX,
        };
        Self {
            id,
            ino,
            state: SpinLock::named(
                "listener",
                ListenerState {
                    slots: (0..slots).map(|_| Slot::default()).collect(),
                    opens: 1,
                    ready_connectors: 0,
                    pollers: Pollers::new(),
                },
            ),
            cond: WaitQueue::new(),
        }
    }

    /// The listener id, which is the device minor of its node.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Inode of the device node.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Number of backlog slots.
    pub fn backlog(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Trades `mine` (the pipe this side reads from) for the partner's.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] once released, [`Errno::EWOULDBLOCK`] if `noblock`
    /// and nobody is waiting, [`Errno::ECONNREFUSED`] if the backlog is
    /// full, [`Errno::ECONNRESET`] if the listener closes while waiting,
    /// [`Errno::EINTR`] if killed while waiting. On error this side's ends
    /// of both pipes have been released.
    pub async fn rendezvous(
        &self,
        kill: &KillSignal,
        role: Role,
        mine: Arc<Pipe>,
        noblock: bool,
    ) -> KResult<Arc<Pipe>> {
        let bed = match self.claim(role, &mine, noblock) {
            Ok(Claim::Paired(theirs)) => return Ok(theirs),
            Ok(Claim::Waiting(bed)) => bed,
            Err(e) => {
                release(&mine, -1, -1);
                return Err(e);
            }
        };

        let res = kill
            .wait_until(&self.cond, || {
                let mut st = self.state.lock();
                let slot = &mut st.slots[bed];
                if let Some(e) = slot.err {
                    return Some(Err(e));
                }
                slot.theirs(role).clone().map(Ok)
            })
            .await
            .and_then(|r| r);

        let mut st = self.state.lock();
        let slot = &mut st.slots[bed];
        let theirs = slot.theirs(role).take();
        slot.reset();
        if role == Role::Connector {
            st.ready_connectors -= 1;
        }
        drop(st);
        match (res, theirs) {
            (Ok(_), Some(theirs)) => Ok(theirs),
            (Err(e), Some(theirs)) => {
                // Paired, but this side gave up first. The partner owns the
                // other ends and sees a dead peer.
                release(&mine, -1, 0);
                release(&theirs, 0, -1);
                Err(e)
            }
            (res, None) => {
                release(&mine, -1, -1);
                Err(res.err().unwrap_or(Errno::ECONNRESET))
            }
        }
    }

    /// Pairs with a waiting partner, or occupies a free slot.
    fn claim(&self, role: Role, mine: &Arc<Pipe>, noblock: bool) -> KResult<Claim> {
        let mut st = self.state.lock();
        if st.opens == 0 {
            return Err(Errno::EBADF);
        }
        let other = match role {
            Role::Connector => Role::Acceptor,
            Role::Acceptor => Role::Connector,
        };
        let partner = st.slots.iter_mut().find(|s| s.waiting(other)).and_then(|slot| {
            let theirs = slot.mine(other).clone()?;
            *slot.mine(role) = Some(mine.clone());
            Some(theirs)
        });
        if let Some(theirs) = partner {
            drop(st);
            self.cond.wake_all();
            return Ok(Claim::Paired(theirs));
        }
        if noblock {
            return Err(Errno::EWOULDBLOCK);
        }
        let idx = st
            .slots
            .iter()
            .position(Slot::is_free)
            .ok_or(Errno::ECONNREFUSED)?;
        *st.slots[idx].mine(role) = Some(mine.clone());
        if role == Role::Connector {
            st.ready_connectors += 1;
            st.pollers.wake_ready(Ready::READ);
        }
        Ok(Claim::Waiting(idx))
    }

    /// Adjusts the open count. When it reaches zero the listener is
    /// released: waiters get `ECONNRESET` and pollers are woken. Returns
    /// `true` on release.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] once released.
    pub fn reopen(&self, delta: isize) -> KResult<bool> {
        let mut st = self.state.lock();
        if st.opens == 0 {
            return Err(Errno::EBADF);
        }
        st.opens = st.opens.checked_add_signed(delta).ok_or(Errno::EBADF)?;
        if st.opens > 0 {
            return Ok(false);
        }
        for slot in &mut st.slots {
            if !slot.is_free() {
                slot.err = Some(Errno::ECONNRESET);
            }
        }
        st.pollers.wake_ready(Ready::READ | Ready::HUP | Ready::ERROR);
        drop(st);
        self.cond.wake_all();
        Ok(true)
    }

    /// Readable while a connector waits.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOMEM`] if the poller list is full.
    pub fn poll(&self, pm: &PollMsg) -> KResult<Ready> {
        let mut st = self.state.lock();
        if st.opens == 0 {
            return Ok(Ready::empty());
        }
        if pm.events.contains(Ready::READ) && st.ready_connectors > 0 {
            return Ok(Ready::READ);
        }
        if pm.dowait {
            st.pollers.add(pm)?;
        }
        Ok(Ready::empty())
    }

    /// Connectors currently waiting in the backlog.
    pub fn ready_connectors(&self) -> usize {
        self.state.lock().ready_connectors
    }
}

//! Futexes.
//!
//! Each futex is keyed by the physical address of its word, so processes
//! sharing a page share the futex. The first use of a key spawns an
//! arbiter task that owns the futex's sleepers and serves one command at a
//! time from a bounded channel. Callers wait on a oneshot reply, racing
//! their kill signal; a sleeper whose caller has gone away is skipped when
//! a wakeup is handed out.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use meson_core::sync::{SpinLock, channel, oneshot};
use meson_core::{kdebug, ktrace};
use meson_mm::{AddressSpace, PhysWord};
use meson_syscall::{FUTEX_CNDGIVE, FUTEX_SLEEP, FUTEX_WAKE};

use crate::errno::{Errno, KResult};
use crate::sched::{Either, KillSignal, Scheduler, Timer, select};

type Reply = oneshot::Sender<KResult<usize>>;

/// A parked caller.
struct Sleeper {
    reply: Reply,
    deadline: Option<u64>,
}

enum Command {
    Sleep {
        word: PhysWord,
        expected: u32,
        deadline: Option<u64>,
    },
    Wake {
        n: u32,
    },
    CndGive {
        other: channel::Sender<Message>,
    },
    CndTake {
        sleepers: Vec<Sleeper>,
        /// Where refused sleepers go back to.
        bounce: oneshot::Sender<Vec<Sleeper>>,
    },
}

struct Message {
    cmd: Command,
    reply: Reply,
}

/// One futex's sleepers, owned by its arbiter task.
struct Arbiter {
    sleepers: Vec<Sleeper>,
    cap: usize,
    timer: Arc<Timer>,
}

impl Arbiter {
    fn timed(&self) -> usize {
        self.sleepers.iter().filter(|s| s.deadline.is_some()).count()
    }

    fn next_deadline(&self) -> Option<u64> {
        self.sleepers.iter().filter_map(|s| s.deadline).min()
    }

    /// Hands `value` to the oldest sleeper that is still listening.
    fn wake_one(&mut self, value: usize) {
        while !self.sleepers.is_empty() {
            let s = self.sleepers.remove(0);
            if s.reply.send(Ok(value)).is_ok() {
                return;
            }
        }
    }

    fn wake_all(&mut self, value: usize) {
        for s in self.sleepers.drain(..) {
            // A killed caller dropped its receiver.
            let _ = s.reply.send(Ok(value));
        }
    }

    /// Wakes the sleeper with the earliest expired deadline.
    fn expire(&mut self) {
        let now = self.timer.now_ns();
        let due = self
            .sleepers
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.deadline.filter(|&d| d <= now).map(|d| (d, i)))
            .min();
        if let Some((_, i)) = due {
            let s = self.sleepers.remove(i);
            let _ = s.reply.send(Ok(0));
        }
    }

    async fn serve(&mut self, msg: Message) {
        let Message { cmd, reply } = msg;
        let res = match cmd {
            Command::Sleep {
                word,
                expected,
                deadline,
            } => {
                if word.load() != expected {
                    Ok(0)
                } else if self.sleepers.len() >= self.cap
                    || (deadline.is_some() && self.timed() >= self.cap)
                {
                    Err(Errno::ENOMEM)
                } else {
                    self.sleepers.push(Sleeper { reply, deadline });
                    return;
                }
            }
            Command::Wake { n: 1 } => {
                self.wake_one(0);
                Ok(0)
            }
            Command::Wake { n: u32::MAX } => {
                self.wake_all(1);
                Ok(0)
            }
            Command::Wake { .. } => Err(Errno::EINVAL),
            Command::CndGive { other } => self.give(&other).await,
            Command::CndTake { sleepers, bounce } => {
                if self.sleepers.len() + sleepers.len() > self.cap {
                    let _ = bounce.send(sleepers);
                    Err(Errno::ENOMEM)
                } else {
                    self.sleepers.extend(sleepers);
                    Ok(0)
                }
            }
        };
        let _ = reply.send(res);
    }

    /// Moves every sleeper to the futex behind `other`.
    async fn give(&mut self, other: &channel::Sender<Message>) -> KResult<usize> {
        if self.sleepers.is_empty() {
            return Ok(0);
        }
        let (tx, rx) = oneshot::oneshot();
        let (bounce, mut bounced) = oneshot::oneshot();
        let msg = Message {
            cmd: Command::CndTake {
                sleepers: core::mem::take(&mut self.sleepers),
                bounce,
            },
            reply: tx,
        };
        if let Err(msg) = other.send(msg).await {
            if let Command::CndTake { sleepers, .. } = msg.cmd {
                self.sleepers = sleepers;
            }
            return Err(Errno::EINVAL);
        }
        let res = rx.await.unwrap_or(Err(Errno::EINVAL));
        if let Some(sleepers) = bounced.try_recv() {
            self.sleepers = sleepers;
        }
        res
    }

    async fn run(mut self, mut rx: channel::Receiver<Message>) {
        loop {
            let next = match self.next_deadline() {
                Some(deadline) => {
                    let timer = self.timer.clone();
                    match select(rx.recv(), timer.sleep_until(deadline)).await {
                        Either::Left(msg) => msg,
                        Either::Right(()) => {
                            self.expire();
                            continue;
                        }
                    }
                }
                None => rx.recv().await,
            };
            let Some(msg) = next else {
                return;
            };
            self.serve(msg).await;
        }
    }
}

/// Every futex in the system.
pub struct Futexes {
    arbiters: SpinLock<BTreeMap<u64, channel::Sender<Message>>>,
    max: usize,
    waiters: usize,
    channel_depth: usize,
    timer: Arc<Timer>,
}

impl Futexes {
    /// Creates an empty table allowing `max` live futexes of `waiters`
    /// sleepers each, with `channel_depth` queued commands per futex.
    pub fn new(timer: Arc<Timer>, max: usize, waiters: usize, channel_depth: usize) -> Self {
        Self {
            arbiters: SpinLock::named("futexes", BTreeMap::new()),
            max,
            waiters,
            channel_depth: channel_depth.max(1),
            timer,
        }
    }

    /// Number of live futexes.
    pub fn len(&self) -> usize {
        self.arbiters.lock().len()
    }

    /// Returns `true` if no futex has been used yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the arbiter for `key`, spawning it on first use.
    fn arbiter(&self, sched: &dyn Scheduler, key: u64) -> KResult<channel::Sender<Message>> {
        let mut map = self.arbiters.lock();
        if let Some(tx) = map.get(&key) {
            return Ok(tx.clone());
        }
        if map.len() >= self.max {
            return Err(Errno::ENOMEM);
        }
        let (tx, rx) = channel::channel(self.channel_depth);
        map.insert(key, tx.clone());
        drop(map);
        ktrace!("futex: arbiter for {:#x}", key);
        let arbiter = Arbiter {
            sleepers: Vec::new(),
            cap: self.waiters,
            timer: self.timer.clone(),
        };
        sched.spawn(Box::pin(arbiter.run(rx)));
        Ok(tx)
    }

    /// Resolves a user word to its futex.
    fn lookup(
        &self,
        sched: &dyn Scheduler,
        aspace: &AddressSpace,
        va: usize,
    ) -> KResult<(PhysWord, channel::Sender<Message>)> {
        let word = aspace.translate(va).map_err(|e| match e {
            meson_mm::VmError::NoMemory => Errno::ENOMEM,
            _ => Errno::EFAULT,
        })?;
        let tx = self.arbiter(sched, word.paddr())?;
        Ok((word, tx))
    }

    /// Runs one `futex` call. `deadline` is an absolute clock reading in
    /// nanoseconds.
    ///
    /// # Errors
    ///
    /// [`Errno::EINVAL`] for a bad op, misaligned word, past deadline or
    /// bad wake count, [`Errno::EFAULT`] if the word is not mapped,
    /// [`Errno::ENOMEM`] at the futex or sleeper limit, [`Errno::EINTR`]
    /// if killed while waiting.
    #[expect(clippy::too_many_arguments, reason = "mirrors the futex call")]
    pub async fn futex(
        &self,
        sched: &dyn Scheduler,
        aspace: &AddressSpace,
        kill: &KillSignal,
        op: usize,
        uaddr: usize,
        uaddr2: usize,
        val: usize,
        deadline: Option<u64>,
    ) -> KResult<usize> {
        if op > FUTEX_CNDGIVE {
            return Err(Errno::EINVAL);
        }
        if (uaddr | uaddr2) & 3 != 0 {
            return Err(Errno::EINVAL);
        }
        let (word, tx) = self.lookup(sched, aspace, uaddr)?;
        if deadline.is_some_and(|d| d < self.timer.now_ns()) {
            return Err(Errno::EINVAL);
        }
        #[expect(clippy::cast_possible_truncation, reason = "futex values are 32-bit")]
        let aux = val as u32;
        let cmd = match op {
            FUTEX_SLEEP => Command::Sleep {
                word,
                expected: aux,
                deadline,
            },
            FUTEX_WAKE => Command::Wake { n: aux },
            _ => {
                let (_, other) = self.lookup(sched, aspace, uaddr2)?;
                Command::CndGive { other }
            }
        };
        let (reply, rx) = oneshot::oneshot();
        let res = kill
            .killable(async move {
                if tx.send(Message { cmd, reply }).await.is_err() {
                    return Err(Errno::EINVAL);
                }
                rx.await.unwrap_or(Err(Errno::EINVAL))
            })
            .await?;
        if res.is_err() {
            kdebug!("futex: op {} at {:#x} failed: {:?}", op, uaddr, res);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Executor, JoinHandle};
    use meson_mm::{HeapPageProvider, NoShootdown, RegionPerms, USERMIN, VmLimits};

    const WORD: usize = USERMIN;

    struct Rig {
        exec: Arc<Executor>,
        timer: Arc<Timer>,
        futexes: Arc<Futexes>,
        aspace: Arc<AddressSpace>,
    }

    fn rig() -> Rig {
        let provider = Arc::new(HeapPageProvider::new(16));
        let aspace = Arc::new(AddressSpace::new(
            provider,
            Arc::new(NoShootdown),
            VmLimits::UNLIMITED,
        ));
        aspace
            .map_anon(WORD, 4096, RegionPerms::USER | RegionPerms::WRITE, false, true)
            .unwrap();
        let timer = Arc::new(Timer::new(0));
        Rig {
            exec: Arc::new(Executor::new()),
            futexes: Arc::new(Futexes::new(timer.clone(), 4, 10, 4)),
            timer,
            aspace,
        }
    }

    impl Rig {
        fn call(
            &self,
            kill: &Arc<KillSignal>,
            op: usize,
            uaddr: usize,
            val: usize,
            deadline: Option<u64>,
        ) -> JoinHandle<KResult<usize>> {
            let exec = self.exec.clone();
            let futexes = self.futexes.clone();
            let aspace = self.aspace.clone();
            let kill = kill.clone();
            self.exec.spawn_with_handle(async move {
                futexes
                    .futex(&*exec, &aspace, &kill, op, uaddr, 0, val, deadline)
                    .await
            })
        }
    }

    #[test]
    fn sleep_returns_at_once_when_value_changed() {
        let r = rig();
        r.aspace.write_u32(WORD, 5).unwrap();
        let mut h = r.call(&Arc::new(KillSignal::new()), FUTEX_SLEEP, WORD, 4, None);
        r.exec.run_until_stalled();
        assert_eq!(h.try_take(), Some(Ok(0)));
        assert_eq!(r.futexes.len(), 1);
    }

    #[test]
    fn wake_one_wakes_oldest() {
        let r = rig();
        let kill = Arc::new(KillSignal::new());
        let mut a = r.call(&kill, FUTEX_SLEEP, WORD, 0, None);
        r.exec.run_until_stalled();
        let mut b = r.call(&kill, FUTEX_SLEEP, WORD, 0, None);
        r.exec.run_until_stalled();
        let mut w = r.call(&kill, FUTEX_WAKE, WORD, 1, None);
        r.exec.run_until_stalled();
        assert_eq!(w.try_take(), Some(Ok(0)));
        assert_eq!(a.try_take(), Some(Ok(0)));
        assert!(!b.is_finished());

        let mut all = r.call(&kill, FUTEX_WAKE, WORD, u32::MAX as usize, None);
        r.exec.run_until_stalled();
        assert_eq!(all.try_take(), Some(Ok(0)));
        assert_eq!(b.try_take(), Some(Ok(1)));
    }

    #[test]
    fn killed_sleeper_is_skipped() {
        let r = rig();
        let doomed = Arc::new(KillSignal::new());
        let live = Arc::new(KillSignal::new());
        let mut a = r.call(&doomed, FUTEX_SLEEP, WORD, 0, None);
        r.exec.run_until_stalled();
        let mut b = r.call(&live, FUTEX_SLEEP, WORD, 0, None);
        r.exec.run_until_stalled();
        doomed.doom();
        r.exec.run_until_stalled();
        assert_eq!(a.try_take(), Some(Err(Errno::EINTR)));

        let _w = r.call(&live, FUTEX_WAKE, WORD, 1, None);
        r.exec.run_until_stalled();
        assert_eq!(b.try_take(), Some(Ok(0)));
    }

    #[test]
    fn timeout_wakes_with_zero() {
        let r = rig();
        let kill = Arc::new(KillSignal::new());
        let mut a = r.call(&kill, FUTEX_SLEEP, WORD, 0, Some(1_000));
        r.exec.run_until_stalled();
        assert!(!a.is_finished());
        r.timer.advance(1_000);
        r.exec.run_until_stalled();
        assert_eq!(a.try_take(), Some(Ok(0)));
    }

    #[test]
    fn bad_arguments() {
        let r = rig();
        let kill = Arc::new(KillSignal::new());
        let mut op = r.call(&kill, 3, WORD, 0, None);
        let mut align = r.call(&kill, FUTEX_WAKE, WORD + 2, 1, None);
        let mut unmapped = r.call(&kill, FUTEX_WAKE, WORD + 4096, 1, None);
        let mut count = r.call(&kill, FUTEX_WAKE, WORD, 2, None);
        r.timer.advance(10);
        let mut past = r.call(&kill, FUTEX_SLEEP, WORD, 0, Some(5));
        r.exec.run_until_stalled();
        assert_eq!(op.try_take(), Some(Err(Errno::EINVAL)));
        assert_eq!(align.try_take(), Some(Err(Errno::EINVAL)));
        assert_eq!(unmapped.try_take(), Some(Err(Errno::EFAULT)));
        assert_eq!(count.try_take(), Some(Err(Errno::EINVAL)));
        assert_eq!(past.try_take(), Some(Err(Errno::EINVAL)));
    }

    #[test]
    fn sleeper_limit() {
        let r = rig();
        let kill = Arc::new(KillSignal::new());
        let sleepers: Vec<_> = (0..10)
            .map(|_| r.call(&kill, FUTEX_SLEEP, WORD, 0, None))
            .collect();
        r.exec.run_until_stalled();
        let mut extra = r.call(&kill, FUTEX_SLEEP, WORD, 0, None);
        r.exec.run_until_stalled();
        assert_eq!(extra.try_take(), Some(Err(Errno::ENOMEM)));
        drop(sleepers);
    }

    #[test]
    fn cndgive_moves_sleepers() {
        let r = rig();
        let kill = Arc::new(KillSignal::new());
        let mutex = WORD + 8;
        let mut a = r.call(&kill, FUTEX_SLEEP, WORD, 0, None);
        r.exec.run_until_stalled();
        let mut give = {
            let exec = r.exec.clone();
            let futexes = r.futexes.clone();
            let aspace = r.aspace.clone();
            let kill = kill.clone();
            r.exec.spawn_with_handle(async move {
                futexes
                    .futex(&*exec, &aspace, &kill, FUTEX_CNDGIVE, WORD, mutex, 0, None)
                    .await
            })
        };
        r.exec.run_until_stalled();
        assert_eq!(give.try_take(), Some(Ok(0)));
        assert!(!a.is_finished());

        // Waking the condition finds nobody; waking the mutex finds `a`.
        let _w = r.call(&kill, FUTEX_WAKE, WORD, 1, None);
        r.exec.run_until_stalled();
        assert!(!a.is_finished());
        let _w = r.call(&kill, FUTEX_WAKE, mutex, 1, None);
        r.exec.run_until_stalled();
        assert_eq!(a.try_take(), Some(Ok(0)));
    }

    #[test]
    fn futex_limit() {
        let r = rig();
        let kill = Arc::new(KillSignal::new());
        let hs: Vec<_> = (0..5)
            .map(|i| r.call(&kill, FUTEX_WAKE, WORD + 4 * i, 1, None))
            .collect();
        r.exec.run_until_stalled();
        let results: Vec<_> = hs.into_iter().map(|mut h| h.try_take()).collect();
        assert_eq!(results[3], Some(Ok(0)));
        assert_eq!(results[4], Some(Err(Errno::ENOMEM)));
    }
}

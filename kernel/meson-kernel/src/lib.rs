//! Meson syscall execution core.
//!
//! [`Kernel`] owns every system-wide table: the admission budget, the
//! process table, the futex and socket registries and the pipe limit. A
//! platform layer hands it a trapped thread through [`Kernel::syscall`] and
//! resumes (or drops) the thread according to the returned
//! [`SyscallOutcome`]. The filesystem, the page allocator, the TLB and the
//! thread scheduler are reached only through the traits in [`fs`],
//! [`meson_mm`] and [`sched`], so the whole core runs on the host under
//! `cargo test`.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod admission;
pub mod config;
pub mod errno;
pub mod exec;
pub mod fd;
pub mod fs;
pub mod futex;
pub mod net;
pub mod pipe;
pub mod poll;
pub mod proc;
pub mod sched;
pub mod syscall;
pub mod uio;

#[cfg(test)]
mod testing;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use meson_mm::{AddressSpace, PageProvider, TlbShootdown, VmLimits};

use crate::admission::{Admission, Quota};
use crate::config::KernelConfig;
use crate::errno::KResult;
use crate::fd::FdTable;
use crate::fs::{Cwd, FileService};
use crate::futex::Futexes;
use crate::net::UnixNet;
use crate::proc::{ProcTable, Process, ProcessInit, Thread, TrapFrame};
use crate::sched::{Scheduler, Timer};

pub use meson_core::log::LogLevel;
pub use meson_core::{kdebug, kerr, kfatal, kinfo, klog, ktrace, kwarn};
pub use meson_core::{kprint, kprintln};
pub use syscall::SyscallOutcome;

/// The syscall core and every table it owns.
pub struct Kernel {
    config: KernelConfig,
    admission: Arc<Admission>,
    timer: Arc<Timer>,
    futexes: Futexes,
    net: Arc<UnixNet>,
    pipes: Arc<Quota>,
    procs: ProcTable,
    fs: Arc<dyn FileService>,
    sched: Arc<dyn Scheduler>,
    provider: Arc<dyn PageProvider>,
    tlb: Arc<dyn TlbShootdown>,
}

impl Kernel {
    /// Builds the core around its collaborators. The clock starts at 0.
    pub fn new(
        config: KernelConfig,
        fs: Arc<dyn FileService>,
        sched: Arc<dyn Scheduler>,
        provider: Arc<dyn PageProvider>,
        tlb: Arc<dyn TlbShootdown>,
    ) -> Self {
        let timer = Arc::new(Timer::new(0));
        kdebug!(
            "kernel: heap budget {} bytes, {} processes",
            config.heap_budget,
            config.max_procs
        );
        Self {
            admission: Arc::new(Admission::new(config.heap_budget)),
            futexes: Futexes::new(
                timer.clone(),
                config.max_futexes,
                config.futex_waiters,
                config.futex_channel,
            ),
            net: UnixNet::new(fs.clone(), config.max_sockets),
            pipes: Arc::new(Quota::new(config.max_pipes)),
            procs: ProcTable::new(config.max_procs),
            timer,
            config,
            fs,
            sched,
            provider,
            tlb,
        }
    }

    /// The configuration the kernel was built with.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The heap admission budget.
    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    /// The kernel clock.
    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    /// The process table.
    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    /// The futex table.
    pub fn futexes(&self) -> &Futexes {
        &self.futexes
    }

    /// The UNIX-domain socket layer.
    pub fn net(&self) -> &Arc<UnixNet> {
        &self.net
    }

    /// The global pipe limit.
    pub fn pipes(&self) -> &Arc<Quota> {
        &self.pipes
    }

    /// The file service.
    pub fn fs(&self) -> &Arc<dyn FileService> {
        &self.fs
    }

    /// The thread scheduler.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.sched
    }

    /// Advances the clock by `delta_ns`, waking due sleepers. Driven by the
    /// platform tick.
    pub fn tick(&self, delta_ns: u64) -> usize {
        self.timer.advance(delta_ns)
    }

    /// Registers a process with an empty address space, no descriptors and
    /// the root as cwd. Its first thread is not started.
    ///
    /// The limits come from `parent`, or from the configuration for a
    /// process without parent.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOMEM`](crate::errno::Errno::ENOMEM) at the process limit.
    pub fn create_process(
        &self,
        parent: Option<&Arc<Process>>,
        name: &str,
    ) -> KResult<Arc<Thread>> {
        let ulimit = parent.map_or(self.config.ulimit, |p| p.ulimit());
        let aspace = AddressSpace::new(
            self.provider.clone(),
            self.tlb.clone(),
            VmLimits {
                max_pages: ulimit.pages,
                max_regions: ulimit.regions,
            },
        );
        let init = ProcessInit {
            name: String::from(name),
            aspace: Arc::new(aspace),
            fds: Arc::new(FdTable::new()),
            cwd: Cwd::root(),
            ulimit,
        };
        self.procs.create(parent, init, TrapFrame::new())
    }

    /// Creates pid 1 running the program at `path` and hands its thread to
    /// the scheduler.
    ///
    /// # Errors
    ///
    /// Any process creation or exec error. Nothing is left behind.
    pub fn spawn_init(&self, path: &str, args: &[&[u8]]) -> KResult<Arc<Thread>> {
        let thread = self.create_process(None, "init")?;
        let args: Vec<Vec<u8>> = args.iter().map(|a| a.to_vec()).collect();
        let path = fs::path::resolve("/", path);
        if let Err(e) = exec::exec(
            self.fs.as_ref(),
            &thread,
            path,
            &args,
            self.config.ps_per_cycle,
        ) {
            self.procs.terminate(&thread, 0);
            return Err(e);
        }
        kinfo!("kernel: init started as pid {}", thread.process().pid());
        self.sched.start_thread(thread.clone());
        Ok(thread)
    }
}

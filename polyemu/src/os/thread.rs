use crate::registers::RegisterState;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Why a thread is not runnable.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum WaitReason {
    Futex { addr: u64 },
    Sleep { until_ns: u64 },
    Join { tid: u64 },
    Event { handle: u64 },
    Pipe { id: u64 },
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ThreadStatus {
    Runnable,
    Blocked { reason: WaitReason },
    Exited { code: u64 },
}

/// A guest thread. While a thread is current its live registers are in the
/// cpu and `regs` is stale.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct ExecutionContext {
    pub tid: u64,
    pub regs: RegisterState,
    pub status: ThreadStatus,
    /// `CLONE_CHILD_CLEARTID` address, zeroed and futex-woken on exit.
    pub clear_child_tid: u64,
}

impl ExecutionContext {
    pub fn is_runnable(&self) -> bool {
        self.status == ThreadStatus::Runnable
    }
    pub fn is_exited(&self) -> bool {
        matches!(self.status, ThreadStatus::Exited { .. })
    }
}

/// Cooperative round-robin scheduler over guest threads.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Scheduler {
    threads: BTreeMap<u64, ExecutionContext>,
    current: u64,
    next_tid: u64,
}

impl Scheduler {
    pub fn new(main_tid: u64) -> Self {
        let mut threads = BTreeMap::new();
        threads.insert(
            main_tid,
            ExecutionContext {
                tid: main_tid,
                regs: RegisterState::default(),
                status: ThreadStatus::Runnable,
                clear_child_tid: 0,
            },
        );
        Self {
            threads,
            current: main_tid,
            next_tid: main_tid + 1,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn current_mut(&mut self) -> Option<&mut ExecutionContext> {
        self.threads.get_mut(&self.current)
    }

    pub fn get(&self, tid: u64) -> Option<&ExecutionContext> {
        self.threads.get(&tid)
    }

    pub fn get_mut(&mut self, tid: u64) -> Option<&mut ExecutionContext> {
        self.threads.get_mut(&tid)
    }

    pub fn threads(&self) -> impl Iterator<Item = &ExecutionContext> {
        self.threads.values()
    }

    pub fn spawn(&mut self, regs: RegisterState, clear_child_tid: u64) -> u64 {
        let tid = self.next_tid;
        self.next_tid += 1;
        debug!("spawn thread {}", tid);
        self.threads.insert(
            tid,
            ExecutionContext {
                tid,
                regs,
                status: ThreadStatus::Runnable,
                clear_child_tid,
            },
        );
        tid
    }

    pub fn block_current(&mut self, reason: WaitReason) {
        debug!("thread {} blocks on {:?}", self.current, reason);
        if let Some(t) = self.threads.get_mut(&self.current) {
            t.status = ThreadStatus::Blocked { reason };
        }
    }

    pub fn exit(&mut self, tid: u64, code: u64) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.status = ThreadStatus::Exited { code };
        }
    }

    /// Wake up to `count` futex waiters on `addr`, lowest tid first.
    pub fn futex_wake(&mut self, addr: u64, count: u64) -> u64 {
        let mut woken = 0;
        for t in self.threads.values_mut() {
            if woken >= count {
                break;
            }
            if t.status
                == (ThreadStatus::Blocked {
                    reason: WaitReason::Futex { addr },
                })
            {
                t.status = ThreadStatus::Runnable;
                woken += 1;
            }
        }
        woken
    }

    /// Make blocked threads runnable when `ready` says their wait is over.
    pub fn wake_ready(
        &mut self,
        mut ready: impl FnMut(&WaitReason, &BTreeMap<u64, ThreadStatus>) -> bool,
    ) {
        let statuses: BTreeMap<u64, ThreadStatus> = self
            .threads
            .iter()
            .map(|(k, v)| (*k, v.status.clone()))
            .collect();
        for t in self.threads.values_mut() {
            if let ThreadStatus::Blocked { reason } = &t.status {
                if ready(reason, &statuses) {
                    t.status = ThreadStatus::Runnable;
                }
            }
        }
    }

    /// Next runnable thread in round-robin order after the current one; the
    /// current thread itself comes last.
    pub fn next_runnable(&self) -> Option<u64> {
        let after = self
            .threads
            .range(self.current + 1..)
            .chain(self.threads.range(..=self.current));
        after
            .filter(|(_, t)| t.is_runnable())
            .map(|(tid, _)| *tid)
            .next()
    }

    /// Earliest wake-up time among sleeping threads.
    pub fn earliest_sleeper(&self) -> Option<u64> {
        self.threads
            .values()
            .filter_map(|t| match &t.status {
                ThreadStatus::Blocked {
                    reason: WaitReason::Sleep { until_ns },
                } => Some(*until_ns),
                _ => None,
            })
            .min()
    }

    pub fn set_current(&mut self, tid: u64) {
        self.current = tid;
    }

    pub fn live_count(&self) -> usize {
        self.threads.values().filter(|t| !t.is_exited()).count()
    }

    pub fn runnable_count(&self) -> usize {
        self.threads.values().filter(|t| t.is_runnable()).count()
    }
}

#[cfg(test)]
mod test {
    use super::{Scheduler, ThreadStatus, WaitReason};
    use crate::registers::RegisterState;

    #[test]
    fn test_round_robin_and_futex() {
        let mut s = Scheduler::new(100);
        let a = s.spawn(RegisterState::default(), 0);
        let b = s.spawn(RegisterState::default(), 0);
        assert_eq!(s.next_runnable(), Some(a));
        s.set_current(b);
        assert_eq!(s.next_runnable(), Some(100));

        s.block_current(WaitReason::Futex { addr: 0x10 });
        s.set_current(a);
        s.block_current(WaitReason::Futex { addr: 0x10 });
        s.set_current(100);
        s.block_current(WaitReason::Join { tid: a });
        assert_eq!(s.next_runnable(), None);

        assert_eq!(s.futex_wake(0x10, 1), 1);
        assert!(s.get(a).unwrap().is_runnable());
        assert!(!s.get(b).unwrap().is_runnable());

        s.exit(a, 0);
        s.wake_ready(|r, st| match r {
            WaitReason::Join { tid } => matches!(st.get(tid), Some(ThreadStatus::Exited { .. })),
            _ => false,
        });
        assert!(s.get(100).unwrap().is_runnable());
        assert_eq!(s.live_count(), 2);
    }
}

//! Warp: 32 threads executing the SIMT access state machine of spec.md
//! §4.5. Grounded in `original_source/src/include/Warp.hpp` (`AccessThread`,
//! `Thread_State`) and `original_source/src/SM.cpp`'s per-warp loop. The
//! teacher's `warp.rs` donates the `Warp` struct name, not its
//! register-file/program-counter body — a warp here tracks page-touch
//! bookkeeping, not instruction execution.

use std::collections::VecDeque;

use crate::ids::WarpId;
use crate::request::{AccessKind, Kernel, MemoryAccess, Request, WarpRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Idle,
    Busy,
    Waiting,
}

/// One lane of a warp: a read cursor into a bound `Request`, plus whatever
/// `MemoryAccess` it's currently waiting on.
pub struct AccessThread {
    pub read_index: usize,
    pub request: Option<Request>,
    pub access: Option<MemoryAccess>,
    pub state: ThreadState,
}

impl AccessThread {
    fn new() -> Self {
        AccessThread {
            read_index: 0,
            request: None,
            access: None,
            state: ThreadState::Idle,
        }
    }
}

pub struct Warp {
    pub warp_id: WarpId,
    pub threads: Vec<AccessThread>,
    /// Available for block assignment (not currently owned by any block).
    pub idle: bool,
    pub busy: bool,
    pub record: WarpRecord,
    /// Accesses emitted this tick, collected by the SM's round-robin pass
    /// into the GMMU (`warp_to_gmmu_queue`).
    pub outbox: VecDeque<MemoryAccess>,
    /// Accesses the GMMU has returned, delivered by the SM before this
    /// warp's step (`gmmu_to_sm_queue`).
    pub inbox: VecDeque<MemoryAccess>,
}

impl Warp {
    pub fn new(warp_id: WarpId, threads_per_warp: u32) -> Self {
        Warp {
            warp_id,
            threads: (0..threads_per_warp).map(|_| AccessThread::new()).collect(),
            idle: true,
            busy: false,
            record: WarpRecord { warp_id, ..WarpRecord::default() },
            outbox: VecDeque::new(),
            inbox: VecDeque::new(),
        }
    }

    pub fn reset_for_block(&mut self, start_cycle: u64) {
        self.idle = false;
        self.record = WarpRecord { warp_id: self.warp_id, start_cycle, ..WarpRecord::default() };
    }

    /// Step 1 (§4.5): drain returned accesses, waking the matching thread.
    fn drain_returns(&mut self) {
        while let Some(access) = self.inbox.pop_front() {
            if let Some(thread) = self
                .threads
                .iter_mut()
                .find(|t| t.state == ThreadState::Waiting && t.access.as_ref().map(|a| a.request_id) == Some(access.request_id) && matches!(t.access.as_ref(), Some(a) if a.kind == access.kind))
            {
                self.record.wait_cycles += 0; // bookkeeping hook for future wait-cycle accounting
                thread.access = None;
                let has_more_writes = thread.request.as_ref().map(|r| !r.write_pages.is_empty()).unwrap_or(false);
                if has_more_writes {
                    thread.state = ThreadState::Busy;
                } else {
                    thread.request = None;
                    thread.state = ThreadState::Idle;
                }
            }
        }
    }

    /// Steps 2-4: recompute busy, dispatch new requests at the sync
    /// barrier, and emit the next access for every busy thread.
    pub fn step(
        &mut self,
        kernel: &mut Kernel,
        sm_id: u32,
        block_id: u64,
        max_access_per_request: u32,
    ) {
        self.drain_returns();

        self.busy = !kernel.requests.is_empty() || self.threads.iter().any(|t| t.state != ThreadState::Idle);
        if !self.busy {
            return;
        }

        let all_idle = self.threads.iter().all(|t| t.state == ThreadState::Idle);
        if all_idle {
            for thread in self.threads.iter_mut() {
                if let Some(req) = kernel.requests.pop_front() {
                    thread.read_index = 0;
                    thread.request = Some(req);
                    thread.state = ThreadState::Busy;
                }
            }
        }

        for thread in self.threads.iter_mut() {
            if thread.state != ThreadState::Busy {
                continue;
            }
            let mut read_index = thread.read_index;
            let Some(request) = thread.request.as_mut() else { continue };

            let emitted = if read_index < request.read_pages.len() {
                let mut page_ids = Vec::new();
                while page_ids.len() < max_access_per_request as usize && read_index < request.read_pages.len() {
                    let touch = &mut request.read_pages[read_index];
                    page_ids.push(touch.page_id);
                    touch.remaining_touches -= 1;
                    if touch.remaining_touches == 0 {
                        read_index += 1;
                    }
                }
                thread.read_index = read_index;
                Some((AccessKind::Read, page_ids))
            } else if request.num_instructions > 0 {
                request.num_instructions -= 1;
                None
            } else if !request.write_pages.is_empty() {
                let mut page_ids = Vec::new();
                while page_ids.len() < max_access_per_request as usize && !request.write_pages.is_empty() {
                    let touch = request.write_pages.front_mut().unwrap();
                    page_ids.push(touch.page_id);
                    touch.remaining_touches -= 1;
                    if touch.remaining_touches == 0 {
                        request.write_pages.remove(0);
                    }
                }
                Some((AccessKind::Write, page_ids))
            } else {
                thread.request = None;
                thread.state = ThreadState::Idle;
                None
            };

            if let Some((kind, page_ids)) = emitted {
                let access = MemoryAccess {
                    model_id: kernel.model_id,
                    app_id: kernel.app_id,
                    sm_id,
                    block_id,
                    warp_id: self.warp_id,
                    request_id: request.request_id,
                    kind,
                    page_ids,
                };
                self.record.compute_cycles += 1;
                self.outbox.push_back(access);
                thread.state = ThreadState::Waiting;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::LayerId;
    use crate::request::Request;

    fn kernel_with_one_request() -> Kernel {
        let mut k = Kernel::new(0, 0, 0, 0 as LayerId);
        k.requests.push_back(Request::new(1, vec![100], vec![200], 0));
        k
    }

    #[test]
    fn dispatch_then_emit_read_access() {
        let mut warp = Warp::new(0, 2);
        let mut kernel = kernel_with_one_request();
        warp.step(&mut kernel, 0, 0, 4);
        assert!(warp.busy);
        assert_eq!(warp.outbox.len(), 1);
        let access = warp.outbox.front().unwrap();
        assert_eq!(access.kind, AccessKind::Read);
        assert_eq!(access.page_ids, vec![100]);
    }

    #[test]
    fn returning_read_then_write_then_idle() {
        let mut warp = Warp::new(0, 1);
        let mut kernel = kernel_with_one_request();
        warp.step(&mut kernel, 0, 0, 4);
        let access = warp.outbox.pop_front().unwrap();
        warp.inbox.push_back(access);
        warp.step(&mut kernel, 0, 0, 4); // drains return -> Busy (write pending), dispatches write
        assert_eq!(warp.outbox.len(), 1);
        assert_eq!(warp.outbox.front().unwrap().kind, AccessKind::Write);

        let access = warp.outbox.pop_front().unwrap();
        warp.inbox.push_back(access);
        warp.step(&mut kernel, 0, 0, 4); // drains return -> Idle, request freed
        assert!(!warp.busy);
    }
}

//! Page-ID Readback
//!
//! Tracks the single asynchronous copy of the page-ID buffer back to the
//! host. Completions arrive on a crossbeam channel and are consumed at the
//! start of a frame; every request carries a ticket so a completion that
//! shows up after its request was abandoned is recognised and dropped.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use glam::UVec2;

use crate::gpu::{GpuDevice, ReadbackCompletion, ReadbackRequest, ReadbackTicket};

/// Result of waiting one more frame for the in-flight readback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadbackWait {
    Waiting,
    TimedOut,
}

#[derive(Debug)]
pub struct ReadbackTracker {
    sender: Sender<ReadbackCompletion>,
    receiver: Receiver<ReadbackCompletion>,
    next_ticket: u64,
    in_flight: Option<ReadbackTicket>,
    waited_frames: u32,
    timeout_frames: u32,
    stale_discarded: u64,
}

impl ReadbackTracker {
    pub fn new(timeout_frames: u32) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            next_ticket: 1,
            in_flight: None,
            waited_frames: 0,
            timeout_frames,
            stale_discarded: 0,
        }
    }

    pub fn in_flight(&self) -> Option<ReadbackTicket> {
        self.in_flight
    }

    /// Completions dropped because their request had been abandoned
    pub fn stale_discarded(&self) -> u64 {
        self.stale_discarded
    }

    /// Issue a non-blocking readback of the page-ID buffer
    pub fn request(&mut self, device: &mut impl GpuDevice, buffer_size: UVec2) -> ReadbackTicket {
        let _span = tracing::trace_span!("vt.request_readback").entered();
        if let Some(previous) = self.in_flight {
            log::debug!("Readback {previous:?} superseded before completing");
        }

        let ticket = ReadbackTicket(self.next_ticket);
        self.next_ticket += 1;
        self.in_flight = Some(ticket);
        self.waited_frames = 0;

        device.request_page_id_readback(ReadbackRequest {
            ticket,
            buffer_size,
            completion: self.sender.clone(),
        });
        ticket
    }

    /// Take the completion of the in-flight request, if it arrived
    ///
    /// A completion with the error flag yields an empty readback.
    pub fn take_completion(&mut self) -> Option<Vec<u32>> {
        let mut result = None;
        for completion in self.receiver.try_iter() {
            if self.in_flight != Some(completion.ticket) {
                self.stale_discarded += 1;
                log::debug!("Discarding stale readback {:?}", completion.ticket);
                continue;
            }

            self.in_flight = None;
            result = Some(if completion.has_error {
                log::warn!("Readback {:?} completed with an error, treating it as empty", completion.ticket);
                Vec::new()
            } else {
                completion.data
            });
        }
        result
    }

    /// Count one more frame spent waiting
    pub fn tick(&mut self) -> ReadbackWait {
        self.waited_frames += 1;
        if self.waited_frames > self.timeout_frames {
            log::warn!(
                "Readback {:?} timed out after {} frames",
                self.in_flight,
                self.waited_frames - 1
            );
            self.abandon();
            return ReadbackWait::TimedOut;
        }
        ReadbackWait::Waiting
    }

    /// Stop waiting; a late completion will be discarded
    pub fn abandon(&mut self) {
        self.in_flight = None;
        self.waited_frames = 0;
    }

    /// Wait up to `max_wait` for the in-flight readback, polling the device
    ///
    /// Returns false if it had to give up.
    pub fn drain(&mut self, device: &mut impl GpuDevice, max_wait: Duration) -> bool {
        if self.in_flight.is_none() {
            return true;
        }

        let start = Instant::now();
        loop {
            device.poll();
            if self.take_completion().is_some() {
                return true;
            }
            if start.elapsed() >= max_wait {
                log::warn!("Gave up waiting for readback {:?} after {:?}", self.in_flight, max_wait);
                self.abandon();
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

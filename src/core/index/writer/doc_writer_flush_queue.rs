// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::core::index::writer::{
    DocumentsWriterDeleteQueue, DocumentsWriterPerThread, FlushedSegment, FrozenBufferedUpdates,
};
use crate::error::Result;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Receives the tickets of the flush queue in creation order.
pub trait FlushTicketPublisher {
    /// Publishes a flushed segment together with its private deletes and the
    /// global deletes frozen when its flush started.
    fn publish_flushed_segment(
        &self,
        segment: FlushedSegment,
        global_packet: Option<FrozenBufferedUpdates>,
    ) -> Result<()>;

    fn publish_frozen_updates(&self, packet: FrozenBufferedUpdates) -> Result<()>;
}

pub type FlushTicketRef = Arc<Mutex<FlushTicket>>;

/// Orders concurrently finishing flushes: tickets are created when a flush
/// starts and published strictly in that order, each once it is filled in.
pub struct DocumentsWriterFlushQueue {
    queue: Mutex<VecDeque<FlushTicketRef>>,
    // we track tickets separately since count must be present even before the ticket is
    // constructed ie. queue.size would not reflect it.
    ticket_count: AtomicU32,
    purge_lock: Mutex<()>,
}

impl Default for DocumentsWriterFlushQueue {
    fn default() -> Self {
        DocumentsWriterFlushQueue {
            queue: Mutex::new(VecDeque::new()),
            ticket_count: AtomicU32::new(0),
            purge_lock: Mutex::new(()),
        }
    }
}

impl DocumentsWriterFlushQueue {
    /// Freezes the global deletes of `delete_queue` into a ticket of its own.
    pub fn add_deletes(&self, delete_queue: &DocumentsWriterDeleteQueue) -> Result<()> {
        let mut queue = self.queue.lock()?;
        // first inc the ticket count - freeze opens a window for any_change() to fail
        self.inc_tickets();
        match delete_queue.freeze_global_buffer(None) {
            Ok(frozen_updates) => {
                queue.push_back(Arc::new(Mutex::new(FlushTicket::Global(
                    GlobalDeletesTicket::new(frozen_updates),
                ))));
                Ok(())
            }
            Err(e) => {
                self.dec_tickets();
                Err(e)
            }
        }
    }

    pub fn has_tickets(&self) -> bool {
        self.ticket_count.load(Ordering::Acquire) > 0
    }

    fn inc_tickets(&self) {
        self.ticket_count.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_tickets(&self) {
        self.ticket_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn ticket_count(&self) -> u32 {
        self.ticket_count.load(Ordering::Acquire)
    }

    /// Enqueues the ticket of a flush that is about to start. The global
    /// deletes are frozen in the same critical section so every ticket
    /// carries exactly the deletes that arrived before it.
    pub fn add_flush_ticket(&self, dwpt: &mut DocumentsWriterPerThread) -> Result<FlushTicketRef> {
        let mut queue = self.queue.lock()?;
        self.inc_tickets();
        match dwpt.prepare_flush() {
            Ok(update) => {
                let ticket = Arc::new(Mutex::new(FlushTicket::Segment(Box::new(
                    SegmentFlushTicket::new(update),
                ))));
                queue.push_back(Arc::clone(&ticket));
                Ok(ticket)
            }
            Err(e) => {
                self.dec_tickets();
                Err(e)
            }
        }
    }

    /// Fills in the result of a flush. A flush that produced no segment
    /// publishes like a failed one.
    pub fn add_segment(&self, ticket: &FlushTicketRef, segment: Option<FlushedSegment>) -> Result<()> {
        let _queue = self.queue.lock()?;
        let mut ticket = ticket.lock()?;
        match segment {
            Some(segment) => ticket.set_segment(segment),
            None => ticket.set_failed(),
        }
        Ok(())
    }

    pub fn mark_ticket_failed(&self, ticket: &FlushTicketRef) -> Result<()> {
        let _queue = self.queue.lock()?;
        ticket.lock()?.set_failed();
        Ok(())
    }

    /// Publishes every publishable ticket at the head of the queue, waiting
    /// for a concurrent purge to finish first.
    pub fn force_purge(&self, publisher: &dyn FlushTicketPublisher) -> Result<u32> {
        let _lock = self.purge_lock.lock()?;
        self.inner_purge(publisher)
    }

    /// Like `force_purge` but returns at once if another thread is purging.
    pub fn try_purge(&self, publisher: &dyn FlushTicketPublisher) -> Result<u32> {
        match self.purge_lock.try_lock() {
            Ok(_l) => self.inner_purge(publisher),
            _ => Ok(0),
        }
    }

    fn inner_purge(&self, publisher: &dyn FlushTicketPublisher) -> Result<u32> {
        let mut num_purged = 0u32;
        loop {
            let head = {
                let queue = self.queue.lock()?;
                let head = match queue.front() {
                    Some(head) => Arc::clone(head),
                    None => break,
                };
                if !head.lock()?.can_publish() {
                    break;
                }
                head
            };
            // if we block on publish -> lock IW -> lock BufferedDeletes we don't block
            // concurrent segment flushes just because they want to append to the queue.
            // the downside is that we need to force a purge on full flush since there could
            // be a ticket still in the queue.
            let res = head.lock()?.publish(publisher);

            let mut queue = self.queue.lock()?;
            let polled = queue.pop_front();
            debug_assert!(polled.map(|p| Arc::ptr_eq(&p, &head)).unwrap_or(false));
            self.dec_tickets();
            num_purged += 1;
            res?;
        }
        Ok(num_purged)
    }
}

pub struct GlobalDeletesTicket {
    frozen_updates: Option<FrozenBufferedUpdates>,
}

impl GlobalDeletesTicket {
    pub fn new(frozen_updates: FrozenBufferedUpdates) -> Self {
        GlobalDeletesTicket {
            frozen_updates: Some(frozen_updates),
        }
    }
}

pub struct SegmentFlushTicket {
    frozen_updates: Option<FrozenBufferedUpdates>,
    segment: Option<FlushedSegment>,
    failed: bool,
}

impl SegmentFlushTicket {
    pub fn new(frozen_updates: FrozenBufferedUpdates) -> Self {
        SegmentFlushTicket {
            frozen_updates: Some(frozen_updates),
            segment: None,
            failed: false,
        }
    }
}

pub enum FlushTicket {
    Global(GlobalDeletesTicket),
    Segment(Box<SegmentFlushTicket>),
}

impl FlushTicket {
    fn set_segment(&mut self, segment: FlushedSegment) {
        if let FlushTicket::Segment(s) = self {
            debug_assert!(!s.failed);
            s.segment = Some(segment);
        }
    }

    fn set_failed(&mut self) {
        if let FlushTicket::Segment(s) = self {
            debug_assert!(s.segment.is_none());
            s.failed = true;
        }
    }

    pub fn can_publish(&self) -> bool {
        match self {
            FlushTicket::Global(_) => true,
            FlushTicket::Segment(s) => s.segment.is_some() || s.failed,
        }
    }

    fn publish(&mut self, publisher: &dyn FlushTicketPublisher) -> Result<()> {
        let (segment, frozen_updates) = match self {
            FlushTicket::Global(g) => (None, g.frozen_updates.take()),
            FlushTicket::Segment(s) => (s.segment.take(), s.frozen_updates.take()),
        };
        // Finish the flushed segment and publish it to IndexWriter
        match segment {
            Some(segment) => {
                debug!(
                    "DW: publish flushed segment {} seg-private updates={:?}",
                    segment.segment_info.name(),
                    segment.segment_updates.as_ref().map(|su| su.to_string())
                );
                publisher.publish_flushed_segment(segment, frozen_updates)
            }
            None => match frozen_updates {
                // a failed flush still carries the global deletes frozen for it
                Some(update) if update.any() => publisher.publish_frozen_updates(update),
                _ => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::doc::Term;
    use crate::core::index::reader::write_segment;
    use crate::core::store::{Directory, RAMDirectory};

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<String>>,
    }

    impl FlushTicketPublisher for RecordingPublisher {
        fn publish_flushed_segment(
            &self,
            segment: FlushedSegment,
            global_packet: Option<FrozenBufferedUpdates>,
        ) -> Result<()> {
            let deletes = global_packet.map(|p| p.num_term_deletes).unwrap_or(0);
            self.events
                .lock()?
                .push(format!("{}+{}", segment.segment_info.name(), deletes));
            Ok(())
        }

        fn publish_frozen_updates(&self, packet: FrozenBufferedUpdates) -> Result<()> {
            self.events
                .lock()?
                .push(format!("deletes+{}", packet.num_term_deletes));
            Ok(())
        }
    }

    fn flushed(dir: &Arc<dyn Directory>, name: &str) -> Result<FlushedSegment> {
        Ok(FlushedSegment {
            segment_info: write_segment(dir, name, 2)?,
            segment_updates: None,
            live_docs: None,
            del_count: 0,
        })
    }

    fn segment_ticket(queue: &DocumentsWriterFlushQueue, deletes: &DocumentsWriterDeleteQueue) -> Result<FlushTicketRef> {
        // the same path as add_flush_ticket, without a builder
        let mut guard = queue.queue.lock()?;
        queue.inc_tickets();
        let ticket = Arc::new(Mutex::new(FlushTicket::Segment(Box::new(
            SegmentFlushTicket::new(deletes.freeze_global_buffer(None)?),
        ))));
        guard.push_back(Arc::clone(&ticket));
        Ok(ticket)
    }

    #[test]
    fn test_tickets_publish_in_creation_order() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let deletes = DocumentsWriterDeleteQueue::default();
        let queue = DocumentsWriterFlushQueue::default();
        let publisher = RecordingPublisher::default();

        deletes.add_delete_terms(vec![Term::from_text("id", "1")]);
        let first = segment_ticket(&queue, &deletes)?;
        let second = segment_ticket(&queue, &deletes)?;
        assert_eq!(queue.ticket_count(), 2);

        // the later flush finishes first but has to wait for the head
        queue.add_segment(&second, Some(flushed(&dir, "_1")?))?;
        assert_eq!(queue.force_purge(&publisher)?, 0);
        assert!(publisher.events.lock()?.is_empty());

        queue.add_segment(&first, Some(flushed(&dir, "_0")?))?;
        assert_eq!(queue.force_purge(&publisher)?, 2);
        assert_eq!(*publisher.events.lock()?, vec!["_0+1", "_1+0"]);
        assert!(!queue.has_tickets());
        Ok(())
    }

    #[test]
    fn test_failed_ticket_publishes_global_deletes() -> Result<()> {
        let deletes = DocumentsWriterDeleteQueue::default();
        let queue = DocumentsWriterFlushQueue::default();
        let publisher = RecordingPublisher::default();

        deletes.add_delete_terms(vec![Term::from_text("id", "1"), Term::from_text("id", "2")]);
        let failed = segment_ticket(&queue, &deletes)?;
        deletes.add_delete_terms(vec![Term::from_text("id", "3")]);
        queue.add_deletes(&deletes)?;
        // an empty delete ticket publishes nothing
        queue.add_deletes(&deletes)?;

        queue.mark_ticket_failed(&failed)?;
        assert_eq!(queue.try_purge(&publisher)?, 3);
        assert_eq!(*publisher.events.lock()?, vec!["deletes+2", "deletes+1"]);
        Ok(())
    }
}

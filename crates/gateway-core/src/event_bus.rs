//! Cooperative single-threaded event queue
//!
//! `enqueue` never blocks; urgent events jump the queue. Handlers run from
//! `drain` in FIFO order and may enqueue new events, which are picked up
//! after the current batch. Handlers must not recurse into `drain`.

use std::collections::VecDeque;

use crate::event::{Event, EventDataRef};

const MAX_EVENT_DATA_BUFFERS: usize = 64;
const MAX_EVENT_DATA_SIZE: usize = 256;

struct DataSlot {
    generation: u16,
    data: [u8; MAX_EVENT_DATA_SIZE],
}

/// The bus plus its bounded inline-data ring.
pub struct EventBus {
    queue: VecDeque<Event>,
    slots: Vec<DataSlot>,
    slot_iter: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_EVENT_DATA_BUFFERS);
        for _ in 0..MAX_EVENT_DATA_BUFFERS {
            slots.push(DataSlot { generation: 0, data: [0; MAX_EVENT_DATA_SIZE] });
        }
        Self { queue: VecDeque::new(), slots, slot_iter: 0 }
    }

    /// Enqueues an event; urgent events are pushed to the front.
    pub fn enqueue(&mut self, event: Event) {
        if event.is_urgent() {
            self.queue.push_front(event);
        } else {
            self.queue.push_back(event);
        }
    }

    /// Enqueues an event carrying an inline data payload.
    ///
    /// The payload is copied into the next ring slot; the slot's generation
    /// is bumped so stale references are detectable.
    pub fn enqueue_with_data(&mut self, event: Event, data: &[u8]) {
        assert!(!data.is_empty() && data.len() <= MAX_EVENT_DATA_SIZE);

        self.slot_iter = (self.slot_iter + 1) % MAX_EVENT_DATA_BUFFERS;
        let slot = &mut self.slots[self.slot_iter];
        slot.generation = slot.generation.wrapping_add(1);
        slot.data[..data.len()].copy_from_slice(data);

        let data_ref = EventDataRef {
            index: self.slot_iter as u16,
            generation: slot.generation,
            size: data.len() as u16,
        };

        self.enqueue(event.with_data(data_ref));
    }

    /// Copies the payload referenced by \p event out of the ring.
    ///
    /// Returns `None` if the event carries no data or the slot has been
    /// reused since (generation mismatch).
    #[must_use]
    pub fn event_data(&self, event: &Event) -> Option<&[u8]> {
        let data_ref = event.data_ref()?;
        let slot = self.slots.get(usize::from(data_ref.index))?;

        if slot.generation != data_ref.generation {
            return None;
        }

        Some(&slot.data[..usize::from(data_ref.size)])
    }

    /// Pops the next event, honoring FIFO order.
    pub fn pop(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains the queue, dispatching every event to \p handler. Events the
    /// handler enqueues are processed after the current batch.
    pub fn drain(&mut self, mut handler: impl FnMut(&mut EventBus, &Event)) {
        // bound the loop: a handler that enqueues per event must not spin us
        let mut budget = self.queue.len().max(1) * 64;

        while let Some(event) = self.pop() {
            handler(self, &event);

            budget -= 1;
            if budget == 0 {
                tracing::warn!("event bus drain budget exhausted, {} left", self.queue.len());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::REVENT_POLL;
    use crate::resource::R_DEVICES;

    fn ev(num: i64) -> Event {
        Event::new(R_DEVICES, REVENT_POLL, num, 0)
    }

    #[test]
    fn fifo_order_with_urgent_preemption() {
        let mut bus = EventBus::new();
        bus.enqueue(ev(1));
        bus.enqueue(ev(2));
        let mut urgent = ev(3);
        urgent.set_urgent(true);
        bus.enqueue(urgent);

        let order: Vec<i64> = std::iter::from_fn(|| bus.pop()).map(|e| e.num()).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn handlers_may_enqueue_followups() {
        let mut bus = EventBus::new();
        bus.enqueue(ev(1));

        let mut seen = Vec::new();
        bus.drain(|bus, event| {
            seen.push(event.num());
            if event.num() == 1 {
                bus.enqueue(ev(2));
            }
        });

        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn data_ring_generation_is_verified() {
        let mut bus = EventBus::new();
        bus.enqueue_with_data(ev(0), b"payload");
        let event = bus.pop().unwrap();
        assert_eq!(bus.event_data(&event), Some(&b"payload"[..]));

        // overwrite every slot so the generation moves on
        for _ in 0..64 {
            bus.enqueue_with_data(ev(0), b"x");
        }
        assert_eq!(bus.event_data(&event), None);
    }
}

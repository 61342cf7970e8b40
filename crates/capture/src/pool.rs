use crate::channel::{ControlChannel, DequeuedBuffer, MappedRegion};
use crate::error::CaptureError;
use std::{fmt, mem};

/// Which side may touch a buffer right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Queued on the device; may be written by the driver at any time.
    Device,
    /// Dequeued; readable by the process until it is queued again.
    Consumer,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Device => f.write_str("device"),
            Owner::Consumer => f.write_str("consumer"),
        }
    }
}

/// Read-only view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub index: u32,
    pub length: usize,
    pub owner: Owner,
}

struct Slot<R> {
    owner: Owner,
    region: R,
}

/// Fixed set of device buffers mapped into the process, indexed `0..N`.
///
/// [`BufferPool::establish`] and [`BufferPool::release`] are the only places
/// mappings are created or destroyed. A device-owned buffer is never
/// unmapped; stop the stream and [`BufferPool::reclaim_all`] first.
pub struct BufferPool<R: MappedRegion> {
    slots: Vec<Slot<R>>,
}

impl<R: MappedRegion> BufferPool<R> {
    pub fn empty() -> Self {
        Self { slots: Vec::new() }
    }

    /// Maps buffers `0..count` as granted by `request_buffers`.
    ///
    /// If any buffer fails to map, the ones already mapped are unmapped before
    /// the error is returned.
    #[tracing::instrument(skip(channel))]
    pub fn establish<C>(channel: &mut C, count: u32) -> Result<Self, CaptureError>
    where
        C: ControlChannel<Region = R>,
    {
        let mut pool = Self {
            slots: Vec::with_capacity(count as usize),
        };

        for index in 0..count {
            let mapped = channel
                .query_buffer(index)
                .and_then(|placement| channel.map_buffer(&placement));

            match mapped {
                Ok(region) => {
                    tracing::trace!("Mapped buffer {} ({} bytes)", index, region.len());
                    pool.slots.push(Slot {
                        owner: Owner::Consumer,
                        region,
                    });
                }
                Err(e) => {
                    tracing::error!(
                        "Mapping buffer {} of {} failed, unwinding {} mapped buffer(s): {}",
                        index,
                        count,
                        pool.len(),
                        e
                    );
                    pool.release();
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    /// Unmaps every consumer-owned buffer, continuing past individual failures.
    ///
    /// A buffer still queued on the device is left mapped and reported as an
    /// ownership violation, since the driver may still write into it. Failures
    /// are logged and returned; the pool is empty afterwards either way.
    pub fn release(&mut self) -> Vec<CaptureError> {
        let mut failures = Vec::new();

        for (index, slot) in self.slots.drain(..).enumerate() {
            if slot.owner == Owner::Device {
                let e = CaptureError::OwnershipViolation {
                    index: index as u32,
                    owner: slot.owner,
                    operation: "unmap",
                };
                tracing::warn!("Leaving buffer {} mapped: {}", index, e);
                mem::forget(slot.region);
                failures.push(e);
                continue;
            }

            if let Err(e) = slot.region.unmap() {
                tracing::warn!("Failed to unmap buffer {}: {}", index, e);
                failures.push(e);
            }
        }

        failures
    }

    /// Returns every buffer to the process once the stream is off.
    ///
    /// Stopping the stream dequeues all buffers on the device side, so this
    /// must only follow a successful `set_streaming(false)`.
    pub fn reclaim_all(&mut self) {
        for slot in &mut self.slots {
            slot.owner = Owner::Consumer;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn descriptor(&self, index: u32) -> Option<BufferDescriptor> {
        self.slots.get(index as usize).map(|slot| BufferDescriptor {
            index,
            length: slot.region.len(),
            owner: slot.owner,
        })
    }

    pub fn descriptors(&self) -> impl Iterator<Item = BufferDescriptor> + '_ {
        (0..self.slots.len() as u32).filter_map(|index| self.descriptor(index))
    }

    /// Indices currently held by the process.
    pub fn consumer_owned(&self) -> Vec<u32> {
        self.descriptors()
            .filter(|d| d.owner == Owner::Consumer)
            .map(|d| d.index)
            .collect()
    }

    /// Indices currently queued on the device.
    pub fn device_owned(&self) -> Vec<u32> {
        self.descriptors()
            .filter(|d| d.owner == Owner::Device)
            .map(|d| d.index)
            .collect()
    }

    /// The filled part of a dequeued buffer. `None` unless the process owns it.
    pub fn frame(&self, index: u32, bytes_used: u32) -> Option<&[u8]> {
        let slot = self.slots.get(index as usize)?;
        if slot.owner != Owner::Consumer {
            return None;
        }
        let data = slot.region.as_slice();
        Some(&data[..data.len().min(bytes_used as usize)])
    }

    /// Hands a consumer-owned buffer back to the device.
    pub fn enqueue<C>(&mut self, channel: &mut C, index: u32) -> Result<(), CaptureError>
    where
        C: ControlChannel<Region = R>,
    {
        let slot = self.slot_mut(index)?;
        if slot.owner != Owner::Consumer {
            return Err(CaptureError::OwnershipViolation {
                index,
                owner: slot.owner,
                operation: "enqueue",
            });
        }

        channel.enqueue_buffer(index)?;
        slot.owner = Owner::Device;
        Ok(())
    }

    /// Takes the next filled buffer from the device.
    pub fn dequeue<C>(&mut self, channel: &mut C) -> Result<DequeuedBuffer, CaptureError>
    where
        C: ControlChannel<Region = R>,
    {
        let buffer = channel.dequeue_buffer()?;
        let slot = self.slot_mut(buffer.index)?;
        if slot.owner != Owner::Device {
            return Err(CaptureError::OwnershipViolation {
                index: buffer.index,
                owner: slot.owner,
                operation: "dequeue",
            });
        }

        slot.owner = Owner::Consumer;
        Ok(buffer)
    }

    /// Queues every consumer-owned buffer, as needed before streaming starts.
    pub fn enqueue_all<C>(&mut self, channel: &mut C) -> Result<(), CaptureError>
    where
        C: ControlChannel<Region = R>,
    {
        for index in self.consumer_owned() {
            self.enqueue(channel, index)?;
        }
        Ok(())
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut Slot<R>, CaptureError> {
        let len = self.slots.len();
        self.slots.get_mut(index as usize).ok_or_else(|| {
            CaptureError::StreamStateError(format!(
                "buffer index {} outside pool of {}",
                index, len
            ))
        })
    }
}

impl<R: MappedRegion> Drop for BufferPool<R> {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            tracing::debug!("Releasing {} buffer(s) on drop", self.slots.len());
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, rc::Rc};

    struct HeapRegion {
        data: Vec<u8>,
        unmapped: Rc<Cell<usize>>,
    }

    impl MappedRegion for HeapRegion {
        fn as_slice(&self) -> &[u8] {
            &self.data
        }

        fn unmap(self) -> Result<(), CaptureError> {
            self.unmapped.set(self.unmapped.get() + 1);
            Ok(())
        }
    }

    fn counted_pool(owners: &[Owner]) -> (BufferPool<HeapRegion>, Rc<Cell<usize>>) {
        let unmapped = Rc::new(Cell::new(0));
        let pool = BufferPool {
            slots: owners
                .iter()
                .map(|&owner| Slot {
                    owner,
                    region: HeapRegion {
                        data: vec![7u8; 16],
                        unmapped: unmapped.clone(),
                    },
                })
                .collect(),
        };
        (pool, unmapped)
    }

    fn pool_of(owners: &[Owner]) -> BufferPool<HeapRegion> {
        counted_pool(owners).0
    }

    #[test]
    fn owner_display() {
        assert_eq!(Owner::Device.to_string(), "device");
        assert_eq!(Owner::Consumer.to_string(), "consumer");
    }

    #[test]
    fn frame_is_only_visible_to_its_owner() {
        let pool = pool_of(&[Owner::Device, Owner::Consumer]);
        assert!(pool.frame(0, 16).is_none());
        assert_eq!(pool.frame(1, 4), Some(&[7u8; 4][..]));
        assert!(pool.frame(2, 4).is_none());
    }

    #[test]
    fn frame_clamps_to_buffer_length() {
        let pool = pool_of(&[Owner::Consumer]);
        assert_eq!(pool.frame(0, 1024).map(<[u8]>::len), Some(16));
    }

    #[test]
    fn consumer_owned_lists_held_indices() {
        let pool = pool_of(&[Owner::Consumer, Owner::Device, Owner::Consumer]);
        assert_eq!(pool.consumer_owned(), vec![0, 2]);
        assert_eq!(pool.descriptors().count(), 3);
        assert_eq!(
            pool.descriptor(1),
            Some(BufferDescriptor {
                index: 1,
                length: 16,
                owner: Owner::Device
            })
        );
    }

    #[test]
    fn release_empties_the_pool() {
        let (mut pool, unmapped) = counted_pool(&[Owner::Consumer, Owner::Consumer]);
        assert!(pool.release().is_empty());
        assert!(pool.is_empty());
        assert_eq!(unmapped.get(), 2);
        assert!(pool.release().is_empty());
    }

    #[test]
    fn release_refuses_to_unmap_queued_buffers() {
        let (mut pool, unmapped) =
            counted_pool(&[Owner::Consumer, Owner::Device, Owner::Device]);
        assert_eq!(pool.device_owned(), vec![1, 2]);

        let failures = pool.release();

        assert_eq!(unmapped.get(), 1, "Only the consumer-owned buffer is unmapped");
        assert_eq!(failures.len(), 2);
        assert!(matches!(
            failures[0],
            CaptureError::OwnershipViolation {
                index: 1,
                owner: Owner::Device,
                operation: "unmap"
            }
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn reclaim_all_lets_release_unmap_everything() {
        let (mut pool, unmapped) = counted_pool(&[Owner::Device, Owner::Consumer, Owner::Device]);

        pool.reclaim_all();

        assert!(pool.device_owned().is_empty());
        assert!(pool.release().is_empty());
        assert_eq!(unmapped.get(), 3);
    }
}

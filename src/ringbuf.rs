//! Bounded FIFO over an owned byte array, with an optional pool of
//! independent read cursors ("handles") next to the normal one.
//!
//! One slot is reserved to tell full from empty, so a `RingBuffer<N, H>`
//! holds at most `N - 1` bytes. Nothing here suspends and nothing
//! allocates. The SPS receive path and the EDM response buffer sit on
//! this type.

use crate::config::RING_BUFFER_MAX_HANDLES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Free,
    Taken { read: usize, locked: bool, loss: u32 },
}

/// A claimed read cursor.
///
/// Obtained from [`RingBuffer::take_read_handle`] and returned with
/// [`RingBuffer::give_read_handle`]. Not `Copy`: giving the handle back
/// consumes it, so a stale cursor cannot be used afterwards.
#[derive(Debug, PartialEq, Eq)]
pub struct ReadHandle(usize);

pub struct RingBuffer<const N: usize, const H: usize = 0> {
    store: [u8; N],
    write: usize,
    read: usize,
    handles: [HandleState; H],
    read_requires_handle: bool,
    add_loss: u32,
    read_loss: u32,
}

impl<const N: usize, const H: usize> Default for RingBuffer<N, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const H: usize> RingBuffer<N, H> {
    const SIZES_OK: () = assert!(N > 1 && H <= RING_BUFFER_MAX_HANDLES);

    pub const fn new() -> Self {
        let _: () = Self::SIZES_OK;
        Self {
            store: [0; N],
            write: 0,
            read: 0,
            handles: [HandleState::Free; H],
            read_requires_handle: false,
            add_loss: 0,
            read_loss: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N - 1
    }

    fn unread(&self, cursor: usize) -> usize {
        (self.write + N - cursor) % N
    }

    /// Bytes behind the slowest cursor that constrains a plain [`add`].
    ///
    /// [`add`]: Self::add
    fn max_unread(&self) -> usize {
        let mut worst = if self.read_requires_handle {
            0
        } else {
            self.unread(self.read)
        };
        for h in &self.handles {
            if let HandleState::Taken { read, .. } = h {
                worst = worst.max(self.unread(*read));
            }
        }
        worst
    }

    /// Bytes a plain [`add`] can take without overwriting any cursor.
    ///
    /// [`add`]: Self::add
    pub fn available_size(&self) -> usize {
        self.capacity() - self.max_unread()
    }

    /// Bytes a [`force_add`] can take, i.e. the capacity minus whatever
    /// locked handles still hold.
    ///
    /// [`force_add`]: Self::force_add
    pub fn available_size_max(&self) -> usize {
        let mut worst = 0;
        for h in &self.handles {
            if let HandleState::Taken { read, locked: true, .. } = h {
                worst = worst.max(self.unread(*read));
            }
        }
        self.capacity() - worst
    }

    /// Unread bytes at the normal cursor. Zero while reads are restricted
    /// to handles.
    pub fn data_size(&self) -> usize {
        if self.read_requires_handle {
            0
        } else {
            self.unread(self.read)
        }
    }

    pub fn data_size_handle(&self, handle: &ReadHandle) -> usize {
        match self.handles[handle.0] {
            HandleState::Taken { read, .. } => self.unread(read),
            HandleState::Free => 0,
        }
    }

    fn copy_in(&mut self, data: &[u8]) {
        let first = data.len().min(N - self.write);
        self.store[self.write..self.write + first].copy_from_slice(&data[..first]);
        self.store[..data.len() - first].copy_from_slice(&data[first..]);
        self.write = (self.write + data.len()) % N;
    }

    fn copy_out(&self, cursor: usize, buf: &mut [u8]) {
        let first = buf.len().min(N - cursor);
        let rest = buf.len() - first;
        buf[..first].copy_from_slice(&self.store[cursor..cursor + first]);
        buf[first..].copy_from_slice(&self.store[..rest]);
    }

    /// All-or-nothing append. Fails, counting the bytes into the add-loss
    /// statistic, when the data does not fit in front of the slowest
    /// cursor.
    pub fn add(&mut self, data: &[u8]) -> bool {
        if data.len() > self.available_size() {
            self.add_loss += data.len() as u32;
            return false;
        }
        self.copy_in(data);
        if self.read_requires_handle {
            self.read = self.write;
        }
        true
    }

    /// Append that may overwrite unread data, advancing the normal cursor
    /// and any unlocked handle past the destroyed bytes and accounting the
    /// loss to the read-loss statistics.
    ///
    /// Fails without touching the buffer when a locked handle would lose
    /// data, or when `data` exceeds the capacity outright.
    pub fn force_add(&mut self, data: &[u8]) -> bool {
        let n = data.len();
        let cap = self.capacity();
        if n > cap {
            self.add_loss += n as u32;
            return false;
        }
        for h in &self.handles {
            if let HandleState::Taken { read, locked: true, .. } = h {
                if self.unread(*read) + n > cap {
                    self.add_loss += n as u32;
                    return false;
                }
            }
        }

        // Overwritten bytes are counted once in the total, however many
        // cursors they were unread at.
        let overwritten = (self.max_unread() + n).saturating_sub(cap);
        self.read_loss += overwritten as u32;

        let normal_excess = (self.unread(self.read) + n).saturating_sub(cap);
        self.read = (self.read + normal_excess) % N;
        for h in &mut self.handles {
            if let HandleState::Taken { read, locked: false, loss } = h {
                let excess = ((self.write + N - *read) % N + n).saturating_sub(cap);
                *read = (*read + excess) % N;
                *loss += excess as u32;
            }
        }

        self.copy_in(data);
        if self.read_requires_handle {
            self.read = self.write;
        }
        true
    }

    /// Consume from the normal cursor. Returns the bytes copied; zero when
    /// empty or when reads are restricted to handles.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.read_requires_handle {
            return 0;
        }
        let n = buf.len().min(self.unread(self.read));
        self.copy_out(self.read, &mut buf[..n]);
        self.read = (self.read + n) % N;
        n
    }

    /// Inspect from the normal cursor without consuming, starting `offset`
    /// bytes in.
    pub fn peek(&self, buf: &mut [u8], offset: usize) -> usize {
        if self.read_requires_handle {
            return 0;
        }
        let unread = self.unread(self.read);
        if offset >= unread {
            return 0;
        }
        let n = buf.len().min(unread - offset);
        self.copy_out((self.read + offset) % N, &mut buf[..n]);
        n
    }

    /// Consume via a handle. Advancing a handle may free capacity for
    /// [`add`](Self::add).
    pub fn read_handle(&mut self, handle: &ReadHandle, buf: &mut [u8]) -> usize {
        let (cursor, n) = match &mut self.handles[handle.0] {
            HandleState::Taken { read, .. } => {
                let n = buf.len().min((self.write + N - *read) % N);
                let cursor = *read;
                *read = (*read + n) % N;
                (cursor, n)
            }
            HandleState::Free => return 0,
        };
        self.copy_out(cursor, &mut buf[..n]);
        n
    }

    pub fn peek_handle(&self, handle: &ReadHandle, buf: &mut [u8], offset: usize) -> usize {
        match self.handles[handle.0] {
            HandleState::Taken { read, .. } => {
                let unread = self.unread(read);
                if offset >= unread {
                    return 0;
                }
                let n = buf.len().min(unread - offset);
                self.copy_out((read + offset) % N, &mut buf[..n]);
                n
            }
            HandleState::Free => 0,
        }
    }

    /// Claim a cursor from the fixed pool. A fresh handle starts at the
    /// write cursor and sees only data added after this call.
    pub fn take_read_handle(&mut self) -> Option<ReadHandle> {
        for (i, h) in self.handles.iter_mut().enumerate() {
            if *h == HandleState::Free {
                *h = HandleState::Taken {
                    read: self.write,
                    locked: false,
                    loss: 0,
                };
                return Some(ReadHandle(i));
            }
        }
        None
    }

    /// Return a cursor to the pool. The slot stops constraining writes.
    pub fn give_read_handle(&mut self, handle: ReadHandle) {
        self.handles[handle.0] = HandleState::Free;
    }

    /// Freeze the handle's cursor against [`force_add`](Self::force_add).
    pub fn lock_read_handle(&mut self, handle: &ReadHandle) {
        if let HandleState::Taken { locked, .. } = &mut self.handles[handle.0] {
            *locked = true;
        }
    }

    pub fn unlock_read_handle(&mut self, handle: &ReadHandle) {
        if let HandleState::Taken { locked, .. } = &mut self.handles[handle.0] {
            *locked = false;
        }
    }

    pub fn read_handle_is_locked(&self, handle: &ReadHandle) -> bool {
        matches!(
            self.handles[handle.0],
            HandleState::Taken { locked: true, .. }
        )
    }

    /// Discard everything unread at the normal cursor, without loss
    /// accounting.
    pub fn flush(&mut self) {
        self.read = self.write;
    }

    pub fn flush_handle(&mut self, handle: &ReadHandle) {
        if let HandleState::Taken { read, .. } = &mut self.handles[handle.0] {
            *read = self.write;
        }
    }

    /// When set, plain [`read`](Self::read)/[`peek`](Self::peek) return
    /// zero and the normal cursor stops constraining writes; data is
    /// reachable through handles only.
    pub fn set_read_requires_handle(&mut self, on: bool) {
        self.read_requires_handle = on;
        if on {
            self.read = self.write;
        }
    }

    pub fn read_requires_handle(&self) -> bool {
        self.read_requires_handle
    }

    /// Bytes rejected by failed [`add`](Self::add)/[`force_add`](Self::force_add) calls.
    pub fn add_loss(&self) -> u32 {
        self.add_loss
    }

    /// Bytes destroyed by successful force-adds, each counted once.
    pub fn read_loss(&self) -> u32 {
        self.read_loss
    }

    /// Bytes this handle's cursor was pushed past by force-adds.
    pub fn read_loss_handle(&self, handle: &ReadHandle) -> u32 {
        match self.handles[handle.0] {
            HandleState::Taken { loss, .. } => loss,
            HandleState::Free => 0,
        }
    }
}

//! Reference-counted packet buffers
//!
//! Every packet that crosses the stack lives in a slot of a fixed-capacity
//! [`BufPool`]. A [`Buf`] is a handle to one slot plus a window (`head`,
//! `len`) into it. Cloning a handle bumps the slot's reference count and
//! dropping the last handle returns the slot to its pool, so "last holder
//! frees" is enforced by ownership rather than by discipline.
//!
//! Handles only hand out mutable access while they are the sole owner of the
//! slot. Shared handles are read-only views.
//!
//! The pools are referenced through the object-safe [`RawPool`] trait so that
//! [`Stack`](crate::Stack) does not carry the pool dimensions in its type.

use core::cell::{RefCell, UnsafeCell};
use core::future::poll_fn;
use core::task::{Context, Poll};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::waitqueue::WakerRegistration;

use crate::Error;

/// What a buffer carries; set when the buffer enters the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufKind {
    /// Outbound HCI command
    Command,
    /// Inbound HCI event
    Event,
    /// Inbound ACL data
    AclIn,
    /// Outbound ACL data
    AclOut,
    /// Reassembled L2CAP SDU
    Sdu,
}

/// Slot bookkeeping for a pool, object safe
pub trait RawPool: Sync {
    /// Claim a free slot, returning its index
    fn try_claim(&self) -> Option<usize>;
    /// Claim a free slot or register the waker to be woken on the next release
    fn poll_claim(&self, cx: &mut Context<'_>) -> Poll<usize>;
    /// Add a reference to a claimed slot
    fn retain(&self, index: usize);
    /// Drop a reference; the slot is free again once the count reaches zero
    fn release(&self, index: usize);
    /// Current reference count of a slot
    fn refs(&self, index: usize) -> u16;
    /// Number of free slots
    fn available(&self) -> usize;
    /// Total number of slots
    fn capacity(&self) -> usize;
    /// Size in bytes of every slot
    fn slot_size(&self) -> usize;
    /// Start of the slot's storage
    fn slot_ptr(&self, index: usize) -> *mut u8;
}

struct PoolState<const N: usize> {
    refs: [u16; N],
    waker: WakerRegistration,
}

/// Fixed pool of `N` buffers of `SIZE` bytes
pub struct BufPool<const N: usize, const SIZE: usize> {
    slots: [UnsafeCell<[u8; SIZE]>; N],
    state: Mutex<CriticalSectionRawMutex, RefCell<PoolState<N>>>,
}

// SAFETY: slot storage is only written through a `Buf` that is the sole
// owner of the slot; reference counts are guarded by a critical section.
unsafe impl<const N: usize, const SIZE: usize> Sync for BufPool<N, SIZE> {}

impl<const N: usize, const SIZE: usize> BufPool<N, SIZE> {
    /// Create an empty pool
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { UnsafeCell::new([0; SIZE]) }; N],
            state: Mutex::new(RefCell::new(PoolState {
                refs: [0; N],
                waker: WakerRegistration::new(),
            })),
        }
    }
}

impl<const N: usize, const SIZE: usize> Default for BufPool<N, SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const SIZE: usize> RawPool for BufPool<N, SIZE> {
    fn try_claim(&self) -> Option<usize> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let index = state.refs.iter().position(|&r| r == 0)?;
            state.refs[index] = 1;
            Some(index)
        })
    }

    fn poll_claim(&self, cx: &mut Context<'_>) -> Poll<usize> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if let Some(index) = state.refs.iter().position(|&r| r == 0) {
                state.refs[index] = 1;
                Poll::Ready(index)
            } else {
                state.waker.register(cx.waker());
                Poll::Pending
            }
        })
    }

    fn retain(&self, index: usize) {
        self.state.lock(|state| {
            state.borrow_mut().refs[index] += 1;
        });
    }

    fn release(&self, index: usize) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.refs[index] = state.refs[index].saturating_sub(1);
            if state.refs[index] == 0 {
                state.waker.wake();
            }
        });
    }

    fn refs(&self, index: usize) -> u16 {
        self.state.lock(|state| state.borrow().refs[index])
    }

    fn available(&self) -> usize {
        self.state
            .lock(|state| state.borrow().refs.iter().filter(|&&r| r == 0).count())
    }

    fn capacity(&self) -> usize {
        N
    }

    fn slot_size(&self) -> usize {
        SIZE
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        self.slots[index].get().cast::<u8>()
    }
}

/// Handle to one pooled buffer
pub struct Buf<'p> {
    pool: &'p dyn RawPool,
    index: usize,
    head: usize,
    len: usize,
    kind: BufKind,
    handle: u16,
}

impl<'p> Buf<'p> {
    /// Take a free buffer from `pool`
    ///
    /// # Errors
    /// Returns [`Error::NoResources`] if the pool is exhausted
    pub fn try_alloc(pool: &'p dyn RawPool, kind: BufKind) -> Result<Self, Error> {
        match pool.try_claim() {
            Some(index) => Ok(Self::from_slot(pool, index, kind)),
            None => {
                warn!("[BUF] pool exhausted ({:?})", kind);
                Err(Error::NoResources)
            }
        }
    }

    /// Take a free buffer from `pool`, waiting for one to be released if needed
    pub async fn alloc(pool: &'p dyn RawPool, kind: BufKind) -> Self {
        let index = poll_fn(|cx| pool.poll_claim(cx)).await;
        Self::from_slot(pool, index, kind)
    }

    fn from_slot(pool: &'p dyn RawPool, index: usize, kind: BufKind) -> Self {
        Self {
            pool,
            index,
            head: 0,
            len: 0,
            kind,
            handle: 0,
        }
    }

    /// Buffer kind
    #[must_use]
    pub fn kind(&self) -> BufKind {
        self.kind
    }

    /// Change the buffer kind
    pub fn set_kind(&mut self, kind: BufKind) {
        self.kind = kind;
    }

    /// Connection handle of an ACL buffer
    #[must_use]
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// Record the connection handle of an ACL buffer
    pub fn set_handle(&mut self, handle: u16) {
        self.handle = handle;
    }

    /// Number of bytes in the buffer window
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the window is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total size of the backing slot
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.slot_size()
    }

    /// Free bytes before the window
    #[must_use]
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Free bytes after the window
    #[must_use]
    pub fn tailroom(&self) -> usize {
        self.capacity() - self.head - self.len
    }

    /// True if no other handle refers to the same slot
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.pool.refs(self.index) == 1
    }

    /// The bytes in the window
    #[must_use]
    pub fn data(&self) -> &[u8] {
        // SAFETY: head + len never exceeds the slot size, and the slot is only
        // written through a unique handle borrowed mutably.
        unsafe { core::slice::from_raw_parts(self.pool.slot_ptr(self.index).add(self.head), self.len) }
    }

    /// Mutable access to the bytes in the window
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the buffer is shared
    pub fn data_mut(&mut self) -> Result<&mut [u8], Error> {
        self.ensure_unique()?;
        // SAFETY: the handle is the sole owner of the slot and is borrowed mutably.
        Ok(unsafe {
            core::slice::from_raw_parts_mut(self.pool.slot_ptr(self.index).add(self.head), self.len)
        })
    }

    /// Reserve `headroom` bytes in front of an empty buffer for later [`push_front`](Self::push_front)
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the buffer is not empty and
    /// [`Error::MessageTooLong`] if the slot is smaller than `headroom`
    pub fn reserve(&mut self, headroom: usize) -> Result<(), Error> {
        if self.len != 0 {
            return Err(Error::InvalidState);
        }
        if headroom > self.capacity() {
            return Err(Error::MessageTooLong);
        }
        self.head = headroom;
        Ok(())
    }

    /// Append bytes after the window
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the buffer is shared and
    /// [`Error::MessageTooLong`] if the bytes do not fit
    pub fn put_slice(&mut self, data: &[u8]) -> Result<(), Error> {
        self.ensure_unique()?;
        if data.len() > self.tailroom() {
            return Err(Error::MessageTooLong);
        }
        // SAFETY: bounds checked above, handle is unique.
        unsafe {
            let dst = self.pool.slot_ptr(self.index).add(self.head + self.len);
            core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        self.len += data.len();
        Ok(())
    }

    /// Append one byte
    ///
    /// # Errors
    /// See [`put_slice`](Self::put_slice)
    pub fn put_u8(&mut self, value: u8) -> Result<(), Error> {
        self.put_slice(&[value])
    }

    /// Append a little-endian `u16`
    ///
    /// # Errors
    /// See [`put_slice`](Self::put_slice)
    pub fn put_le16(&mut self, value: u16) -> Result<(), Error> {
        self.put_slice(&value.to_le_bytes())
    }

    /// Prepend bytes in front of the window, consuming headroom
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the buffer is shared and
    /// [`Error::MessageTooLong`] if there is not enough headroom
    pub fn push_front(&mut self, data: &[u8]) -> Result<(), Error> {
        self.ensure_unique()?;
        if data.len() > self.head {
            return Err(Error::MessageTooLong);
        }
        self.head -= data.len();
        self.len += data.len();
        // SAFETY: the new head is inside the slot, handle is unique.
        unsafe {
            let dst = self.pool.slot_ptr(self.index).add(self.head);
            core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    /// Drop `n` bytes from the front of the window
    ///
    /// # Errors
    /// Returns [`Error::InvalidPacket`] if the window is shorter than `n`
    pub fn pull(&mut self, n: usize) -> Result<(), Error> {
        if n > self.len {
            return Err(Error::InvalidPacket);
        }
        self.head += n;
        self.len -= n;
        Ok(())
    }

    /// Shorten the window to at most `len` bytes
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    fn ensure_unique(&self) -> Result<(), Error> {
        if self.is_unique() {
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }
}

impl Clone for Buf<'_> {
    fn clone(&self) -> Self {
        self.pool.retain(self.index);
        Self {
            pool: self.pool,
            index: self.index,
            head: self.head,
            len: self.len,
            kind: self.kind,
            handle: self.handle,
        }
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl core::fmt::Debug for Buf<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Buf")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Buf<'_> {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(f, "Buf({:?}, len {})", self.kind, self.len);
    }
}

// `bt-hci` commands and ACL packets serialize straight into pooled buffers.
impl embedded_io::ErrorType for Buf<'_> {
    type Error = Error;
}

impl embedded_io::Write for Buf<'_> {
    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        self.put_slice(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embassy_futures::join::join;

    #[test]
    fn test_alloc_until_exhausted() {
        let pool: BufPool<2, 16> = BufPool::new();
        let a = Buf::try_alloc(&pool, BufKind::Event).unwrap();
        let b = Buf::try_alloc(&pool, BufKind::Event).unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(
            Buf::try_alloc(&pool, BufKind::Event).unwrap_err(),
            Error::NoResources
        );
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_last_holder_frees() {
        let pool: BufPool<1, 16> = BufPool::new();
        let mut buf = Buf::try_alloc(&pool, BufKind::AclIn).unwrap();
        buf.put_slice(&[1, 2, 3]).unwrap();

        let copy = buf.clone();
        assert!(!buf.is_unique());
        assert_eq!(copy.data(), &[1, 2, 3]);

        drop(buf);
        assert_eq!(pool.available(), 0);
        assert!(copy.is_unique());
        drop(copy);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_shared_buffer_is_read_only() {
        let pool: BufPool<1, 16> = BufPool::new();
        let mut buf = Buf::try_alloc(&pool, BufKind::AclIn).unwrap();
        let _copy = buf.clone();
        assert_eq!(buf.put_u8(1).unwrap_err(), Error::InvalidState);
        assert_eq!(buf.data_mut().unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let pool: BufPool<1, 4> = BufPool::new();
        let mut buf = Buf::try_alloc(&pool, BufKind::Command).unwrap();
        buf.put_slice(&[0; 3]).unwrap();
        assert_eq!(buf.put_le16(7).unwrap_err(), Error::MessageTooLong);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.tailroom(), 1);
    }

    #[test]
    fn test_headroom_and_pull() {
        let pool: BufPool<1, 16> = BufPool::new();
        let mut buf = Buf::try_alloc(&pool, BufKind::AclOut).unwrap();
        buf.reserve(4).unwrap();
        buf.put_slice(b"data").unwrap();
        buf.push_front(&[0xAA, 0xBB]).unwrap();
        assert_eq!(buf.data(), &[0xAA, 0xBB, b'd', b'a', b't', b'a']);
        assert_eq!(buf.headroom(), 2);
        assert_eq!(buf.push_front(&[0; 3]).unwrap_err(), Error::MessageTooLong);

        buf.pull(2).unwrap();
        assert_eq!(buf.data(), b"data");
        assert_eq!(buf.pull(5).unwrap_err(), Error::InvalidPacket);

        buf.truncate(2);
        assert_eq!(buf.data(), b"da");
    }

    #[test]
    fn test_async_alloc_waits_for_release() {
        let pool: BufPool<1, 8> = BufPool::new();
        let held = Buf::try_alloc(&pool, BufKind::AclOut).unwrap();

        let (_, buf) = block_on(join(
            async move {
                embassy_futures::yield_now().await;
                drop(held);
            },
            Buf::alloc(&pool, BufKind::AclOut),
        ));
        assert_eq!(buf.kind(), BufKind::AclOut);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_write_hci_into_buffer() {
        use bt_hci::WriteHci;
        use bt_hci::cmd::le::LeSetAdvEnable;

        let pool: BufPool<1, 4> = BufPool::new();
        let mut buf = Buf::try_alloc(&pool, BufKind::Command).unwrap();
        LeSetAdvEnable::new(true).write_hci(&mut buf).unwrap();
        assert_eq!(buf.data(), &[0x0A, 0x20, 1, 1]);
        assert_eq!(
            LeSetAdvEnable::new(false).write_hci(&mut buf).unwrap_err(),
            Error::MessageTooLong
        );
    }
}

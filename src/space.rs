use memflow::prelude::v1::*;

use std::collections::BTreeMap;
use std::sync::Mutex;

use log::*;

/// Read-only byte provider the typed object layer is built on.
///
/// Implementations translate an address into backing bytes. A read either fills the whole
/// output buffer or fails, there is no partial success. Reads must never panic on bad input,
/// addresses near the end of the address range included.
pub trait AddressSpace: Send + Sync {
    fn read_raw_into(&self, addr: Address, out: &mut [u8]) -> Result<()>;

    /// Reads `len` bytes, returning `None` if any of them is unreadable.
    fn read(&self, addr: Address, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0; len];
        match self.read_raw_into(addr, &mut buf) {
            Ok(()) => Some(buf),
            Err(err) => {
                trace!("unreadable {:x}+{:x}: {}", addr, len, err);
                None
            }
        }
    }

    fn is_readable(&self, addr: Address, len: usize) -> bool {
        self.read(addr, len).is_some()
    }
}

impl<T: AddressSpace + ?Sized> AddressSpace for &T {
    fn read_raw_into(&self, addr: Address, out: &mut [u8]) -> Result<()> {
        (**self).read_raw_into(addr, out)
    }
}

/// Snapshot made of explicitly mapped byte ranges.
///
/// Everything outside of the mapped ranges is unreadable.
#[derive(Clone, Default)]
pub struct SparseSpace {
    ranges: BTreeMap<umem, Vec<u8>>,
}

impl SparseSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `bytes` at `base`. Ranges may touch, but never overlap.
    pub fn map(&mut self, base: Address, bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let start = base.to_umem();
        let last = start
            .checked_add(bytes.len() as umem - 1)
            .ok_or(Error(ErrorOrigin::Memory, ErrorKind::OutOfMemoryRange))?;

        let overlaps_prev = self
            .ranges
            .range(..=start)
            .next_back()
            .map(|(&b, buf)| start - b < buf.len() as umem)
            .unwrap_or(false);

        let overlaps_next = self.ranges.range(start..=last).next().is_some();

        if overlaps_prev || overlaps_next {
            return Err(Error(ErrorOrigin::Memory, ErrorKind::AlreadyExists)
                .log_error(format!("range {:x}-{:x} overlaps a mapped range", start, last)));
        }

        self.ranges.insert(start, bytes);
        Ok(())
    }

    pub fn with_range(mut self, base: Address, bytes: Vec<u8>) -> Result<Self> {
        self.map(base, bytes)?;
        Ok(self)
    }

    pub fn mapped_len(&self) -> usize {
        self.ranges.values().map(Vec::len).sum()
    }
}

impl AddressSpace for SparseSpace {
    fn read_raw_into(&self, addr: Address, out: &mut [u8]) -> Result<()> {
        let mut cur = addr.to_umem();
        let mut done = 0;

        while done < out.len() {
            let (&base, buf) = self
                .ranges
                .range(..=cur)
                .next_back()
                .ok_or(Error(ErrorOrigin::Memory, ErrorKind::OutOfMemoryRange))?;

            let off = (cur - base) as usize;
            if off >= buf.len() {
                return Err(Error(ErrorOrigin::Memory, ErrorKind::OutOfMemoryRange));
            }

            let cnt = std::cmp::min(buf.len() - off, out.len() - done);
            out[done..done + cnt].copy_from_slice(&buf[off..off + cnt]);
            done += cnt;

            if done < out.len() {
                cur = cur
                    .checked_add(cnt as umem)
                    .ok_or(Error(ErrorOrigin::Memory, ErrorKind::OutOfMemoryRange))?;
            }
        }

        Ok(())
    }
}

/// Exposes a memflow `MemoryView` as an address space.
///
/// Views require exclusive access for reads, so they are kept behind a mutex. Any read that
/// comes back partial is reported as unreadable.
pub struct ViewSpace<T> {
    mem: Mutex<T>,
    arch_bits: u8,
    little_endian: bool,
}

impl<T: MemoryView> ViewSpace<T> {
    pub fn new(mem: T) -> Self {
        let MemoryViewMetadata {
            arch_bits,
            little_endian,
            ..
        } = mem.metadata();

        Self {
            mem: Mutex::new(mem),
            arch_bits,
            little_endian,
        }
    }

    pub fn arch_bits(&self) -> u8 {
        self.arch_bits
    }

    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    pub fn into_inner(self) -> Result<T> {
        self.mem
            .into_inner()
            .map_err(|_| Error(ErrorOrigin::Memory, ErrorKind::Unknown))
    }
}

impl<T: MemoryView> AddressSpace for ViewSpace<T> {
    fn read_raw_into(&self, addr: Address, out: &mut [u8]) -> Result<()> {
        let mut mem = self
            .mem
            .lock()
            .map_err(|_| Error(ErrorOrigin::Memory, ErrorKind::Unknown))?;
        mem.read_raw_into(addr, out).data()
    }
}

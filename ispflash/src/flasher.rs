//! Bulk dump, erase and flash workflows.
//!
//! [`Programmer`] splits a [`MemoryRange`] into page-sized [`Chunk`]s and
//! drives a [`DeviceLink`] one chunk at a time:
//!
//! ```text
//! range ──► chunks ──► for each chunk ──► op ──ok──► next chunk
//!                            ▲             │
//!                            └── retry ◄───┘ transient error, budget left
//!                                          │
//!                                          └──► close link, "Fail! at ..."
//! ```
//!
//! A chunk is attempted once and retried up to [`NRETRY`] more times on a
//! transient error. When the budget runs out the last underlying error is
//! returned unchanged. Errors that cannot go away by repeating the operation
//! (closed session, file, bad argument) abort at once. Every error exit
//! closes the link first.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::report::Reporter;
use crate::target::{DeviceLink, EraseRequest, ProtocolVariant};

/// Retries per chunk after the first attempt.
pub const NRETRY: usize = 3;

/// Chunks between progress ticks.
pub const REFRESH_RATE: usize = 10;

/// Default flash base address.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// An address range on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    /// First address.
    pub base: u32,
    /// Length in bytes.
    pub len: usize,
}

impl MemoryRange {
    /// Create a range.
    pub fn new(base: u32, len: usize) -> Self {
        Self { base, len }
    }

    /// One past the last address.
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.base) + self.len as u64
    }

    /// Split into `chunk_size` chunks aligned to the range base. The last
    /// chunk may be short.
    ///
    /// Fails if the range runs past the 32-bit address space.
    pub fn chunks(&self, chunk_size: usize) -> Result<Vec<Chunk>> {
        if chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk size of zero".into()));
        }
        if self.end() > u64::from(u32::MAX) + 1 {
            return Err(Error::InvalidArgument(format!(
                "range 0x{:08x}+{} exceeds the address space",
                self.base, self.len
            )));
        }
        let mut chunks = Vec::with_capacity(self.len.div_ceil(chunk_size));
        let mut offset = 0;
        while offset < self.len {
            let len = chunk_size.min(self.len - offset);
            // Bounded by the address space check above
            #[allow(clippy::cast_possible_truncation)]
            let address = self.base + offset as u32;
            chunks.push(Chunk {
                index: chunks.len(),
                address,
                offset,
                len,
            });
            offset += len;
        }
        Ok(chunks)
    }
}

/// One page-sized slice of a [`MemoryRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the range.
    pub index: usize,
    /// Device address.
    pub address: u32,
    /// Offset from the range base.
    pub offset: usize,
    /// Length in bytes; short only for the last chunk.
    pub len: usize,
}

/// Tunables for bulk workflows.
#[derive(Debug, Clone)]
pub struct FlashOptions {
    /// Address of page 0 for erase page indices.
    pub flash_base: u32,
    /// Retries per chunk after the first attempt.
    pub retries: usize,
    /// Chunks between progress ticks.
    pub progress_interval: usize,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            flash_base: FLASH_BASE,
            retries: NRETRY,
            progress_interval: REFRESH_RATE,
        }
    }
}

/// Bulk operation engine over one session.
///
/// Owns the link; dropping the programmer closes it.
pub struct Programmer<L: DeviceLink> {
    link: L,
    reporter: Reporter,
    options: FlashOptions,
}

impl<L: DeviceLink> Programmer<L> {
    /// Wrap a connected link.
    pub fn new(link: L, reporter: Reporter) -> Self {
        Self {
            link,
            reporter,
            options: FlashOptions::default(),
        }
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: FlashOptions) -> Self {
        self.options = options;
        self
    }

    /// The session.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// The session, mutably.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Current options.
    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    /// Run `op` once plus up to `retries` more times while it fails with a
    /// transient error and the link stays open.
    fn with_retry<T>(
        &mut self,
        address: u32,
        mut op: impl FnMut(&mut L) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op(&mut self.link) {
                Ok(value) => return Ok(value),
                Err(e)
                    if e.is_transient()
                        && attempt < self.options.retries
                        && self.link.is_open() =>
                {
                    attempt += 1;
                    debug!(
                        "Chunk 0x{address:08x} failed ({e}), retry {attempt}/{}",
                        self.options.retries
                    );
                    self.reporter.warning(format!("Retrain at: 0x{address:08x}"));
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn abort<T>(&mut self, error: Error) -> Result<T> {
        self.link.close();
        Err(error)
    }

    /// Drive `per_chunk` over every chunk, ticking progress. On failure the
    /// link is closed and the failing address reported.
    fn run_chunks(
        &mut self,
        range: MemoryRange,
        chunk_size: usize,
        mut per_chunk: impl FnMut(&mut Self, &Chunk) -> Result<()>,
    ) -> Result<()> {
        let chunks = match range.chunks(chunk_size) {
            Ok(chunks) => chunks,
            Err(e) => return self.abort(e),
        };
        let total = chunks.len();
        let interval = self.options.progress_interval.max(1);
        for chunk in &chunks {
            if let Err(e) = per_chunk(self, chunk) {
                self.reporter.error(format!("Fail! at 0x{:08x}", chunk.address));
                return self.abort(e);
            }
            let done = chunk.index + 1;
            if done % interval == 0 || done == total {
                self.reporter.progress(done, total);
            }
        }
        Ok(())
    }

    /// Read `range` into `out` in address order.
    ///
    /// On abort `out` holds exactly the chunks read before the failure.
    pub fn dump<W: Write>(&mut self, range: MemoryRange, out: &mut W) -> Result<()> {
        self.dump_into(range, out, Path::new("<output>"))
    }

    /// Read `range` into a new file at `path`.
    pub fn dump_to_file(&mut self, range: MemoryRange, path: &Path) -> Result<()> {
        let file = match File::create(path) {
            Ok(file) => file,
            Err(e) => return self.abort(Error::file(path, e)),
        };
        let mut writer = BufWriter::new(file);
        let dumped = self.dump_into(range, &mut writer, path);
        let flushed = writer.flush().map_err(|e| Error::file(path, e));
        dumped.and(flushed)
    }

    fn dump_into<W: Write>(&mut self, range: MemoryRange, out: &mut W, path: &Path) -> Result<()> {
        self.reporter.info(format!(
            "Dumping 0x{:08x}-0x{:08x}",
            range.base,
            range.end()
        ));
        let chunk_size = self.link.chunk_size();
        self.run_chunks(range, chunk_size, |this, chunk| {
            let data = this.with_retry(chunk.address, |link| {
                link.read_memory(chunk.address, chunk.len)
            })?;
            out.write_all(&data).map_err(|e| Error::file(path, e))
        })?;
        self.reporter.info("Ok!");
        Ok(())
    }

    /// Erase the pages covering `range`.
    ///
    /// ISP sessions erase page by page, with the extended command when the
    /// device reported it; header-protocol sessions erase byte ranges.
    pub fn erase(&mut self, range: MemoryRange) -> Result<()> {
        self.reporter.info(format!(
            "Erasing 0x{:08x}-0x{:08x}",
            range.base,
            range.end()
        ));
        let chunk_size = self.link.chunk_size();
        let variant = self.link.variant();
        let extended = self.link.supports_extended_erase();
        self.run_chunks(range, chunk_size, |this, chunk| {
            let request = match variant {
                ProtocolVariant::Isp => {
                    let page = this.page_index(chunk.address, chunk_size)?;
                    if extended {
                        EraseRequest::Extended(page)
                    } else {
                        EraseRequest::Page(page)
                    }
                },
                ProtocolVariant::Dfu => EraseRequest::Range {
                    address: chunk.address,
                    len: chunk_len_u32(chunk_size)?,
                },
            };
            this.with_retry(chunk.address, |link| link.erase(request))
        })?;
        self.reporter.info("Ok!");
        Ok(())
    }

    /// Page index of `address` relative to the flash base.
    fn page_index(&self, address: u32, page_size: usize) -> Result<u16> {
        let base = self.options.flash_base;
        let offset = address.checked_sub(base).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "address 0x{address:08x} is below flash base 0x{base:08x}"
            ))
        })?;
        let page = offset as usize / page_size;
        // The top of the 16-bit space holds the mass and bank sentinels
        match u16::try_from(page) {
            Ok(page) if page < crate::protocol::isp::ISP_BANK2_ERASE => Ok(page),
            _ => Err(Error::InvalidArgument(format!(
                "page {page} at 0x{address:08x} cannot be encoded"
            ))),
        }
    }

    /// Write `data` at `base`, optionally reading each chunk back.
    ///
    /// The last chunk is zero padded to a full page. A read-back mismatch is
    /// retried as a write within the same per-chunk budget.
    pub fn flash(&mut self, data: &[u8], base: u32, verify: bool) -> Result<()> {
        if data.is_empty() {
            return self.abort(Error::InvalidArgument("empty firmware image".into()));
        }
        let range = MemoryRange::new(base, data.len());
        if self.link.variant() == ProtocolVariant::Dfu {
            return self.flash_unchecked(data, range);
        }

        self.reporter.info(format!(
            "Flashing 0x{:08x}-0x{:08x}",
            range.base,
            range.end()
        ));
        let page_size = self.link.chunk_size();
        self.run_chunks(range, page_size, |this, chunk| {
            let page = padded_chunk(data, chunk, page_size);
            this.with_retry(chunk.address, |link| {
                link.write_memory(chunk.address, &page)?;
                if verify {
                    let readback = link.read_memory(chunk.address, page.len())?;
                    if readback != page {
                        return Err(Error::VerifyMismatch {
                            address: chunk.address,
                        });
                    }
                }
                Ok(())
            })
        })?;
        self.reporter.info("Ok!");
        Ok(())
    }

    /// Header-protocol flash: erase every chunk, then write every chunk,
    /// without retry or verify.
    fn flash_unchecked(&mut self, data: &[u8], range: MemoryRange) -> Result<()> {
        let chunk_size = self.link.chunk_size();
        let erase_len = match chunk_len_u32(chunk_size) {
            Ok(len) => len,
            Err(e) => return self.abort(e),
        };

        self.reporter.info(format!(
            "Erasing 0x{:08x}-0x{:08x}",
            range.base,
            range.end()
        ));
        self.run_chunks(range, chunk_size, |this, chunk| {
            this.link.erase(EraseRequest::Range {
                address: chunk.address,
                len: erase_len,
            })
        })?;

        self.reporter.info(format!(
            "Flashing 0x{:08x}-0x{:08x}",
            range.base,
            range.end()
        ));
        self.run_chunks(range, chunk_size, |this, chunk| {
            let page = padded_chunk(data, chunk, chunk_size);
            this.link.write_memory(chunk.address, &page)
        })?;
        self.reporter.info("Ok!");
        Ok(())
    }

    /// Erase the whole flash.
    pub fn mass_erase(&mut self) -> Result<()> {
        self.reporter.info("Mass erase");
        match self.link.erase(EraseRequest::Mass) {
            Ok(()) => {
                self.reporter.hint("Mass erase complete. Device is reset");
                Ok(())
            },
            Err(e) => self.abort(e),
        }
    }

    /// Enable readout protection. The device resets and the session ends.
    pub fn protect(&mut self) -> Result<()> {
        self.reporter.info("Read protecting");
        match self.link.readout_protect() {
            Ok(()) => {
                self.reporter.hint("Read protection complete. Device is reset");
                Ok(())
            },
            Err(e) => self.abort(e),
        }
    }

    /// Disable readout protection. The device mass erases and resets; the
    /// session ends.
    pub fn unprotect(&mut self) -> Result<()> {
        self.reporter.info("Read unprotecting");
        match self.link.readout_unprotect() {
            Ok(()) => {
                self.reporter
                    .hint("Read unprotection complete. Flash is erased, device is reset");
                Ok(())
            },
            Err(e) => self.abort(e),
        }
    }

    /// Leave the bootloader and run the application at `address`.
    pub fn go(&mut self, address: u32) -> Result<()> {
        self.reporter.info(format!("Starting application at 0x{address:08x}"));
        match self.link.start_application(address) {
            Ok(()) => Ok(()),
            Err(e) => self.abort(e),
        }
    }
}

impl<L: DeviceLink> Drop for Programmer<L> {
    fn drop(&mut self) {
        self.link.close();
    }
}

/// The bytes of `chunk` from `data`, zero padded to `page_size`.
fn padded_chunk(data: &[u8], chunk: &Chunk, page_size: usize) -> Vec<u8> {
    let mut page = vec![0u8; page_size.max(chunk.len)];
    page[..chunk.len].copy_from_slice(&data[chunk.offset..chunk.offset + chunk.len]);
    page
}

fn chunk_len_u32(chunk_size: usize) -> Result<u32> {
    u32::try_from(chunk_size)
        .map_err(|_| Error::InvalidArgument(format!("chunk size {chunk_size}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{MemorySink, Severity};
    use crate::target::DeviceInfo;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use std::sync::Arc;

    const MEMORY_SIZE: usize = 8192;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Read(u32, usize),
        Write(u32, usize),
        Erase(EraseRequest),
    }

    /// In-memory device: flash mirrored from `FLASH_BASE`, scripted faults.
    struct FakeLink {
        variant: ProtocolVariant,
        open: Rc<Cell<bool>>,
        extended: bool,
        memory: Vec<u8>,
        ops: Vec<Op>,
        writes: Vec<(u32, Vec<u8>)>,
        fail_reads: HashMap<u32, usize>,
        fail_writes: HashMap<u32, usize>,
        /// Keyed by page index, or by address for range erases.
        fail_erases: HashMap<u32, usize>,
        corrupt_reads: HashMap<u32, usize>,
    }

    impl FakeLink {
        fn new(variant: ProtocolVariant) -> Self {
            Self {
                variant,
                open: Rc::new(Cell::new(true)),
                extended: false,
                memory: (0..MEMORY_SIZE).map(|i| (i % 251) as u8).collect(),
                ops: Vec::new(),
                writes: Vec::new(),
                fail_reads: HashMap::new(),
                fail_writes: HashMap::new(),
                fail_erases: HashMap::new(),
                corrupt_reads: HashMap::new(),
            }
        }

        fn take(faults: &mut HashMap<u32, usize>, address: u32) -> bool {
            match faults.get_mut(&address) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                },
                _ => false,
            }
        }

        fn offset(address: u32) -> usize {
            (address - FLASH_BASE) as usize
        }

        fn writes_at(&self, address: u32) -> usize {
            self.writes.iter().filter(|(a, _)| *a == address).count()
        }

        fn reads_at(&self, address: u32) -> usize {
            self.ops
                .iter()
                .filter(|op| matches!(op, Op::Read(a, _) if *a == address))
                .count()
        }
    }

    impl DeviceLink for FakeLink {
        fn variant(&self) -> ProtocolVariant {
            self.variant
        }

        fn is_open(&self) -> bool {
            self.open.get()
        }

        fn close(&mut self) {
            self.open.set(false);
        }

        fn supports_extended_erase(&self) -> bool {
            self.extended
        }

        fn device_info(&self) -> DeviceInfo {
            DeviceInfo::default()
        }

        fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
            if !self.is_open() {
                return Err(Error::NotActive);
            }
            self.ops.push(Op::Read(address, len));
            if Self::take(&mut self.fail_reads, address) {
                return Err(Error::Timeout("scripted".into()));
            }
            let start = Self::offset(address);
            let mut data = self.memory[start..start + len].to_vec();
            if Self::take(&mut self.corrupt_reads, address) {
                data[0] ^= 0xFF;
            }
            Ok(data)
        }

        fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
            if !self.is_open() {
                return Err(Error::NotActive);
            }
            self.ops.push(Op::Write(address, data.len()));
            self.writes.push((address, data.to_vec()));
            if Self::take(&mut self.fail_writes, address) {
                return Err(Error::Nack);
            }
            let start = Self::offset(address);
            self.memory[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn erase(&mut self, request: EraseRequest) -> Result<()> {
            if !self.is_open() {
                return Err(Error::NotActive);
            }
            self.ops.push(Op::Erase(request));
            let key = match request {
                EraseRequest::Page(page) | EraseRequest::Extended(page) => u32::from(page),
                EraseRequest::Range { address, .. } => address,
                EraseRequest::Mass | EraseRequest::Bank(_) => u32::MAX,
            };
            if Self::take(&mut self.fail_erases, key) {
                return Err(Error::Nack);
            }
            Ok(())
        }

        fn start_application(&mut self, _address: u32) -> Result<()> {
            self.close();
            Ok(())
        }

        fn readout_protect(&mut self) -> Result<()> {
            self.close();
            Ok(())
        }

        fn readout_unprotect(&mut self) -> Result<()> {
            self.close();
            Ok(())
        }
    }

    fn programmer(link: FakeLink) -> (Programmer<FakeLink>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (Programmer::new(link, Reporter::new(sink.clone())), sink)
    }

    #[test]
    fn test_two_chunk_range() {
        let chunks = MemoryRange::new(0x0800_0000, 256).chunks(128).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].address, chunks[0].len), (0x0800_0000, 128));
        assert_eq!((chunks[1].address, chunks[1].len), (0x0800_0080, 128));
    }

    #[test]
    fn test_chunks_align_to_range_base() {
        let chunks = MemoryRange::new(0x0800_0010, 300).chunks(128).unwrap();
        let addresses: Vec<_> = chunks.iter().map(|c| c.address).collect();
        assert_eq!(addresses, vec![0x0800_0010, 0x0800_0090, 0x0800_0110]);
        assert_eq!(chunks[2].len, 44);
        assert_eq!(chunks[2].offset, 256);
    }

    #[test]
    fn test_chunks_reject_address_overflow() {
        let range = MemoryRange::new(0xFFFF_FF00, 512);
        assert!(matches!(range.chunks(128), Err(Error::InvalidArgument(_))));
        assert_eq!(MemoryRange::new(0xFFFF_FF00, 256).chunks(128).unwrap().len(), 2);
    }

    #[test]
    fn test_flash_pads_last_chunk() {
        let image: Vec<u8> = (1..=130).map(|b| b as u8).collect();
        let (mut prog, _sink) = programmer(FakeLink::new(ProtocolVariant::Isp));

        prog.flash(&image, FLASH_BASE, false).unwrap();

        let writes = &prog.link().writes;
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1, image[..128].to_vec());
        assert_eq!(writes[1].0, FLASH_BASE + 128);
        assert_eq!(writes[1].1.len(), 128);
        assert_eq!(&writes[1].1[..2], &image[128..]);
        assert!(writes[1].1[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_flash_write_count_is_ceil() {
        let (mut prog, _sink) = programmer(FakeLink::new(ProtocolVariant::Isp));
        prog.flash(&[0xAA; 1000], FLASH_BASE, false).unwrap();
        assert_eq!(prog.link().writes.len(), 8);
    }

    #[test]
    fn test_verify_rewrites_only_the_mismatching_chunk() {
        let mut link = FakeLink::new(ProtocolVariant::Isp);
        link.corrupt_reads.insert(FLASH_BASE + 128, 1);
        let (mut prog, sink) = programmer(link);

        prog.flash(&[0x5A; 384], FLASH_BASE, true).unwrap();

        let link = prog.link();
        assert_eq!(link.writes_at(FLASH_BASE), 1);
        assert_eq!(link.writes_at(FLASH_BASE + 128), 2);
        assert_eq!(link.writes_at(FLASH_BASE + 256), 1);
        assert_eq!(sink.messages(Severity::Warning), vec!["Retrain at: 0x08000080"]);
    }

    #[test]
    fn test_verify_gives_up_after_budget() {
        let mut link = FakeLink::new(ProtocolVariant::Isp);
        link.corrupt_reads.insert(FLASH_BASE + 128, NRETRY + 1);
        let (mut prog, sink) = programmer(link);

        let result = prog.flash(&[0x5A; 256], FLASH_BASE, true);

        assert!(matches!(
            result,
            Err(Error::VerifyMismatch { address }) if address == FLASH_BASE + 128
        ));
        assert_eq!(prog.link().writes_at(FLASH_BASE + 128), NRETRY + 1);
        assert!(!prog.link().is_open());
        assert_eq!(sink.messages(Severity::Error), vec!["Fail! at 0x08000080"]);
    }

    #[test]
    fn test_retry_exhaustion_returns_last_error() {
        let mut link = FakeLink::new(ProtocolVariant::Isp);
        link.fail_reads.insert(FLASH_BASE, NRETRY + 1);
        let (mut prog, sink) = programmer(link);
        let mut out = Vec::new();

        let result = prog.dump(MemoryRange::new(FLASH_BASE, 256), &mut out);

        assert!(matches!(result, Err(Error::Timeout(msg)) if msg == "scripted"));
        assert_eq!(prog.link().reads_at(FLASH_BASE), NRETRY + 1);
        assert_eq!(sink.messages(Severity::Warning).len(), NRETRY);
        assert!(out.is_empty());
    }

    #[test]
    fn test_retry_recovers_within_budget() {
        let mut link = FakeLink::new(ProtocolVariant::Isp);
        link.fail_writes.insert(FLASH_BASE, NRETRY);
        let (mut prog, sink) = programmer(link);

        prog.flash(&[0x11; 128], FLASH_BASE, false).unwrap();

        assert_eq!(prog.link().writes_at(FLASH_BASE), NRETRY + 1);
        assert_eq!(sink.messages(Severity::Info).last().unwrap(), "Ok!");
    }

    #[test]
    fn test_dump_truncates_at_last_good_chunk() {
        let mut link = FakeLink::new(ProtocolVariant::Isp);
        link.fail_reads.insert(FLASH_BASE + 256, NRETRY + 1);
        let expected = link.memory[..256].to_vec();
        let (mut prog, _sink) = programmer(link);
        let mut out = Vec::new();

        assert!(prog.dump(MemoryRange::new(FLASH_BASE, 512), &mut out).is_err());
        assert_eq!(out, expected);
        assert!(!prog.link().is_open());
    }

    #[test]
    fn test_dump_reads_exact_tail() {
        let link = FakeLink::new(ProtocolVariant::Isp);
        let expected = link.memory[..200].to_vec();
        let (mut prog, _sink) = programmer(link);
        let mut out = Vec::new();

        prog.dump(MemoryRange::new(FLASH_BASE, 200), &mut out).unwrap();

        assert_eq!(out, expected);
        assert_eq!(prog.link().ops[1], Op::Read(FLASH_BASE + 128, 72));
    }

    #[test]
    fn test_dump_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.bin");
        let link = FakeLink::new(ProtocolVariant::Isp);
        let expected = link.memory[..384].to_vec();
        let (mut prog, _sink) = programmer(link);

        prog.dump_to_file(MemoryRange::new(FLASH_BASE, 384), &path).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), expected);
    }

    #[test]
    fn test_dump_to_unwritable_path_is_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("dump.bin");
        let (mut prog, _sink) = programmer(FakeLink::new(ProtocolVariant::Isp));

        let result = prog.dump_to_file(MemoryRange::new(FLASH_BASE, 128), &path);

        assert!(matches!(result, Err(Error::File { .. })));
        assert!(prog.link().ops.is_empty());
    }

    #[test]
    fn test_not_active_aborts_without_retry() {
        let link = FakeLink::new(ProtocolVariant::Isp);
        link.open.set(false);
        let (mut prog, sink) = programmer(link);

        let result = prog.flash(&[0; 128], FLASH_BASE, false);

        assert!(matches!(result, Err(Error::NotActive)));
        assert!(sink.messages(Severity::Warning).is_empty());
    }

    #[test]
    fn test_erase_retries_failing_page() {
        let mut link = FakeLink::new(ProtocolVariant::Isp);
        link.fail_erases.insert(1, NRETRY);
        let (mut prog, sink) = programmer(link);

        prog.erase(MemoryRange::new(FLASH_BASE, 256)).unwrap();

        let page1 = prog
            .link()
            .ops
            .iter()
            .filter(|op| **op == Op::Erase(EraseRequest::Page(1)))
            .count();
        assert_eq!(page1, NRETRY + 1);
        assert_eq!(sink.messages(Severity::Warning).len(), NRETRY);
        assert_eq!(sink.messages(Severity::Warning)[0], "Retrain at: 0x08000080");
        assert_eq!(sink.messages(Severity::Info).last().unwrap(), "Ok!");
        assert!(prog.link().is_open());
    }

    #[test]
    fn test_erase_exhaustion_closes_link() {
        let mut link = FakeLink::new(ProtocolVariant::Isp);
        link.fail_erases.insert(1, NRETRY + 1);
        let (mut prog, sink) = programmer(link);

        let result = prog.erase(MemoryRange::new(FLASH_BASE, 384));

        assert!(matches!(result, Err(Error::Nack)));
        assert!(!prog.link().is_open());
        assert_eq!(sink.messages(Severity::Error), vec!["Fail! at 0x08000080"]);
        // The page after the failing one is never touched
        assert!(!prog.link().ops.contains(&Op::Erase(EraseRequest::Page(2))));
    }

    #[test]
    fn test_erase_uses_basic_pages() {
        let (mut prog, _sink) = programmer(FakeLink::new(ProtocolVariant::Isp));
        prog.erase(MemoryRange::new(FLASH_BASE + 256, 256)).unwrap();
        assert_eq!(
            prog.link().ops,
            vec![
                Op::Erase(EraseRequest::Page(2)),
                Op::Erase(EraseRequest::Page(3)),
            ]
        );
    }

    #[test]
    fn test_erase_uses_extended_pages_when_reported() {
        let mut link = FakeLink::new(ProtocolVariant::Isp);
        link.extended = true;
        let (mut prog, _sink) = programmer(link);
        prog.erase(MemoryRange::new(FLASH_BASE, 256)).unwrap();
        assert_eq!(
            prog.link().ops,
            vec![
                Op::Erase(EraseRequest::Extended(0)),
                Op::Erase(EraseRequest::Extended(1)),
            ]
        );
    }

    #[test]
    fn test_erase_below_flash_base_is_invalid() {
        let (mut prog, _sink) = programmer(FakeLink::new(ProtocolVariant::Isp));
        let result = prog.erase(MemoryRange::new(FLASH_BASE - 128, 128));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(prog.link().ops.is_empty());
        assert!(!prog.link().is_open());
    }

    #[test]
    fn test_dfu_flash_erases_then_writes_without_verify() {
        let (mut prog, sink) = programmer(FakeLink::new(ProtocolVariant::Dfu));

        prog.flash(&[0x77; 1500], FLASH_BASE, true).unwrap();

        assert_eq!(
            prog.link().ops,
            vec![
                Op::Erase(EraseRequest::Range {
                    address: FLASH_BASE,
                    len: 1024
                }),
                Op::Erase(EraseRequest::Range {
                    address: FLASH_BASE + 1024,
                    len: 1024
                }),
                Op::Write(FLASH_BASE, 1024),
                Op::Write(FLASH_BASE + 1024, 1024),
            ]
        );
        assert_eq!(sink.messages(Severity::Info).last().unwrap(), "Ok!");
    }

    #[test]
    fn test_dfu_flash_does_not_retry() {
        let mut link = FakeLink::new(ProtocolVariant::Dfu);
        link.fail_writes.insert(FLASH_BASE, 1);
        let (mut prog, _sink) = programmer(link);

        assert!(matches!(prog.flash(&[1; 64], FLASH_BASE, false), Err(Error::Nack)));
        assert_eq!(prog.link().writes_at(FLASH_BASE), 1);
    }

    #[test]
    fn test_progress_ticks_at_interval_and_end() {
        let (mut prog, sink) = programmer(FakeLink::new(ProtocolVariant::Isp));
        let mut out = Vec::new();
        prog.dump(MemoryRange::new(FLASH_BASE, 25 * 128), &mut out).unwrap();
        assert_eq!(sink.progress_ticks(), vec![(10, 25), (20, 25), (25, 25)]);
    }

    #[test]
    fn test_single_command_workflows() {
        let (mut prog, sink) = programmer(FakeLink::new(ProtocolVariant::Isp));
        prog.mass_erase().unwrap();
        assert_eq!(prog.link().ops, vec![Op::Erase(EraseRequest::Mass)]);
        assert_eq!(
            sink.messages(Severity::Hint),
            vec!["Mass erase complete. Device is reset"]
        );

        prog.protect().unwrap();
        assert!(!prog.link().is_open());
    }

    #[test]
    fn test_drop_closes_link() {
        let link = FakeLink::new(ProtocolVariant::Isp);
        let open = link.open.clone();
        let (prog, _sink) = programmer(link);
        drop(prog);
        assert!(!open.get());
    }

    #[test]
    fn test_flash_verify_over_serial_session() {
        use crate::port::{IspRevision, mock::MockPort};
        use crate::protocol::isp::{ISP_ACK, ISP_NACK, encode_frame};
        use crate::target::{IspConfig, IspLink};

        let port = MockPort::with_rx(&[ISP_ACK]);
        let config = IspConfig::default()
            .with_revision(IspRevision::Legacy)
            .with_handshake_attempts(5);
        let mut link = IspLink::new(port.clone(), config, Reporter::default());
        link.connect().unwrap();
        port.clear_written();

        let image = [0x5A; 100];
        let mut page = image.to_vec();
        page.resize(128, 0);
        // First data frame is rejected, the retry goes through
        port.push_rx(&[ISP_ACK, ISP_ACK, ISP_NACK]);
        port.push_rx(&[ISP_ACK, ISP_ACK, ISP_ACK]);
        port.push_rx(&[ISP_ACK, ISP_ACK, ISP_ACK]);
        port.push_rx(&page);
        let sink = Arc::new(MemorySink::new());
        let mut prog = Programmer::new(link, Reporter::new(sink.clone()));

        prog.flash(&image, FLASH_BASE, true).unwrap();

        let mut data_frame = vec![0x7F];
        data_frame.extend_from_slice(&page);
        let write: Vec<u8> = [
            encode_frame(&[0x31]),
            encode_frame(&FLASH_BASE.to_be_bytes()),
            encode_frame(&data_frame),
        ]
        .concat();
        let read: Vec<u8> = [
            encode_frame(&[0x11]),
            encode_frame(&FLASH_BASE.to_be_bytes()),
            encode_frame(&[0x7F]),
        ]
        .concat();
        assert_eq!(port.written(), [write.clone(), write, read].concat());
        assert_eq!(sink.messages(Severity::Warning), vec!["Retrain at: 0x08000000"]);
        assert!(prog.link().is_open());
    }
}

//! Fallback-chain image flashing.
//!
//! Writing an image to a device is the one operation here that fails in
//! interesting ways, so it is built around an ordered chain of
//! [`FlashMethod`] strategies: each is attempted exactly once, any failure
//! moves the chain on to the next method, and only exhausting the whole
//! chain is terminal. Re-running (repeating the entire chain, path checks
//! included) is the outer [`crate::retry`] layer's job; no method retries
//! itself.
//!
//! Two methods are built in: [`RawCopy`], a direct block-level copy with a
//! fixed block size, and [`PlainCopy`], a buffered fallback copy. Compressed
//! images (`.gz`, `.xz`, `.zst`) are decompressed to a temporary file before
//! flashing, and `.torrent` files are handed to an [`IsoConverter`]
//! collaborator to produce an ISO first.
//!
//! The flasher takes device paths exactly as supplied. It does not check
//! that a path names a block device rather than a regular file; pointing it
//! at the wrong path writes the image there.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::error::{RecoveryError, Result};
use crate::journal::Journal;

/// Block size used by [`RawCopy`], matching the classic `dd bs=4M`.
pub const RAW_BLOCK_SIZE: usize = 4 * 1024 * 1024;

// Buffer size for buffered copies and verification reads.
const COPY_BUFFER: usize = 1024 * 1024; // 1 MiB

// O_DIRECT needs buffer addresses and write sizes aligned to the sector.
const DIRECT_ALIGN: usize = 512;

/// Progress notifications emitted while a flash runs.
///
/// The CLI maps these onto progress bars; library users may ignore them.
#[derive(Debug, Clone, Copy)]
pub enum FlashEvent<'a> {
    /// Decompression of a compressed image began.
    DecompressStarted,
    /// Bytes decompressed so far.
    DecompressProgress(u64),
    /// Torrent-to-ISO conversion began.
    ConvertStarted,
    /// A flash method is about to run.
    MethodStarted { name: &'a str },
    /// The current method began writing; the payload is the total byte count.
    WriteStarted(u64),
    /// Bytes written so far by the current method.
    WriteProgress(u64),
    /// Verification began; the payload is the total byte count.
    VerifyStarted(u64),
    /// Bytes verified so far.
    VerifyProgress(u64),
}

/// Cancellation flag and progress callback shared with every method attempt.
pub struct FlashCtx<'a> {
    running: &'a AtomicBool,
    report: &'a dyn Fn(FlashEvent<'_>),
}

impl<'a> FlashCtx<'a> {
    pub fn new(running: &'a AtomicBool, report: &'a dyn Fn(FlashEvent<'_>)) -> Self {
        Self { running, report }
    }

    /// Emits a progress event.
    pub fn emit(&self, event: FlashEvent<'_>) {
        (self.report)(event);
    }

    /// Fails with [`RecoveryError::Cancelled`] once the shared flag drops.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RecoveryError::Cancelled)
        }
    }
}

/// One concrete strategy for getting image bytes onto a device.
///
/// Implementations make a single attempt and never retry internally. A
/// returned error moves the chain on to the next method, except for
/// [`RecoveryError::Cancelled`], which aborts the whole chain.
pub trait FlashMethod {
    /// Short name used in journal records and progress displays.
    fn name(&self) -> &'static str;

    /// Writes `image` to `device` once.
    fn attempt(&self, image: &Path, device: &Path, ctx: &FlashCtx<'_>) -> Result<()>;
}

/// External collaborator that materialises a local ISO from a torrent file.
///
/// The toolkit ships no implementation; flashing a `.torrent` without a
/// converter configured fails with [`RecoveryError::Conversion`].
pub trait IsoConverter {
    /// Produces an ISO for `torrent` and returns its path.
    fn convert(&self, torrent: &Path) -> Result<PathBuf>;
}

/// Direct block-level copy, the primary flash method.
///
/// Writes fixed-size blocks straight to the device. With `direct` set the
/// device is opened `O_DIRECT`, which requires the aligned buffer and tail
/// padding below; cleared, it degrades to ordinary writes so the method can
/// also run against regular files.
pub struct RawCopy {
    /// Bytes copied per write. Must be a multiple of 512 when `direct` is set.
    pub block_size: usize,
    /// Open the device with `O_DIRECT` (Unix only; ignored elsewhere).
    pub direct: bool,
}

impl Default for RawCopy {
    fn default() -> Self {
        Self {
            block_size: RAW_BLOCK_SIZE,
            direct: true,
        }
    }
}

impl FlashMethod for RawCopy {
    fn name(&self) -> &'static str {
        "raw-copy"
    }

    fn attempt(&self, image: &Path, device: &Path, ctx: &FlashCtx<'_>) -> Result<()> {
        let mut image_file = File::open(image)
            .map_err(|e| RecoveryError::io(format!("opening image {}", image.display()), e))?;
        let image_len = image_file
            .metadata()
            .map_err(|e| RecoveryError::io(format!("sizing image {}", image.display()), e))?
            .len();

        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true);
        #[cfg(unix)]
        if self.direct {
            opts.custom_flags(libc::O_DIRECT);
        }
        let mut device_file = opts
            .open(device)
            .map_err(|e| RecoveryError::io(format!("opening device {}", device.display()), e))?;

        ctx.emit(FlashEvent::WriteStarted(image_len));

        // Over-allocate so a sector-aligned window exists inside the buffer.
        let mut backing = vec![0u8; self.block_size + DIRECT_ALIGN];
        let offset = backing.as_ptr().align_offset(DIRECT_ALIGN);
        let buffer = &mut backing[offset..offset + self.block_size];

        let mut written: u64 = 0;
        while written < image_len {
            ctx.check_cancelled()?;

            let to_read = std::cmp::min(self.block_size as u64, image_len - written) as usize;
            image_file
                .read_exact(&mut buffer[..to_read])
                .map_err(|e| RecoveryError::io("reading image block", e))?;

            // The tail may not be a whole number of sectors; pad it with
            // zeros when writing O_DIRECT.
            let write_len = if self.direct && to_read % DIRECT_ALIGN != 0 {
                let padded = to_read.div_ceil(DIRECT_ALIGN) * DIRECT_ALIGN;
                buffer[to_read..padded].fill(0);
                padded
            } else {
                to_read
            };

            device_file
                .write_all(&buffer[..write_len])
                .map_err(|e| RecoveryError::io("writing device block", e))?;
            written += to_read as u64;
            ctx.emit(FlashEvent::WriteProgress(written));
        }

        device_file
            .flush()
            .map_err(|e| RecoveryError::io("flushing device", e))
    }
}

/// Buffered whole-file copy, the fallback flash method.
pub struct PlainCopy;

impl FlashMethod for PlainCopy {
    fn name(&self) -> &'static str {
        "plain-copy"
    }

    fn attempt(&self, image: &Path, device: &Path, ctx: &FlashCtx<'_>) -> Result<()> {
        let image_file = File::open(image)
            .map_err(|e| RecoveryError::io(format!("opening image {}", image.display()), e))?;
        let image_len = image_file
            .metadata()
            .map_err(|e| RecoveryError::io(format!("sizing image {}", image.display()), e))?
            .len();
        let mut reader = BufReader::new(image_file);

        let device_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(device)
            .map_err(|e| RecoveryError::io(format!("opening device {}", device.display()), e))?;

        ctx.emit(FlashEvent::WriteStarted(image_len));

        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut written: u64 = 0;
        {
            let mut writer = BufWriter::new(&device_file);
            loop {
                ctx.check_cancelled()?;

                let n = reader
                    .read(&mut buffer)
                    .map_err(|e| RecoveryError::io("reading image", e))?;
                if n == 0 {
                    break;
                }
                writer
                    .write_all(&buffer[..n])
                    .map_err(|e| RecoveryError::io("writing device", e))?;
                written += n as u64;
                ctx.emit(FlashEvent::WriteProgress(written));
            }
            writer
                .flush()
                .map_err(|e| RecoveryError::io("flushing device", e))?;
        }

        device_file
            .sync_all()
            .map_err(|e| RecoveryError::io("syncing device", e))
    }
}

/// Writes images to devices by walking an ordered chain of methods.
pub struct Flasher {
    journal: Arc<Journal>,
    methods: Vec<Box<dyn FlashMethod>>,
    converter: Option<Box<dyn IsoConverter>>,
    verify: bool,
    running: Arc<AtomicBool>,
    report: Box<dyn Fn(FlashEvent<'_>)>,
}

impl Flasher {
    /// A flasher with the standard chain: [`RawCopy`] then [`PlainCopy`].
    pub fn new(journal: Arc<Journal>) -> Self {
        Self::with_methods(
            journal,
            vec![Box::new(RawCopy::default()), Box::new(PlainCopy)],
        )
    }

    /// A flasher with a caller-supplied method chain, tried in order.
    pub fn with_methods(journal: Arc<Journal>, methods: Vec<Box<dyn FlashMethod>>) -> Self {
        Self {
            journal,
            methods,
            converter: None,
            verify: false,
            running: Arc::new(AtomicBool::new(true)),
            report: Box::new(|_| {}),
        }
    }

    /// Wires in the torrent-to-ISO collaborator.
    pub fn converter(mut self, converter: Box<dyn IsoConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Enables a SHA-256 read-back comparison after each successful method.
    ///
    /// A mismatch demotes that method's success to a failure and lets the
    /// chain continue with the next method.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Shares a cancellation flag; clearing it fails the flash with
    /// [`RecoveryError::Cancelled`].
    pub fn running(mut self, flag: Arc<AtomicBool>) -> Self {
        self.running = flag;
        self
    }

    /// Registers a callback receiving [`FlashEvent`] progress notifications.
    pub fn on_event(mut self, report: impl Fn(FlashEvent<'_>) + 'static) -> Self {
        self.report = Box::new(report);
        self
    }

    /// Writes `image` to `device`, picking a path by file extension.
    ///
    /// `.iso` images are flashed directly; `.torrent` files go through the
    /// configured [`IsoConverter`] first; `.gz`/`.xz`/`.zst` images are
    /// decompressed to a temporary file. Anything else fails with
    /// [`RecoveryError::UnsupportedFormat`] before any method runs.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::PathNotFound`] if `image` does not exist,
    /// [`RecoveryError::Conversion`] if a torrent has no converter,
    /// [`RecoveryError::MethodsExhausted`] if every method failed, or
    /// [`RecoveryError::Cancelled`] if the shared flag was cleared.
    pub fn flash(&self, image: &Path, device: &Path) -> Result<()> {
        if !image.exists() {
            let err = RecoveryError::PathNotFound(image.to_path_buf());
            self.journal.error(format!("flash aborted: {err}"));
            return Err(err);
        }

        let ext = image
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "iso" => self.flash_iso(image, device),
            "torrent" => {
                let iso = self.convert_torrent(image)?;
                self.flash_iso(&iso, device)
            }
            "gz" | "gzip" | "xz" | "zst" | "zstd" => {
                self.journal.info(format!(
                    "decompressing {} before flashing",
                    image.display()
                ));
                let staged = match decompress(image, &ext, &self.ctx()) {
                    Ok(staged) => staged,
                    Err(RecoveryError::Cancelled) => {
                        self.journal.warn("flash cancelled");
                        return Err(RecoveryError::Cancelled);
                    }
                    Err(e) => {
                        self.journal.error(format!("flash aborted: {e}"));
                        return Err(e);
                    }
                };
                self.flash_iso(&staged.path, device)
            }
            _ => {
                let err = RecoveryError::UnsupportedFormat(ext);
                self.journal.error(format!("flash aborted: {err}"));
                Err(err)
            }
        }
    }

    fn ctx(&self) -> FlashCtx<'_> {
        FlashCtx {
            running: &self.running,
            report: self.report.as_ref(),
        }
    }

    fn convert_torrent(&self, torrent: &Path) -> Result<PathBuf> {
        let Some(converter) = self.converter.as_deref() else {
            let err =
                RecoveryError::Conversion("no torrent-to-ISO converter is configured".into());
            self.journal.error(format!("flash aborted: {err}"));
            return Err(err);
        };

        self.ctx().emit(FlashEvent::ConvertStarted);
        match converter.convert(torrent) {
            Ok(iso) => {
                self.journal.info(format!(
                    "converted {} to {}",
                    torrent.display(),
                    iso.display()
                ));
                Ok(iso)
            }
            Err(e) => {
                self.journal.error(format!("flash aborted: {e}"));
                Err(e)
            }
        }
    }

    fn flash_iso(&self, iso: &Path, device: &Path) -> Result<()> {
        if !iso.exists() {
            let err = RecoveryError::PathNotFound(iso.to_path_buf());
            self.journal.error(format!("flash aborted: {err}"));
            return Err(err);
        }

        let ctx = self.ctx();
        for method in &self.methods {
            self.journal
                .info(format!("attempting flash method `{}`", method.name()));
            ctx.emit(FlashEvent::MethodStarted {
                name: method.name(),
            });

            match method.attempt(iso, device, &ctx) {
                Ok(()) => {
                    if self.verify && !self.confirm_written(method.name(), iso, device, &ctx)? {
                        continue;
                    }
                    self.journal.info(format!(
                        "flashed {} to {} using `{}`",
                        iso.display(),
                        device.display(),
                        method.name()
                    ));
                    return Ok(());
                }
                Err(RecoveryError::Cancelled) => {
                    self.journal.warn("flash cancelled");
                    return Err(RecoveryError::Cancelled);
                }
                Err(e) => {
                    self.journal
                        .warn(format!("flash method `{}` failed: {e}", method.name()));
                }
            }
        }

        let err = RecoveryError::MethodsExhausted(iso.to_path_buf());
        self.journal.error(err.to_string());
        Err(err)
    }

    /// `Ok(false)` means the written data did not check out and the chain
    /// should move on; only cancellation escapes as an error.
    fn confirm_written(
        &self,
        name: &str,
        iso: &Path,
        device: &Path,
        ctx: &FlashCtx<'_>,
    ) -> Result<bool> {
        match verify_written(iso, device, ctx) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.journal
                    .warn(format!("method `{name}` wrote data that failed verification"));
                Ok(false)
            }
            Err(RecoveryError::Cancelled) => {
                self.journal.warn("flash cancelled");
                Err(RecoveryError::Cancelled)
            }
            Err(e) => {
                self.journal
                    .warn(format!("could not verify method `{name}`: {e}"));
                Ok(false)
            }
        }
    }
}

/// Compares the SHA-256 of the image against the device's leading bytes.
fn verify_written(image: &Path, device: &Path, ctx: &FlashCtx<'_>) -> Result<bool> {
    let mut image_file = File::open(image)
        .map_err(|e| RecoveryError::io(format!("opening image {}", image.display()), e))?;
    let image_len = image_file
        .metadata()
        .map_err(|e| RecoveryError::io(format!("sizing image {}", image.display()), e))?
        .len();
    let mut device_file = File::open(device)
        .map_err(|e| RecoveryError::io(format!("reading back {}", device.display()), e))?;

    ctx.emit(FlashEvent::VerifyStarted(image_len));

    let mut image_hasher = Sha256::new();
    let mut device_hasher = Sha256::new();
    let mut image_buf = vec![0u8; COPY_BUFFER];
    let mut device_buf = vec![0u8; COPY_BUFFER];

    let mut remaining = image_len;
    while remaining > 0 {
        ctx.check_cancelled()?;

        let chunk = std::cmp::min(COPY_BUFFER as u64, remaining) as usize;
        image_file
            .read_exact(&mut image_buf[..chunk])
            .map_err(|e| RecoveryError::io("reading image for verification", e))?;
        device_file
            .read_exact(&mut device_buf[..chunk])
            .map_err(|e| RecoveryError::io("reading device for verification", e))?;

        image_hasher.update(&image_buf[..chunk]);
        device_hasher.update(&device_buf[..chunk]);

        remaining -= chunk as u64;
        ctx.emit(FlashEvent::VerifyProgress(image_len - remaining));
    }

    Ok(image_hasher.finalize() == device_hasher.finalize())
}

/// A decompressed image staged in a temporary file, deleted on drop.
struct StagedImage {
    path: PathBuf,
    _temp: TempPath,
}

fn decompress(image: &Path, ext: &str, ctx: &FlashCtx<'_>) -> Result<StagedImage> {
    let input = File::open(image)
        .map_err(|e| RecoveryError::io(format!("opening image {}", image.display()), e))?;

    let mut reader: Box<dyn Read> = match ext {
        "gz" | "gzip" => Box::new(GzDecoder::new(BufReader::new(input))),
        "xz" => Box::new(XzDecoder::new(BufReader::new(input))),
        "zst" | "zstd" => Box::new(
            ZstdDecoder::new(BufReader::new(input))
                .map_err(|e| RecoveryError::io("starting zstd decoder", e))?,
        ),
        other => return Err(RecoveryError::UnsupportedFormat(other.to_string())),
    };

    ctx.emit(FlashEvent::DecompressStarted);

    let mut temp =
        NamedTempFile::new().map_err(|e| RecoveryError::io("creating staging file", e))?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        let mut buffer = [0u8; 8192];
        let mut total: u64 = 0;

        loop {
            ctx.check_cancelled()?;

            let n = reader
                .read(&mut buffer)
                .map_err(|e| RecoveryError::io("decompressing image", e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buffer[..n])
                .map_err(|e| RecoveryError::io("writing staged image", e))?;
            total += n as u64;
            ctx.emit(FlashEvent::DecompressProgress(total));
        }
        writer
            .flush()
            .map_err(|e| RecoveryError::io("writing staged image", e))?;
    }

    let temp_path = temp.into_temp_path();
    Ok(StagedImage {
        path: temp_path.to_path_buf(),
        _temp: temp_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::fs;
    use std::io;
    use std::rc::Rc;

    enum Outcome {
        Succeed,
        Fail,
        Cancel,
    }

    /// Records every attempt and follows a fixed script.
    struct Scripted {
        name: &'static str,
        outcome: Outcome,
        seen: Rc<RefCell<Vec<(&'static str, PathBuf)>>>,
    }

    impl FlashMethod for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn attempt(&self, image: &Path, _device: &Path, _ctx: &FlashCtx<'_>) -> Result<()> {
            self.seen.borrow_mut().push((self.name, image.to_path_buf()));
            match self.outcome {
                Outcome::Succeed => Ok(()),
                Outcome::Fail => Err(RecoveryError::io(
                    "simulated failure",
                    io::Error::other("boom"),
                )),
                Outcome::Cancel => Err(RecoveryError::Cancelled),
            }
        }
    }

    fn scripted(
        name: &'static str,
        outcome: Outcome,
        seen: &Rc<RefCell<Vec<(&'static str, PathBuf)>>>,
    ) -> Box<dyn FlashMethod> {
        Box::new(Scripted {
            name,
            outcome,
            seen: Rc::clone(seen),
        })
    }

    fn journal(dir: &tempfile::TempDir) -> Arc<Journal> {
        Arc::new(Journal::open(dir.path().join("events.log")).unwrap())
    }

    #[test]
    fn a_later_method_rescues_an_earlier_failure() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        let image = dir.path().join("distro.iso");
        fs::write(&image, b"bootable bits").unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![
                scripted("first", Outcome::Fail, &seen),
                scripted("second", Outcome::Succeed, &seen),
            ],
        );

        flasher.flash(&image, &dir.path().join("dev")).unwrap();

        let names: Vec<&str> = seen.borrow().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["first", "second"]);

        let log = fs::read_to_string(journal.path()).unwrap();
        let warn = log.lines().position(|l| l.contains("`first` failed"));
        let done = log.lines().position(|l| l.contains("using `second`"));
        assert!(warn.unwrap() < done.unwrap(), "journal:\n{log}");
    }

    #[test]
    fn exhausting_every_method_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        let image = dir.path().join("distro.iso");
        fs::write(&image, b"bootable bits").unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![
                scripted("first", Outcome::Fail, &seen),
                scripted("second", Outcome::Fail, &seen),
            ],
        );

        let err = flasher.flash(&image, &dir.path().join("dev")).unwrap_err();
        assert!(matches!(err, RecoveryError::MethodsExhausted(_)), "got {err}");

        // Each method attempted exactly once, in declared order.
        let names: Vec<&str> = seen.borrow().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn unsupported_extensions_attempt_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        let notes = dir.path().join("notes.txt");
        fs::write(&notes, b"not an image").unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![scripted("only", Outcome::Succeed, &seen)],
        );

        let err = flasher.flash(&notes, &dir.path().join("dev")).unwrap_err();
        match err {
            RecoveryError::UnsupportedFormat(ext) => assert_eq!(ext, "txt"),
            other => panic!("expected UnsupportedFormat, got {other}"),
        }
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn a_missing_image_fails_before_any_method() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![scripted("only", Outcome::Succeed, &seen)],
        );

        let err = flasher
            .flash(&dir.path().join("ghost.iso"), &dir.path().join("dev"))
            .unwrap_err();
        assert!(matches!(err, RecoveryError::PathNotFound(_)), "got {err}");
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn cancellation_aborts_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        let image = dir.path().join("distro.iso");
        fs::write(&image, b"bootable bits").unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![
                scripted("first", Outcome::Cancel, &seen),
                scripted("second", Outcome::Succeed, &seen),
            ],
        );

        let err = flasher.flash(&image, &dir.path().join("dev")).unwrap_err();
        assert!(matches!(err, RecoveryError::Cancelled), "got {err}");
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn torrents_need_a_converter() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        let torrent = dir.path().join("distro.torrent");
        fs::write(&torrent, b"d8:announce0:e").unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![scripted("only", Outcome::Succeed, &seen)],
        );

        let err = flasher.flash(&torrent, &dir.path().join("dev")).unwrap_err();
        assert!(matches!(err, RecoveryError::Conversion(_)), "got {err}");
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn converted_torrents_are_flashed() {
        struct FixedConverter {
            iso: PathBuf,
        }
        impl IsoConverter for FixedConverter {
            fn convert(&self, _torrent: &Path) -> Result<PathBuf> {
                fs::write(&self.iso, b"converted payload").unwrap();
                Ok(self.iso.clone())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        let torrent = dir.path().join("distro.torrent");
        fs::write(&torrent, b"d8:announce0:e").unwrap();
        let iso = dir.path().join("staged.iso");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![scripted("only", Outcome::Succeed, &seen)],
        )
        .converter(Box::new(FixedConverter { iso: iso.clone() }));

        flasher.flash(&torrent, &dir.path().join("dev")).unwrap();

        // The method saw the converted ISO, not the torrent.
        assert_eq!(seen.borrow()[0].1, iso);
    }

    #[test]
    fn compressed_images_are_staged_before_flashing() {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        /// Captures the bytes of whatever image it is asked to flash.
        struct Capturing {
            bytes: Rc<RefCell<Vec<u8>>>,
        }
        impl FlashMethod for Capturing {
            fn name(&self) -> &'static str {
                "capture"
            }
            fn attempt(&self, image: &Path, _device: &Path, _ctx: &FlashCtx<'_>) -> Result<()> {
                *self.bytes.borrow_mut() = fs::read(image).unwrap();
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);

        let payload = b"the actual image contents".to_vec();
        let compressed = dir.path().join("image.iso.gz");
        let mut encoder = GzEncoder::new(File::create(&compressed).unwrap(), Compression::fast());
        encoder.write_all(&payload).unwrap();
        encoder.finish().unwrap();

        let bytes = Rc::new(RefCell::new(Vec::new()));
        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![Box::new(Capturing {
                bytes: Rc::clone(&bytes),
            })],
        );

        flasher.flash(&compressed, &dir.path().join("dev")).unwrap();
        assert_eq!(*bytes.borrow(), payload);
    }

    #[test]
    fn a_corrupt_archive_is_journalled_before_failing() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        let bogus = dir.path().join("image.iso.gz");
        fs::write(&bogus, b"this is not a gzip stream").unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![scripted("only", Outcome::Succeed, &seen)],
        );

        let err = flasher.flash(&bogus, &dir.path().join("dev")).unwrap_err();
        assert!(matches!(err, RecoveryError::Io { .. }), "got {err}");
        assert!(seen.borrow().is_empty());

        let log = fs::read_to_string(journal.path()).unwrap();
        assert!(log.contains("ERROR"), "journal:\n{log}");
        assert!(log.contains("flash aborted"), "journal:\n{log}");
    }

    #[test]
    fn raw_copy_reproduces_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image.iso");
        let device = dir.path().join("device.img");
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&image, &payload).unwrap();

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        let report = move |event: FlashEvent<'_>| sink.borrow_mut().push(format!("{event:?}"));
        let running = AtomicBool::new(true);
        let ctx = FlashCtx::new(&running, &report);

        let method = RawCopy {
            block_size: 1024,
            direct: false,
        };
        method.attempt(&image, &device, &ctx).unwrap();

        assert_eq!(fs::read(&device).unwrap(), payload);
        let events = events.borrow();
        assert!(events.contains(&"WriteStarted(3000)".to_string()));
        assert_eq!(events.last().unwrap(), "WriteProgress(3000)");
    }

    #[test]
    fn plain_copy_reproduces_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image.iso");
        let device = dir.path().join("device.img");
        let payload = b"small payload".repeat(100);
        fs::write(&image, &payload).unwrap();

        let report = |_: FlashEvent<'_>| {};
        let running = AtomicBool::new(true);
        let ctx = FlashCtx::new(&running, &report);

        PlainCopy.attempt(&image, &device, &ctx).unwrap();
        assert_eq!(fs::read(&device).unwrap(), payload);
    }

    #[test]
    fn a_cleared_flag_cancels_mid_copy() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image.iso");
        let device = dir.path().join("device.img");
        fs::write(&image, vec![7u8; 4096]).unwrap();

        let report = |_: FlashEvent<'_>| {};
        let running = AtomicBool::new(false);
        let ctx = FlashCtx::new(&running, &report);

        let err = PlainCopy.attempt(&image, &device, &ctx).unwrap_err();
        assert!(matches!(err, RecoveryError::Cancelled), "got {err}");
    }

    #[test]
    fn verification_demotes_methods_that_wrote_garbage() {
        /// Reports success after writing the right length of wrong bytes.
        struct WritesGarbage;
        impl FlashMethod for WritesGarbage {
            fn name(&self) -> &'static str {
                "garbage"
            }
            fn attempt(&self, image: &Path, device: &Path, _ctx: &FlashCtx<'_>) -> Result<()> {
                let len = fs::metadata(image).unwrap().len() as usize;
                fs::write(device, vec![0u8; len]).unwrap();
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        let image = dir.path().join("image.iso");
        let device = dir.path().join("device.img");
        let payload = b"genuine image data".repeat(32);
        fs::write(&image, &payload).unwrap();

        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![Box::new(WritesGarbage), Box::new(PlainCopy)],
        )
        .verify(true);

        flasher.flash(&image, &device).unwrap();

        assert_eq!(fs::read(&device).unwrap(), payload);
        let log = fs::read_to_string(journal.path()).unwrap();
        assert!(log.contains("failed verification"), "journal:\n{log}");
    }

    #[test]
    fn cancellation_during_verification_is_journalled() {
        /// Copies the image without ever consulting the cancellation flag.
        struct BlindCopy;
        impl FlashMethod for BlindCopy {
            fn name(&self) -> &'static str {
                "blind-copy"
            }
            fn attempt(&self, image: &Path, device: &Path, _ctx: &FlashCtx<'_>) -> Result<()> {
                fs::copy(image, device).unwrap();
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        let image = dir.path().join("image.iso");
        fs::write(&image, b"genuine image data").unwrap();

        let flasher = Flasher::with_methods(Arc::clone(&journal), vec![Box::new(BlindCopy)])
            .verify(true)
            .running(Arc::new(AtomicBool::new(false)));

        let err = flasher
            .flash(&image, &dir.path().join("device.img"))
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Cancelled), "got {err}");

        let log = fs::read_to_string(journal.path()).unwrap();
        assert!(log.contains("flash cancelled"), "journal:\n{log}");
    }

    #[test]
    fn uppercase_extensions_are_recognised() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        let image = dir.path().join("DISTRO.ISO");
        fs::write(&image, b"bootable bits").unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![scripted("only", Outcome::Succeed, &seen)],
        );

        flasher.flash(&image, &dir.path().join("dev")).unwrap();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn event_callback_sees_method_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        let image = dir.path().join("distro.iso");
        fs::write(&image, b"bootable bits").unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let starts = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&starts);

        let flasher = Flasher::with_methods(
            Arc::clone(&journal),
            vec![
                scripted("first", Outcome::Fail, &seen),
                scripted("second", Outcome::Succeed, &seen),
            ],
        )
        .on_event(move |event| {
            if matches!(event, FlashEvent::MethodStarted { .. }) {
                counter.set(counter.get() + 1);
            }
        });

        flasher.flash(&image, &dir.path().join("dev")).unwrap();
        assert_eq!(starts.get(), 2);
    }
}

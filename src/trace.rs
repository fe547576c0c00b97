//! Stack capture, stack hashing and (report-side only) symbol resolution.

use std::{
    ffi::c_void,
    fmt, io,
    path::PathBuf,
};

use bytemuck::Zeroable;
use serde::{Deserialize, Serialize};

/// Maximum number of return addresses kept per stack.
pub const BACKTRACE_SIZE: usize = 64;

pub type StackHash = u64;

/// Multiplier of the polynomial stack hash (`2^64 / phi`).
pub const HASH_BASE: u64 = 11400714819323198485;

/// What a stack hash that lands on a table sentinel is remapped to.
pub const HASH_SUBSTITUTE: StackHash = 0xDEAF_BEEF;

/// Stack-hash sentinels of the site table.
pub const EMPTY_STACK_HASH: StackHash = 0;
pub const REMOVED_STACK_HASH: StackHash = StackHash::MAX;

/// A captured call stack: up to [`BACKTRACE_SIZE`] return addresses, unused
/// slots null, plus a hash of the captured addresses.
///
/// The stored hash is written out but never read back: deserializing rebuilds
/// the trace from its frames.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SerializedTrace")]
#[repr(C)]
pub struct StackTrace {
    #[serde(with = "crate::serialize::frames")]
    frames: [usize; BACKTRACE_SIZE],
    hash: StackHash,
}

// SAFETY: All fields are integers, all-zero is a valid (empty) trace
unsafe impl Zeroable for StackTrace {}

#[derive(Deserialize)]
struct SerializedTrace {
    #[serde(with = "crate::serialize::frames")]
    frames: [usize; BACKTRACE_SIZE],
}

impl From<SerializedTrace> for StackTrace {
    fn from(trace: SerializedTrace) -> Self {
        Self::from_frames(&trace.frames)
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackTrace")
            .field("hash", &format_args!("{:#018x}", self.hash))
            .field("depth", &self.depth())
            .finish()
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        Self::empty()
    }
}

/// One resolved frame of a [`StackTrace`]. Either half may be missing if the
/// binary has no symbols / no debug info for that address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub address: usize,
    pub name: Option<String>,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
}

impl StackTrace {
    /// A trace with no frames. Its hash is whatever an empty stack hashes to.
    pub const fn empty() -> Self {
        Self {
            frames: [0; BACKTRACE_SIZE],
            hash: remap(0),
        }
    }

    /// Walk the current thread's stack, dropping the innermost `skip` frames
    /// (the profiler's own). Does not resolve symbols, so this is fine to call
    /// from an allocation hook.
    #[inline(never)]
    pub fn capture(skip: usize) -> Self {
        let mut frames = [0usize; BACKTRACE_SIZE];
        let mut depth = 0;
        let mut skipped = 0;
        backtrace::trace(|frame| {
            if skipped < skip {
                skipped += 1;
                return true;
            }
            frames[depth] = frame.ip() as usize;
            depth += 1;
            depth < BACKTRACE_SIZE
        });
        Self::from_frames(&frames[..depth])
    }

    /// Build a trace from explicit return addresses, innermost first. The
    /// stack ends at the first null address, and anything past
    /// [`BACKTRACE_SIZE`] is dropped.
    pub fn from_frames(frames: &[usize]) -> Self {
        let depth = frames
            .iter()
            .position(|&ip| ip == 0)
            .unwrap_or(frames.len())
            .min(BACKTRACE_SIZE);
        let mut trace = Self::empty();
        trace.frames[..depth].copy_from_slice(&frames[..depth]);
        trace.hash = polynomial_hash(&frames[..depth]);
        trace
    }

    pub const fn hash(&self) -> StackHash {
        self.hash
    }

    /// The captured return addresses, up to the first null slot.
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.depth()]
    }

    pub fn depth(&self) -> usize {
        self.frames
            .iter()
            .position(|&ip| ip == 0)
            .unwrap_or(BACKTRACE_SIZE)
    }

    /// Resolve every frame to a symbol name and source location. This takes
    /// the `backtrace` symbolication lock and allocates freely: report path
    /// only.
    pub fn resolve(&self) -> Vec<ResolvedFrame> {
        self.frames()
            .iter()
            .map(|&address| {
                let mut frame = ResolvedFrame {
                    address,
                    name: None,
                    file: None,
                    line: None,
                };
                // Inlined frames resolve to several symbols; the first one is
                // the outermost function at this address
                backtrace::resolve(address as *mut c_void, |symbol| {
                    if frame.name.is_none() {
                        frame.name = symbol.name().map(|name| name.to_string());
                        frame.file = symbol.filename().map(PathBuf::from);
                        frame.line = symbol.lineno();
                    }
                });
                frame
            })
            .collect()
    }

    /// Print one line per frame:
    /// `    name    file:line    (address)`, or `    <no symbol>    (address)`.
    pub fn write_symbolized<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: io::Write,
    {
        for frame in self.resolve() {
            match &frame.name {
                Some(name) => {
                    write!(w, "    {name}")?;
                    if let (Some(file), Some(line)) = (&frame.file, frame.line) {
                        write!(w, "    {}:{line}", file.display())?;
                    }
                }
                None => write!(w, "    <no symbol>")?,
            }
            writeln!(w, "    ({:0width$x})", frame.address, width = 2 * std::mem::size_of::<usize>())?;
        }
        Ok(())
    }
}

/// `hash = hash * HASH_BASE + ip` over every frame, remapped off the sentinels.
fn polynomial_hash(frames: &[usize]) -> StackHash {
    let hash = frames
        .iter()
        .fold(0u64, |hash, &ip| hash.wrapping_mul(HASH_BASE).wrapping_add(ip as u64));
    remap(hash)
}

const fn remap(hash: StackHash) -> StackHash {
    if hash == EMPTY_STACK_HASH || hash == REMOVED_STACK_HASH {
        HASH_SUBSTITUTE
    } else {
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_polynomial_over_frames() {
        let trace = StackTrace::from_frames(&[3, 5]);
        assert_eq!(trace.hash(), 3u64.wrapping_mul(HASH_BASE).wrapping_add(5));
        assert_eq!(trace.frames(), &[3, 5]);
    }

    #[test]
    fn sentinel_hashes_are_remapped() {
        assert_eq!(StackTrace::from_frames(&[]).hash(), HASH_SUBSTITUTE);
        assert_eq!(
            StackTrace::from_frames(&[usize::MAX]).hash(),
            if usize::BITS == 64 { HASH_SUBSTITUTE } else { usize::MAX as u64 }
        );
        assert_eq!(StackTrace::empty().hash(), HASH_SUBSTITUTE);
    }

    #[test]
    fn frames_past_capacity_are_dropped() {
        let frames: Vec<usize> = (1..=100).collect();
        let trace = StackTrace::from_frames(&frames);
        assert_eq!(trace.depth(), BACKTRACE_SIZE);
        assert_eq!(trace, StackTrace::from_frames(&frames[..BACKTRACE_SIZE]));
    }

    #[test]
    fn capture_sees_this_stack() {
        let trace = StackTrace::capture(0);
        assert!(trace.depth() > 0);
        assert_ne!(trace.hash(), EMPTY_STACK_HASH);
        assert_ne!(trace.hash(), REMOVED_STACK_HASH);
    }

    #[test]
    fn json_keeps_frames_and_hash() {
        let trace = StackTrace::from_frames(&[0x1000, 0x2f00]);
        let json = serde_json::to_string(&trace).unwrap();
        assert!(json.contains("\"0x2f00\""));
        let back: StackTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trace);
    }

    #[test]
    fn json_hash_is_recomputed_from_frames() {
        for hash in [EMPTY_STACK_HASH, REMOVED_STACK_HASH, 1234] {
            let json = format!(r#"{{"frames":["0x10"],"hash":{hash}}}"#);
            let back: StackTrace = serde_json::from_str(&json).unwrap();
            assert_eq!(back, StackTrace::from_frames(&[0x10]));
        }
    }

    #[test]
    fn frames_stop_at_the_first_null() {
        let trace = StackTrace::from_frames(&[0x10, 0, 0x20]);
        assert_eq!(trace, StackTrace::from_frames(&[0x10]));
        assert_eq!(trace.frames(), &[0x10]);

        let json = serde_json::to_string(&trace).unwrap();
        let back: StackTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trace);
    }

    #[test]
    fn unresolvable_frames_print_no_symbol() {
        let trace = StackTrace::from_frames(&[0x10]);
        let mut out = Vec::new();
        trace.write_symbolized(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("<no symbol>"), "{out}");
        assert!(out.trim_end().ends_with("10)"), "{out}");
    }
}

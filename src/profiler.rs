//! Passive event recorder for the heap and collector.
//!
//! The heap pushes typed events while it runs; nothing is written until
//! [`Profiler::dump`] serializes the log to a trace file, one event per
//! line. Whether events are recorded at all is gated by the owning heap,
//! so a disabled profiler costs a single untaken branch per hook point.

use std::{
    fmt, fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

/// Copy of a chunk's metadata taken at event-recording time.
///
/// Events never hold live chunk references; sweep and free may destroy the
/// chunk long before the trace is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSnapshot {
    pub start: usize,
    pub size: usize,
    pub marked: bool,
}

impl fmt::Display for ChunkSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} {} {}", self.start, self.size, self.marked as u8)
    }
}

/// One observation of heap or collector activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcEvent {
    HeapInit,
    AllocStart { size: usize },
    NewChunk(ChunkSnapshot),
    ReusedChunk(ChunkSnapshot),
    CollectStart,
    MarkStart,
    ChunkMarked(ChunkSnapshot),
    ChunkSwept(ChunkSnapshot),
    ChunkFreed(ChunkSnapshot),
}

/// Trace line format: event name, then the event's fields in fixed order,
/// whitespace separated. Chunk fields are `start size marked` with the
/// start address in hex, the size in decimal and the mark bit as 0/1.
impl fmt::Display for GcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcEvent::HeapInit => write!(f, "HeapInit"),
            GcEvent::AllocStart { size } => write!(f, "AllocStart {size}"),
            GcEvent::NewChunk(chunk) => write!(f, "NewChunk {chunk}"),
            GcEvent::ReusedChunk(chunk) => write!(f, "ReusedChunk {chunk}"),
            GcEvent::CollectStart => write!(f, "CollectStart"),
            GcEvent::MarkStart => write!(f, "MarkStart"),
            GcEvent::ChunkMarked(chunk) => write!(f, "ChunkMarked {chunk}"),
            GcEvent::ChunkSwept(chunk) => write!(f, "ChunkSwept {chunk}"),
            GcEvent::ChunkFreed(chunk) => write!(f, "ChunkFreed {chunk}"),
        }
    }
}

/// In-memory event log.
#[derive(Debug, Default)]
pub struct Profiler {
    events: Vec<GcEvent>,
}

impl Profiler {
    #[must_use]
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    #[inline]
    pub fn record(&mut self, event: GcEvent) {
        self.events.push(event);
    }

    #[must_use]
    pub fn events(&self) -> &[GcEvent] {
        &self.events
    }

    /// Writes the recorded events to `<log_dir>/heap-<unix-seconds>.log`
    /// and clears the log. The directory is created if missing.
    pub fn dump(&mut self, log_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(log_dir)?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let path = log_dir.join(format!("heap-{stamp}.log"));

        let mut out = BufWriter::new(fs::File::create(&path)?);
        for event in &self.events {
            writeln!(out, "{event}")?;
        }
        out.flush()?;

        self.events.clear();
        Ok(path)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(start: usize, size: usize, marked: bool) -> ChunkSnapshot {
        ChunkSnapshot {
            start,
            size,
            marked,
        }
    }

    #[test]
    fn event_lines_use_fixed_field_order() {
        assert_eq!(GcEvent::HeapInit.to_string(), "HeapInit");
        assert_eq!(
            GcEvent::AllocStart { size: 64 }.to_string(),
            "AllocStart 64"
        );
        assert_eq!(
            GcEvent::NewChunk(snapshot(0x1000, 64, false)).to_string(),
            "NewChunk 0x1000 64 0"
        );
        assert_eq!(
            GcEvent::ChunkMarked(snapshot(0xbeef, 24, true)).to_string(),
            "ChunkMarked 0xbeef 24 1"
        );
    }

    #[test]
    fn dump_writes_one_event_per_line_and_clears_the_log() {
        let dir = tempfile::tempdir().expect("create temp dir");

        let mut profiler = Profiler::new();
        profiler.record(GcEvent::HeapInit);
        profiler.record(GcEvent::AllocStart { size: 64 });
        profiler.record(GcEvent::NewChunk(snapshot(0x2000, 64, false)));

        let path = profiler.dump(dir.path()).expect("dump trace");

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("heap-") && name.ends_with(".log"));

        let contents = fs::read_to_string(&path).expect("read trace");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            ["HeapInit", "AllocStart 64", "NewChunk 0x2000 64 0"]
        );

        assert!(profiler.events().is_empty());
    }

    #[test]
    fn dump_creates_the_log_directory() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let nested = dir.path().join("traces").join("gc");

        let mut profiler = Profiler::new();
        profiler.record(GcEvent::CollectStart);

        let path = profiler.dump(&nested).expect("dump trace");
        assert!(path.starts_with(&nested));
        assert!(path.exists());
    }
}

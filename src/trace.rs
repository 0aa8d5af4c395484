//! Chrome trace output.
//!
//! Records every task step as a complete ("X") event on the track of the
//! worker slot that ran it.  Load the file in chrome://tracing or Perfetto.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

pub struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_complete(
        &mut self,
        name: &str,
        tid: usize,
        start: Instant,
        end: Instant,
    ) -> std::io::Result<()> {
        writeln!(
            self.w,
            "{{ \"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ts\": {}, \"ph\": \"X\", \"dur\": {} }},",
            tid,
            name,
            start.saturating_duration_since(self.start).as_micros(),
            end.saturating_duration_since(start).as_micros(),
        )
    }

    /// Record one task step.  Trace output is best effort; errors only
    /// disable further output.
    pub fn step(&mut self, name: &str, tid: usize, span: (Instant, Instant)) {
        if let Err(err) = self.write_complete(name, tid, span.0, span.1) {
            tracing::warn!("trace write failed: {}", err);
        }
    }

    fn close(&mut self) -> std::io::Result<()> {
        // A final event spanning the whole session, which also avoids a
        // trailing comma in the JSON array.
        write!(
            self.w,
            "{{ \"pid\": 0, \"name\": \"main\", \"ts\": 0, \"ph\": \"X\", \"dur\": {} }}\n]\n",
            self.start.elapsed().as_micros()
        )?;
        self.w.flush()
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

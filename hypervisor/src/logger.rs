//! A `log::Log` implementation installed once at boot over a pluggable
//! sink, SPEC_FULL.md §2A.
//!
//! The byte-channel/16550 console itself is out of scope (SPEC_FULL.md
//! §1), so [`ConsoleSink`] is an abstract "write bytes, flush" seam; boot
//! wires a real platform sink, tests use [`NullSink`].

use core::fmt::{self, Write};

use spin::Mutex;

use crate::config::LOGGING_LEVEL;

/// The boot-time transport a [`HvLogger`] writes formatted records to.
/// Implemented once per platform by the out-of-scope console driver; the
/// core never depends on a concrete transport.
pub(crate) trait ConsoleSink: Send {
    fn write_bytes(&mut self, bytes: &[u8]);
    fn flush(&mut self) {}
}

struct SinkWriter<'a>(&'a mut dyn ConsoleSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// A `log::Log` implementation that serializes access to one [`ConsoleSink`]
/// behind a spinlock, tagging each record with the core id that produced
/// it (matching the teacher's own per-core APIC-id tag, generalized to
/// this architecture's PIR).
pub(crate) struct HvLogger<S: ConsoleSink> {
    sink: Mutex<S>,
    core_id: fn() -> u32,
}

impl<S: ConsoleSink> HvLogger<S> {
    pub(crate) const fn new(sink: S, core_id: fn() -> u32) -> Self {
        Self { sink: Mutex::new(sink), core_id }
    }
}

impl<S: ConsoleSink> log::Log for HvLogger<S> {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= LOGGING_LEVEL
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut guard = self.sink.lock();
        let mut writer = SinkWriter(&mut *guard);
        let _ = writeln!(writer, "#{}:{}: {}", (self.core_id)(), record.level(), record.args());
    }

    fn flush(&self) {
        self.sink.lock().flush();
    }
}

/// A sink that discards everything, for host-side unit tests where no
/// platform console exists.
#[derive(Default)]
pub(crate) struct NullSink;

impl ConsoleSink for NullSink {
    fn write_bytes(&mut self, _bytes: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use log::Log;

    #[derive(Default)]
    struct RecordingSink {
        written: Vec<u8>,
    }

    impl ConsoleSink for RecordingSink {
        fn write_bytes(&mut self, bytes: &[u8]) {
            self.written.extend_from_slice(bytes);
        }
    }

    #[test]
    fn disabled_level_is_not_logged() {
        let logger = HvLogger::new(RecordingSink::default(), || 0);
        let metadata = log::Metadata::builder().level(log::Level::Trace).build();
        assert!(logger.enabled(&metadata) == (log::Level::Trace <= LOGGING_LEVEL));
    }

    #[test]
    fn logged_record_reaches_the_sink_tagged_with_core_id() {
        let logger = HvLogger::new(RecordingSink::default(), || 7);
        logger.log(
            &log::Record::builder()
                .args(format_args!("hello"))
                .level(log::Level::Info)
                .build(),
        );
        let written = logger.sink.lock().written.clone();
        let text = core::str::from_utf8(&written).unwrap();
        assert!(text.contains("#7:INFO: hello"));
    }
}
</content>

//! In-memory debug sink for raw tool output.
//!
//! Every chunk from every spawned process lands here verbatim so a failed run
//! can be diagnosed without re-running it. The buffer is capped and trims
//! from the front, keeping the newest output.

use parking_lot::Mutex;

/// Maximum retained characters before the oldest output is dropped.
pub const DEBUG_LOG_CAP: usize = 2_000_000;

#[derive(Debug)]
pub struct DebugLog {
    buffer: Mutex<String>,
    cap: usize,
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugLog {
    pub fn new() -> Self {
        Self::with_cap(DEBUG_LOG_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            buffer: Mutex::new(String::new()),
            cap,
        }
    }

    /// Append one raw chunk, trimming the front if the cap is exceeded.
    pub fn append(&self, chunk: &str) {
        let mut buffer = self.buffer.lock();
        buffer.push_str(chunk);
        if buffer.len() > self.cap {
            let mut cut = buffer.len() - self.cap;
            while cut < buffer.len() && !buffer.is_char_boundary(cut) {
                cut += 1;
            }
            buffer.drain(..cut);
        }
    }

    /// Current contents, oldest retained output first.
    pub fn snapshot(&self) -> String {
        self.buffer.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_verbatim() {
        let log = DebugLog::new();
        log.append("first chunk ");
        log.append("second chunk");
        assert_eq!(log.snapshot(), "first chunk second chunk");
    }

    #[test]
    fn trims_from_the_front_when_over_cap() {
        let log = DebugLog::with_cap(10);
        log.append("0123456789");
        log.append("abcde");
        assert_eq!(log.snapshot(), "56789abcde");
        assert_eq!(log.len(), 10);
    }

    #[test]
    fn trim_respects_char_boundaries() {
        let log = DebugLog::with_cap(6);
        log.append("aaaa");
        log.append("ééé");
        assert!(log.len() <= 6);
        assert!(log.snapshot().ends_with("ééé"));
    }
}

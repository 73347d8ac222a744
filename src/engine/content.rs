//! Writer-facing view of a record's payload

use std::io;

/// What a writer wants done with the content it was handed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    /// Store the content as it now stands
    Commit,
    /// Leave the record untouched (on insert: create nothing)
    Keep,
}

/// Payload buffer handed to writers
///
/// Starts as a window over the record's reserved capacity (or over a scratch
/// buffer for inserts). Growing past that window moves the content into an
/// owned buffer; if the final content no longer fits the record, the record
/// is relocated.
#[derive(Debug)]
pub struct RecordContent<'a> {
    region: &'a mut [u8],
    len: usize,
    spilled: Option<Vec<u8>>,
    reserved: usize,
}

/// Final state of a writer's content
#[derive(Debug)]
pub(crate) enum Written {
    /// Content stayed within the original region
    InPlace(usize),
    /// Content moved to an owned buffer with the given requested capacity
    Spilled { data: Vec<u8>, capacity: usize },
}

impl<'a> RecordContent<'a> {
    pub(crate) fn new(region: &'a mut [u8], len: usize) -> Self {
        debug_assert!(len <= region.len());
        RecordContent {
            region,
            len,
            spilled: None,
            reserved: 0,
        }
    }

    pub fn len(&self) -> usize {
        match &self.spilled {
            Some(data) => data.len(),
            None => self.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes the content can hold without growing
    pub fn capacity(&self) -> usize {
        match &self.spilled {
            Some(data) => self.reserved.max(data.len()),
            None => self.region.len(),
        }
    }

    /// True once the content no longer lives in the original region
    pub fn has_outgrown(&self) -> bool {
        self.spilled.is_some()
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.spilled {
            Some(data) => data,
            None => &self.region[..self.len],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.spilled {
            Some(data) => data,
            None => &mut self.region[..self.len],
        }
    }

    pub fn clear(&mut self) {
        self.truncate(0);
    }

    pub fn truncate(&mut self, len: usize) {
        match &mut self.spilled {
            Some(data) => data.truncate(len),
            None => self.len = self.len.min(len),
        }
    }

    /// Make room for at least `additional` more bytes
    pub fn reserve(&mut self, additional: usize) {
        let needed = self.len() + additional;
        if needed <= self.capacity() {
            return;
        }
        match &mut self.spilled {
            Some(data) => {
                data.reserve(needed - data.len());
                self.reserved = needed;
            }
            None => self.spill(needed),
        }
    }

    fn spill(&mut self, capacity: usize) {
        let mut data = Vec::with_capacity(capacity);
        data.extend_from_slice(&self.region[..self.len]);
        self.reserved = capacity;
        self.spilled = Some(data);
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        match &mut self.spilled {
            Some(data) => data.extend_from_slice(bytes),
            None => {
                self.region[self.len..self.len + bytes.len()].copy_from_slice(bytes);
                self.len += bytes.len();
            }
        }
    }

    pub fn push(&mut self, byte: u8) {
        self.extend_from_slice(&[byte]);
    }

    pub fn resize(&mut self, new_len: usize, value: u8) {
        let len = self.len();
        if new_len <= len {
            self.truncate(new_len);
            return;
        }
        self.reserve(new_len - len);
        match &mut self.spilled {
            Some(data) => data.resize(new_len, value),
            None => {
                self.region[len..new_len].fill(value);
                self.len = new_len;
            }
        }
    }

    /// Replace the whole content
    pub fn replace(&mut self, bytes: &[u8]) {
        self.clear();
        self.extend_from_slice(bytes);
    }

    pub(crate) fn finish(self) -> Written {
        match self.spilled {
            Some(data) => Written::Spilled {
                capacity: self.reserved.max(data.len()),
                data,
            },
            None => Written::InPlace(self.len),
        }
    }
}

impl io::Write for RecordContent<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

//! Little-endian primitives shared by the record codecs.
//!
//! Records are only ever read back by the code that wrote them, so a buffer
//! that does not decode exactly is corruption and panics.

pub const U64_LEN: usize = 8;
const LEN_PREFIX: usize = 4;

pub fn str_len(s: &str) -> usize {
    LEN_PREFIX + s.len()
}

pub fn bytes_len(b: &[u8]) -> usize {
    LEN_PREFIX + b.len()
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_bytes(out: &mut Vec<u8>, b: &[u8]) {
    let len = u32::try_from(b.len()).unwrap_or_else(|_| {
        panic!("field of {} bytes does not fit a record length prefix", b.len())
    });
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(b);
}

pub fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

/// Cursor over an encoded record.
pub struct Reader<'a> {
    what: &'static str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(what: &'static str, bytes: &'a [u8]) -> Self {
        Self { what, bytes, pos: 0 }
    }

    pub fn is_at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        let Some(end) = end else {
            panic!(
                "corrupt {} record: need {} bytes at offset {}, only {} present ({})",
                self.what,
                n,
                self.pos,
                self.bytes.len(),
                hex::encode(self.bytes)
            );
        };
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        out
    }

    pub fn u64(&mut self) -> u64 {
        let mut arr = [0u8; U64_LEN];
        arr.copy_from_slice(self.take(U64_LEN));
        u64::from_le_bytes(arr)
    }

    pub fn bytes(&mut self) -> &'a [u8] {
        let mut arr = [0u8; LEN_PREFIX];
        arr.copy_from_slice(self.take(LEN_PREFIX));
        let len = u32::from_le_bytes(arr) as usize;
        self.take(len)
    }

    pub fn string(&mut self) -> String {
        let what = self.what;
        match std::str::from_utf8(self.bytes()) {
            Ok(s) => s.to_string(),
            Err(e) => panic!("corrupt {what} record: string field is not UTF-8: {e}"),
        }
    }

    /// Every byte must have been consumed.
    pub fn finish(self) {
        if !self.is_at_end() {
            panic!(
                "corrupt {} record: {} trailing bytes after offset {}",
                self.what,
                self.bytes.len() - self.pos,
                self.pos
            );
        }
    }
}

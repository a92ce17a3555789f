//! Prometheus remote-read request scanning
//!
//! The read body is a snappy-compressed `ReadRequest` protobuf. Only the
//! `__name__` matcher is needed for routing, so a minimal wire-format
//! walk extracts it without generated types:
//! `ReadRequest.queries[].matchers[]{name, value}`.

/// Metric name from the first `__name__` matcher, if present
pub fn metric_from_read_request(body: &[u8]) -> Option<String> {
    let raw = snap::raw::Decoder::new().decompress_vec(body).ok()?;
    let mut fields = FieldIter::new(&raw);
    while let Some((field, wire)) = fields.next_field() {
        // ReadRequest.queries
        if field == 1 && wire == WIRE_LEN {
            let query = fields.take_len_delimited()?;
            if let Some(metric) = metric_from_query(query) {
                return Some(metric);
            }
        } else {
            fields.skip(wire)?;
        }
    }
    None
}

fn metric_from_query(query: &[u8]) -> Option<String> {
    let mut fields = FieldIter::new(query);
    while let Some((field, wire)) = fields.next_field() {
        // Query.matchers
        if field == 3 && wire == WIRE_LEN {
            let matcher = fields.take_len_delimited()?;
            if let Some(metric) = metric_from_matcher(matcher) {
                return Some(metric);
            }
        } else {
            fields.skip(wire)?;
        }
    }
    None
}

fn metric_from_matcher(matcher: &[u8]) -> Option<String> {
    let mut fields = FieldIter::new(matcher);
    let mut name = None;
    let mut value = None;
    while let Some((field, wire)) = fields.next_field() {
        match (field, wire) {
            // LabelMatcher.name
            (2, WIRE_LEN) => {
                name = Some(String::from_utf8_lossy(fields.take_len_delimited()?).to_string())
            }
            // LabelMatcher.value
            (3, WIRE_LEN) => {
                value = Some(String::from_utf8_lossy(fields.take_len_delimited()?).to_string())
            }
            _ => fields.skip(wire)?,
        }
    }
    match (name.as_deref(), value) {
        (Some("__name__"), Some(value)) => Some(value),
        _ => None,
    }
}

const WIRE_VARINT: u8 = 0;
const WIRE_I64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_I32: u8 = 5;

struct FieldIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldIter<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn next_field(&mut self) -> Option<(u64, u8)> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let key = self.varint()?;
        Some((key >> 3, (key & 0x7) as u8))
    }

    fn varint(&mut self) -> Option<u64> {
        let mut out = 0u64;
        let mut shift = 0u32;
        while self.pos < self.buf.len() && shift < 64 {
            let b = self.buf[self.pos];
            self.pos += 1;
            out |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Some(out);
            }
            shift += 7;
        }
        None
    }

    fn take_len_delimited(&mut self) -> Option<&'a [u8]> {
        let len = self.varint()? as usize;
        let end = self.pos.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Some(out)
    }

    fn skip(&mut self, wire: u8) -> Option<()> {
        match wire {
            WIRE_VARINT => self.varint().map(|_| ()),
            WIRE_I64 => {
                let end = self.pos.checked_add(8)?;
                (end <= self.buf.len()).then(|| self.pos = end)
            }
            WIRE_LEN => self.take_len_delimited().map(|_| ()),
            WIRE_I32 => {
                let end = self.pos.checked_add(4)?;
                (end <= self.buf.len()).then(|| self.pos = end)
            }
            _ => None,
        }
    }
}
